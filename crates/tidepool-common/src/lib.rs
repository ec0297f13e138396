//! Common types for Tidepool
//!
//! This crate holds the pieces shared by every other Tidepool crate: the
//! translation table for native status codes and the typed error taxonomy
//! built on top of it.

pub mod errno;
pub mod error;

// Re-exports
pub use errno::Errno;
pub use error::{Error, NativeStatus, Result};
