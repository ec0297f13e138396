//! Tidepool client
//!
//! Typed, resource-safe access to a distributed block-storage service built
//! atop an object store. The crate wraps the raw native boundary
//! (`tidepool-engine`) in entities that own their handles exclusively and
//! release them exactly once:
//!
//! ```text
//! Session ──connect──▶ PoolContext ──open──▶ Image ──▶ snapshots / clones
//! ```
//!
//! A [`Session`] must be connected before a [`PoolContext`] can be derived
//! from it; a pool context must be live before an [`Image`] can be created
//! or opened through it; an image must be open before any I/O or snapshot
//! operation. Children hold non-owning back-references to their parents, so
//! using an entity after its parent was released yields a typed
//! [`Error::InvalidState`](tidepool_common::Error::InvalidState) instead of
//! undefined behavior.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tidepool_client::Session;
//! use tidepool_engine::{MemoryEngine, NativeEngine};
//!
//! # fn main() -> tidepool_common::Result<()> {
//! let engine: Arc<dyn NativeEngine> = Arc::new(MemoryEngine::new());
//! let session = Session::new(engine, "admin")?;
//! session.configure("mon_host", "10.0.0.1:6789")?;
//! session.connect()?;
//!
//! let pool = session.pool_context("blocks")?;
//! pool.create_image("volume0", 10 << 20)?;
//! let image = pool.open_image("volume0")?;
//! image.write(b"hello")?;
//! image.close();
//! session.disconnect();
//! # Ok(())
//! # }
//! ```

pub mod image;
pub mod pool;
pub mod session;
pub mod snapshot;

#[cfg(test)]
pub(crate) mod testutil;

// Re-exports
pub use image::{Image, ImageStat};
pub use pool::PoolContext;
pub use session::Session;
pub use snapshot::SnapshotInfo;

pub use tidepool_common::{Error, NativeStatus, Result};
pub use tidepool_engine::{DEFAULT_OBJECT_ORDER, FEATURE_LAYERING};
