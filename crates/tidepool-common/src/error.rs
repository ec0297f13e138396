//! Error types for Tidepool
//!
//! Every failure that originates at the native boundary carries a
//! [`NativeStatus`] with the translated symbolic name and message alongside
//! the raw code, so callers can match on a stable kind while keeping the
//! original diagnostic for logs.

use crate::errno;
use std::fmt;
use thiserror::Error;

/// Common result type for Tidepool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Translated native status: the raw code plus its symbolic name and
/// human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeStatus {
    /// Raw native status code (negative).
    pub code: i32,
    /// Stable symbolic name, `UNKNOWN_ERROR` for codes outside the table.
    pub name: &'static str,
    /// Human-readable message.
    pub message: String,
}

impl NativeStatus {
    /// Translate a raw native status code.
    pub fn from_code(code: i32) -> Self {
        Self {
            code,
            name: errno::name_of(code),
            message: errno::message_of(code),
        }
    }
}

impl fmt::Display for NativeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} (code {})", self.name, self.message, self.code)
    }
}

/// Common error type for Tidepool
#[derive(Debug, Error)]
pub enum Error {
    /// Operation attempted against a released or not-yet-ready entity,
    /// detected locally before touching the native layer.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("not found: {0}")]
    NotFound(NativeStatus),

    #[error("already exists: {0}")]
    AlreadyExists(NativeStatus),

    #[error("resource busy: {0}")]
    Busy(NativeStatus),

    #[error("permission denied: {0}")]
    PermissionDenied(NativeStatus),

    #[error("no space: {0}")]
    NoSpace(NativeStatus),

    #[error("connection error: {0}")]
    ConnectionError(NativeStatus),

    #[error("configuration error: {0}")]
    ConfigError(NativeStatus),

    /// Fallback for native codes with no dedicated kind.
    #[error("native error: {0}")]
    UnknownNative(NativeStatus),
}

impl Error {
    /// Create an invalid-state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Categorize a raw native status code.
    ///
    /// The caller guarantees `code` is negative; zero or positive values
    /// still produce an `UnknownNative` rather than panicking.
    pub fn from_native(code: i32) -> Self {
        let status = NativeStatus::from_code(code);
        match code.unsigned_abs() as i32 {
            errno::ENOENT => Self::NotFound(status),
            errno::EEXIST => Self::AlreadyExists(status),
            errno::EBUSY => Self::Busy(status),
            errno::EPERM | errno::EACCES => Self::PermissionDenied(status),
            errno::ENOSPC | errno::EDQUOT => Self::NoSpace(status),
            m if (errno::ENETDOWN..=errno::EHOSTUNREACH).contains(&m) || m == errno::ENONET => {
                Self::ConnectionError(status)
            }
            _ => Self::UnknownNative(status),
        }
    }

    /// Categorize a native failure from configuration loading.
    ///
    /// A missing file stays `NotFound`; every other failure is a
    /// `ConfigError` carrying the translated code.
    pub fn from_config(code: i32) -> Self {
        if code == -errno::ENOENT {
            Self::NotFound(NativeStatus::from_code(code))
        } else {
            Self::ConfigError(NativeStatus::from_code(code))
        }
    }

    /// The translated native status, if this failure originated at the
    /// native boundary.
    #[must_use]
    pub fn native_status(&self) -> Option<&NativeStatus> {
        match self {
            Self::InvalidState(_) => None,
            Self::NotFound(s)
            | Self::AlreadyExists(s)
            | Self::Busy(s)
            | Self::PermissionDenied(s)
            | Self::NoSpace(s)
            | Self::ConnectionError(s)
            | Self::ConfigError(s)
            | Self::UnknownNative(s) => Some(s),
        }
    }

    /// Check if this is an invalid-state error
    #[must_use]
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState(_))
    }

    /// Check if this is a not-found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this is a busy error
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_codes_map_to_kinds() {
        assert!(matches!(Error::from_native(-2), Error::NotFound(_)));
        assert!(matches!(Error::from_native(-17), Error::AlreadyExists(_)));
        assert!(matches!(Error::from_native(-16), Error::Busy(_)));
        assert!(matches!(Error::from_native(-1), Error::PermissionDenied(_)));
        assert!(matches!(Error::from_native(-13), Error::PermissionDenied(_)));
        assert!(matches!(Error::from_native(-28), Error::NoSpace(_)));
        assert!(matches!(Error::from_native(-122), Error::NoSpace(_)));
        assert!(matches!(Error::from_native(-110), Error::ConnectionError(_)));
        assert!(matches!(Error::from_native(-111), Error::ConnectionError(_)));
        assert!(matches!(Error::from_native(-107), Error::ConnectionError(_)));
        assert!(matches!(Error::from_native(-22), Error::UnknownNative(_)));
    }

    #[test]
    fn unknown_codes_keep_the_raw_value() {
        let err = Error::from_native(-999);
        let status = err.native_status().unwrap();
        assert_eq!(status.code, -999);
        assert_eq!(status.name, errno::UNKNOWN_NAME);
        assert!(status.message.contains("-999"));
    }

    #[test]
    fn config_failures_split_on_missing_file() {
        assert!(Error::from_config(-2).is_not_found());
        assert!(matches!(Error::from_config(-22), Error::ConfigError(_)));
        assert!(matches!(Error::from_config(-5), Error::ConfigError(_)));
    }

    #[test]
    fn display_includes_name_message_and_code() {
        let err = Error::from_native(-16);
        let text = err.to_string();
        assert!(text.contains("EBUSY"));
        assert!(text.contains("Device or resource busy"));
        assert!(text.contains("-16"));
    }

    #[test]
    fn predicates() {
        assert!(Error::invalid_state("closed").is_invalid_state());
        assert!(!Error::from_native(-2).is_invalid_state());
        assert!(Error::from_native(-2).is_not_found());
        assert!(Error::from_native(-16).is_busy());
        assert!(Error::invalid_state("closed").native_status().is_none());
    }
}
