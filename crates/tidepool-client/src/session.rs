//! Cluster sessions
//!
//! A [`Session`] owns the native client handle and walks it through the
//! lifecycle *created → configured → connected → terminated*. Pool contexts
//! are derived from a connected session and hold only a non-owning
//! back-reference to it; once the session disconnects, every derived entity
//! fails with `InvalidState` instead of touching a freed handle.

use crate::pool::PoolContext;

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tidepool_common::{Error, Result};
use tidepool_engine::{NativeEngine, RawHandle};
use tracing::{info, warn};

enum SessionState {
    /// Handle allocated, not yet connected. Configuration is still open.
    Created {
        handle: RawHandle,
        overlay: BTreeMap<String, String>,
    },
    Connected {
        handle: RawHandle,
    },
    Terminated,
}

pub(crate) struct SessionShared {
    pub(crate) engine: Arc<dyn NativeEngine>,
    client_id: String,
    state: Mutex<SessionState>,
}

impl SessionShared {
    /// Handle for deriving pool contexts; `InvalidState` unless connected.
    pub(crate) fn connected_handle(&self) -> Result<RawHandle> {
        match *self.state.lock() {
            SessionState::Connected { handle } => Ok(handle),
            SessionState::Created { .. } => {
                Err(Error::invalid_state("session is not connected"))
            }
            SessionState::Terminated => {
                Err(Error::invalid_state("session has been disconnected"))
            }
        }
    }

    /// Release the native handle. Runs at most once; repeated calls are
    /// no-ops so cleanup along failure paths cannot raise.
    fn release(&self) {
        let mut state = self.state.lock();
        let handle = match *state {
            SessionState::Created { handle, .. } | SessionState::Connected { handle } => handle,
            SessionState::Terminated => return,
        };
        *state = SessionState::Terminated;
        let rc = self.engine.shutdown(handle);
        if rc < 0 {
            warn!(client = %self.client_id, rc, "shutdown reported an error");
        } else {
            info!(client = %self.client_id, "session disconnected");
        }
    }
}

impl Drop for SessionShared {
    fn drop(&mut self) {
        self.release();
    }
}

/// An authenticated connection to the storage cluster.
///
/// Exclusively owns one native client handle. The handle is released
/// exactly once: by [`disconnect`](Session::disconnect) or, failing that,
/// on drop.
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    /// Allocate a session for the given client identity.
    ///
    /// The session starts unconfigured and unconnected.
    pub fn new(engine: Arc<dyn NativeEngine>, client_id: &str) -> Result<Self> {
        let ret = engine.create_client(client_id);
        if ret < 0 {
            return Err(Error::from_native(ret as i32));
        }
        Ok(Self {
            shared: Arc::new(SessionShared {
                engine,
                client_id: client_id.to_string(),
                state: Mutex::new(SessionState::Created {
                    handle: ret as RawHandle,
                    overlay: BTreeMap::new(),
                }),
            }),
        })
    }

    /// The client identity this session authenticates as.
    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    /// Set one configuration key.
    ///
    /// Valid only before connecting; fails with `InvalidState` afterward.
    pub fn configure(&self, key: &str, value: &str) -> Result<()> {
        let mut state = self.shared.state.lock();
        match &mut *state {
            SessionState::Created { handle, overlay } => {
                let rc = self.shared.engine.conf_set(*handle, key, value);
                if rc < 0 {
                    return Err(Error::from_native(rc));
                }
                overlay.insert(key.to_string(), value.to_string());
                Ok(())
            }
            SessionState::Connected { .. } => {
                Err(Error::invalid_state("session already connected"))
            }
            SessionState::Terminated => {
                Err(Error::invalid_state("session has been disconnected"))
            }
        }
    }

    /// Look up a key in the local configuration overlay.
    ///
    /// Only reflects keys set through [`configure`](Session::configure); the
    /// keys a config file contributed live in the native layer.
    pub fn config_value(&self, key: &str) -> Option<String> {
        match &*self.shared.state.lock() {
            SessionState::Created { overlay, .. } => overlay.get(key).cloned(),
            _ => None,
        }
    }

    /// Merge an external configuration file.
    ///
    /// Fails with `NotFound` if the path is absent and `ConfigError` on
    /// malformed input; the file format itself is owned by the native
    /// layer, this library only forwards the path.
    pub fn load_config_file(&self, path: &Path) -> Result<()> {
        let state = self.shared.state.lock();
        match *state {
            SessionState::Created { handle, .. } => {
                let rc = self.shared.engine.conf_read_file(handle, path);
                if rc < 0 {
                    return Err(Error::from_config(rc));
                }
                Ok(())
            }
            SessionState::Connected { .. } => {
                Err(Error::invalid_state("session already connected"))
            }
            SessionState::Terminated => {
                Err(Error::invalid_state("session has been disconnected"))
            }
        }
    }

    /// Establish the cluster connection.
    ///
    /// Calling connect twice without disconnecting is a caller error and
    /// fails with `InvalidState`.
    pub fn connect(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        let handle = match *state {
            SessionState::Created { handle, .. } => handle,
            SessionState::Connected { .. } => {
                return Err(Error::invalid_state("session already connected"));
            }
            SessionState::Terminated => {
                return Err(Error::invalid_state("session has been disconnected"));
            }
        };
        let rc = self.shared.engine.connect(handle);
        if rc < 0 {
            return Err(Error::from_native(rc));
        }
        *state = SessionState::Connected { handle };
        info!(client = %self.shared.client_id, "session connected");
        Ok(())
    }

    /// Derive a context scoped to one pool. Requires a connected session.
    pub fn pool_context(&self, pool_name: &str) -> Result<PoolContext> {
        let handle = self.shared.connected_handle()?;
        let ret = self.shared.engine.pool_open(handle, pool_name);
        if ret < 0 {
            return Err(Error::from_native(ret as i32));
        }
        Ok(PoolContext::new(
            &self.shared,
            pool_name.to_string(),
            ret as RawHandle,
        ))
    }

    /// Release the connection. Safe to call multiple times; never raises.
    ///
    /// Every pool context and image derived from this session becomes
    /// invalid: their operations fail with `InvalidState` afterward.
    pub fn disconnect(&self) {
        self.shared.release();
    }

    /// Engine library version as (major, minor, patch). Pure query.
    pub fn version(&self) -> (u32, u32, u32) {
        self.shared.engine.version()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use std::io::Write;

    #[test]
    fn version_is_queryable_without_connecting() {
        let (engine, _) = testutil::test_engine();
        let session = Session::new(engine, "admin").unwrap();
        let (major, minor, _) = session.version();
        assert!(major >= 1 || minor >= 1);
    }

    #[test]
    fn configure_accumulates_until_connect() {
        let (engine, _) = testutil::test_engine();
        let session = testutil::session(&engine);
        session.configure("mon_host", "127.0.0.1:6789").unwrap();
        assert_eq!(
            session.config_value("mon_host").as_deref(),
            Some("127.0.0.1:6789")
        );
        session.connect().unwrap();

        let err = session.configure("mon_host", "10.0.0.1").unwrap_err();
        assert!(err.is_invalid_state());
        assert_eq!(session.config_value("mon_host"), None);
    }

    #[test]
    fn load_config_file_statuses() {
        let (engine, _) = testutil::test_engine();
        let session = testutil::session(&engine);

        let err = session
            .load_config_file(Path::new("/nonexistent/tidepool.conf"))
            .unwrap_err();
        assert!(err.is_not_found());

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        writeln!(bad, "not a key value pair").unwrap();
        let err = session.load_config_file(bad.path()).unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));

        let mut good = tempfile::NamedTempFile::new().unwrap();
        writeln!(good, "mon_host = 127.0.0.1:6789").unwrap();
        session.load_config_file(good.path()).unwrap();
    }

    #[test]
    fn connect_twice_is_a_caller_error() {
        let (engine, _) = testutil::test_engine();
        let session = testutil::connected_session(&engine);
        assert!(session.connect().unwrap_err().is_invalid_state());
    }

    #[test]
    fn disconnect_is_idempotent() {
        let (engine, pool) = testutil::test_engine();
        let session = testutil::connected_session(&engine);
        let _ctx = session.pool_context(&pool).unwrap();
        session.disconnect();
        session.disconnect();
        session.disconnect();
    }

    #[test]
    fn derived_contexts_fail_after_disconnect() {
        let (engine, pool) = testutil::test_engine();
        let session = testutil::connected_session(&engine);
        let ctx = session.pool_context(&pool).unwrap();
        session.disconnect();

        assert!(ctx.list_images().unwrap_err().is_invalid_state());
        assert!(ctx.create_image("img", 1 << 20).unwrap_err().is_invalid_state());
        assert!(session.pool_context(&pool).unwrap_err().is_invalid_state());
    }

    #[test]
    fn unknown_pool_is_not_found() {
        let (engine, _) = testutil::test_engine();
        let session = testutil::connected_session(&engine);
        assert!(session.pool_context("no-such-pool").unwrap_err().is_not_found());
    }

    #[test]
    fn pool_context_requires_connection() {
        let (engine, pool) = testutil::test_engine();
        let session = testutil::session(&engine);
        assert!(session.pool_context(&pool).unwrap_err().is_invalid_state());
    }
}
