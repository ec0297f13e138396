//! Shared test fixtures
//!
//! Tests run against the in-process engine. Connection identity, config
//! file, and pool name can be overridden through the environment, mirroring
//! how the suite would point at a real cluster:
//! `TIDEPOOL_TEST_ID`, `TIDEPOOL_TEST_CONF`, `TIDEPOOL_TEST_POOL`.

use crate::Session;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tidepool_engine::MemoryEngine;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Engine with the test pool registered, plus the pool's name.
pub(crate) fn test_engine() -> (Arc<MemoryEngine>, String) {
    let pool = env_or("TIDEPOOL_TEST_POOL", "blocks");
    let engine = Arc::new(MemoryEngine::new());
    engine.add_pool(&pool);
    (engine, pool)
}

/// Fresh unconnected session against the given engine.
pub(crate) fn session(engine: &Arc<MemoryEngine>) -> Session {
    let id = env_or("TIDEPOOL_TEST_ID", "admin");
    Session::new(engine.clone(), &id).unwrap()
}

/// Session configured from `TIDEPOOL_TEST_CONF` (or a generated config
/// file) and connected.
pub(crate) fn connected_session(engine: &Arc<MemoryEngine>) -> Session {
    let session = session(engine);
    match std::env::var("TIDEPOOL_TEST_CONF") {
        Ok(path) => session.load_config_file(Path::new(&path)).unwrap(),
        Err(_) => {
            let mut conf = tempfile::NamedTempFile::new().unwrap();
            writeln!(conf, "[global]").unwrap();
            writeln!(conf, "mon_host = 127.0.0.1:6789").unwrap();
            session.load_config_file(conf.path()).unwrap();
        }
    }
    session.connect().unwrap();
    session
}
