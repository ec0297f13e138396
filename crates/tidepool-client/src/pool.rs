//! Pool contexts
//!
//! A [`PoolContext`] owns a native handle scoped to one logical pool and is
//! the factory for images. It validates the whole ownership chain (session
//! alive and connected, own handle present) before every native call, since
//! the native layer itself does not reject stale handles.

use crate::image::Image;
use crate::session::SessionShared;

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tidepool_common::{Error, Result};
use tidepool_engine::{NativeEngine, RawHandle};
use tracing::{debug, info};

pub(crate) struct PoolShared {
    pub(crate) engine: Arc<dyn NativeEngine>,
    session: Weak<SessionShared>,
    name: String,
    handle: Mutex<Option<RawHandle>>,
}

impl PoolShared {
    /// Validate the ownership chain and return the pool handle.
    pub(crate) fn live_handle(&self) -> Result<RawHandle> {
        let session = self
            .session
            .upgrade()
            .ok_or_else(|| Error::invalid_state("session has been destroyed"))?;
        session.connected_handle()?;
        (*self.handle.lock())
            .ok_or_else(|| Error::invalid_state("pool context has been destroyed"))
    }

    /// Release the pool handle. At most once; repeated calls are no-ops.
    fn release(&self) {
        if let Some(handle) = self.handle.lock().take() {
            let rc = self.engine.pool_close(handle);
            if rc < 0 {
                debug!(pool = %self.name, rc, "pool close reported an error");
            }
        }
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        self.release();
    }
}

/// A handle scoped to one logical storage pool, used to address images.
///
/// Valid only while the owning [`Session`](crate::Session) is connected.
/// Exclusively owns one native pool handle, released exactly once by
/// [`destroy`](PoolContext::destroy) or on drop.
pub struct PoolContext {
    pub(crate) shared: Arc<PoolShared>,
}

impl std::fmt::Debug for PoolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolContext")
            .field("name", &self.shared.name)
            .finish_non_exhaustive()
    }
}

impl PoolContext {
    pub(crate) fn new(session: &Arc<SessionShared>, name: String, handle: RawHandle) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                engine: Arc::clone(&session.engine),
                session: Arc::downgrade(session),
                name,
                handle: Mutex::new(Some(handle)),
            }),
        }
    }

    /// Name of the pool this context addresses.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Create an image in the conservative legacy on-disk format (format 1).
    ///
    /// Callers opting into modern features use
    /// [`create_image_with`](PoolContext::create_image_with).
    pub fn create_image(&self, name: &str, size: u64) -> Result<()> {
        let handle = self.shared.live_handle()?;
        let rc = self.shared.engine.image_create(handle, name, size);
        if rc < 0 {
            return Err(Error::from_native(rc));
        }
        info!(pool = %self.shared.name, image = %name, size, "created image");
        Ok(())
    }

    /// Create a format 2 image with explicit feature bits and object order.
    ///
    /// `order` is the object size exponent; 0 selects the engine default.
    pub fn create_image_with(
        &self,
        name: &str,
        size: u64,
        features: u64,
        order: u8,
    ) -> Result<()> {
        let handle = self.shared.live_handle()?;
        let rc = self
            .shared
            .engine
            .image_create2(handle, name, size, features, order);
        if rc < 0 {
            return Err(Error::from_native(rc));
        }
        info!(pool = %self.shared.name, image = %name, size, features, "created image");
        Ok(())
    }

    /// Open an image by name.
    pub fn open_image(&self, name: &str) -> Result<Image> {
        let handle = self.shared.live_handle()?;
        let ret = self.shared.engine.image_open(handle, name);
        if ret < 0 {
            return Err(Error::from_native(ret as i32));
        }
        Ok(Image::new(&self.shared, name.to_string(), ret as RawHandle))
    }

    /// List image names in this pool, in stable order.
    pub fn list_images(&self) -> Result<Vec<String>> {
        let handle = self.shared.live_handle()?;
        let mut names = Vec::new();
        let rc = self.shared.engine.image_list(handle, &mut names);
        if rc < 0 {
            return Err(Error::from_native(rc));
        }
        Ok(names)
    }

    /// Remove a closed image.
    pub fn remove_image(&self, name: &str) -> Result<()> {
        let handle = self.shared.live_handle()?;
        let rc = self.shared.engine.image_remove(handle, name);
        if rc < 0 {
            return Err(Error::from_native(rc));
        }
        info!(pool = %self.shared.name, image = %name, "removed image");
        Ok(())
    }

    /// Rename an image within this pool.
    pub fn rename_image(&self, old_name: &str, new_name: &str) -> Result<()> {
        let handle = self.shared.live_handle()?;
        let rc = self.shared.engine.image_rename(handle, old_name, new_name);
        if rc < 0 {
            return Err(Error::from_native(rc));
        }
        Ok(())
    }

    /// Release the pool handle. Idempotent; never raises.
    ///
    /// Safe to call before or after the owning session disconnects. Any
    /// later operation on this context fails with `InvalidState`.
    pub fn destroy(&self) {
        self.shared.release();
    }
}
