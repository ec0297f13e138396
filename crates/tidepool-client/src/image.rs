//! Images
//!
//! An [`Image`] owns the native handle to one opened virtual block device.
//! Reads and writes are independently positioned; there is no file cursor.
//! Metadata queries go to the native layer on every call, so a caller must
//! re-invoke [`stat`](Image::stat) after a resize.

use crate::pool::PoolShared;

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tidepool_common::{Error, Result};
use tidepool_engine::{NativeEngine, RawHandle, RawImageInfo};
use tracing::debug;

/// Point-in-time image metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageStat {
    /// Image size in bytes.
    pub size: u64,
    /// Object size exponent (objects are `1 << object_order` bytes).
    pub object_order: u8,
    /// On-disk format generation: 1 (legacy) or 2 (modern).
    pub format_version: u8,
}

pub(crate) struct ImageShared {
    pub(crate) engine: Arc<dyn NativeEngine>,
    pub(crate) pool: Weak<PoolShared>,
    pub(crate) name: String,
    handle: Mutex<Option<RawHandle>>,
}

impl ImageShared {
    /// Validate the ownership chain and return the image handle.
    pub(crate) fn live_handle(&self) -> Result<RawHandle> {
        let pool = self
            .pool
            .upgrade()
            .ok_or_else(|| Error::invalid_state("pool context has been destroyed"))?;
        pool.live_handle()?;
        (*self.handle.lock()).ok_or_else(|| Error::invalid_state("image has been closed"))
    }

    /// Pool handle of the owning context, for pool-scoped calls that name
    /// this image (clone sources).
    pub(crate) fn pool_handle(&self) -> Result<RawHandle> {
        self.pool
            .upgrade()
            .ok_or_else(|| Error::invalid_state("pool context has been destroyed"))?
            .live_handle()
    }

    /// Release the image handle. At most once; repeated calls are no-ops.
    fn release(&self) {
        if let Some(handle) = self.handle.lock().take() {
            let rc = self.engine.image_close(handle);
            if rc < 0 {
                debug!(image = %self.name, rc, "image close reported an error");
            }
        }
    }
}

impl Drop for ImageShared {
    fn drop(&mut self) {
        self.release();
    }
}

/// An opened virtual block device.
///
/// Exclusively owns one native image handle, released exactly once by
/// [`close`](Image::close) or on drop. After closing, every operation
/// (including snapshot calls) fails with `InvalidState`.
pub struct Image {
    pub(crate) shared: Arc<ImageShared>,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("name", &self.shared.name)
            .finish_non_exhaustive()
    }
}

impl Image {
    pub(crate) fn new(pool: &Arc<PoolShared>, name: String, handle: RawHandle) -> Self {
        Self {
            shared: Arc::new(ImageShared {
                engine: Arc::clone(&pool.engine),
                pool: Arc::downgrade(pool),
                name,
                handle: Mutex::new(Some(handle)),
            }),
        }
    }

    /// Name this image was opened under.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Query current metadata. Not live-updated: re-invoke after a resize.
    pub fn stat(&self) -> Result<ImageStat> {
        let handle = self.shared.live_handle()?;
        let mut info = RawImageInfo::default();
        let rc = self.shared.engine.image_stat(handle, &mut info);
        if rc < 0 {
            return Err(Error::from_native(rc));
        }
        Ok(ImageStat {
            size: info.size,
            object_order: info.obj_order,
            format_version: if info.old_format { 1 } else { 2 },
        })
    }

    /// True when the image was created in the legacy (format 1) layout.
    pub fn is_legacy_format(&self) -> Result<bool> {
        let handle = self.shared.live_handle()?;
        let mut old = false;
        let rc = self.shared.engine.image_old_format(handle, &mut old);
        if rc < 0 {
            return Err(Error::from_native(rc));
        }
        Ok(old)
    }

    /// Grow or truncate the image.
    ///
    /// Truncation below the current size is destructive and unguarded
    /// here; that policy belongs to the storage layer.
    pub fn resize(&self, new_size: u64) -> Result<()> {
        let handle = self.shared.live_handle()?;
        let rc = self.shared.engine.image_resize(handle, new_size);
        if rc < 0 {
            return Err(Error::from_native(rc));
        }
        Ok(())
    }

    /// Positioned read of up to `length` bytes at `offset`.
    ///
    /// Returns fewer bytes than requested only at end-of-image.
    pub fn read(&self, offset: u64, length: usize) -> Result<Bytes> {
        let handle = self.shared.live_handle()?;
        let mut buf = vec![0u8; length];
        let ret = self.shared.engine.image_read(handle, offset, &mut buf);
        if ret < 0 {
            return Err(Error::from_native(ret as i32));
        }
        buf.truncate(ret as usize);
        Ok(Bytes::from(buf))
    }

    /// Write at the start of the image. Returns the byte count written.
    ///
    /// Every call is independently positioned; there is no cursor carried
    /// between calls.
    pub fn write(&self, data: &[u8]) -> Result<u64> {
        self.write_at(0, data)
    }

    /// Positioned write at `offset`. Returns the byte count written.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<u64> {
        let handle = self.shared.live_handle()?;
        let ret = self.shared.engine.image_write(handle, offset, data);
        if ret < 0 {
            return Err(Error::from_native(ret as i32));
        }
        Ok(ret as u64)
    }

    /// Release the image handle. Idempotent; never raises.
    pub fn close(&self) {
        self.shared.release();
    }
}

#[cfg(test)]
mod tests {
    use crate::testutil;

    const MB: u64 = 1 << 20;

    #[test]
    fn stat_reports_creation_size() {
        let (engine, pool) = testutil::test_engine();
        let session = testutil::connected_session(&engine);
        let ctx = session.pool_context(&pool).unwrap();
        ctx.create_image("img", 10_485_760).unwrap();

        let image = ctx.open_image("img").unwrap();
        assert_eq!(image.stat().unwrap().size, 10_485_760);
        image.close();
    }

    #[test]
    fn resize_doubles_and_stat_follows() {
        let (engine, pool) = testutil::test_engine();
        let session = testutil::connected_session(&engine);
        let ctx = session.pool_context(&pool).unwrap();
        ctx.create_image_with("imageforresizetest", 10 * MB, crate::FEATURE_LAYERING, 0)
            .unwrap();

        let image = ctx.open_image("imageforresizetest").unwrap();
        image.resize(20 * MB).unwrap();
        assert_eq!(image.stat().unwrap().size, 20 * MB);
        image.close();
    }

    #[test]
    fn positioned_writes_concatenate() {
        let (engine, pool) = testutil::test_engine();
        let session = testutil::connected_session(&engine);
        let ctx = session.pool_context(&pool).unwrap();
        ctx.create_image_with("imageforwritetest", 10 * MB, crate::FEATURE_LAYERING, 0)
            .unwrap();

        let image = ctx.open_image("imageforwritetest").unwrap();
        let buf = b"tide";
        assert_eq!(image.write(buf).unwrap(), 4);
        assert_eq!(image.write_at(buf.len() as u64, buf).unwrap(), 4);

        let data = image.read(0, 8).unwrap();
        assert_eq!(&data[..], b"tidetide");
        image.close();
    }

    #[test]
    fn read_is_short_only_at_end_of_image() {
        let (engine, pool) = testutil::test_engine();
        let session = testutil::connected_session(&engine);
        let ctx = session.pool_context(&pool).unwrap();
        ctx.create_image("small", MB).unwrap();

        let image = ctx.open_image("small").unwrap();
        let data = image.read(MB - 4, 64).unwrap();
        assert_eq!(data.len(), 4);
        let data = image.read(MB, 64).unwrap();
        assert!(data.is_empty());
        image.close();
    }

    #[test]
    fn double_close_is_a_noop() {
        let (engine, pool) = testutil::test_engine();
        let session = testutil::connected_session(&engine);
        let ctx = session.pool_context(&pool).unwrap();
        ctx.create_image("img", MB).unwrap();

        let image = ctx.open_image("img").unwrap();
        image.close();
        image.close();
        assert!(image.stat().unwrap_err().is_invalid_state());
        assert!(image.write(b"x").unwrap_err().is_invalid_state());

        // closed image no longer blocks removal
        ctx.remove_image("img").unwrap();
    }

    #[test]
    fn operations_fail_after_parent_release() {
        let (engine, pool) = testutil::test_engine();
        let session = testutil::connected_session(&engine);
        let ctx = session.pool_context(&pool).unwrap();
        ctx.create_image("img", MB).unwrap();
        let image = ctx.open_image("img").unwrap();

        ctx.destroy();
        assert!(image.stat().unwrap_err().is_invalid_state());
        assert!(image.read(0, 4).unwrap_err().is_invalid_state());
    }
}
