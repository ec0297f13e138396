//! Snapshots, clones, and bulk copy
//!
//! Snapshots belong to one image and move through an explicit state
//! machine: *created (unprotected) → protected → unprotected → removable*.
//! Protection gates a snapshot's use as a clone parent; the gate is checked locally
//! before the native call so ordering violations surface as a precise
//! `InvalidState` instead of an ambiguous native code.

use crate::image::Image;
use crate::pool::PoolContext;

use tidepool_common::{errno, Error, Result};
use tidepool_engine::RawSnapInfo;
use tracing::info;

/// One entry of an image's snapshot list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    /// Engine-assigned id, unique within the image.
    pub id: u64,
    /// Name, unique within the image but not globally.
    pub name: String,
    /// Approximate image size at snapshot time, in bytes.
    pub size: u64,
}

impl From<RawSnapInfo> for SnapshotInfo {
    fn from(raw: RawSnapInfo) -> Self {
        Self {
            id: raw.id,
            name: raw.name,
            size: raw.size,
        }
    }
}

impl Image {
    /// Create a snapshot of the current contents, initially unprotected.
    pub fn snap_create(&self, name: &str) -> Result<()> {
        let handle = self.shared.live_handle()?;
        let rc = self.shared.engine.snap_create(handle, name);
        if rc < 0 {
            return Err(Error::from_native(rc));
        }
        info!(image = %self.shared.name, snap = %name, "created snapshot");
        Ok(())
    }

    /// Mark a snapshot as protected so it can serve as a clone parent.
    ///
    /// The native layer rejects re-protecting; that surfaces here as
    /// `InvalidState` rather than a raw busy code.
    pub fn snap_protect(&self, name: &str) -> Result<()> {
        let handle = self.shared.live_handle()?;
        let rc = self.shared.engine.snap_protect(handle, name);
        if rc == -errno::EBUSY {
            return Err(Error::invalid_state("snapshot is already protected"));
        }
        if rc < 0 {
            return Err(Error::from_native(rc));
        }
        Ok(())
    }

    /// Clear the protected mark.
    ///
    /// Fails with `Busy` while a clone still depends on this snapshot; the
    /// dependency is tracked by the storage layer, not locally.
    pub fn snap_unprotect(&self, name: &str) -> Result<()> {
        let handle = self.shared.live_handle()?;
        let rc = self.shared.engine.snap_unprotect(handle, name);
        if rc == -errno::EINVAL {
            return Err(Error::invalid_state("snapshot is not protected"));
        }
        if rc < 0 {
            return Err(Error::from_native(rc));
        }
        Ok(())
    }

    /// Query a snapshot's protection state.
    pub fn snap_is_protected(&self, name: &str) -> Result<bool> {
        let handle = self.shared.live_handle()?;
        let mut protected = false;
        let rc = self
            .shared
            .engine
            .snap_is_protected(handle, name, &mut protected);
        if rc < 0 {
            return Err(Error::from_native(rc));
        }
        Ok(protected)
    }

    /// Remove a snapshot. Only unprotected snapshots are removable.
    pub fn snap_remove(&self, name: &str) -> Result<()> {
        let handle = self.shared.live_handle()?;
        let rc = self.shared.engine.snap_remove(handle, name);
        if rc < 0 {
            return Err(Error::from_native(rc));
        }
        Ok(())
    }

    /// List snapshots in creation order, as reported by the storage layer
    /// at call time. Nothing is cached.
    pub fn snap_list(&self) -> Result<Vec<SnapshotInfo>> {
        let handle = self.shared.live_handle()?;
        let mut raw = Vec::new();
        let rc = self.shared.engine.snap_list(handle, &mut raw);
        if rc < 0 {
            return Err(Error::from_native(rc));
        }
        Ok(raw.into_iter().map(SnapshotInfo::from).collect())
    }

    /// Derive a child image from a protected snapshot of this image,
    /// possibly into a different pool.
    ///
    /// The protection precondition is checked locally first: cloning an
    /// unprotected snapshot fails with `InvalidState` before any native
    /// call is attempted. On success the child is addressable via
    /// [`PoolContext::open_image`] on the target; no ancestry is retained
    /// by this library.
    pub fn clone_to(
        &self,
        snap_name: &str,
        target: &PoolContext,
        child_name: &str,
        features: u64,
        order: u8,
    ) -> Result<()> {
        if !self.snap_is_protected(snap_name)? {
            return Err(Error::invalid_state(
                "parent snapshot must be protected before cloning",
            ));
        }
        let src_pool = self.shared.pool_handle()?;
        let dst_pool = target.shared.live_handle()?;
        let rc = self.shared.engine.image_clone(
            src_pool,
            &self.shared.name,
            snap_name,
            dst_pool,
            child_name,
            features,
            order,
        );
        if rc < 0 {
            return Err(Error::from_native(rc));
        }
        info!(
            parent = %self.shared.name,
            snap = %snap_name,
            child = %child_name,
            "cloned image"
        );
        Ok(())
    }

    /// Bulk-copy the full contents of this image into another open image.
    ///
    /// This is a plain data copy, not a snapshot-backed clone. Destination
    /// capacity validation is deferred to the storage layer.
    pub fn copy_to(&self, dest: &Image) -> Result<()> {
        let src = self.shared.live_handle()?;
        let dst = dest.shared.live_handle()?;
        let rc = self.shared.engine.image_copy(src, dst);
        if rc < 0 {
            return Err(Error::from_native(rc));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::testutil;
    use crate::{Error, Image, PoolContext, FEATURE_LAYERING};
    use rand::RngCore;

    const MB: u64 = 1 << 20;

    fn layered_image(ctx: &PoolContext, name: &str) -> Image {
        ctx.create_image_with(name, 10 * MB, FEATURE_LAYERING, 0)
            .unwrap();
        ctx.open_image(name).unwrap()
    }

    #[test]
    fn create_protect_clone_unprotect_remove() {
        let (engine, pool) = testutil::test_engine();
        let session = testutil::connected_session(&engine);
        let ctx = session.pool_context(&pool).unwrap();
        let image = layered_image(&ctx, "baseimage");

        image.snap_create("mysnapshot").unwrap();
        image.snap_protect("mysnapshot").unwrap();
        assert!(image.snap_is_protected("mysnapshot").unwrap());

        let snaps = image.snap_list().unwrap();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].name, "mysnapshot");
        assert_eq!(snaps[0].size, 10 * MB);

        image
            .clone_to("mysnapshot", &ctx, "baseimage-child1", FEATURE_LAYERING, 0)
            .unwrap();
        let child = ctx.open_image("baseimage-child1").unwrap();
        assert!(!child.is_legacy_format().unwrap());
        child.close();
        ctx.remove_image("baseimage-child1").unwrap();

        image.snap_unprotect("mysnapshot").unwrap();
        image.snap_remove("mysnapshot").unwrap();
        assert!(image.snap_list().unwrap().is_empty());

        image.close();
        ctx.remove_image("baseimage").unwrap();
    }

    #[test]
    fn ten_snapshots_list_and_drain() {
        let (engine, pool) = testutil::test_engine();
        let session = testutil::connected_session(&engine);
        let ctx = session.pool_context(&pool).unwrap();
        let image = layered_image(&ctx, "baseimage");

        for i in 0..10 {
            image.snap_create(&format!("mysnapshot-{i}")).unwrap();
            image.snap_protect(&format!("mysnapshot-{i}")).unwrap();
        }

        let snaps = image.snap_list().unwrap();
        assert_eq!(snaps.len(), 10);
        // creation order is preserved
        for (i, snap) in snaps.iter().enumerate() {
            assert_eq!(snap.name, format!("mysnapshot-{i}"));
        }

        for i in 0..10 {
            image.snap_unprotect(&format!("mysnapshot-{i}")).unwrap();
            image.snap_remove(&format!("mysnapshot-{i}")).unwrap();
        }
        assert!(image.snap_list().unwrap().is_empty());
        image.close();
    }

    #[test]
    fn duplicate_snapshot_name_already_exists() {
        let (engine, pool) = testutil::test_engine();
        let session = testutil::connected_session(&engine);
        let ctx = session.pool_context(&pool).unwrap();
        let image = layered_image(&ctx, "baseimage");

        image.snap_create("s1").unwrap();
        let err = image.snap_create("s1").unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        image.close();
    }

    #[test]
    fn clone_of_unprotected_snapshot_fails_locally() {
        let (engine, pool) = testutil::test_engine();
        engine.add_pool("other");
        let session = testutil::connected_session(&engine);
        let ctx = session.pool_context(&pool).unwrap();
        let target = session.pool_context("other").unwrap();
        let image = layered_image(&ctx, "baseimage");

        image.snap_create("s1").unwrap();
        let err = image
            .clone_to("s1", &target, "child", FEATURE_LAYERING, 0)
            .unwrap_err();
        assert!(err.is_invalid_state());
        // the native layer was never reached: no child was created
        assert!(target.list_images().unwrap().is_empty());
        image.close();
    }

    #[test]
    fn clone_into_another_pool() {
        let (engine, pool) = testutil::test_engine();
        engine.add_pool("other");
        let session = testutil::connected_session(&engine);
        let ctx = session.pool_context(&pool).unwrap();
        let target = session.pool_context("other").unwrap();
        let image = layered_image(&ctx, "baseimage");

        image.write(b"parent data").unwrap();
        image.snap_create("s1").unwrap();
        image.snap_protect("s1").unwrap();
        image.clone_to("s1", &target, "child", FEATURE_LAYERING, 0).unwrap();

        let child = target.open_image("child").unwrap();
        assert_eq!(&child.read(0, 11).unwrap()[..], b"parent data");
        child.close();
        image.close();
    }

    #[test]
    fn unprotect_blocked_while_clone_depends() {
        let (engine, pool) = testutil::test_engine();
        let session = testutil::connected_session(&engine);
        let ctx = session.pool_context(&pool).unwrap();
        let image = layered_image(&ctx, "baseimage");

        image.snap_create("s1").unwrap();
        image.snap_protect("s1").unwrap();
        image.clone_to("s1", &ctx, "child", FEATURE_LAYERING, 0).unwrap();

        assert!(image.snap_unprotect("s1").unwrap_err().is_busy());
        assert!(image.snap_remove("s1").unwrap_err().is_busy());

        ctx.remove_image("child").unwrap();
        image.snap_unprotect("s1").unwrap();
        image.snap_remove("s1").unwrap();
        image.close();
    }

    #[test]
    fn protection_state_transitions_are_guarded() {
        let (engine, pool) = testutil::test_engine();
        let session = testutil::connected_session(&engine);
        let ctx = session.pool_context(&pool).unwrap();
        let image = layered_image(&ctx, "baseimage");

        image.snap_create("s1").unwrap();
        assert!(image.snap_unprotect("s1").unwrap_err().is_invalid_state());
        image.snap_protect("s1").unwrap();
        assert!(image.snap_protect("s1").unwrap_err().is_invalid_state());
        image.close();
    }

    #[test]
    fn copy_reproduces_random_content() {
        let (engine, pool) = testutil::test_engine();
        let session = testutil::connected_session(&engine);
        let ctx = session.pool_context(&pool).unwrap();

        let src = layered_image(&ctx, "imagecopy1");
        let dst = layered_image(&ctx, "imagecopy2");

        let mut payload = vec![0u8; 4096];
        rand::thread_rng().fill_bytes(&mut payload);
        src.write(&payload).unwrap();

        src.copy_to(&dst).unwrap();
        assert_eq!(&dst.read(0, payload.len()).unwrap()[..], &payload[..]);

        src.close();
        dst.close();
    }

    #[test]
    fn snapshot_operations_fail_on_closed_image() {
        let (engine, pool) = testutil::test_engine();
        let session = testutil::connected_session(&engine);
        let ctx = session.pool_context(&pool).unwrap();
        let image = layered_image(&ctx, "baseimage");
        image.close();

        assert!(image.snap_create("s1").unwrap_err().is_invalid_state());
        assert!(image.snap_list().unwrap_err().is_invalid_state());
        assert!(
            image
                .clone_to("s1", &ctx, "child", FEATURE_LAYERING, 0)
                .unwrap_err()
                .is_invalid_state()
        );
    }
}
