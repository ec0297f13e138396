//! Tidepool native engine boundary
//!
//! The client library talks to the block-storage engine through the
//! [`NativeEngine`] trait, which mirrors the C calling convention of the
//! native libraries: opaque `u64` handles, signed integer returns where
//! zero or a positive count means success and a negative value is a
//! `-errno`-style status, and out-parameters for data-bearing calls.
//!
//! Nothing at this boundary allocates typed errors; translation into the
//! taxonomy in `tidepool-common` happens one layer up, in
//! `tidepool-client`. The crate also ships [`MemoryEngine`], a complete
//! in-process engine used by the test suite and local development.

pub mod memory;

// Re-exports
pub use memory::MemoryEngine;

use std::path::Path;

/// Opaque handle issued by an engine.
///
/// Handles are process-local and never reused while open. Each handle is
/// owned by exactly one client-side entity and must be released exactly
/// once through the matching close/shutdown call.
pub type RawHandle = u64;

/// Feature bit: layering, required for clone support.
pub const FEATURE_LAYERING: u64 = 1 << 0;

/// Default object size exponent (22 = 4 MiB objects).
pub const DEFAULT_OBJECT_ORDER: u8 = 22;

/// Image metadata as reported by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawImageInfo {
    /// Image size in bytes.
    pub size: u64,
    /// Object size exponent (object size is `1 << obj_order` bytes).
    pub obj_order: u8,
    /// True when the image uses the legacy (format 1) on-disk layout.
    pub old_format: bool,
}

/// Snapshot metadata as reported by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawSnapInfo {
    /// Engine-assigned snapshot id, unique within the image.
    pub id: u64,
    /// Snapshot name, unique within the image.
    pub name: String,
    /// Image size at snapshot time, in bytes.
    pub size: u64,
}

/// The native storage engine boundary.
///
/// One method per native entry point. Methods returning `i32` yield `0` on
/// success; methods returning `i64` yield a non-negative handle or byte
/// count. Any negative return is a `-errno` status to be translated by the
/// caller.
pub trait NativeEngine: Send + Sync {
    /// Engine library version as (major, minor, patch). Always succeeds.
    fn version(&self) -> (u32, u32, u32);

    /// Allocate a client handle for the given identity.
    fn create_client(&self, client_id: &str) -> i64;

    /// Set one configuration key on an unconnected client.
    fn conf_set(&self, client: RawHandle, key: &str, value: &str) -> i32;

    /// Merge a configuration file into the client's overlay.
    fn conf_read_file(&self, client: RawHandle, path: &Path) -> i32;

    /// Establish the cluster connection.
    fn connect(&self, client: RawHandle) -> i32;

    /// Tear down the connection and release the client handle along with
    /// every pool and image handle derived from it.
    fn shutdown(&self, client: RawHandle) -> i32;

    /// Open a handle scoped to one pool. Returns the pool handle.
    fn pool_open(&self, client: RawHandle, pool: &str) -> i64;

    /// Release a pool handle.
    fn pool_close(&self, ioctx: RawHandle) -> i32;

    /// Create an image in the legacy (format 1) layout.
    fn image_create(&self, ioctx: RawHandle, name: &str, size: u64) -> i32;

    /// Create a format 2 image with explicit feature bits and object order
    /// (0 selects the engine default).
    fn image_create2(&self, ioctx: RawHandle, name: &str, size: u64, features: u64, order: u8)
        -> i32;

    /// Open an image by name. Returns the image handle.
    fn image_open(&self, ioctx: RawHandle, name: &str) -> i64;

    /// Release an image handle.
    fn image_close(&self, image: RawHandle) -> i32;

    /// List image names in the pool, in stable order.
    fn image_list(&self, ioctx: RawHandle, out: &mut Vec<String>) -> i32;

    /// Remove a closed image.
    fn image_remove(&self, ioctx: RawHandle, name: &str) -> i32;

    /// Rename an image within its pool.
    fn image_rename(&self, ioctx: RawHandle, old: &str, new: &str) -> i32;

    /// Query current image metadata.
    fn image_stat(&self, image: RawHandle, out: &mut RawImageInfo) -> i32;

    /// Query whether the image uses the legacy layout.
    fn image_old_format(&self, image: RawHandle, out: &mut bool) -> i32;

    /// Grow or truncate the image.
    fn image_resize(&self, image: RawHandle, size: u64) -> i32;

    /// Positioned read. Returns the byte count actually read; short reads
    /// happen only at end-of-image.
    fn image_read(&self, image: RawHandle, offset: u64, buf: &mut [u8]) -> i64;

    /// Positioned write. Returns the byte count written; there are no
    /// partial writes.
    fn image_write(&self, image: RawHandle, offset: u64, data: &[u8]) -> i64;

    /// Create a snapshot of the image's current contents.
    fn snap_create(&self, image: RawHandle, name: &str) -> i32;

    /// Remove an unprotected snapshot.
    fn snap_remove(&self, image: RawHandle, name: &str) -> i32;

    /// Mark a snapshot as protected, gating it for use as a clone parent.
    fn snap_protect(&self, image: RawHandle, name: &str) -> i32;

    /// Clear the protected mark. Fails while clone children exist.
    fn snap_unprotect(&self, image: RawHandle, name: &str) -> i32;

    /// Query a snapshot's protection state.
    fn snap_is_protected(&self, image: RawHandle, name: &str, out: &mut bool) -> i32;

    /// List snapshots in creation order.
    fn snap_list(&self, image: RawHandle, out: &mut Vec<RawSnapInfo>) -> i32;

    /// Derive a child image from a protected snapshot, possibly into a
    /// different pool.
    #[allow(clippy::too_many_arguments)]
    fn image_clone(
        &self,
        src_ioctx: RawHandle,
        parent: &str,
        snap: &str,
        dst_ioctx: RawHandle,
        child: &str,
        features: u64,
        order: u8,
    ) -> i32;

    /// Bulk-copy the full contents of one open image into another.
    fn image_copy(&self, src_image: RawHandle, dst_image: RawHandle) -> i32;
}
