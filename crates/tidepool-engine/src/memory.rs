//! In-process storage engine
//!
//! [`MemoryEngine`] implements the full [`NativeEngine`] boundary against
//! process-local state. It exists for the test suite and local development,
//! and it deliberately keeps the native calling convention: raw handles,
//! integer statuses, and no typed errors. Behavior at the edges (stale
//! handles, ordering violations, out-of-bounds I/O) mirrors what the real
//! engine reports so the client's translation layer can be exercised
//! without a cluster.

use crate::{
    DEFAULT_OBJECT_ORDER, FEATURE_LAYERING, NativeEngine, RawHandle, RawImageInfo, RawSnapInfo,
};

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tidepool_common::errno;
use tracing::debug;

/// Engine version reported by [`NativeEngine::version`].
pub const ENGINE_VERSION: (u32, u32, u32) = (1, 2, 0);

/// Object order bounds accepted for image creation (4 KiB to 32 MiB).
const MIN_OBJECT_ORDER: u8 = 12;
const MAX_OBJECT_ORDER: u8 = 25;

#[derive(Debug)]
struct ClientRec {
    #[allow(dead_code)]
    id: String,
    conf: BTreeMap<String, String>,
    connected: bool,
}

#[derive(Debug)]
struct IoctxRec {
    client: RawHandle,
    pool: String,
}

#[derive(Debug)]
struct OpenImageRec {
    client: RawHandle,
    pool: String,
    name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ParentRef {
    pool: String,
    image: String,
    snap: String,
}

#[derive(Debug)]
struct SnapRec {
    id: u64,
    name: String,
    size: u64,
    protected: bool,
    data: Vec<u8>,
}

#[derive(Debug)]
struct ImageRec {
    size: u64,
    order: u8,
    features: u64,
    old_format: bool,
    data: Vec<u8>,
    snaps: Vec<SnapRec>,
    parent: Option<ParentRef>,
}

#[derive(Debug, Default)]
struct Pool {
    // BTreeMap keeps image listings in stable order
    images: BTreeMap<String, ImageRec>,
}

#[derive(Debug, Default)]
struct Inner {
    next_handle: RawHandle,
    next_snap_id: u64,
    clients: HashMap<RawHandle, ClientRec>,
    ioctxs: HashMap<RawHandle, IoctxRec>,
    open_images: HashMap<RawHandle, OpenImageRec>,
    pools: BTreeMap<String, Pool>,
}

impl Inner {
    fn alloc(&mut self) -> RawHandle {
        self.next_handle += 1;
        self.next_handle
    }

    fn ioctx_pool(&self, ioctx: RawHandle) -> Result<String, i32> {
        let ctx = self.ioctxs.get(&ioctx).ok_or(-errno::EBADF)?;
        if !self.clients.contains_key(&ctx.client) {
            return Err(-errno::ENOTCONN);
        }
        Ok(ctx.pool.clone())
    }

    fn image_loc(&self, image: RawHandle) -> Result<(String, String), i32> {
        let open = self.open_images.get(&image).ok_or(-errno::EBADF)?;
        if !self.clients.contains_key(&open.client) {
            return Err(-errno::ENOTCONN);
        }
        Ok((open.pool.clone(), open.name.clone()))
    }

    fn image_ref(&self, image: RawHandle) -> Result<&ImageRec, i32> {
        let (pool, name) = self.image_loc(image)?;
        self.pools
            .get(&pool)
            .and_then(|p| p.images.get(&name))
            .ok_or(-errno::ENOENT)
    }

    fn image_mut(&mut self, image: RawHandle) -> Result<&mut ImageRec, i32> {
        let (pool, name) = self.image_loc(image)?;
        self.pools
            .get_mut(&pool)
            .and_then(|p| p.images.get_mut(&name))
            .ok_or(-errno::ENOENT)
    }

    fn is_open(&self, pool: &str, name: &str) -> bool {
        self.open_images
            .values()
            .any(|o| o.pool == pool && o.name == name)
    }

    fn has_clone_children(&self, parent: &ParentRef) -> bool {
        self.pools
            .values()
            .flat_map(|p| p.images.values())
            .any(|img| img.parent.as_ref() == Some(parent))
    }

    fn create_image(
        &mut self,
        ioctx: RawHandle,
        name: &str,
        size: u64,
        features: u64,
        order: u8,
        old_format: bool,
    ) -> i32 {
        if size == 0 {
            return -errno::EINVAL;
        }
        let order = if order == 0 { DEFAULT_OBJECT_ORDER } else { order };
        if !(MIN_OBJECT_ORDER..=MAX_OBJECT_ORDER).contains(&order) {
            return -errno::EINVAL;
        }
        let pool_name = match self.ioctx_pool(ioctx) {
            Ok(p) => p,
            Err(rc) => return rc,
        };
        let pool = self.pools.get_mut(&pool_name).expect("ioctx pool exists");
        if pool.images.contains_key(name) {
            return -errno::EEXIST;
        }
        pool.images.insert(
            name.to_string(),
            ImageRec {
                size,
                order,
                features,
                old_format,
                data: vec![0; size as usize],
                snaps: Vec::new(),
                parent: None,
            },
        );
        debug!(pool = %pool_name, image = %name, size, "created image");
        0
    }
}

/// In-process implementation of the native engine boundary.
///
/// Pools must be registered through [`MemoryEngine::add_pool`] before a
/// client can open them, mirroring the fact that pool creation belongs to
/// cluster administration rather than this library.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    inner: Mutex<Inner>,
}

impl MemoryEngine {
    /// Create an empty engine with no pools.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pool. Existing pools are left untouched.
    pub fn add_pool(&self, name: &str) {
        self.inner
            .lock()
            .pools
            .entry(name.to_string())
            .or_default();
    }
}

impl NativeEngine for MemoryEngine {
    fn version(&self) -> (u32, u32, u32) {
        ENGINE_VERSION
    }

    fn create_client(&self, client_id: &str) -> i64 {
        let mut inner = self.inner.lock();
        let handle = inner.alloc();
        inner.clients.insert(
            handle,
            ClientRec {
                id: client_id.to_string(),
                conf: BTreeMap::new(),
                connected: false,
            },
        );
        handle as i64
    }

    fn conf_set(&self, client: RawHandle, key: &str, value: &str) -> i32 {
        let mut inner = self.inner.lock();
        match inner.clients.get_mut(&client) {
            Some(rec) => {
                rec.conf.insert(key.to_string(), value.to_string());
                0
            }
            None => -errno::EBADF,
        }
    }

    fn conf_read_file(&self, client: RawHandle, path: &Path) -> i32 {
        let mut inner = self.inner.lock();
        if !inner.clients.contains_key(&client) {
            return -errno::EBADF;
        }
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return -errno::ENOENT,
            Err(_) => return -errno::EIO,
        };
        // ini-style: `key = value` lines, [section] headers, # or ; comments
        let mut parsed = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return -errno::EINVAL;
            };
            parsed.insert(key.trim().to_string(), value.trim().to_string());
        }
        let rec = inner.clients.get_mut(&client).expect("checked above");
        rec.conf.extend(parsed);
        0
    }

    fn connect(&self, client: RawHandle) -> i32 {
        let mut inner = self.inner.lock();
        match inner.clients.get_mut(&client) {
            Some(rec) if rec.connected => -errno::EISCONN,
            Some(rec) => {
                rec.connected = true;
                debug!(handle = client, "client connected");
                0
            }
            None => -errno::EBADF,
        }
    }

    fn shutdown(&self, client: RawHandle) -> i32 {
        let mut inner = self.inner.lock();
        if inner.clients.remove(&client).is_none() {
            return -errno::EBADF;
        }
        // Derived handles stay in the tables so later use reports a stale
        // connection rather than an unknown handle.
        debug!(handle = client, "client shut down");
        0
    }

    fn pool_open(&self, client: RawHandle, pool: &str) -> i64 {
        let mut inner = self.inner.lock();
        match inner.clients.get(&client) {
            Some(rec) if rec.connected => {}
            Some(_) => return i64::from(-errno::ENOTCONN),
            None => return i64::from(-errno::EBADF),
        }
        if !inner.pools.contains_key(pool) {
            return i64::from(-errno::ENOENT);
        }
        let handle = inner.alloc();
        inner.ioctxs.insert(
            handle,
            IoctxRec {
                client,
                pool: pool.to_string(),
            },
        );
        handle as i64
    }

    fn pool_close(&self, ioctx: RawHandle) -> i32 {
        let mut inner = self.inner.lock();
        match inner.ioctxs.remove(&ioctx) {
            Some(_) => 0,
            None => -errno::EBADF,
        }
    }

    fn image_create(&self, ioctx: RawHandle, name: &str, size: u64) -> i32 {
        self.inner
            .lock()
            .create_image(ioctx, name, size, 0, 0, true)
    }

    fn image_create2(
        &self,
        ioctx: RawHandle,
        name: &str,
        size: u64,
        features: u64,
        order: u8,
    ) -> i32 {
        self.inner
            .lock()
            .create_image(ioctx, name, size, features, order, false)
    }

    fn image_open(&self, ioctx: RawHandle, name: &str) -> i64 {
        let mut inner = self.inner.lock();
        let pool = match inner.ioctx_pool(ioctx) {
            Ok(p) => p,
            Err(rc) => return i64::from(rc),
        };
        let client = inner.ioctxs[&ioctx].client;
        if !inner
            .pools
            .get(&pool)
            .is_some_and(|p| p.images.contains_key(name))
        {
            return i64::from(-errno::ENOENT);
        }
        let handle = inner.alloc();
        inner.open_images.insert(
            handle,
            OpenImageRec {
                client,
                pool,
                name: name.to_string(),
            },
        );
        handle as i64
    }

    fn image_close(&self, image: RawHandle) -> i32 {
        let mut inner = self.inner.lock();
        match inner.open_images.remove(&image) {
            Some(_) => 0,
            None => -errno::EBADF,
        }
    }

    fn image_list(&self, ioctx: RawHandle, out: &mut Vec<String>) -> i32 {
        let inner = self.inner.lock();
        let pool = match inner.ioctx_pool(ioctx) {
            Ok(p) => p,
            Err(rc) => return rc,
        };
        out.clear();
        out.extend(inner.pools[&pool].images.keys().cloned());
        0
    }

    fn image_remove(&self, ioctx: RawHandle, name: &str) -> i32 {
        let mut inner = self.inner.lock();
        let pool_name = match inner.ioctx_pool(ioctx) {
            Ok(p) => p,
            Err(rc) => return rc,
        };
        if inner.is_open(&pool_name, name) {
            return -errno::EBUSY;
        }
        let pool = inner.pools.get_mut(&pool_name).expect("ioctx pool exists");
        match pool.images.get(name) {
            Some(img) if !img.snaps.is_empty() => -errno::ENOTEMPTY,
            Some(_) => {
                pool.images.remove(name);
                debug!(pool = %pool_name, image = %name, "removed image");
                0
            }
            None => -errno::ENOENT,
        }
    }

    fn image_rename(&self, ioctx: RawHandle, old: &str, new: &str) -> i32 {
        let mut inner = self.inner.lock();
        let pool_name = match inner.ioctx_pool(ioctx) {
            Ok(p) => p,
            Err(rc) => return rc,
        };
        let pool = inner.pools.get_mut(&pool_name).expect("ioctx pool exists");
        if pool.images.contains_key(new) {
            return -errno::EEXIST;
        }
        let Some(rec) = pool.images.remove(old) else {
            return -errno::ENOENT;
        };
        pool.images.insert(new.to_string(), rec);
        for open in inner.open_images.values_mut() {
            if open.pool == pool_name && open.name == old {
                open.name = new.to_string();
            }
        }
        0
    }

    fn image_stat(&self, image: RawHandle, out: &mut RawImageInfo) -> i32 {
        let inner = self.inner.lock();
        match inner.image_ref(image) {
            Ok(rec) => {
                out.size = rec.size;
                out.obj_order = rec.order;
                out.old_format = rec.old_format;
                0
            }
            Err(rc) => rc,
        }
    }

    fn image_old_format(&self, image: RawHandle, out: &mut bool) -> i32 {
        let inner = self.inner.lock();
        match inner.image_ref(image) {
            Ok(rec) => {
                *out = rec.old_format;
                0
            }
            Err(rc) => rc,
        }
    }

    fn image_resize(&self, image: RawHandle, size: u64) -> i32 {
        if size == 0 {
            return -errno::EINVAL;
        }
        let mut inner = self.inner.lock();
        match inner.image_mut(image) {
            Ok(rec) => {
                rec.size = size;
                rec.data.resize(size as usize, 0);
                0
            }
            Err(rc) => rc,
        }
    }

    fn image_read(&self, image: RawHandle, offset: u64, buf: &mut [u8]) -> i64 {
        let inner = self.inner.lock();
        let rec = match inner.image_ref(image) {
            Ok(rec) => rec,
            Err(rc) => return i64::from(rc),
        };
        if offset >= rec.size {
            return 0;
        }
        let start = offset as usize;
        let end = rec.size.min(offset + buf.len() as u64) as usize;
        let n = end - start;
        buf[..n].copy_from_slice(&rec.data[start..end]);
        n as i64
    }

    fn image_write(&self, image: RawHandle, offset: u64, data: &[u8]) -> i64 {
        let mut inner = self.inner.lock();
        let rec = match inner.image_mut(image) {
            Ok(rec) => rec,
            Err(rc) => return i64::from(rc),
        };
        let end = match offset.checked_add(data.len() as u64) {
            Some(end) if end <= rec.size => end,
            _ => return i64::from(-errno::EINVAL),
        };
        rec.data[offset as usize..end as usize].copy_from_slice(data);
        data.len() as i64
    }

    fn snap_create(&self, image: RawHandle, name: &str) -> i32 {
        let mut inner = self.inner.lock();
        if let Err(rc) = inner.image_ref(image) {
            return rc;
        }
        inner.next_snap_id += 1;
        let id = inner.next_snap_id;
        let rec = inner.image_mut(image).expect("checked above");
        if rec.snaps.iter().any(|s| s.name == name) {
            return -errno::EEXIST;
        }
        rec.snaps.push(SnapRec {
            id,
            name: name.to_string(),
            size: rec.size,
            protected: false,
            data: rec.data.clone(),
        });
        debug!(image, snap = %name, "created snapshot");
        0
    }

    fn snap_remove(&self, image: RawHandle, name: &str) -> i32 {
        let mut inner = self.inner.lock();
        let rec = match inner.image_mut(image) {
            Ok(rec) => rec,
            Err(rc) => return rc,
        };
        let Some(pos) = rec.snaps.iter().position(|s| s.name == name) else {
            return -errno::ENOENT;
        };
        if rec.snaps[pos].protected {
            return -errno::EBUSY;
        }
        rec.snaps.remove(pos);
        0
    }

    fn snap_protect(&self, image: RawHandle, name: &str) -> i32 {
        let mut inner = self.inner.lock();
        let rec = match inner.image_mut(image) {
            Ok(rec) => rec,
            Err(rc) => return rc,
        };
        match rec.snaps.iter_mut().find(|s| s.name == name) {
            Some(snap) if snap.protected => -errno::EBUSY,
            Some(snap) => {
                snap.protected = true;
                0
            }
            None => -errno::ENOENT,
        }
    }

    fn snap_unprotect(&self, image: RawHandle, name: &str) -> i32 {
        let mut inner = self.inner.lock();
        let (pool, image_name) = match inner.image_loc(image) {
            Ok(loc) => loc,
            Err(rc) => return rc,
        };
        let parent = ParentRef {
            pool,
            image: image_name,
            snap: name.to_string(),
        };
        let rec = inner.image_ref(image).expect("located above");
        match rec.snaps.iter().find(|s| s.name == name) {
            Some(snap) if !snap.protected => return -errno::EINVAL,
            Some(_) => {}
            None => return -errno::ENOENT,
        }
        if inner.has_clone_children(&parent) {
            return -errno::EBUSY;
        }
        let rec = inner.image_mut(image).expect("located above");
        let snap = rec
            .snaps
            .iter_mut()
            .find(|s| s.name == name)
            .expect("checked above");
        snap.protected = false;
        0
    }

    fn snap_is_protected(&self, image: RawHandle, name: &str, out: &mut bool) -> i32 {
        let inner = self.inner.lock();
        let rec = match inner.image_ref(image) {
            Ok(rec) => rec,
            Err(rc) => return rc,
        };
        match rec.snaps.iter().find(|s| s.name == name) {
            Some(snap) => {
                *out = snap.protected;
                0
            }
            None => -errno::ENOENT,
        }
    }

    fn snap_list(&self, image: RawHandle, out: &mut Vec<RawSnapInfo>) -> i32 {
        let inner = self.inner.lock();
        let rec = match inner.image_ref(image) {
            Ok(rec) => rec,
            Err(rc) => return rc,
        };
        out.clear();
        out.extend(rec.snaps.iter().map(|s| RawSnapInfo {
            id: s.id,
            name: s.name.clone(),
            size: s.size,
        }));
        0
    }

    fn image_clone(
        &self,
        src_ioctx: RawHandle,
        parent: &str,
        snap: &str,
        dst_ioctx: RawHandle,
        child: &str,
        features: u64,
        order: u8,
    ) -> i32 {
        let mut inner = self.inner.lock();
        let src_pool = match inner.ioctx_pool(src_ioctx) {
            Ok(p) => p,
            Err(rc) => return rc,
        };
        let dst_pool = match inner.ioctx_pool(dst_ioctx) {
            Ok(p) => p,
            Err(rc) => return rc,
        };
        let order = if order == 0 { DEFAULT_OBJECT_ORDER } else { order };
        if !(MIN_OBJECT_ORDER..=MAX_OBJECT_ORDER).contains(&order) {
            return -errno::EINVAL;
        }

        let (snap_size, snap_data) = {
            let Some(parent_rec) = inner.pools[&src_pool].images.get(parent) else {
                return -errno::ENOENT;
            };
            // Cloning needs a format 2 parent with layering enabled.
            if parent_rec.old_format || parent_rec.features & FEATURE_LAYERING == 0 {
                return -errno::EINVAL;
            }
            match parent_rec.snaps.iter().find(|s| s.name == snap) {
                Some(s) if !s.protected => return -errno::EINVAL,
                Some(s) => (s.size, s.data.clone()),
                None => return -errno::ENOENT,
            }
        };

        let dst = inner.pools.get_mut(&dst_pool).expect("ioctx pool exists");
        if dst.images.contains_key(child) {
            return -errno::EEXIST;
        }
        dst.images.insert(
            child.to_string(),
            ImageRec {
                size: snap_size,
                order,
                features,
                old_format: false,
                data: snap_data,
                snaps: Vec::new(),
                parent: Some(ParentRef {
                    pool: src_pool,
                    image: parent.to_string(),
                    snap: snap.to_string(),
                }),
            },
        );
        debug!(parent = %parent, snap = %snap, child = %child, "cloned image");
        0
    }

    fn image_copy(&self, src_image: RawHandle, dst_image: RawHandle) -> i32 {
        let mut inner = self.inner.lock();
        let (src_size, src_data) = match inner.image_ref(src_image) {
            Ok(rec) => (rec.size, rec.data.clone()),
            Err(rc) => return rc,
        };
        if src_image == dst_image {
            return 0;
        }
        let dst = match inner.image_mut(dst_image) {
            Ok(rec) => rec,
            Err(rc) => return rc,
        };
        if dst.size < src_size {
            return -errno::ERANGE;
        }
        dst.data[..src_size as usize].copy_from_slice(&src_data);
        0
    }
}
