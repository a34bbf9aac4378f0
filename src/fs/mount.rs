//! The mount: handle cache, root handle, credentials, and the verb layer
//! that turns path-oriented filesystem calls into (bucket, key) requests.
//!
//! Lookup is the heart of it. A probe takes the key's partition latch and
//! keeps it through the decision: on a hit the handle gets its initial
//! reference and the latch drops; on a miss the lane set admits a new
//! handle (possibly recycling a cold one) and the latch publishes it
//! before releasing, so exactly one creator ever wins for a given key.
//! Losing a reference race (the handle was claimed by a reclaimer between
//! our probe and our ref) just retries the probe.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use bytes::Bytes;
use secrecy::ExposeSecret as _;
use tracing::{trace, warn};

use crate::config::Config;
use crate::error::{FsError, FsResult};
use crate::fs::handle::{FileHandle, HandleFactory, HandleFlags, MAX_DEPTH, ROOT_NAME, Stat};
use crate::fs::index::{HandleIndex, Probe};
use crate::fs::key::FhKey;
use crate::fs::lru::{LruLanes, RefFlags};
use crate::store::{Credentials, ObjectStore, StoreError, UserInfo};

/// Mount instance counter; also the `st_dev` each instance reports.
static FS_INSTANCE: AtomicU32 = AtomicU32::new(0);

/// A handle returned by lookup, plus whether this call manufactured it.
/// Freshly created handles have not been verified against the store.
pub struct LookupResult {
    pub handle: Arc<FileHandle>,
    pub created: bool,
}

/// What a `key/` prefix listing revealed.
struct PrefixProbe {
    /// Anything at all lives under the prefix (marker object included).
    exists: bool,
    /// Something other than the marker object lives under the prefix.
    has_children: bool,
}

pub struct BucketFs {
    store: Arc<dyn ObjectStore>,
    config: Config,
    creds: Credentials,
    user: Mutex<Option<UserInfo>>,
    instance: u32,
    fsid: String,
    root: Arc<FileHandle>,
    index: HandleIndex,
    lru: LruLanes,
    closed: AtomicBool,
}

impl BucketFs {
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, creds: Credentials, config: Config) -> Self {
        let instance = FS_INSTANCE.fetch_add(1, Ordering::Relaxed) + 1;
        // No bucket may carry this name, so the root key can never collide
        // with a real first-level lookup.
        let fsid = format!("{ROOT_NAME}bucketfs_inst-{instance}");
        let root = Arc::new(FileHandle::new_root(instance, &fsid));
        let index = HandleIndex::new(config.fhcache_partitions, config.fhcache_size);
        let lru = LruLanes::new(config.lru_lanes, config.lru_lane_hiwat);
        Self {
            store,
            config,
            creds,
            user: Mutex::new(None),
            instance,
            fsid,
            root,
            index,
            lru,
            closed: AtomicBool::new(false),
        }
    }

    /// Resolve the mount's access key and remember the user. Mismatched
    /// secrets and suspended accounts are refused.
    pub fn authorize(&self) -> FsResult<()> {
        let user = self
            .store
            .lookup_user(&self.creds.access_key)
            .map_err(|e| match e {
                StoreError::NotFound => FsError::NotFound,
                other => FsError::Backend(other),
            })?;
        if user.secret.expose_secret() != self.creds.secret.expose_secret() {
            return Err(FsError::InvalidArgument);
        }
        if user.suspended {
            return Err(FsError::UserSuspended);
        }
        *self.user.lock().expect("user mutex poisoned") = Some(user);
        Ok(())
    }

    #[must_use]
    pub fn root(&self) -> &Arc<FileHandle> {
        &self.root
    }

    #[must_use]
    pub fn instance(&self) -> u32 {
        self.instance
    }

    #[must_use]
    pub fn fsid(&self) -> &str {
        &self.fsid
    }

    #[must_use]
    pub fn user(&self) -> Option<UserInfo> {
        self.user.lock().expect("user mutex poisoned").clone()
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of handles currently resident in the cache (root excluded).
    #[must_use]
    pub fn cached_handles(&self) -> usize {
        self.lru.len()
    }

    // ── Handle cache ────────────────────────────────────────────────────

    /// Find or create the handle for `name` under `parent`.
    ///
    /// This is pure cache traffic — no store I/O, no verification of
    /// freshly manufactured handles; [`BucketFs::lookup`] layers that on
    /// top.
    pub fn lookup_fh(
        &self,
        parent: &Arc<FileHandle>,
        name: &str,
        cflags: HandleFlags,
    ) -> FsResult<LookupResult> {
        if self.closed() {
            return Err(FsError::NotFound);
        }
        if !parent.is_dir() {
            return Err(FsError::NotDirectory);
        }
        if parent.depth() >= MAX_DEPTH {
            return Err(FsError::PathTooDeep);
        }
        let key = parent.make_fhk(name);

        loop {
            match self.index.find_latch(key.object, &key) {
                Probe::Hit(fh, latch) => {
                    if self.lru.ref_handle(&fh, RefFlags::INITIAL) {
                        drop(latch);
                        return Ok(LookupResult {
                            handle: fh,
                            created: false,
                        });
                    }
                    // Claimed by a reclaimer between probe and ref.
                    drop(latch);
                    std::hint::spin_loop();
                }
                Probe::Miss(mut latch) => {
                    let factory = HandleFactory {
                        dev: u64::from(self.instance),
                        parent: Arc::clone(parent),
                        key,
                        name: name.to_owned(),
                        flags: cflags,
                    };
                    let Some(fh) = self.lru.insert(&self.index, &mut latch, &factory) else {
                        return Err(FsError::OutOfHandles);
                    };
                    self.index.insert_latched(Arc::clone(&fh), latch);
                    trace!(name = %name, key = ?fh.key(), "admitted handle");
                    return Ok(LookupResult {
                        handle: fh,
                        created: true,
                    });
                }
            }
        }
    }

    /// Take an additional reference on a held handle.
    pub fn ref_handle(&self, fh: &Arc<FileHandle>) {
        // A held handle cannot be mid-reclaim; the ref cannot fail.
        let ok = self.lru.ref_handle(fh, RefFlags::empty());
        debug_assert!(ok, "ref on a held handle cannot race a reclaimer");
    }

    /// Release one reference.
    pub fn unref(&self, fh: &Arc<FileHandle>) {
        self.lru.unref(fh);
    }

    /// Find a live handle by its opaque key alone. Returns `None` when the
    /// handle has been evicted; callers must be prepared to re-resolve by
    /// path.
    pub fn lookup_handle(&self, hk: FhKey) -> Option<Arc<FileHandle>> {
        if self.closed() {
            return None;
        }
        if hk == *self.root.key() {
            self.ref_handle(&self.root);
            return Some(Arc::clone(&self.root));
        }
        loop {
            match self.index.find_latch(hk.object, &hk) {
                Probe::Hit(fh, latch) => {
                    if self.lru.ref_handle(&fh, RefFlags::INITIAL) {
                        drop(latch);
                        return Some(fh);
                    }
                    drop(latch);
                    std::hint::spin_loop();
                }
                Probe::Miss(_latch) => {
                    warn!(
                        bucket = hk.bucket,
                        object = hk.object,
                        "handle lookup failed (need persistent handles)"
                    );
                    return None;
                }
            }
        }
    }

    fn find_cached(&self, key: &FhKey) -> Option<Arc<FileHandle>> {
        loop {
            match self.index.find_latch(key.object, key) {
                Probe::Hit(fh, latch) => {
                    if self.lru.ref_handle(&fh, RefFlags::INITIAL) {
                        drop(latch);
                        return Some(fh);
                    }
                    drop(latch);
                    std::hint::spin_loop();
                }
                Probe::Miss(_latch) => return None,
            }
        }
    }

    /// Drop a key from the index and its lane. Holders keep the handle
    /// alive; the name is simply no longer resolvable.
    fn evict(&self, key: &FhKey) {
        match self.index.find_latch(key.object, key) {
            Probe::Hit(fh, latch) => {
                self.index.erase_latched(key, latch);
                self.lru.forget(&fh);
            }
            Probe::Miss(_latch) => {}
        }
    }

    /// Flip the mount closed and drop every cached handle. Concurrent
    /// lookups observe the closed flag and fail with `NOT_FOUND`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.index.drain(|fh| {
            trace!(name = fh.object_name(), refs = fh.refs(), "drain unref");
            fh.clear_refs();
        });
        self.lru.drain(drop);
    }

    // ── Filesystem verbs ────────────────────────────────────────────────

    /// Path lookup with cold-miss verification.
    ///
    /// Cache hits are answered without I/O. A miss manufactures a handle
    /// and then confirms `(bucket, full path)` against the store — a head
    /// for buckets and file objects, a prefix probe for directories — so a
    /// hash collision or a stale name can never escape as a phantom entry.
    pub fn lookup(&self, parent: &Arc<FileHandle>, name: &str) -> FsResult<LookupResult> {
        if self.closed() {
            return Err(FsError::NotFound);
        }
        if !parent.is_dir() {
            return Err(FsError::NotDirectory);
        }
        let key = parent.make_fhk(name);
        if let Some(handle) = self.find_cached(&key) {
            return Ok(LookupResult {
                handle,
                created: false,
            });
        }

        if parent.is_root() {
            match self.store.head_bucket(name) {
                Ok(()) => {}
                Err(StoreError::NotFound) => return Err(FsError::NotFound),
                Err(e) => return Err(FsError::Backend(e)),
            }
            return self.lookup_fh(parent, name, HandleFlags::DIRECTORY);
        }

        let bucket = parent.bucket_name().to_owned();
        let key_name = parent.make_key_name(name);
        match self.store.head_object(&bucket, &key_name) {
            Ok(meta) => {
                let res = self.lookup_fh(parent, name, HandleFlags::empty())?;
                res.handle.set_size(meta.size);
                res.handle.set_mtime(meta.mtime);
                Ok(res)
            }
            Err(StoreError::NotFound) => {
                // No object at this key; a directory exists here exactly
                // when something lists under `key/`.
                let probe = self.probe_prefix(&bucket, &key_name)?;
                if probe.exists {
                    let res = self.lookup_fh(parent, name, HandleFlags::DIRECTORY)?;
                    res.handle.set_pseudo();
                    Ok(res)
                } else {
                    Err(FsError::NotFound)
                }
            }
            Err(e) => Err(FsError::Backend(e)),
        }
    }

    fn probe_prefix(&self, bucket: &str, key_name: &str) -> FsResult<PrefixProbe> {
        let prefix = format!("{key_name}/");
        let mut probe = PrefixProbe {
            exists: false,
            has_children: false,
        };
        self.store
            .list_objects(bucket, &prefix, '/', None, &mut |n, _m, _p| {
                probe.exists = true;
                if n.is_empty() {
                    // The directory's own marker object.
                    return ControlFlow::Continue(());
                }
                probe.has_children = true;
                ControlFlow::Break(())
            })?;
        Ok(probe)
    }

    /// Attributes; never touches the store.
    pub fn getattr(&self, fh: &Arc<FileHandle>) -> FsResult<Stat> {
        if self.closed() {
            return Err(FsError::NotFound);
        }
        Ok(fh.stat())
    }

    /// Create an empty file object and return its open handle.
    pub fn create(&self, parent: &Arc<FileHandle>, name: &str) -> FsResult<LookupResult> {
        if self.closed() {
            return Err(FsError::NotFound);
        }
        if parent.is_root() {
            // Only buckets live at the first level.
            return Err(FsError::InvalidArgument);
        }
        let key = parent.make_fhk(name);
        if let Some(existing) = self.find_cached(&key) {
            self.unref(&existing);
            return Err(FsError::AlreadyExists);
        }

        let bucket = parent.bucket_name().to_owned();
        let key_name = parent.make_key_name(name);
        match self.store.head_object(&bucket, &key_name) {
            Ok(_) => return Err(FsError::AlreadyExists),
            Err(StoreError::NotFound) => {}
            Err(e) => return Err(FsError::Backend(e)),
        }
        self.store.put_object(&bucket, &key_name, Bytes::new())?;

        let res = self.lookup_fh(parent, name, HandleFlags::empty())?;
        res.handle.open_for_create();
        res.handle.open()?;
        res.handle.set_times(SystemTime::now());
        Ok(res)
    }

    /// Make a directory: a bucket at the first level, a `key/` marker
    /// object below it.
    pub fn mkdir(&self, parent: &Arc<FileHandle>, name: &str) -> FsResult<LookupResult> {
        if self.closed() {
            return Err(FsError::NotFound);
        }
        if parent.is_root() {
            self.store.create_bucket(name).map_err(|e| match e {
                StoreError::AlreadyExists => FsError::AlreadyExists,
                other => FsError::Backend(other),
            })?;
        } else {
            let bucket = parent.bucket_name().to_owned();
            let marker_key = format!("{}/", parent.make_key_name(name));
            self.store.put_object(&bucket, &marker_key, Bytes::new())?;
        }
        let res = self.lookup_fh(parent, name, HandleFlags::DIRECTORY)?;
        res.handle.set_times(SystemTime::now());
        Ok(res)
    }

    /// Remove a file object and forget its handle mapping.
    pub fn unlink(&self, parent: &Arc<FileHandle>, name: &str) -> FsResult<()> {
        if self.closed() {
            return Err(FsError::NotFound);
        }
        if parent.is_root() {
            return Err(FsError::IsDirectory);
        }
        let bucket = parent.bucket_name().to_owned();
        let key_name = parent.make_key_name(name);
        self.store.delete_object(&bucket, &key_name)?;
        self.evict(&parent.make_fhk(name));
        Ok(())
    }

    /// Remove an empty directory: the bucket itself at the first level,
    /// the `key/` marker below it.
    pub fn rmdir(&self, parent: &Arc<FileHandle>, name: &str) -> FsResult<()> {
        if self.closed() {
            return Err(FsError::NotFound);
        }
        if parent.is_root() {
            self.store.delete_bucket(name).map_err(|e| match e {
                StoreError::NotFound => FsError::NotFound,
                other => FsError::Backend(other),
            })?;
        } else {
            let bucket = parent.bucket_name().to_owned();
            let key_name = parent.make_key_name(name);
            if self.probe_prefix(&bucket, &key_name)?.has_children {
                return Err(FsError::Backend(StoreError::NotEmpty));
            }
            // Pseudo directories have no marker object to delete.
            match self.store.delete_object(&bucket, &format!("{key_name}/")) {
                Ok(()) | Err(StoreError::NotFound) => {}
                Err(e) => return Err(FsError::Backend(e)),
            }
        }
        self.evict(&parent.make_fhk(name));
        Ok(())
    }

    /// List a directory, resuming at cookie `*offset` (0 for a fresh
    /// stream).
    ///
    /// Each entry is reported to `cb` with its cookie, the seeded hash of
    /// its short name; cookies are stable across streams. Resumption
    /// relies on the directory handle's marker cache: if the handle was
    /// reclaimed since the cookie was handed out, the listing restarts
    /// from the beginning and re-emits earlier entries. Returning
    /// `ControlFlow::Break` from `cb` aborts the listing.
    pub fn readdir(
        &self,
        dir: &Arc<FileHandle>,
        offset: &mut u64,
        cb: &mut dyn FnMut(&str, u64) -> ControlFlow<()>,
    ) -> FsResult<()> {
        if self.closed() {
            return Err(FsError::NotFound);
        }
        if !dir.is_dir() {
            return Err(FsError::NotDirectory);
        }
        let marker = if *offset == 0 {
            None
        } else {
            dir.find_marker(*offset)
        };

        let mut emit = |name: &str, resume: &str| -> ControlFlow<()> {
            let cookie = FileHandle::dirent_cookie(name);
            dir.add_marker(cookie, resume);
            *offset = cookie;
            cb(name, cookie)
        };

        if dir.is_root() {
            self.store
                .list_buckets(marker.as_deref(), &mut |name, resume, _p| {
                    emit(name, resume)
                })?;
        } else {
            let mut prefix = dir.full_object_name(1);
            if !prefix.is_empty() {
                prefix.push('/');
            }
            let bucket = dir.bucket_name().to_owned();
            self.store.list_objects(
                &bucket,
                &prefix,
                '/',
                marker.as_deref(),
                &mut |name, resume, _p| {
                    if name.is_empty() {
                        // The directory's own marker object.
                        return ControlFlow::Continue(());
                    }
                    emit(name, resume)
                },
            )?;
        }
        Ok(())
    }

    /// Read into `buf` at `off`, returning the byte count copied. Chunks
    /// from the store are copied out bounded by the buffer length.
    pub fn read(&self, fh: &Arc<FileHandle>, off: u64, buf: &mut [u8]) -> FsResult<usize> {
        if self.closed() {
            return Err(FsError::NotFound);
        }
        if !fh.is_file() {
            return Err(FsError::IsDirectory);
        }
        let bucket = fh.bucket_name().to_owned();
        let key_name = fh.full_object_name(1);
        let mut nread = 0usize;
        self.store.get_object(
            &bucket,
            &key_name,
            off,
            buf.len() as u64,
            &mut |chunk, _start, _end| {
                let want = buf.len() - nread;
                let take = want.min(chunk.len());
                buf[nread..nread + take].copy_from_slice(&chunk[..take]);
                nread += take;
            },
        )?;
        fh.set_atime(SystemTime::now());
        Ok(nread)
    }

    /// Stream a write through the handle's upload. Offsets must be
    /// monotone non-decreasing within one open session.
    pub fn write(&self, fh: &Arc<FileHandle>, off: u64, data: Bytes) -> FsResult<usize> {
        if self.closed() {
            return Err(FsError::NotFound);
        }
        let max = self.config.max_put_size.as_u64();
        if off.saturating_add(data.len() as u64) > max {
            return Err(FsError::TooLarge);
        }
        fh.write(
            self.store.as_ref(),
            self.config.obj_stripe_size.as_u64(),
            off,
            data,
        )
    }

    /// Open a file handle for I/O.
    pub fn open(&self, fh: &Arc<FileHandle>) -> FsResult<()> {
        if self.closed() {
            return Err(FsError::NotFound);
        }
        if !fh.is_file() {
            return Err(FsError::IsDirectory);
        }
        fh.open()
    }

    /// Close a file handle, completing any write in flight.
    pub fn release(&self, fh: &Arc<FileHandle>) -> FsResult<()> {
        fh.close()
    }
}

impl Drop for BucketFs {
    fn drop(&mut self) {
        self.close();
    }
}
