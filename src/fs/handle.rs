//! Cache-resident descriptor of one filesystem node.
//!
//! A [`FileHandle`] is a node in the namespace tree: the mount root, a
//! bucket, a directory prefix, or a file object. Identity (key, name,
//! lineage) is fixed at construction; per-node mutable state lives behind
//! the handle's own mutex. The LRU refcount and the reclaim marker are
//! atomics owned by the lane set — nothing else may touch them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use bitflags::bitflags;
use bytes::Bytes;
use tracing::trace;

use crate::error::{FsError, FsResult};
use crate::fs::key::{FhKey, name_hash};
use crate::store::{ObjectStore, PutStream};

/// Leaf name of the mount root.
pub const ROOT_NAME: &str = "/";

/// Hard limit on namespace depth; lookups past it fail with
/// [`FsError::PathTooDeep`].
pub const MAX_DEPTH: u16 = 256;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HandleFlags: u32 {
        /// An opener holds this handle.
        const OPEN = 0x0001;
        /// The mount root.
        const ROOT = 0x0002;
        /// Created locally, object not yet confirmed in the store.
        const CREATE_PENDING = 0x0004;
        /// Synthesized from a listing prefix, no backing object.
        const PSEUDO = 0x0008;
        const DIRECTORY = 0x0010;
        /// First-level directory backed by a bucket.
        const BUCKET = 0x0020;
        const LOCK = 0x0040;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Directory,
    File,
}

/// POSIX-shaped attributes. `ino` is the object-hash half of the key, so
/// it survives eviction and rebuild from path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub size: u64,
    pub blksize: u32,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

/// Kind-specific payload.
enum Variant {
    Directory {
        /// readdir cursor cache: cookie -> store resume marker.
        markers: BTreeMap<u64, String>,
    },
    File,
}

/// Streaming upload in flight on a file handle.
struct ActiveWrite {
    stream: Box<dyn PutStream>,
    next_off: u64,
    bytes_written: u64,
}

struct HandleState {
    flags: HandleFlags,
    size: u64,
    nlink: u64,
    atime: SystemTime,
    mtime: SystemTime,
    ctime: SystemTime,
    variant: Variant,
}

pub struct FileHandle {
    key: FhKey,
    name: String,
    /// Lineage for path reconstruction. These keep the parent allocation
    /// alive but carry no cache pin: eviction is governed solely by the
    /// lane refcount.
    parent: Option<Arc<FileHandle>>,
    /// The enclosing bucket handle; `None` when this handle *is* the
    /// bucket, or the root.
    bucket: Option<Arc<FileHandle>>,
    depth: u16,
    kind: HandleKind,
    is_bucket: bool,
    /// Filesystem instance number, reported as `st_dev`.
    dev: u64,
    /// LRU lane this handle lives in; stable for the allocation's life.
    lane: usize,

    /// Cache pin count. Owned by the lane set; mutated under the lane
    /// latch, or with plain atomics once the lanes are unreachable
    /// (teardown drain).
    refcnt: AtomicU32,
    /// Set while a reclaimer has claimed this handle but not yet detached
    /// it. A ref attempt that observes this must fail and retry.
    reclaiming: AtomicBool,

    state: Mutex<HandleState>,
    /// Streaming writer slot, serialized separately from `state` so the
    /// structural mutex is never held across store I/O.
    write: Mutex<Option<ActiveWrite>>,
}

impl FileHandle {
    /// Root handle for a mount. Lives outside the index and lanes, pinned
    /// until teardown.
    pub(crate) fn new_root(instance: u32, fsid: &str) -> Self {
        let now = SystemTime::now();
        Self {
            key: FhKey::new(fsid, ROOT_NAME),
            name: ROOT_NAME.to_owned(),
            parent: None,
            bucket: None,
            depth: 0,
            kind: HandleKind::Directory,
            is_bucket: false,
            dev: u64::from(instance),
            lane: 0,
            refcnt: AtomicU32::new(1),
            reclaiming: AtomicBool::new(false),
            state: Mutex::new(HandleState {
                flags: HandleFlags::ROOT | HandleFlags::DIRECTORY,
                size: 0,
                nlink: 3,
                atime: now,
                mtime: now,
                ctime: now,
                variant: Variant::Directory {
                    markers: BTreeMap::new(),
                },
            }),
            write: Mutex::new(None),
        }
    }

    /// Non-root handle. Children of the root are buckets and always
    /// directories; deeper down, `cflags` decides the kind.
    pub(crate) fn new(
        parent: &Arc<FileHandle>,
        key: FhKey,
        name: String,
        cflags: HandleFlags,
        dev: u64,
        lane: usize,
    ) -> Self {
        let (kind, is_bucket, bucket, mut flags) = if parent.is_root() {
            (HandleKind::Directory, true, None, cflags | HandleFlags::BUCKET)
        } else {
            let bucket = if parent.is_bucket() {
                Some(Arc::clone(parent))
            } else {
                parent.bucket.clone()
            };
            let kind = if cflags.contains(HandleFlags::DIRECTORY) {
                HandleKind::Directory
            } else {
                HandleKind::File
            };
            (kind, false, bucket, cflags)
        };
        if kind == HandleKind::Directory {
            flags |= HandleFlags::DIRECTORY;
        }

        let now = SystemTime::now();
        let (variant, nlink) = match kind {
            HandleKind::Directory => (
                Variant::Directory {
                    markers: BTreeMap::new(),
                },
                3,
            ),
            HandleKind::File => (Variant::File, 1),
        };

        Self {
            key,
            name,
            parent: Some(Arc::clone(parent)),
            bucket,
            depth: parent.depth + 1,
            kind,
            is_bucket,
            dev,
            lane,
            refcnt: AtomicU32::new(1),
            reclaiming: AtomicBool::new(false),
            state: Mutex::new(HandleState {
                flags,
                size: 0,
                nlink,
                atime: now,
                mtime: now,
                ctime: now,
                variant,
            }),
            write: Mutex::new(None),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, HandleState> {
        // Poisoning is unrecoverable here; the holder panicked mid-update.
        self.state.lock().expect("handle state mutex poisoned")
    }

    // ── Identity ────────────────────────────────────────────────────────

    #[must_use]
    pub fn key(&self) -> &FhKey {
        &self.key
    }

    #[must_use]
    pub fn object_name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn parent(&self) -> Option<&Arc<FileHandle>> {
        self.parent.as_ref()
    }

    #[must_use]
    pub fn depth(&self) -> u16 {
        self.depth
    }

    #[must_use]
    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    #[must_use]
    pub fn is_bucket(&self) -> bool {
        self.is_bucket
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind == HandleKind::Directory
    }

    #[must_use]
    pub fn is_file(&self) -> bool {
        self.kind == HandleKind::File
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state().flags.contains(HandleFlags::OPEN)
    }

    #[must_use]
    pub fn creating(&self) -> bool {
        self.state().flags.contains(HandleFlags::CREATE_PENDING)
    }

    #[must_use]
    pub fn pseudo(&self) -> bool {
        self.state().flags.contains(HandleFlags::PSEUDO)
    }

    /// Name of the bucket this node lives in; the root name for the root.
    #[must_use]
    pub fn bucket_name(&self) -> &str {
        if self.is_root() {
            ROOT_NAME
        } else if self.is_bucket {
            &self.name
        } else {
            // Non-root, non-bucket handles always carry a bucket pointer.
            self.bucket
                .as_deref()
                .map_or(ROOT_NAME, |b| b.name.as_str())
        }
    }

    // ── Path and key derivation ─────────────────────────────────────────

    /// "/"-joined object key from the enclosing bucket down to this node.
    /// Empty for nodes at or above `min_depth`.
    #[must_use]
    pub fn full_object_name(&self, min_depth: u16) -> String {
        if self.depth <= min_depth {
            return String::new();
        }
        let mut segments: Vec<&str> = Vec::new();
        let mut node: &FileHandle = self;
        loop {
            if node.is_bucket() {
                break;
            }
            segments.push(node.name.as_str());
            match node.parent.as_deref() {
                Some(p) => node = p,
                None => break,
            }
        }
        segments.reverse();
        segments.join("/")
    }

    /// Object key of a prospective child named `name`.
    #[must_use]
    pub fn make_key_name(&self, name: &str) -> String {
        let mut key_name = self.full_object_name(1);
        if !key_name.is_empty() {
            key_name.push('/');
        }
        key_name.push_str(name);
        key_name
    }

    /// Handle key of a prospective child named `name`. Stable across calls
    /// and across rebuilds from path.
    #[must_use]
    pub fn make_fhk(&self, name: &str) -> FhKey {
        FhKey::for_child(self.key.object, &self.make_key_name(name))
    }

    // ── Attributes ──────────────────────────────────────────────────────

    #[must_use]
    pub fn stat(&self) -> Stat {
        let st = self.state();
        let (mode, size, blocks) = match self.kind {
            HandleKind::Directory => (0o777 | libc::S_IFDIR, 0, 0),
            HandleKind::File => (0o666 | libc::S_IFREG, st.size, st.size / 512),
        };
        Stat {
            dev: self.dev,
            ino: self.key.object,
            mode,
            nlink: st.nlink,
            size,
            blksize: 4096,
            blocks,
            atime: st.atime,
            mtime: st.mtime,
            ctime: st.ctime,
        }
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.state().size
    }

    pub fn set_size(&self, size: u64) {
        self.state().size = size;
    }

    pub fn set_nlink(&self, nlink: u64) {
        self.state().nlink = nlink;
    }

    /// Stamp ctime, mtime, and atime together.
    pub fn set_times(&self, t: SystemTime) {
        let mut st = self.state();
        st.ctime = t;
        st.mtime = t;
        st.atime = t;
    }

    pub fn set_ctime(&self, t: SystemTime) {
        self.state().ctime = t;
    }

    pub fn set_mtime(&self, t: SystemTime) {
        self.state().mtime = t;
    }

    pub fn set_atime(&self, t: SystemTime) {
        self.state().atime = t;
    }

    pub fn set_pseudo(&self) {
        self.state().flags.insert(HandleFlags::PSEUDO);
    }

    // ── Open state ──────────────────────────────────────────────────────

    /// Atomic check-and-set of the open flag; a second opener is refused.
    pub fn open(&self) -> FsResult<()> {
        let mut st = self.state();
        if st.flags.contains(HandleFlags::OPEN) {
            return Err(FsError::PermissionDenied);
        }
        st.flags.insert(HandleFlags::OPEN);
        Ok(())
    }

    /// Mark a locally-created node whose object has not been confirmed in
    /// the store yet.
    pub fn open_for_create(&self) {
        self.state().flags.insert(HandleFlags::CREATE_PENDING);
    }

    /// Clear the open flag, finishing any write still in flight.
    pub fn close(&self) -> FsResult<()> {
        self.write_finish()?;
        self.state().flags.remove(HandleFlags::OPEN);
        Ok(())
    }

    // ── Write path ──────────────────────────────────────────────────────

    /// Stream `data` at `off` into the backing object. The first write
    /// opens a streaming upload; offsets must be monotone non-decreasing
    /// within one open session. Directory handles are refused.
    pub fn write(
        &self,
        store: &dyn ObjectStore,
        stripe_size: u64,
        off: u64,
        data: Bytes,
    ) -> FsResult<usize> {
        if self.is_dir() {
            return Err(FsError::IsDirectory);
        }
        let mut slot = self.write.lock().expect("write mutex poisoned");
        if slot.is_none() {
            let bucket = self.bucket_name().to_owned();
            let key = self.full_object_name(1);
            *slot = Some(ActiveWrite {
                stream: store.begin_put(&bucket, &key, stripe_size)?,
                next_off: 0,
                bytes_written: 0,
            });
        }
        let Some(wr) = slot.as_mut() else {
            unreachable!("write slot filled above")
        };
        if off < wr.next_off {
            return Err(FsError::InvalidArgument);
        }
        let len = data.len();
        wr.stream.put_data(off, data)?;
        wr.next_off = off + len as u64;
        wr.bytes_written += len as u64;
        drop(slot);

        let now = SystemTime::now();
        let mut st = self.state();
        st.size = st.size.max(off + len as u64);
        st.mtime = now;
        st.ctime = now;
        Ok(len)
    }

    /// Complete the in-flight upload, if any, and stamp the final size.
    pub fn write_finish(&self) -> FsResult<()> {
        let taken = self
            .write
            .lock()
            .expect("write mutex poisoned")
            .take();
        let Some(mut wr) = taken else {
            return Ok(());
        };
        let total = wr.stream.finish()?;
        trace!(
            name = %self.name,
            total,
            streamed = wr.bytes_written,
            "finished streaming write"
        );
        let now = SystemTime::now();
        let mut st = self.state();
        st.size = total;
        st.mtime = now;
        st.ctime = now;
        st.flags.remove(HandleFlags::CREATE_PENDING);
        Ok(())
    }

    // ── Directory cursor cache ──────────────────────────────────────────

    /// Remember that cookie `off` resumes the listing at `marker`.
    /// Silently ignored on file handles.
    pub fn add_marker(&self, off: u64, marker: &str) {
        if let Variant::Directory { markers } = &mut self.state().variant {
            markers.insert(off, marker.to_owned());
        }
    }

    /// Recover the resume marker for cookie `off`, if still cached.
    #[must_use]
    pub fn find_marker(&self, off: u64) -> Option<String> {
        match &self.state().variant {
            Variant::Directory { markers } => markers.get(&off).cloned(),
            Variant::File => None,
        }
    }

    /// Cookie for a directory entry name.
    #[must_use]
    pub fn dirent_cookie(name: &str) -> u64 {
        name_hash(name)
    }

    // ── Reclaim negotiation (lane set only) ─────────────────────────────

    /// Whether a zero-ref handle may be detached and recycled. The root is
    /// never reclaimable; neither is anything open or mid-write.
    pub(crate) fn reclaim(&self) -> bool {
        if self.is_root() {
            return false;
        }
        if self.state().flags.contains(HandleFlags::OPEN) {
            return false;
        }
        // A busy or populated write slot means an upload is in flight.
        match self.write.try_lock() {
            Ok(slot) => slot.is_none(),
            Err(_) => false,
        }
    }

    pub(crate) fn lane(&self) -> usize {
        self.lane
    }

    #[must_use]
    pub fn refs(&self) -> u32 {
        self.refcnt.load(Ordering::Acquire)
    }

    pub(crate) fn add_ref(&self) -> u32 {
        self.refcnt.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn release_ref(&self) -> u32 {
        let prev = self.refcnt.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "refcount underflow on {:?}", self.key);
        prev - 1
    }

    pub(crate) fn clear_refs(&self) {
        self.refcnt.store(0, Ordering::Release);
    }

    pub(crate) fn is_reclaiming(&self) -> bool {
        self.reclaiming.load(Ordering::Acquire)
    }

    pub(crate) fn set_reclaiming(&self, on: bool) {
        self.reclaiming.store(on, Ordering::Release);
    }
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("key", &self.key)
            .field("name", &self.name)
            .field("depth", &self.depth)
            .field("kind", &self.kind)
            .field("refs", &self.refs())
            .finish_non_exhaustive()
    }
}

/// Construction recipe handed to the lane set: either allocates a fresh
/// handle or resets a reclaimed one in place.
pub(crate) struct HandleFactory {
    pub dev: u64,
    pub parent: Arc<FileHandle>,
    pub key: FhKey,
    pub name: String,
    pub flags: HandleFlags,
}

impl HandleFactory {
    fn construct(&self, lane: usize) -> FileHandle {
        FileHandle::new(
            &self.parent,
            self.key,
            self.name.clone(),
            self.flags,
            self.dev,
            lane,
        )
    }

    pub(crate) fn alloc(&self, lane: usize) -> Arc<FileHandle> {
        Arc::new(self.construct(lane))
    }

    /// Typed reset of a detached handle: every field is overwritten with
    /// the new identity, the refcount restarts at one, and the lane
    /// assignment is preserved.
    pub(crate) fn recycle(&self, fh: &mut FileHandle) {
        *fh = self.construct(fh.lane);
    }
}
