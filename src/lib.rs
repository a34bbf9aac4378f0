//! bucketfs — a file-handle cache and namespace layer that presents a
//! bucket/object store as a POSIX-style filesystem.
//!
//! The crate's core is a concurrent handle cache: a sharded, latched index
//! of live [`fs::FileHandle`]s coupled with a set of LRU reclamation lanes.
//! Path lookups translate `(parent, name)` into content-addressed
//! [`fs::FhKey`]s, serialize through per-partition latches, and recycle
//! cold handles under capacity pressure without a global lock. Around the
//! cache sit per-client sessions ([`session`]) with preallocated inode
//! ranges and a persisted, replay-idempotent wire form.
//!
//! Wire-level store access is abstracted behind [`store::ObjectStore`];
//! this crate never performs I/O while holding a cache latch.

pub mod config;
pub mod error;
pub mod fs;
pub mod session;
pub mod store;

pub use config::Config;
pub use error::{FsError, FsResult};
pub use fs::{BucketFs, FhKey, FileHandle, HandleFlags, HandleKind, LookupResult, Stat};
pub use session::{ClientId, Session, SessionMap, SessionState};
pub use store::{Credentials, ObjectStore, StoreError};
