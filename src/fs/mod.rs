//! The handle cache and namespace layer.

pub mod handle;
pub mod index;
pub mod key;
pub mod lru;
pub mod mount;

pub use handle::{FileHandle, HandleFlags, HandleKind, MAX_DEPTH, ROOT_NAME, Stat};
pub use index::{HandleIndex, Latch, Probe};
pub use key::{FhKey, name_hash};
pub use lru::{LruLanes, RefFlags};
pub use mount::{BucketFs, LookupResult};
