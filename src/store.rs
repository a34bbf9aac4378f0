//! Contracts for the object-store collaborators.
//!
//! The handle cache never talks to the wire itself. Every filesystem verb is
//! matched by a request-shaped adapter on the store side; this module pins
//! down the narrow interface the core invokes. Implementations may block:
//! the core guarantees that no cache latch, lane latch, or handle mutex is
//! held across any call through these traits.

use std::ops::ControlFlow;
use std::time::SystemTime;

use bytes::{Bytes, BytesMut};
use secrecy::SecretString;
use thiserror::Error;

/// Errors surfaced by a store adapter. These cross the boundary unchanged;
/// the filesystem layer wraps them as [`crate::FsError::Backend`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no such bucket or object")]
    NotFound,

    #[error("bucket or object already exists")]
    AlreadyExists,

    #[error("access denied")]
    AccessDenied,

    #[error("bucket is not empty")]
    NotEmpty,

    #[error("i/o failure: {0}")]
    Io(String),
}

/// Access-key credentials presented at mount time.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_key: String,
    pub secret: SecretString,
}

/// Result of an access-key lookup.
#[derive(Debug, Clone)]
pub struct UserInfo {
    pub user_id: String,
    pub display_name: String,
    pub secret: SecretString,
    pub suspended: bool,
}

/// Attributes of a stored object, as reported by a head request.
#[derive(Debug, Clone, Copy)]
pub struct ObjectMeta {
    pub size: u64,
    pub mtime: SystemTime,
}

/// Listing callback: `(short_name, marker, common_prefix)`.
///
/// `short_name` is the entry name relative to the listed prefix, with any
/// trailing delimiter already stripped; `marker` is the store's resume
/// cursor for this entry; `common_prefix` is true for delimiter-collapsed
/// directory entries. Entries arrive in key order. Returning
/// [`ControlFlow::Break`] aborts the listing.
pub type ListFn<'a> = dyn FnMut(&str, &str, bool) -> ControlFlow<()> + 'a;

/// Chunked read sink: `(chunk, start_off, end_off)` relative to the object.
/// The core copies out of `chunk`, bounded by the caller's buffer.
pub type ReadSink<'a> = dyn FnMut(&[u8], u64, u64) + 'a;

/// An in-progress streaming upload of one object.
///
/// Offsets passed to [`PutStream::put_data`] must be monotone
/// non-decreasing; the adapter is free to reject anything else.
pub trait PutStream: Send {
    fn put_data(&mut self, off: u64, data: Bytes) -> Result<(), StoreError>;

    /// Complete the upload. Returns the total object size.
    fn finish(&mut self) -> Result<u64, StoreError>;
}

/// The (bucket, key) -> bytes backend.
pub trait ObjectStore: Send + Sync {
    fn lookup_user(&self, access_key: &str) -> Result<UserInfo, StoreError>;

    fn create_bucket(&self, bucket: &str) -> Result<(), StoreError>;
    fn delete_bucket(&self, bucket: &str) -> Result<(), StoreError>;
    fn head_bucket(&self, bucket: &str) -> Result<(), StoreError>;

    /// List buckets in name order, starting after `marker` if given.
    fn list_buckets(&self, marker: Option<&str>, cb: &mut ListFn<'_>) -> Result<(), StoreError>;

    fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> Result<(), StoreError>;

    /// Open a streaming upload, writing in parts of roughly `stripe_size`.
    fn begin_put(
        &self,
        bucket: &str,
        key: &str,
        stripe_size: u64,
    ) -> Result<Box<dyn PutStream>, StoreError>;

    /// Read `len` bytes at `off`, delivered in chunks through `sink`.
    /// Returns the number of bytes the store produced.
    fn get_object(
        &self,
        bucket: &str,
        key: &str,
        off: u64,
        len: u64,
        sink: &mut ReadSink<'_>,
    ) -> Result<u64, StoreError>;

    fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMeta, StoreError>;

    fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError>;

    /// List object keys under `prefix`, collapsing at `delimiter`.
    /// Short names are reported relative to `prefix`.
    fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: char,
        marker: Option<&str>,
        cb: &mut ListFn<'_>,
    ) -> Result<(), StoreError>;

    /// Fetch a whole object. Convenience over [`ObjectStore::get_object`],
    /// used by the session-map persistence path.
    fn fetch_object(&self, bucket: &str, key: &str) -> Result<Bytes, StoreError> {
        let mut buf = BytesMut::new();
        self.get_object(bucket, key, 0, u64::MAX, &mut |chunk, _s, _e| {
            buf.extend_from_slice(chunk);
        })?;
        Ok(buf.freeze())
    }
}
