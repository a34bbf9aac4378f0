//! Shared in-memory object store for integration tests.
#![allow(dead_code, reason = "not every test file uses every helper")]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use bytes::Bytes;
use secrecy::SecretString;

use bucketfs::store::{
    Credentials, ListFn, ObjectMeta, ObjectStore, PutStream, ReadSink, StoreError, UserInfo,
};

/// Install a fmt subscriber once per test binary so `RUST_LOG` filters
/// apply under `--nocapture`. Later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
struct Inner {
    users: Mutex<BTreeMap<String, UserInfo>>,
    buckets: Mutex<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
}

/// A mock backend: buckets and objects in nested ordered maps.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, access_key: &str, secret: &str, suspended: bool) {
        self.inner.users.lock().unwrap().insert(
            access_key.to_owned(),
            UserInfo {
                user_id: access_key.to_owned(),
                display_name: format!("user-{access_key}"),
                secret: SecretString::from(secret.to_owned()),
                suspended,
            },
        );
    }

    pub fn add_bucket(&self, bucket: &str) {
        self.inner
            .buckets
            .lock()
            .unwrap()
            .entry(bucket.to_owned())
            .or_default();
    }

    pub fn add_object(&self, bucket: &str, key: &str, data: &[u8]) {
        self.add_bucket(bucket);
        self.inner
            .buckets
            .lock()
            .unwrap()
            .get_mut(bucket)
            .unwrap()
            .insert(key.to_owned(), data.to_vec());
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.inner
            .buckets
            .lock()
            .unwrap()
            .get(bucket)
            .and_then(|b| b.get(key).cloned())
    }

    pub fn credentials(access_key: &str, secret: &str) -> Credentials {
        Credentials {
            access_key: access_key.to_owned(),
            secret: SecretString::from(secret.to_owned()),
        }
    }
}

struct MemoryPut {
    inner: Arc<Inner>,
    bucket: String,
    key: String,
    buf: Vec<u8>,
    next_off: u64,
}

impl PutStream for MemoryPut {
    fn put_data(&mut self, off: u64, data: Bytes) -> Result<(), StoreError> {
        if off < self.next_off {
            return Err(StoreError::Io("out-of-order put".to_owned()));
        }
        let off = off as usize;
        if off + data.len() > self.buf.len() {
            self.buf.resize(off + data.len(), 0);
        }
        self.buf[off..off + data.len()].copy_from_slice(&data);
        self.next_off = (off + data.len()) as u64;
        Ok(())
    }

    fn finish(&mut self) -> Result<u64, StoreError> {
        let mut buckets = self.inner.buckets.lock().unwrap();
        let bucket = buckets.get_mut(&self.bucket).ok_or(StoreError::NotFound)?;
        let total = self.buf.len() as u64;
        bucket.insert(self.key.clone(), std::mem::take(&mut self.buf));
        Ok(total)
    }
}

impl ObjectStore for MemoryStore {
    fn lookup_user(&self, access_key: &str) -> Result<UserInfo, StoreError> {
        self.inner
            .users
            .lock()
            .unwrap()
            .get(access_key)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn create_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        let mut buckets = self.inner.buckets.lock().unwrap();
        if buckets.contains_key(bucket) {
            return Err(StoreError::AlreadyExists);
        }
        buckets.insert(bucket.to_owned(), BTreeMap::new());
        Ok(())
    }

    fn delete_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        let mut buckets = self.inner.buckets.lock().unwrap();
        let objects = buckets.get(bucket).ok_or(StoreError::NotFound)?;
        if !objects.is_empty() {
            return Err(StoreError::NotEmpty);
        }
        buckets.remove(bucket);
        Ok(())
    }

    fn head_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        self.inner
            .buckets
            .lock()
            .unwrap()
            .contains_key(bucket)
            .then_some(())
            .ok_or(StoreError::NotFound)
    }

    fn list_buckets(&self, marker: Option<&str>, cb: &mut ListFn<'_>) -> Result<(), StoreError> {
        let names: Vec<String> = self.inner.buckets.lock().unwrap().keys().cloned().collect();
        for name in names {
            if let Some(m) = marker
                && name.as_str() <= m
            {
                continue;
            }
            if cb(&name, &name, false).is_break() {
                break;
            }
        }
        Ok(())
    }

    fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> Result<(), StoreError> {
        let mut buckets = self.inner.buckets.lock().unwrap();
        // Auto-vivify the bucket: keeps test setup short.
        buckets
            .entry(bucket.to_owned())
            .or_default()
            .insert(key.to_owned(), data.to_vec());
        Ok(())
    }

    fn begin_put(
        &self,
        bucket: &str,
        key: &str,
        _stripe_size: u64,
    ) -> Result<Box<dyn PutStream>, StoreError> {
        self.add_bucket(bucket);
        Ok(Box::new(MemoryPut {
            inner: Arc::clone(&self.inner),
            bucket: bucket.to_owned(),
            key: key.to_owned(),
            buf: Vec::new(),
            next_off: 0,
        }))
    }

    fn get_object(
        &self,
        bucket: &str,
        key: &str,
        off: u64,
        len: u64,
        sink: &mut ReadSink<'_>,
    ) -> Result<u64, StoreError> {
        let data = self.object(bucket, key).ok_or(StoreError::NotFound)?;
        let size = data.len() as u64;
        if off >= size {
            return Ok(0);
        }
        let end = size.min(off.saturating_add(len));
        // Deliver in small chunks to exercise the bounded-copy path.
        let mut pos = off;
        while pos < end {
            let chunk_end = end.min(pos + 1024);
            sink(&data[pos as usize..chunk_end as usize], pos, chunk_end);
            pos = chunk_end;
        }
        Ok(end - off)
    }

    fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMeta, StoreError> {
        let data = self.object(bucket, key).ok_or(StoreError::NotFound)?;
        Ok(ObjectMeta {
            size: data.len() as u64,
            mtime: SystemTime::now(),
        })
    }

    fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        let mut buckets = self.inner.buckets.lock().unwrap();
        let objects = buckets.get_mut(bucket).ok_or(StoreError::NotFound)?;
        objects.remove(key).ok_or(StoreError::NotFound)?;
        Ok(())
    }

    fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: char,
        marker: Option<&str>,
        cb: &mut ListFn<'_>,
    ) -> Result<(), StoreError> {
        let objects: Vec<String> = {
            let buckets = self.inner.buckets.lock().unwrap();
            let objects = buckets.get(bucket).ok_or(StoreError::NotFound)?;
            objects.keys().cloned().collect()
        };

        let mut last_prefix: Option<String> = None;
        for key in objects {
            let Some(rest) = key.strip_prefix(prefix) else {
                continue;
            };
            if let Some(m) = marker {
                // Prefix markers (trailing delimiter) skip their whole
                // subtree; object markers skip up to and including
                // themselves.
                if m.ends_with(delimiter) {
                    if key.starts_with(m) || key.as_str() <= m {
                        continue;
                    }
                } else if key.as_str() <= m {
                    continue;
                }
            }
            let flow = match rest.split_once(delimiter) {
                Some((head, _)) if !head.is_empty() => {
                    // Collapse everything below `head` into one entry.
                    let full = format!("{prefix}{head}{delimiter}");
                    if last_prefix.as_deref() == Some(full.as_str()) {
                        continue;
                    }
                    last_prefix = Some(full.clone());
                    cb(head, &full, true)
                }
                Some((_, _)) => {
                    // The listed directory's own marker object.
                    cb("", &key, false)
                }
                None => cb(rest, &key, false),
            };
            if flow.is_break() {
                break;
            }
        }
        Ok(())
    }
}
