#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::ops::ControlFlow;
use std::sync::Arc;

use bytes::Bytes;
use common::MemoryStore;

use bucketfs::fs::handle::HandleFlags;
use bucketfs::fs::name_hash;
use bucketfs::store::ObjectStore as _;
use bucketfs::{BucketFs, Config, FsError};

fn mount(store: &MemoryStore) -> BucketFs {
    common::init_tracing();
    BucketFs::new(
        Arc::new(store.clone()),
        MemoryStore::credentials("AK", "s3cr3t"),
        Config::default(),
    )
}

fn small_mount(store: &MemoryStore, lanes: usize, hiwat: usize) -> BucketFs {
    common::init_tracing();
    let config = Config {
        fhcache_partitions: 4,
        lru_lanes: lanes,
        lru_lane_hiwat: hiwat,
        ..Config::default()
    };
    BucketFs::new(
        Arc::new(store.clone()),
        MemoryStore::credentials("AK", "s3cr3t"),
        config,
    )
}

#[test]
fn authorize_checks_key_secret_and_suspension() {
    let store = MemoryStore::new();
    store.add_user("AK", "s3cr3t", false);
    store.add_user("BANNED", "x", true);

    assert!(mount(&store).authorize().is_ok());

    let fs = BucketFs::new(
        Arc::new(store.clone()),
        MemoryStore::credentials("AK", "wrong"),
        Config::default(),
    );
    assert!(matches!(fs.authorize(), Err(FsError::InvalidArgument)));

    let fs = BucketFs::new(
        Arc::new(store.clone()),
        MemoryStore::credentials("BANNED", "x"),
        Config::default(),
    );
    assert!(matches!(fs.authorize(), Err(FsError::UserSuspended)));

    let fs = BucketFs::new(
        Arc::new(store.clone()),
        MemoryStore::credentials("NOBODY", "x"),
        Config::default(),
    );
    assert!(matches!(fs.authorize(), Err(FsError::NotFound)));
}

#[test]
fn second_lookup_hits_the_same_handle() {
    let store = MemoryStore::new();
    let fs = mount(&store);
    let root = Arc::clone(fs.root());

    let first = fs.lookup_fh(&root, "photos", HandleFlags::empty()).unwrap();
    assert!(first.created);
    let second = fs.lookup_fh(&root, "photos", HandleFlags::empty()).unwrap();
    assert!(!second.created);
    assert!(Arc::ptr_eq(&first.handle, &second.handle));
    assert_eq!(first.handle.refs(), 2);

    fs.unref(&first.handle);
    fs.unref(&second.handle);
    assert_eq!(first.handle.refs(), 0);
    assert_eq!(fs.cached_handles(), 1, "zero refs do not evict");
}

#[test]
fn cold_lookup_is_verified_against_the_store() {
    let store = MemoryStore::new();
    store.add_object("photos", "readme.txt", b"hello");
    store.add_object("photos", "2024/cat.jpg", b"meow");
    let fs = mount(&store);
    let root = Arc::clone(fs.root());

    // Bucket exists.
    let bucket = fs.lookup(&root, "photos").unwrap();
    assert!(bucket.created);
    assert!(bucket.handle.is_bucket());

    // Plain object resolves as a file with its size.
    let file = fs.lookup(&bucket.handle, "readme.txt").unwrap();
    assert!(file.handle.is_file());
    assert_eq!(file.handle.size(), 5);

    // A key that only exists as a prefix resolves as a directory.
    let dir = fs.lookup(&bucket.handle, "2024").unwrap();
    assert!(dir.handle.is_dir());
    assert!(dir.handle.pseudo());

    // Nothing at all.
    assert!(matches!(
        fs.lookup(&bucket.handle, "missing"),
        Err(FsError::NotFound)
    ));
    assert!(matches!(fs.lookup(&root, "nobucket"), Err(FsError::NotFound)));
}

#[test]
fn lookup_handle_resolves_by_key_until_eviction() {
    let store = MemoryStore::new();
    let fs = mount(&store);
    let root = Arc::clone(fs.root());

    let res = fs.lookup_fh(&root, "photos", HandleFlags::empty()).unwrap();
    let hk = *res.handle.key();

    let again = fs.lookup_handle(hk).unwrap();
    assert!(Arc::ptr_eq(&res.handle, &again));
    assert_eq!(res.handle.refs(), 2);

    // Root resolves by its own key.
    let root_again = fs.lookup_handle(*root.key()).unwrap();
    assert!(Arc::ptr_eq(&root, &root_again));

    // An unknown key misses; the caller re-resolves by path.
    let bogus = bucketfs::FhKey::from_hashes(1, 2);
    assert!(fs.lookup_handle(bogus).is_none());
}

#[test]
fn depth_limit_refuses_admission() {
    let store = MemoryStore::new();
    let fs = small_mount(&store, 2, 10_000);
    let mut dir = Arc::clone(fs.root());

    for i in 0..256 {
        let res = fs
            .lookup_fh(&dir, &format!("d{i}"), HandleFlags::DIRECTORY)
            .unwrap();
        dir = res.handle;
    }
    assert_eq!(dir.depth(), 256);
    let before = fs.cached_handles();
    assert!(matches!(
        fs.lookup_fh(&dir, "too-deep", HandleFlags::DIRECTORY),
        Err(FsError::PathTooDeep)
    ));
    assert_eq!(fs.cached_handles(), before, "no handle admitted past the limit");
}

#[test]
fn exhausted_lanes_report_out_of_handles() {
    let store = MemoryStore::new();
    let fs = small_mount(&store, 1, 2);
    let root = Arc::clone(fs.root());

    let a = fs.lookup_fh(&root, "a", HandleFlags::empty()).unwrap();
    let b = fs.lookup_fh(&root, "b", HandleFlags::empty()).unwrap();
    assert!(matches!(
        fs.lookup_fh(&root, "c", HandleFlags::empty()),
        Err(FsError::OutOfHandles)
    ));

    // Releasing a pin makes room again.
    fs.unref(&a.handle);
    let c = fs.lookup_fh(&root, "c", HandleFlags::empty()).unwrap();
    assert!(c.created);
    drop(b);
}

#[test]
fn capacity_is_bounded_and_survivors_are_recent() {
    let store = MemoryStore::new();
    let fs = small_mount(&store, 4, 1000);
    let root = Arc::clone(fs.root());

    for i in 0..10_000 {
        let res = fs
            .lookup_fh(&root, &format!("k{i}"), HandleFlags::empty())
            .unwrap();
        fs.unref(&res.handle);
    }
    assert!(
        fs.cached_handles() <= 4 * 1000,
        "live handles exceed lanes * hiwat: {}",
        fs.cached_handles()
    );

    // The hottest recent key must still be resident.
    let res = fs.lookup_fh(&root, "k9999", HandleFlags::empty()).unwrap();
    assert!(!res.created, "most recently admitted key was evicted");
}

#[test]
fn closed_mount_refuses_everything() {
    let store = MemoryStore::new();
    store.add_object("photos", "readme.txt", b"hello");
    let fs = mount(&store);
    let root = Arc::clone(fs.root());

    let res = fs.lookup_fh(&root, "photos", HandleFlags::empty()).unwrap();
    let hk = *res.handle.key();

    fs.close();
    assert!(matches!(
        fs.lookup_fh(&root, "photos", HandleFlags::empty()),
        Err(FsError::NotFound)
    ));
    assert!(matches!(fs.lookup(&root, "photos"), Err(FsError::NotFound)));
    assert!(fs.lookup_handle(hk).is_none());
    assert_eq!(fs.cached_handles(), 0);

    // Idempotent.
    fs.close();
}

#[test]
fn create_write_read_round_trip() {
    let store = MemoryStore::new();
    store.add_bucket("photos");
    let fs = mount(&store);
    let root = Arc::clone(fs.root());
    let bucket = fs.lookup(&root, "photos").unwrap();

    let created = fs.create(&bucket.handle, "notes.txt").unwrap();
    let fh = &created.handle;
    assert!(fh.is_open());
    assert!(fh.creating());

    assert_eq!(fs.write(fh, 0, Bytes::from_static(b"hello ")).unwrap(), 6);
    assert_eq!(fs.write(fh, 6, Bytes::from_static(b"world")).unwrap(), 5);

    // Offsets may not go backwards within an open session.
    assert!(matches!(
        fs.write(fh, 3, Bytes::from_static(b"x")),
        Err(FsError::InvalidArgument)
    ));

    fs.release(fh).unwrap();
    assert!(!fh.is_open());
    assert!(!fh.creating());
    assert_eq!(fh.size(), 11);
    assert_eq!(store.object("photos", "notes.txt").unwrap(), b"hello world");

    let mut buf = [0u8; 16];
    let n = fs.read(fh, 0, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello world");

    let mut tail = [0u8; 4];
    let n = fs.read(fh, 6, &mut tail).unwrap();
    assert_eq!(&tail[..n], b"worl");
}

#[test]
fn create_refuses_duplicates_and_root_files() {
    let store = MemoryStore::new();
    store.add_object("photos", "readme.txt", b"hi");
    let fs = mount(&store);
    let root = Arc::clone(fs.root());
    let bucket = fs.lookup(&root, "photos").unwrap();

    assert!(matches!(
        fs.create(&bucket.handle, "readme.txt"),
        Err(FsError::AlreadyExists)
    ));
    assert!(matches!(
        fs.create(&root, "stray.txt"),
        Err(FsError::InvalidArgument)
    ));
}

#[test]
fn writes_larger_than_the_put_limit_are_refused() {
    let store = MemoryStore::new();
    store.add_bucket("photos");
    let config = Config {
        max_put_size: bytesize::ByteSize::b(8),
        ..Config::default()
    };
    let fs = BucketFs::new(
        Arc::new(store.clone()),
        MemoryStore::credentials("AK", "s3cr3t"),
        config,
    );
    let root = Arc::clone(fs.root());
    let bucket = fs.lookup(&root, "photos").unwrap();
    let created = fs.create(&bucket.handle, "big.bin").unwrap();
    assert!(matches!(
        fs.write(&created.handle, 0, Bytes::from_static(b"123456789")),
        Err(FsError::TooLarge)
    ));
}

#[test]
fn mkdir_and_rmdir_manage_buckets_and_prefixes() {
    let store = MemoryStore::new();
    let fs = mount(&store);
    let root = Arc::clone(fs.root());

    let bucket = fs.mkdir(&root, "photos").unwrap();
    assert!(bucket.handle.is_bucket());
    assert!(store.head_bucket("photos").is_ok());
    assert!(matches!(fs.mkdir(&root, "photos"), Err(FsError::AlreadyExists)));

    let dir = fs.mkdir(&bucket.handle, "2024").unwrap();
    assert!(dir.handle.is_dir());
    assert!(store.object("photos", "2024/").is_some());

    // Non-empty directories refuse removal.
    store.add_object("photos", "2024/cat.jpg", b"meow");
    assert_eq!(
        fs.rmdir(&bucket.handle, "2024").unwrap_err().errno(),
        libc::ENOTEMPTY
    );
    fs.unlink(&bucket.handle, "2024/cat.jpg").unwrap();
    fs.rmdir(&bucket.handle, "2024").unwrap();
    assert!(store.object("photos", "2024/").is_none());

    // Bucket removal goes through the store's emptiness check.
    fs.rmdir(&root, "photos").unwrap();
    assert!(store.head_bucket("photos").is_err());
}

#[test]
fn unlink_removes_the_object_and_the_mapping() {
    let store = MemoryStore::new();
    store.add_object("photos", "readme.txt", b"hi");
    let fs = mount(&store);
    let root = Arc::clone(fs.root());
    let bucket = fs.lookup(&root, "photos").unwrap();
    let file = fs.lookup(&bucket.handle, "readme.txt").unwrap();

    fs.unlink(&bucket.handle, "readme.txt").unwrap();
    assert!(store.object("photos", "readme.txt").is_none());
    assert!(matches!(
        fs.lookup(&bucket.handle, "readme.txt"),
        Err(FsError::NotFound)
    ));
    // The held handle stays alive, detached from the namespace.
    assert_eq!(file.handle.size(), 2);
    assert!(matches!(fs.unlink(&root, "photos"), Err(FsError::IsDirectory)));
}

#[test]
fn readdir_emits_hash_cookies_and_resumes_at_markers() {
    let store = MemoryStore::new();
    store.add_object("photos", "a.txt", b"1");
    store.add_object("photos", "b.txt", b"2");
    store.add_object("photos", "c.txt", b"3");
    store.add_object("photos", "sub/inner.txt", b"4");
    let fs = mount(&store);
    let root = Arc::clone(fs.root());
    let bucket = fs.lookup(&root, "photos").unwrap();

    let mut seen: Vec<(String, u64)> = Vec::new();
    let mut offset = 0u64;
    fs.readdir(&bucket.handle, &mut offset, &mut |name, cookie| {
        seen.push((name.to_owned(), cookie));
        ControlFlow::Continue(())
    })
    .unwrap();

    let names: Vec<&str> = seen.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, ["a.txt", "b.txt", "c.txt", "sub"]);
    for (name, cookie) in &seen {
        assert_eq!(*cookie, name_hash(name), "cookie is the seeded name hash");
    }

    // Resume mid-stream: only entries after the cookie's marker appear.
    let mut offset = seen[1].1;
    let mut resumed: Vec<String> = Vec::new();
    fs.readdir(&bucket.handle, &mut offset, &mut |name, _cookie| {
        resumed.push(name.to_owned());
        ControlFlow::Continue(())
    })
    .unwrap();
    assert_eq!(resumed, ["c.txt", "sub"]);

    // Aborting mid-listing stops the stream.
    let mut offset = 0u64;
    let mut first = None;
    fs.readdir(&bucket.handle, &mut offset, &mut |name, _| {
        first = Some(name.to_owned());
        ControlFlow::Break(())
    })
    .unwrap();
    assert_eq!(first.as_deref(), Some("a.txt"));
}

#[test]
fn root_readdir_lists_buckets() {
    let store = MemoryStore::new();
    store.add_bucket("alpha");
    store.add_bucket("beta");
    let fs = mount(&store);
    let root = Arc::clone(fs.root());

    let mut names = Vec::new();
    let mut offset = 0u64;
    fs.readdir(&root, &mut offset, &mut |name, _cookie| {
        names.push(name.to_owned());
        ControlFlow::Continue(())
    })
    .unwrap();
    assert_eq!(names, ["alpha", "beta"]);

    // Resume after the first bucket.
    let mut offset = name_hash("alpha");
    let mut rest = Vec::new();
    fs.readdir(&root, &mut offset, &mut |name, _cookie| {
        rest.push(name.to_owned());
        ControlFlow::Continue(())
    })
    .unwrap();
    assert_eq!(rest, ["beta"]);
}

#[test]
fn stat_reflects_kind_and_instance() {
    let store = MemoryStore::new();
    store.add_object("photos", "readme.txt", b"hello");
    let fs = mount(&store);
    let root = Arc::clone(fs.root());

    let st = fs.getattr(&root).unwrap();
    assert_eq!(st.mode & libc::S_IFMT, libc::S_IFDIR);
    assert_eq!(st.dev, u64::from(fs.instance()));

    let bucket = fs.lookup(&root, "photos").unwrap();
    let file = fs.lookup(&bucket.handle, "readme.txt").unwrap();
    let st = fs.getattr(&file.handle).unwrap();
    assert_eq!(st.mode & libc::S_IFMT, libc::S_IFREG);
    assert_eq!(st.ino, file.handle.key().object);
    assert_eq!(st.size, 5);
}
