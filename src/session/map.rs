//! The session map: every client session, indexed by name and by state.
//!
//! The per-state lists are FIFO — sessions link at the tail on every
//! transition, so the front of a list is always the longest-resident
//! session in that state. The whole map is designed to sit behind a single
//! mutex; methods take `&mut self` and callers serialize.
//!
//! Persistence follows the journal-replay discipline of the wire form in
//! [`crate::session::session`]: the map lives in one well-known object,
//! guarded by version watermarks so that a `save` requiring durability of
//! version `v` either rides an in-flight commit or starts its own. A
//! commit's store write runs on a background task, so `committing` can
//! genuinely run ahead of `committed` across calls; callers observe
//! completion through their callbacks, which fire when the commit is
//! reaped (automatically on the next save/load, or via
//! [`SessionMap::wait_commit`]).

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::SystemTime;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::error::FsError;
use crate::session::session::{ClientId, DecodeError, Session, SessionState};
use crate::store::{ObjectStore, StoreError};

/// Completion callback for save/load: receives 0 on success or a negated
/// errno on failure.
pub type IoCallback = Box<dyn FnOnce(i32) + Send>;

/// A commit whose store write is still running.
struct InflightCommit {
    version: u64,
    task: JoinHandle<Result<(), StoreError>>,
}

pub struct SessionMap {
    store: Arc<dyn ObjectStore>,
    /// Bucket holding the persisted map object.
    bucket: String,
    /// Inode the object name is derived from.
    ino: u64,

    sessions: FxHashMap<ClientId, Session>,
    by_state: [VecDeque<ClientId>; SessionState::COUNT],

    pub version: u64,
    pub projected: u64,
    committing: u64,
    committed: u64,
    /// Callbacks parked per needed version; woken when a commit covering
    /// that version completes.
    commit_waiters: BTreeMap<u64, Vec<IoCallback>>,
    inflight: Option<InflightCommit>,
    waiting_for_load: Vec<IoCallback>,
}

impl SessionMap {
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>, ino: u64) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            ino,
            sessions: FxHashMap::default(),
            by_state: std::array::from_fn(|_| VecDeque::new()),
            version: 0,
            projected: 0,
            committing: 0,
            committed: 0,
            commit_waiters: BTreeMap::new(),
            inflight: None,
            waiting_for_load: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn have_session(&self, client: ClientId) -> bool {
        self.sessions.contains_key(&client)
    }

    #[must_use]
    pub fn get_session(&self, client: ClientId) -> Option<&Session> {
        self.sessions.get(&client)
    }

    pub fn get_session_mut(&mut self, client: ClientId) -> Option<&mut Session> {
        self.sessions.get_mut(&client)
    }

    /// Existing session for `client`, or a fresh one already transitioned
    /// to OPEN. Idempotent.
    pub fn get_or_add_open_session(&mut self, client: ClientId) -> &Session {
        if !self.sessions.contains_key(&client) {
            self.add_session(Session::new(client));
            self.set_state(client, SessionState::Open);
            if let Some(s) = self.sessions.get_mut(&client) {
                s.renew(SystemTime::now());
            }
        }
        &self.sessions[&client]
    }

    /// Register a session. The client must not already have one.
    pub fn add_session(&mut self, session: Session) {
        let client = session.client();
        assert!(
            !self.sessions.contains_key(&client),
            "session already registered for {client:?}"
        );
        let state = session.state();
        self.sessions.insert(client, session);
        self.link_tail(client, state);
        self.bump();
        trace!(client = client.0, ?state, "added session");
    }

    /// Drop a session from both indices, trimming its dedup window first.
    pub fn remove_session(&mut self, client: ClientId) {
        let Some(session) = self.sessions.get_mut(&client) else {
            warn!(client = client.0, "remove of unknown session");
            return;
        };
        session.trim_completed_requests(0);
        let state = session.state();
        let linked = session.linked;
        if linked {
            self.unlink(client, state);
        }
        self.sessions.remove(&client);
        self.bump();
        trace!(client = client.0, "removed session");
    }

    /// Transition a session, bumping its state sequence and re-linking it
    /// at the tail of the new state's list. Returns the new sequence; a
    /// no-op transition returns the current one.
    pub fn set_state(&mut self, client: ClientId, state: SessionState) -> u64 {
        let session = self
            .sessions
            .get_mut(&client)
            .unwrap_or_else(|| unreachable!("set_state on unknown session {client:?}"));
        if session.state() == state {
            return session.state_seq();
        }
        let old_state = session.state();
        let was_linked = session.linked;
        let seq = session.set_state_raw(state);
        if was_linked {
            self.unlink(client, old_state);
        }
        self.link_tail(client, state);
        self.bump();
        trace!(client = client.0, ?old_state, ?state, seq, "session transition");
        seq
    }

    /// Refresh a session's renew stamp and move it to the tail of its
    /// current state list. Calling this on an unlinked session is a
    /// protocol violation and aborts.
    pub fn touch_session(&mut self, client: ClientId) {
        let session = self
            .sessions
            .get_mut(&client)
            .unwrap_or_else(|| unreachable!("touch of unknown session {client:?}"));
        assert!(session.linked, "touch of unlinked session {client:?}");
        let state = session.state();
        session.renew(SystemTime::now());
        self.unlink(client, state);
        self.link_tail(client, state);
    }

    /// Longest-resident session in `state`, if any.
    #[must_use]
    pub fn get_oldest_session(&self, state: SessionState) -> Option<ClientId> {
        self.by_state[state.index()].front().copied()
    }

    /// Sessions in `state`, oldest first.
    pub fn sessions_in_state(&self, state: SessionState) -> impl Iterator<Item = ClientId> + '_ {
        self.by_state[state.index()].iter().copied()
    }

    /// Open sessions for every listed client. Idempotent per client.
    pub fn open_sessions(&mut self, clients: impl IntoIterator<Item = ClientId>) {
        for client in clients {
            self.get_or_add_open_session(client);
        }
        self.bump();
    }

    /// Retire every CLOSED session from both indices.
    pub fn sweep_closed(&mut self) {
        let closed: Vec<ClientId> = self.by_state[SessionState::Closed.index()]
            .iter()
            .copied()
            .collect();
        for client in closed {
            self.remove_session(client);
        }
    }

    // ── Completed-request window ────────────────────────────────────────

    #[must_use]
    pub fn have_completed_request(&self, client: ClientId, tid: u64) -> bool {
        self.get_session(client)
            .is_some_and(|s| s.have_completed_request(tid))
    }

    pub fn add_completed_request(&mut self, client: ClientId, tid: u64) {
        self.sessions
            .get_mut(&client)
            .unwrap_or_else(|| unreachable!("completed request for unknown session {client:?}"))
            .add_completed_request(tid);
    }

    pub fn trim_completed_requests(&mut self, client: ClientId, min_tid: u64) {
        self.sessions
            .get_mut(&client)
            .unwrap_or_else(|| unreachable!("trim for unknown session {client:?}"))
            .trim_completed_requests(min_tid);
    }

    // ── State-list plumbing ─────────────────────────────────────────────

    fn link_tail(&mut self, client: ClientId, state: SessionState) {
        self.by_state[state.index()].push_back(client);
        if let Some(s) = self.sessions.get_mut(&client) {
            s.linked = true;
        }
    }

    fn unlink(&mut self, client: ClientId, state: SessionState) {
        let list = &mut self.by_state[state.index()];
        let pos = list
            .iter()
            .position(|&c| c == client)
            .unwrap_or_else(|| unreachable!("session {client:?} missing from its state list"));
        list.remove(pos);
        if let Some(s) = self.sessions.get_mut(&client) {
            s.linked = false;
        }
    }

    fn bump(&mut self) {
        self.version += 1;
        self.projected = self.version;
    }

    // ── Persistence ─────────────────────────────────────────────────────

    /// Name of the backing object, derived from the map's inode.
    #[must_use]
    pub fn object_name(&self) -> String {
        format!("session_map.0x{:x}", self.ino)
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.version);
        buf.put_u32_le(self.sessions.len() as u32);
        let mut clients: Vec<ClientId> = self.sessions.keys().copied().collect();
        clients.sort_unstable();
        for client in clients {
            self.sessions[&client].encode(buf);
        }
    }

    fn decode(&mut self, buf: &mut Bytes) -> Result<(), DecodeError> {
        if buf.remaining() < 12 {
            return Err(DecodeError::Truncated);
        }
        let version = buf.get_u64_le();
        let count = buf.get_u32_le() as usize;

        self.sessions.clear();
        self.by_state = std::array::from_fn(|_| VecDeque::new());
        for _ in 0..count {
            let session = Session::decode(buf)?;
            let client = session.client();
            let state = session.state();
            self.sessions.insert(client, session);
            self.link_tail(client, state);
        }
        self.version = version;
        self.projected = version;
        Ok(())
    }

    /// Load the persisted map. Every registered load waiter — including
    /// `onload` — completes with the outcome; a failure fails them all.
    pub fn load(&mut self, onload: IoCallback) {
        // Loading replaces the whole map; let any commit settle first.
        self.wait_commit();
        self.waiting_for_load.push(onload);
        let name = self.object_name();
        let result = match self.store.fetch_object(&self.bucket, &name) {
            Ok(mut payload) => match self.decode(&mut payload) {
                Ok(()) => {
                    self.committing = self.version;
                    self.committed = self.version;
                    debug!(version = self.version, sessions = self.sessions.len(), "session map loaded");
                    0
                }
                Err(e) => {
                    warn!(object = %name, error = %e, "session map decode failed");
                    -FsError::from(e).errno()
                }
            },
            Err(e) => {
                warn!(object = %name, error = %e, "session map load failed");
                -FsError::Backend(e).errno()
            }
        };
        for cb in self.waiting_for_load.drain(..) {
            cb(result);
        }
    }

    /// Persist the map if needed.
    ///
    /// `needv` is the version the caller needs durable; zero means "commit
    /// whatever is current". A requirement already satisfied completes
    /// immediately; one covered by the commit in flight parks on that
    /// commit's waiter list; otherwise a new commit starts, writing on a
    /// background task. `onsave` fires when its commit is reaped — on a
    /// later save/load, or via [`SessionMap::wait_commit`]. A failed
    /// commit moves no watermark, so the caller may simply retry.
    pub fn save(&mut self, onsave: IoCallback, needv: u64) {
        self.reap_commit();
        if needv > 0 && self.committed >= needv {
            onsave(0);
            return;
        }
        if needv > 0 && self.committing >= needv && self.committing > self.committed {
            self.commit_waiters
                .entry(self.committing)
                .or_default()
                .push(onsave);
            return;
        }

        // One commit at a time; drain the previous one before starting.
        self.wait_commit();
        if needv > 0 && self.committed >= needv {
            onsave(0);
            return;
        }

        self.committing = self.version;
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        self.commit_waiters
            .entry(self.committing)
            .or_default()
            .push(onsave);

        let store = Arc::clone(&self.store);
        let bucket = self.bucket.clone();
        let name = self.object_name();
        let payload = buf.freeze();
        self.inflight = Some(InflightCommit {
            version: self.committing,
            task: std::thread::spawn(move || store.put_object(&bucket, &name, payload)),
        });
    }

    /// Apply the background commit's outcome if it has already finished.
    fn reap_commit(&mut self) {
        if self
            .inflight
            .as_ref()
            .is_some_and(|c| c.task.is_finished())
        {
            self.finish_commit();
        }
    }

    /// Block until no commit is in flight, firing its waiters.
    pub fn wait_commit(&mut self) {
        if self.inflight.is_some() {
            self.finish_commit();
        }
    }

    fn finish_commit(&mut self) {
        let Some(commit) = self.inflight.take() else {
            return;
        };
        let version = commit.version;
        let result = commit
            .task
            .join()
            .unwrap_or_else(|_| Err(StoreError::Io("commit task panicked".to_owned())));
        match result {
            Ok(()) => {
                self.committed = version;
                debug!(version, "session map committed");
                self.wake_commit_waiters(version, 0);
            }
            Err(e) => {
                warn!(version, error = %e, "session map save failed");
                let errno = -FsError::Backend(e).errno();
                // A failed commit moves no watermark.
                self.committing = self.committed;
                self.wake_commit_waiters(version, errno);
            }
        }
    }

    /// Complete every waiter whose needed version is covered by `upto`.
    fn wake_commit_waiters(&mut self, upto: u64, result: i32) {
        let pending = std::mem::take(&mut self.commit_waiters);
        let mut parked = BTreeMap::new();
        for (needed, cbs) in pending {
            if needed <= upto {
                for cb in cbs {
                    cb(result);
                }
            } else {
                parked.insert(needed, cbs);
            }
        }
        self.commit_waiters = parked;
    }

    #[must_use]
    pub fn committed(&self) -> u64 {
        self.committed
    }

    #[must_use]
    pub fn committing(&self) -> u64 {
        self.committing
    }
}

impl Drop for SessionMap {
    fn drop(&mut self) {
        self.wait_commit();
    }
}
