//! Per-client session state.
//!
//! A session tracks the client's lifecycle state, its preallocated inode
//! ranges, and the window of completed request ids used to deduplicate
//! retried non-idempotent operations.

use std::collections::BTreeSet;
use std::time::SystemTime;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::error::{FsError, FsResult};
use crate::session::interval::IntervalSet;

/// Stable client identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    New,
    /// Journaling open.
    Opening,
    Open,
    /// Journaling close.
    Closing,
    Stale,
    StalePurging,
    StaleClosing,
    Closed,
}

impl SessionState {
    pub(crate) const COUNT: usize = 8;

    pub(crate) fn index(self) -> usize {
        match self {
            Self::New => 0,
            Self::Opening => 1,
            Self::Open => 2,
            Self::Closing => 3,
            Self::Stale => 4,
            Self::StalePurging => 5,
            Self::StaleClosing => 6,
            Self::Closed => 7,
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("truncated session payload")]
    Truncated,

    #[error("unsupported session encoding version {0}")]
    Version(u8),
}

impl From<DecodeError> for FsError {
    fn from(_: DecodeError) -> Self {
        FsError::InvalidArgument
    }
}

const ENCODING_VERSION: u8 = 1;

#[derive(Debug, Clone)]
pub struct Session {
    client: ClientId,
    state: SessionState,
    state_seq: u64,

    /// Journaled preallocation, not yet confirmed.
    pub pending_prealloc: IntervalSet,
    /// Preallocated and ready to hand out.
    pub prealloc: IntervalSet,
    /// Handed out, journaled as consumed.
    pub used: IntervalSet,

    completed_requests: BTreeSet<u64>,
    push_seq: u64,
    last_renew: SystemTime,

    /// Whether this session sits on a by-state list.
    pub(crate) linked: bool,
}

impl Session {
    #[must_use]
    pub fn new(client: ClientId) -> Self {
        Self {
            client,
            state: SessionState::New,
            state_seq: 0,
            pending_prealloc: IntervalSet::new(),
            prealloc: IntervalSet::new(),
            used: IntervalSet::new(),
            completed_requests: BTreeSet::new(),
            push_seq: 0,
            last_renew: SystemTime::UNIX_EPOCH,
            linked: false,
        }
    }

    #[must_use]
    pub fn client(&self) -> ClientId {
        self.client
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn state_seq(&self) -> u64 {
        self.state_seq
    }

    pub(crate) fn set_state_raw(&mut self, state: SessionState) -> u64 {
        self.state = state;
        self.state_seq += 1;
        self.state_seq
    }

    #[must_use]
    pub fn last_renew(&self) -> SystemTime {
        self.last_renew
    }

    pub(crate) fn renew(&mut self, now: SystemTime) {
        self.last_renew = now;
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.state == SessionState::Stale
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    // ── Preallocated inodes ─────────────────────────────────────────────

    /// Next inode that `take_ino` would hand out.
    #[must_use]
    pub fn next_ino(&self) -> Option<u64> {
        self.prealloc.start()
    }

    /// Claim an inode from the ready pool, honoring `hint` when it is
    /// still available. The claimed number moves into `used`.
    pub fn take_ino(&mut self, hint: u64) -> FsResult<u64> {
        if self.prealloc.is_empty() {
            return Err(FsError::NoPrealloc);
        }
        let ino = if hint != 0 && self.prealloc.contains(hint) {
            hint
        } else {
            self.prealloc
                .start()
                .unwrap_or_else(|| unreachable!("non-empty set has a start"))
        };
        self.prealloc.remove(ino);
        self.used.insert(ino);
        Ok(ino)
    }

    /// Ready plus pending preallocation count.
    #[must_use]
    pub fn projected_prealloc_count(&self) -> u64 {
        self.prealloc.count() + self.pending_prealloc.count()
    }

    // ── Push sequence ───────────────────────────────────────────────────

    pub fn inc_push_seq(&mut self) -> u64 {
        self.push_seq += 1;
        self.push_seq
    }

    #[must_use]
    pub fn push_seq(&self) -> u64 {
        self.push_seq
    }

    // ── Completed requests ──────────────────────────────────────────────

    pub fn add_completed_request(&mut self, tid: u64) {
        self.completed_requests.insert(tid);
    }

    #[must_use]
    pub fn have_completed_request(&self, tid: u64) -> bool {
        self.completed_requests.contains(&tid)
    }

    /// Drop every completed tid strictly below `min_tid`; drop the whole
    /// window when `min_tid` is zero.
    pub fn trim_completed_requests(&mut self, min_tid: u64) {
        if min_tid == 0 {
            self.completed_requests.clear();
        } else {
            self.completed_requests = self.completed_requests.split_off(&min_tid);
        }
    }

    #[must_use]
    pub fn completed_request_count(&self) -> usize {
        self.completed_requests.len()
    }

    /// Reset everything but identity and lifecycle state.
    pub fn clear(&mut self) {
        self.pending_prealloc.clear();
        self.prealloc.clear();
        self.used.clear();
        self.completed_requests.clear();
        self.push_seq = 0;
        self.last_renew = SystemTime::UNIX_EPOCH;
    }

    // ── Wire form ───────────────────────────────────────────────────────

    /// Append the wire encoding. The prealloc field carries the
    /// *projected* set (ready plus pending) so that a replayed journal
    /// never under-counts what was promised.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(ENCODING_VERSION);
        buf.put_u64_le(self.client.0);

        buf.put_u32_le(self.completed_requests.len() as u32);
        for tid in &self.completed_requests {
            buf.put_u64_le(*tid);
        }

        let mut projected = self.prealloc.clone();
        projected.union_with(&self.pending_prealloc);
        encode_intervals(buf, &projected);
        encode_intervals(buf, &self.used);
    }

    /// Decode one session. `used` is folded back into `prealloc` and
    /// cleared: a consumed inode whose use never committed is once again
    /// available, which is what makes crash replay idempotent.
    pub fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        if buf.remaining() < 1 {
            return Err(DecodeError::Truncated);
        }
        let version = buf.get_u8();
        if version != ENCODING_VERSION {
            return Err(DecodeError::Version(version));
        }
        if buf.remaining() < 8 {
            return Err(DecodeError::Truncated);
        }
        let client = ClientId(buf.get_u64_le());

        let mut session = Session::new(client);

        let ntids = get_u32(buf)? as usize;
        for _ in 0..ntids {
            if buf.remaining() < 8 {
                return Err(DecodeError::Truncated);
            }
            session.completed_requests.insert(buf.get_u64_le());
        }

        session.prealloc = decode_intervals(buf)?;
        let used = decode_intervals(buf)?;
        session.prealloc.union_with(&used);

        Ok(session)
    }
}

fn get_u32(buf: &mut Bytes) -> Result<u32, DecodeError> {
    if buf.remaining() < 4 {
        return Err(DecodeError::Truncated);
    }
    Ok(buf.get_u32_le())
}

fn encode_intervals(buf: &mut BytesMut, set: &IntervalSet) {
    buf.put_u32_le(set.span_count() as u32);
    for (start, len) in set.iter() {
        buf.put_u64_le(start);
        buf.put_u64_le(len);
    }
}

fn decode_intervals(buf: &mut Bytes) -> Result<IntervalSet, DecodeError> {
    let nspans = get_u32(buf)? as usize;
    let mut set = IntervalSet::new();
    for _ in 0..nspans {
        if buf.remaining() < 16 {
            return Err(DecodeError::Truncated);
        }
        let start = buf.get_u64_le();
        let len = buf.get_u64_le();
        set.insert_span(start, len);
    }
    Ok(set)
}
