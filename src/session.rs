//! Session identity: the small record that decides whether the next
//! connection attempt sends IDENTIFY or RESUME.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex as MutexSync,
};

/// Sentinel stored in the atomic sequence cell to mean "no sequence yet".
///
/// `seq` is a server-assigned, always-positive sequence number in the wire
/// protocol, so `0` is free to reuse as "unset" without an extra
/// `Option`-in-an-atomic dance.
const NO_SEQ: u64 = 0;

/// Identity of a gateway session: its id, last-seen sequence number, the
/// server's debug trace, and this engine's shard coordinates.
///
/// Persists across reconnect attempts within one [`GatewayEngine`]; cleared
/// entirely on reidentify, left untouched on resume.
///
/// [`GatewayEngine`]: crate::engine::GatewayEngine
#[derive(Debug)]
pub struct SessionState {
    id: MutexSync<Option<Box<str>>>,
    seq: AtomicU64,
    trace: MutexSync<Vec<Box<str>>>,
    shard_id: u64,
    shard_count: u64,
}

impl SessionState {
    /// Create a fresh, unidentified session for the given shard coordinates.
    pub fn new(shard_id: u64, shard_count: u64) -> Self {
        Self {
            id: MutexSync::new(None),
            seq: AtomicU64::new(NO_SEQ),
            trace: MutexSync::new(Vec::new()),
            shard_id,
            shard_count,
        }
    }

    /// The shard's `[id, count]` coordinates.
    pub const fn shard(&self) -> [u64; 2] {
        [self.shard_id, self.shard_count]
    }

    /// Current session id, if one has been assigned by a READY event.
    pub fn id(&self) -> Option<Box<str>> {
        self.id.lock().expect("session id lock poisoned").clone()
    }

    /// Store a new session id, as received on READY.
    pub fn set_id(&self, id: Box<str>) {
        self.id.lock().expect("session id lock poisoned").replace(id);
    }

    /// Current sequence number, or `None` if no event has updated it yet.
    pub fn seq(&self) -> Option<u64> {
        match self.seq.load(Ordering::Acquire) {
            NO_SEQ => None,
            seq => Some(seq),
        }
    }

    /// Update the sequence number.
    ///
    /// Per the monotonicity invariant, callers are expected to only call
    /// this with sequence numbers taken from the server; this function does
    /// not itself enforce monotonicity, since the server is the source of
    /// truth and a misbehaving server is a protocol error elsewhere, not
    /// something to silently paper over here.
    pub fn set_seq(&self, seq: u64) {
        self.seq.store(seq, Ordering::Release);
    }

    /// Server-supplied debug trace from the most recent HELLO or READY.
    pub fn trace(&self) -> Vec<Box<str>> {
        self.trace.lock().expect("trace lock poisoned").clone()
    }

    /// Replace the stored trace.
    pub fn set_trace(&self, trace: Vec<Box<str>>) {
        *self.trace.lock().expect("trace lock poisoned") = trace;
    }

    /// Whether the next connection attempt must RESUME rather than IDENTIFY.
    ///
    /// True iff both `session_id` and `seq` are set, per the invariant in
    /// spec.md §3.
    pub fn can_resume(&self) -> bool {
        self.id().is_some() && self.seq().is_some()
    }

    /// Clear `session_id` and `seq`, forcing the next attempt to IDENTIFY.
    ///
    /// Called when a close code falls in the non-resumable set, or when an
    /// INVALID_SESSION event reports `d: false`.
    pub fn reset(&self) {
        self.id.lock().expect("session id lock poisoned").take();
        self.seq.store(NO_SEQ, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::SessionState;
    use static_assertions::assert_impl_all;
    use std::fmt::Debug;

    assert_impl_all!(SessionState: Debug, Send, Sync);

    #[test]
    fn fresh_session_requires_identify() {
        let session = SessionState::new(0, 1);
        assert!(!session.can_resume());
    }

    #[test]
    fn session_with_id_and_seq_can_resume() {
        let session = SessionState::new(0, 1);
        session.set_id("abc".into());
        session.set_seq(42);
        assert!(session.can_resume());
    }

    #[test]
    fn partial_state_cannot_resume() {
        let session = SessionState::new(0, 1);
        session.set_id("abc".into());
        assert!(!session.can_resume());

        let session = SessionState::new(0, 1);
        session.set_seq(42);
        assert!(!session.can_resume());
    }

    #[test]
    fn reset_clears_both_fields() {
        let session = SessionState::new(0, 1);
        session.set_id("abc".into());
        session.set_seq(42);
        session.reset();

        assert!(session.id().is_none());
        assert!(session.seq().is_none());
        assert!(!session.can_resume());
    }

    #[test]
    fn seq_is_monotonic_under_sequential_updates() {
        let session = SessionState::new(0, 1);
        let mut last = 0;

        for seq in [1, 1, 2, 5, 5, 9] {
            session.set_seq(seq);
            assert!(session.seq().unwrap() >= last);
            last = session.seq().unwrap();
        }
    }

    #[test]
    fn shard_coordinates_are_preserved() {
        let session = SessionState::new(3, 16);
        assert_eq!(session.shard(), [3, 16]);
    }
}
