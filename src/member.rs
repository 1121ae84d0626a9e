//! The member table's unit of record: one known instance's last-seen
//! state, plus the status/incarnation ordering the whole protocol hinges
//! on.

use crate::heap::WaitAckKey;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddrV4;
use std::time::Instant;
use uuid::Uuid;

/// A member's last-known lifecycle state. Ordered `Alive < Suspected <
/// Dead < Left` — derived `Ord` follows declaration order, which is the
/// monotone order the compound `(incarnation, status)` key relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Status {
    Alive,
    Suspected,
    Dead,
    Left,
}

impl Status {
    pub fn as_wire_tag(self) -> i64 {
        match self {
            Status::Alive => 0,
            Status::Suspected => 1,
            Status::Dead => 2,
            Status::Left => 3,
        }
    }

    pub fn from_wire_tag(tag: i64) -> Option<Self> {
        match tag {
            0 => Some(Status::Alive),
            1 => Some(Status::Suspected),
            2 => Some(Status::Dead),
            3 => Some(Status::Left),
            _ => None,
        }
    }
}

/// Returns true iff `(new_incarnation, new_status)` strictly overrides
/// `(old_incarnation, old_status)` under the compound monotone key
/// (invariant 2 in SPEC_FULL.md §3).
pub fn is_more_recent(
    new_incarnation: u64,
    new_status: Status,
    old_incarnation: u64,
    old_status: Status,
) -> bool {
    (new_incarnation, new_status) > (old_incarnation, old_status)
}

/// One known instance's state, as tracked by the local member table.
#[derive(Debug, Clone)]
pub struct Member {
    pub uuid: Uuid,
    pub addr: SocketAddrV4,
    pub status: Status,
    pub incarnation: u64,

    /// Precomputed hash of `uuid`, so repeated comparisons (heap
    /// tie-breaks, log lines) don't re-hash the UUID bytes each time.
    cached_hash: u64,

    pub unacknowledged_pings: u32,
    pub ping_deadline: Option<Instant>,

    /// Key into the wait-ack heap's arena; `None` means "stray" — this
    /// member has no ping outstanding.
    pub wait_ack_position: Option<WaitAckKey>,

    /// At most one ack and one ping may be in flight per peer at a
    /// time; these replace the reference implementation's reusable
    /// send-task pointers (SPEC_FULL.md §9).
    pub ack_pending: bool,
    pub ping_pending: bool,

    pub payload: Option<Vec<u8>>,
    pub payload_ttl: u32,
    pub status_ttl: u32,
    pub old_uuid: Option<Uuid>,
    pub old_uuid_ttl: u32,

    /// Index into the member table's `order` vector; owned by
    /// `MemberTable`, not meaningful elsewhere.
    pub(crate) table_index: usize,
}

impl Member {
    pub fn new(uuid: Uuid, addr: SocketAddrV4, status: Status, incarnation: u64) -> Self {
        let mut hasher = DefaultHasher::new();
        uuid.hash(&mut hasher);
        Self {
            uuid,
            addr,
            status,
            incarnation,
            cached_hash: hasher.finish(),
            unacknowledged_pings: 0,
            ping_deadline: None,
            wait_ack_position: None,
            ack_pending: false,
            ping_pending: false,
            payload: None,
            payload_ttl: 0,
            status_ttl: 0,
            old_uuid: None,
            old_uuid_ttl: 0,
            table_index: 0,
        }
    }

    pub fn hash(&self) -> u64 {
        self.cached_hash
    }

    /// Resets the failure-detector bookkeeping: called whenever a ping
    /// is acked, or the member's status/incarnation changes (SPEC_FULL
    /// §4.5 `on_member_update`).
    pub fn reset_failure_detector(&mut self) {
        self.unacknowledged_pings = 0;
    }

    /// Whether a compound-key update at `(incarnation, status)` would
    /// override this member's current state.
    pub fn accepts(&self, incarnation: u64, status: Status) -> bool {
        is_more_recent(incarnation, status, self.incarnation, self.status)
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn any_status() -> impl Strategy<Value = Status> {
        prop_oneof![
            Just(Status::Alive),
            Just(Status::Suspected),
            Just(Status::Dead),
            Just(Status::Left),
        ]
    }

    proptest! {
        /// The compound key is a strict order: a pair is never more
        /// recent than itself, and `a` more recent than `b` rules out
        /// `b` more recent than `a`.
        #[test]
        fn is_more_recent_is_antisymmetric(
            a_inc in any::<u64>(), a_status in any_status(),
            b_inc in any::<u64>(), b_status in any_status(),
        ) {
            if is_more_recent(a_inc, a_status, b_inc, b_status) {
                prop_assert!(!is_more_recent(b_inc, b_status, a_inc, a_status));
            }
        }

        #[test]
        fn is_more_recent_never_holds_for_equal_pairs(inc in any::<u64>(), status in any_status()) {
            prop_assert!(!is_more_recent(inc, status, inc, status));
        }

        /// A strictly higher incarnation always wins regardless of
        /// status on either side.
        #[test]
        fn higher_incarnation_always_wins(
            lo in any::<u64>(), hi in any::<u64>(),
            lo_status in any_status(), hi_status in any_status(),
        ) {
            prop_assume!(hi > lo);
            prop_assert!(is_more_recent(hi, hi_status, lo, lo_status));
        }
    }
}
