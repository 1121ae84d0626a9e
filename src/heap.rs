//! The wait-ack min-heap: tracks outstanding pings keyed by deadline.
//!
//! Grounded in the same arena-plus-token shape `cyclone`'s `TimerWheel`
//! uses (`slotmap` tokens instead of raw pointers), simplified to a
//! binary heap since this engine only ever needs "pop everything whose
//! deadline has passed", not wheel-level bucketing.

use slotmap::{new_key_type, SlotMap};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;
use uuid::Uuid;

new_key_type! {
    /// Arena key for one outstanding ping. A `Member::wait_ack_position`
    /// holding `Some(key)` is the only thing keeping that ping "live" —
    /// removing the arena entry is what makes a heap pop a no-op stray.
    pub struct WaitAckKey;
}

struct Entry {
    uuid: Uuid,
    deadline: Instant,
    hop_count: u8,
}

/// One expired ping, returned by [`WaitAckHeap::pop_expired`].
pub struct Expired {
    pub uuid: Uuid,
    pub hop_count: u8,
}

/// Min-heap over outstanding pings, ordered by `deadline`.
///
/// Removal before expiry (ack received, member removed) is lazy: the
/// arena entry is dropped but the heap-ordering entry is left in place.
/// When that stale entry is eventually popped, the arena lookup misses
/// and it is silently discarded — this is the "stray" sentinel pattern
/// from SPEC_FULL.md §9, not a leak, since the heap only ever grows by
/// as many entries as there have been `insert` calls for still-extant
/// members.
#[derive(Default)]
pub struct WaitAckHeap {
    arena: SlotMap<WaitAckKey, Entry>,
    order: BinaryHeap<Reverse<(Instant, u64, WaitAckKey)>>,
    next_sequence: u64,
}

impl WaitAckHeap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves room for one more outstanding ping so the subsequent
    /// `insert` cannot fail on allocation (SPEC_FULL.md §3 invariant 6).
    pub fn reserve(&mut self, additional: usize) {
        self.arena.reserve(additional);
    }

    pub fn insert(&mut self, uuid: Uuid, deadline: Instant, hop_count: u8) -> WaitAckKey {
        let key = self.arena.insert(Entry {
            uuid,
            deadline,
            hop_count,
        });
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.order.push(Reverse((deadline, sequence, key)));
        key
    }

    /// Removes a ping before it expires (ack received, or the member it
    /// belonged to was removed). No-op if already stray or unknown.
    pub fn remove(&mut self, key: WaitAckKey) {
        self.arena.remove(key);
    }

    pub fn contains(&self, key: WaitAckKey) -> bool {
        self.arena.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Pops every entry whose deadline has passed, skipping strays.
    /// Entries with equal deadlines pop in insertion order, via the
    /// monotonic `sequence` tiebreak (SPEC_FULL.md §10.4) — not
    /// semantically required, just deterministic for tests.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<Expired> {
        let mut expired = Vec::new();
        while let Some(&Reverse((deadline, _, key))) = self.order.peek() {
            if deadline > now {
                break;
            }
            self.order.pop();
            if let Some(entry) = self.arena.remove(key) {
                expired.push(Expired {
                    uuid: entry.uuid,
                    hop_count: entry.hop_count,
                });
            }
        }
        expired
    }

    /// Earliest deadline still pending, used by the engine to size its
    /// next `poll` timeout.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.order.peek().map(|Reverse((deadline, _, _))| *deadline)
    }
}
