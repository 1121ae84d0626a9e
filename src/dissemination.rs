//! The dissemination queue: gossip events with decaying TTLs, so each
//! update reaches every peer roughly once in expectation before it
//! stops being repeated (SPEC_FULL.md §4.4).

use crate::codec::MemberDescriptor;
use crate::member::Status;
use std::collections::VecDeque;
use uuid::Uuid;

/// One queued gossip event. Shares the descriptor shape used on the
/// wire, plus the three independently-decaying TTLs.
#[derive(Debug, Clone)]
pub struct Event {
    pub uuid: Uuid,
    pub addr: std::net::Ipv4Addr,
    pub port: u16,
    pub status: Status,
    pub incarnation: u64,
    pub old_uuid: Option<Uuid>,
    pub old_uuid_ttl: u32,
    pub payload: Option<Vec<u8>>,
    pub payload_ttl: u32,
    pub status_ttl: u32,
}

impl Event {
    pub fn to_descriptor(&self) -> MemberDescriptor {
        MemberDescriptor {
            status: self.status,
            addr: self.addr,
            port: self.port,
            uuid: self.uuid,
            incarnation: self.incarnation,
            old_uuid: if self.old_uuid_ttl > 0 {
                self.old_uuid
            } else {
                None
            },
            payload: if self.payload_ttl > 0 {
                self.payload.clone()
            } else {
                None
            },
        }
    }
}

/// FIFO of pending gossip events, one per member with something new to
/// say. Re-registering a member's event replaces the old one rather
/// than appending a duplicate.
#[derive(Default)]
pub struct DisseminationQueue {
    events: VecDeque<Event>,
}

impl DisseminationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Registers a fresh event for `uuid`, seeding TTLs at `table_size`
    /// so it reaches every peer at least once in expectation. Drops any
    /// existing event for the same UUID first so each member has at
    /// most one pending event.
    pub fn register(&mut self, mut event: Event, table_size: u32) {
        self.events.retain(|e| e.uuid != event.uuid);
        event.status_ttl = table_size.max(1);
        if event.old_uuid.is_some() {
            event.old_uuid_ttl = table_size.max(1);
        }
        if event.payload.is_some() {
            event.payload_ttl = table_size.max(1);
        }
        self.events.push_back(event);
    }

    /// Takes up to `max` events from the front of the queue in FIFO
    /// order, for inclusion in an outgoing packet's DISSEMINATION
    /// section, without removing them (removal/decay happens in
    /// `decay_after_round_step`).
    pub fn peek_front(&self, max: usize) -> Vec<&Event> {
        self.events.iter().take(max).collect()
    }

    /// Decrements every event's TTLs after a round step completes
    /// successfully; drops events whose `status_ttl` reaches zero
    /// (SPEC_FULL.md §4.4). A dropped event that was announcing `Left`
    /// signals the member should now be fully deleted from the table.
    ///
    /// Every queued event decays once per round step regardless of
    /// whether it was actually included in that step's packet — if the
    /// queue is longer than one packet's capacity, events near the
    /// back lose marginal coverage guarantees (SPEC_FULL.md §10.3,
    /// accepted as documented behavior).
    pub fn decay_after_round_step(&mut self) -> Vec<Uuid> {
        let mut fully_expired = Vec::new();
        self.events.retain_mut(|e| {
            if e.old_uuid_ttl > 0 {
                e.old_uuid_ttl -= 1;
            }
            if e.payload_ttl > 0 {
                e.payload_ttl -= 1;
            }
            if e.status_ttl > 0 {
                e.status_ttl -= 1;
            }
            if e.status_ttl == 0 {
                if e.status == Status::Left {
                    fully_expired.push(e.uuid);
                }
                false
            } else {
                true
            }
        });
        fully_expired
    }

    pub fn remove(&mut self, uuid: &Uuid) {
        self.events.retain(|e| e.uuid != *uuid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn event(uuid: Uuid, status: Status) -> Event {
        Event {
            uuid,
            addr: Ipv4Addr::new(127, 0, 0, 1),
            port: 1,
            status,
            incarnation: 0,
            old_uuid: None,
            old_uuid_ttl: 0,
            payload: None,
            payload_ttl: 0,
            status_ttl: 0,
        }
    }

    #[test]
    fn register_seeds_ttl_to_table_size() {
        let mut q = DisseminationQueue::new();
        let uuid = Uuid::new_v4();
        q.register(event(uuid, Status::Alive), 5);
        assert_eq!(q.peek_front(1)[0].status_ttl, 5);
    }

    #[test]
    fn register_replaces_existing_event_for_same_member() {
        let mut q = DisseminationQueue::new();
        let uuid = Uuid::new_v4();
        q.register(event(uuid, Status::Alive), 5);
        q.register(event(uuid, Status::Suspected), 5);
        assert_eq!(q.len(), 1);
        assert_eq!(q.peek_front(1)[0].status, Status::Suspected);
    }

    #[test]
    fn decay_drops_event_when_status_ttl_hits_zero() {
        let mut q = DisseminationQueue::new();
        let uuid = Uuid::new_v4();
        q.register(event(uuid, Status::Alive), 1);
        let expired = q.decay_after_round_step();
        assert!(expired.is_empty());
        assert!(q.is_empty());
    }

    #[test]
    fn decay_reports_full_expiry_only_for_left_status() {
        let mut q = DisseminationQueue::new();
        let uuid = Uuid::new_v4();
        q.register(event(uuid, Status::Left), 1);
        let expired = q.decay_after_round_step();
        assert_eq!(expired, vec![uuid]);
    }

    #[test]
    fn descriptor_hides_payload_and_old_uuid_once_their_ttl_is_spent() {
        let mut e = event(Uuid::new_v4(), Status::Alive);
        e.old_uuid = Some(Uuid::new_v4());
        e.old_uuid_ttl = 0;
        e.payload = Some(vec![1, 2, 3]);
        e.payload_ttl = 0;
        let d = e.to_descriptor();
        assert!(d.old_uuid.is_none());
        assert!(d.payload.is_none());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use std::net::Ipv4Addr;

    fn any_status() -> impl Strategy<Value = Status> {
        prop_oneof![
            Just(Status::Alive),
            Just(Status::Suspected),
            Just(Status::Dead),
            Just(Status::Left),
        ]
    }

    proptest! {
        /// However many rounds a single registered event decays through,
        /// the queue never holds more than the one event it started
        /// with, and `status_ttl` never underflows below zero.
        #[test]
        fn repeated_decay_never_underflows_or_duplicates(
            table_size in 1u32..64,
            rounds in 0usize..80,
            status in any_status(),
        ) {
            let mut q = DisseminationQueue::new();
            let uuid = Uuid::new_v4();
            q.register(
                Event {
                    uuid,
                    addr: Ipv4Addr::new(127, 0, 0, 1),
                    port: 1,
                    status,
                    incarnation: 0,
                    old_uuid: None,
                    old_uuid_ttl: 0,
                    payload: None,
                    payload_ttl: 0,
                    status_ttl: 0,
                },
                table_size,
            );

            for _ in 0..rounds {
                prop_assert!(q.len() <= 1);
                q.decay_after_round_step();
            }
            prop_assert!(q.len() <= 1);
        }

        /// A `Left` event is reported as fully expired exactly once, the
        /// round its `status_ttl` reaches zero — never before, never
        /// again after it's gone.
        #[test]
        fn left_event_expires_exactly_once(table_size in 1u32..64) {
            let mut q = DisseminationQueue::new();
            let uuid = Uuid::new_v4();
            q.register(
                Event {
                    uuid,
                    addr: Ipv4Addr::new(127, 0, 0, 1),
                    port: 1,
                    status: Status::Left,
                    incarnation: 0,
                    old_uuid: None,
                    old_uuid_ttl: 0,
                    payload: None,
                    payload_ttl: 0,
                    status_ttl: 0,
                },
                table_size,
            );

            let mut expirations = 0u32;
            for _ in 0..(table_size as usize + 5) {
                expirations += q.decay_after_round_step().len() as u32;
            }
            prop_assert_eq!(expirations, 1);
        }
    }
}
