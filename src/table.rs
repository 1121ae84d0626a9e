//! The member table: UUID-keyed storage plus a parallel order vector
//! used both for Fisher–Yates round shuffling and for the anti-entropy
//! random-start scan.

use crate::dissemination::{DisseminationQueue, Event};
use crate::error::{Error, Result};
use crate::member::{Member, Status};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use std::collections::VecDeque;
use uuid::Uuid;

/// UUID→Member storage. Mutations are not ordered by insertion; `iter`
/// is stable only between mutating calls.
#[derive(Default)]
pub struct MemberTable {
    members: HashMap<Uuid, Member>,
    /// Mirrors `members`' keys; `Member::table_index` is this vector's
    /// index for that member, kept in sync on insert/remove so removal
    /// is O(1) via swap-remove instead of a linear scan.
    order: Vec<Uuid>,
    self_uuid: Option<Uuid>,
}

impl MemberTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn self_uuid(&self) -> Option<Uuid> {
        self.self_uuid
    }

    pub fn this(&self) -> Option<&Member> {
        self.self_uuid.and_then(|u| self.members.get(&u))
    }

    pub fn this_mut(&mut self) -> Option<&mut Member> {
        let uuid = self.self_uuid?;
        self.members.get_mut(&uuid)
    }

    pub fn mark_self(&mut self, uuid: Uuid) {
        self.self_uuid = Some(uuid);
    }

    pub fn find(&self, uuid: &Uuid) -> Option<&Member> {
        self.members.get(uuid)
    }

    pub fn find_mut(&mut self, uuid: &Uuid) -> Option<&mut Member> {
        self.members.get_mut(uuid)
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.members.contains_key(uuid)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Reserves capacity for `additional` more members so a subsequent
    /// `insert` cannot fail on allocation (SPEC_FULL.md §3 invariant 6;
    /// §4.1: "Before any multi-step mutation that must be atomic, call
    /// `reserve(1)`").
    pub fn reserve(&mut self, additional: usize) {
        self.members.reserve(additional);
        self.order.reserve(additional);
    }

    /// Inserts a new member or replaces an existing one with the same
    /// UUID in place (preserving its `table_index`).
    pub fn insert(&mut self, mut member: Member) {
        let uuid = member.uuid;
        if let Some(existing) = self.members.get(&uuid) {
            member.table_index = existing.table_index;
            self.members.insert(uuid, member);
            return;
        }
        member.table_index = self.order.len();
        self.order.push(uuid);
        self.members.insert(uuid, member);
    }

    /// Removes a member by UUID, fixing up the order vector via
    /// swap-remove so removal never shifts the whole tail.
    pub fn remove(&mut self, uuid: &Uuid) -> Option<Member> {
        let removed = self.members.remove(uuid)?;
        let idx = removed.table_index;
        self.order.swap_remove(idx);
        if let Some(moved_uuid) = self.order.get(idx).copied() {
            if let Some(moved) = self.members.get_mut(&moved_uuid) {
                moved.table_index = idx;
            }
        }
        if self.self_uuid == Some(*uuid) {
            self.self_uuid = None;
        }
        Some(removed)
    }

    /// Renames a member's UUID in place: reserve→insert(new)→remove(old),
    /// surviving any rehash in between (SPEC_FULL.md §4.1).
    /// Rehashes a member under a new UUID, tagging it with `old_uuid`
    /// so the change itself propagates through dissemination (codec's
    /// `D_OLD_UUID` field, SPEC_FULL.md §4.7) instead of peers only
    /// ever seeing the new identity appear with no link to the old one.
    pub fn rehash_for_uuid_change(
        &mut self,
        old_uuid: Uuid,
        new_uuid: Uuid,
        dissemination: &mut DisseminationQueue,
    ) -> Result<()> {
        let mut member = self
            .members
            .get(&old_uuid)
            .cloned()
            .ok_or_else(|| Error::ProtocolError(format!("no member with uuid {old_uuid}")))?;
        self.reserve(1);
        member.uuid = new_uuid;
        member.old_uuid = Some(old_uuid);
        let table_size = self.size_for_ttl();
        member.old_uuid_ttl = table_size.max(1);
        let was_self = self.self_uuid == Some(old_uuid);
        self.insert(member.clone());
        self.remove(&old_uuid);
        if was_self {
            self.self_uuid = Some(new_uuid);
        }
        dissemination.register(
            Event {
                uuid: member.uuid,
                addr: *member.addr.ip(),
                port: member.addr.port(),
                status: member.status,
                incarnation: member.incarnation,
                old_uuid: member.old_uuid,
                old_uuid_ttl: member.old_uuid_ttl,
                payload: member.payload.clone(),
                payload_ttl: member.payload_ttl,
                status_ttl: member.status_ttl,
            },
            table_size,
        );
        Ok(())
    }

    /// Decrements every member's independently-TTL'd fields once per
    /// round, mirroring `DisseminationQueue::decay_after_round_step` so
    /// `status_ttl` (the dead-member GC guard, SPEC_FULL.md §10.2) and
    /// `old_uuid`/`payload` actually expire instead of sitting frozen at
    /// whatever `on_member_update` last seeded them to.
    pub fn decay_member_ttls(&mut self) {
        for member in self.members.values_mut() {
            if member.status_ttl > 0 {
                member.status_ttl -= 1;
            }
            if member.old_uuid_ttl > 0 {
                member.old_uuid_ttl -= 1;
                if member.old_uuid_ttl == 0 {
                    member.old_uuid = None;
                }
            }
            if member.payload_ttl > 0 {
                member.payload_ttl -= 1;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Member> {
        self.members.values_mut()
    }

    /// Picks one member uniformly at random, excluding `self` if asked.
    pub fn random(&self, exclude_self: bool) -> Option<&Member> {
        let candidates: Vec<&Uuid> = self
            .order
            .iter()
            .filter(|u| !exclude_self || Some(**u) != self.self_uuid)
            .collect();
        let mut rng = rand::thread_rng();
        candidates
            .choose(&mut rng)
            .and_then(|uuid| self.members.get(uuid))
    }

    /// Builds the next round's FIFO by Fisher–Yates shuffling every
    /// non-self UUID currently in the table (SPEC_FULL.md §4.2).
    pub fn shuffled_round_queue(&self) -> VecDeque<Uuid> {
        let mut shuffled: Vec<Uuid> = self
            .order
            .iter()
            .copied()
            .filter(|u| Some(*u) != self.self_uuid)
            .collect();
        shuffled.shuffle(&mut rand::thread_rng());
        shuffled.into_iter().collect()
    }

    /// Anti-entropy sample: up to `max` member descriptors starting at
    /// a uniformly random position in table order and wrapping around
    /// (SPEC_FULL.md §4.4).
    pub fn random_sample(&self, max: usize) -> Vec<&Member> {
        if self.order.is_empty() || max == 0 {
            return Vec::new();
        }
        let n = self.order.len();
        let start = rand::thread_rng().gen_range(0..n);
        (0..n.min(max))
            .filter_map(|i| self.members.get(&self.order[(start + i) % n]))
            .collect()
    }

    /// Count of members currently at or past a given status, used to
    /// seed a fresh dissemination event's TTL at table size (SPEC_FULL
    /// §4.4: "New events set TTLs to current member-table size").
    pub fn size_for_ttl(&self) -> u32 {
        self.len() as u32
    }
}

/// Convenience used by the ingest pipeline to decide if a status update
/// would resurrect a ghost: a Dead record for a UUID the table has
/// never heard of (SPEC_FULL.md §3 invariant 5).
pub fn is_ghost_resurrection(table: &MemberTable, uuid: &Uuid, status: Status) -> bool {
    status == Status::Dead && !table.contains(uuid)
}
