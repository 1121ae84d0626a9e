//! Failure-detector state machine: ping bookkeeping and the
//! Alive→Suspected→Dead→(GC) escalation driven by `wait_ack_tick`
//! (SPEC_FULL.md §4.3).

use crate::config::{Config, GcMode, INDIRECT_PING_COUNT, NO_ACKS_TO_DEAD, NO_ACKS_TO_GC, NO_ACKS_TO_SUSPECT};
use crate::dissemination::{DisseminationQueue, Event};
use crate::heap::WaitAckHeap;
use crate::member::Status;
use crate::table::MemberTable;
use std::net::SocketAddrV4;
use std::time::Instant;
use uuid::Uuid;

/// What the engine should do as a result of a `wait_ack_tick` sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Escalation {
    /// Re-ping the member directly.
    RePing { uuid: Uuid, addr: SocketAddrV4 },
    /// Member just became Suspected; issue indirect pings through these
    /// proxies (proxies are chosen by the caller, which has table
    /// access this module intentionally avoids re-borrowing).
    BecameSuspected {
        uuid: Uuid,
        addr: SocketAddrV4,
        indirect_ping_count: usize,
    },
    /// Member just became Dead.
    BecameDead { uuid: Uuid },
    /// Member was garbage collected; fully removed from the table.
    Removed { uuid: Uuid },
}

/// Registers an outstanding ping: sets the deadline, inserts into the
/// wait-ack heap if not already tracked (SPEC_FULL.md §4.3).
pub fn register_ping(
    table: &mut MemberTable,
    heap: &mut WaitAckHeap,
    cfg: &Config,
    uuid: Uuid,
    hop_count: u8,
    now: Instant,
) {
    heap.reserve(1);
    let deadline = now + cfg.ack_timeout * hop_count as u32;
    let Some(member) = table.find_mut(&uuid) else {
        return;
    };
    member.ping_deadline = Some(deadline);
    member.ping_pending = true;
    if member.wait_ack_position.is_none() {
        member.wait_ack_position = Some(heap.insert(uuid, deadline, hop_count));
    }
}

/// Sweeps every wait-ack entry whose deadline has passed and applies
/// the SPEC_FULL.md §4.3 escalation rules. Returns one [`Escalation`]
/// per affected member, in heap-pop order.
pub fn run_wait_ack_tick(
    table: &mut MemberTable,
    heap: &mut WaitAckHeap,
    dissemination: &mut DisseminationQueue,
    gc_mode: GcMode,
    now: Instant,
) -> Vec<Escalation> {
    let expired = heap.pop_expired(now);
    let mut escalations = Vec::new();

    for exp in expired {
        let Some(member) = table.find_mut(&exp.uuid) else {
            continue;
        };
        // This pop might be stray if the member re-armed a newer ping
        // in between; only escalate if this was its current slot.
        if member.wait_ack_position.is_none() {
            continue;
        }
        member.wait_ack_position = None;
        member.ping_pending = false;
        member.unacknowledged_pings += 1;

        match member.status {
            Status::Alive if member.unacknowledged_pings >= NO_ACKS_TO_SUSPECT => {
                member.status = Status::Suspected;
                let uuid = member.uuid;
                let addr = member.addr;
                escalate_dissemination(table, dissemination, uuid);
                escalations.push(Escalation::BecameSuspected {
                    uuid,
                    addr,
                    indirect_ping_count: INDIRECT_PING_COUNT,
                });
            }
            Status::Suspected if member.unacknowledged_pings >= NO_ACKS_TO_DEAD => {
                member.status = Status::Dead;
                let uuid = member.uuid;
                escalate_dissemination(table, dissemination, uuid);
                escalations.push(Escalation::BecameDead { uuid });
            }
            Status::Dead if gc_mode == GcMode::On && member.unacknowledged_pings >= NO_ACKS_TO_GC => {
                let status_ttl = member.status_ttl;
                let uuid = member.uuid;
                if status_ttl == 0 {
                    table.remove(&uuid);
                    escalations.push(Escalation::Removed { uuid });
                } else {
                    escalations.push(Escalation::RePing {
                        uuid,
                        addr: member.addr,
                    });
                }
            }
            _ => {
                escalations.push(Escalation::RePing {
                    uuid: exp.uuid,
                    addr: member.addr,
                });
            }
        }
    }

    escalations
}

fn escalate_dissemination(table: &mut MemberTable, dissemination: &mut DisseminationQueue, uuid: Uuid) {
    let table_size = table.size_for_ttl();
    let ttl = table_size.max(1);
    let Some(member) = table.find_mut(&uuid) else {
        return;
    };
    member.status_ttl = ttl;
    if member.old_uuid.is_some() {
        member.old_uuid_ttl = ttl;
    }
    if member.payload.is_some() {
        member.payload_ttl = ttl;
    }
    let member = &*member;
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::Member;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    fn cfg() -> Config {
        Config::new("127.0.0.1:7946", Uuid::new_v4()).with_ack_timeout(Duration::from_secs(1))
    }

    #[test]
    fn alive_member_becomes_suspected_after_threshold_misses() {
        let mut table = MemberTable::new();
        let mut heap = WaitAckHeap::new();
        let mut dissem = DisseminationQueue::new();
        let cfg = cfg();
        let uuid = Uuid::new_v4();
        table.insert(Member::new(uuid, addr(1), Status::Alive, 0));

        let now = Instant::now();
        for _ in 0..NO_ACKS_TO_SUSPECT {
            register_ping(&mut table, &mut heap, &cfg, uuid, 1, now);
            let escalations =
                run_wait_ack_tick(&mut table, &mut heap, &mut dissem, GcMode::On, now + cfg.ack_timeout);
            if table.find(&uuid).unwrap().status == Status::Suspected {
                assert!(escalations
                    .iter()
                    .any(|e| matches!(e, Escalation::BecameSuspected { uuid: u, .. } if *u == uuid)));
            }
        }
        assert_eq!(table.find(&uuid).unwrap().status, Status::Suspected);
    }

    #[test]
    fn dead_member_is_gc_removed_once_status_ttl_is_spent() {
        let mut table = MemberTable::new();
        let mut heap = WaitAckHeap::new();
        let mut dissem = DisseminationQueue::new();
        let cfg = cfg();
        let uuid = Uuid::new_v4();
        let mut member = Member::new(uuid, addr(1), Status::Dead, 0);
        member.status_ttl = 0;
        member.unacknowledged_pings = NO_ACKS_TO_GC - 1;
        table.insert(member);

        let now = Instant::now();
        register_ping(&mut table, &mut heap, &cfg, uuid, 1, now);
        let escalations =
            run_wait_ack_tick(&mut table, &mut heap, &mut dissem, GcMode::On, now + cfg.ack_timeout);

        assert!(escalations.contains(&Escalation::Removed { uuid }));
        assert!(table.find(&uuid).is_none());
    }

    #[test]
    fn gc_mode_off_never_removes_dead_members() {
        let mut table = MemberTable::new();
        let mut heap = WaitAckHeap::new();
        let mut dissem = DisseminationQueue::new();
        let cfg = cfg();
        let uuid = Uuid::new_v4();
        let mut member = Member::new(uuid, addr(1), Status::Dead, 0);
        member.status_ttl = 0;
        member.unacknowledged_pings = NO_ACKS_TO_GC;
        table.insert(member);

        let now = Instant::now();
        register_ping(&mut table, &mut heap, &cfg, uuid, 1, now);
        run_wait_ack_tick(&mut table, &mut heap, &mut dissem, GcMode::Off, now + cfg.ack_timeout);

        assert!(table.find(&uuid).is_some());
    }

    #[test]
    fn stray_pop_after_reping_is_ignored() {
        let mut table = MemberTable::new();
        let mut heap = WaitAckHeap::new();
        let mut dissem = DisseminationQueue::new();
        let cfg = cfg();
        let uuid = Uuid::new_v4();
        table.insert(Member::new(uuid, addr(1), Status::Alive, 0));

        let now = Instant::now();
        register_ping(&mut table, &mut heap, &cfg, uuid, 1, now);
        // Ack arrives and clears wait_ack_position before the deadline.
        table.find_mut(&uuid).unwrap().wait_ack_position = None;

        let escalations =
            run_wait_ack_tick(&mut table, &mut heap, &mut dissem, GcMode::On, now + cfg.ack_timeout);
        assert!(escalations.is_empty());
    }
}
