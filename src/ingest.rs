//! Incoming-packet dispatch and the central `upsert` operation
//! (SPEC_FULL.md §4.5). Pure state transitions: I/O (sending acks,
//! forwarding indirect pings) is reported back as [`Action`]s for the
//! engine's event loop to carry out.

use crate::codec::{FailureDetection, MemberDescriptor, Packet};
use crate::dissemination::{DisseminationQueue, Event};
use crate::heap::WaitAckHeap;
use crate::member::{Member, Status};
use crate::table::{is_ghost_resurrection, MemberTable};
use std::net::{Ipv4Addr, SocketAddrV4};
use uuid::Uuid;

/// Side effects the engine must perform after a packet has been
/// ingested; kept separate from the table/queue mutations so this
/// module stays free of any transport dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send a direct ack back to `to`, a locally known member.
    SendAck { to: Uuid, incarnation: u64 },
    /// Send an ack straight to `addr`, which may not be a locally known
    /// member — used to reply to the original requester of an indirect
    /// ping once this node (the ultimate target) answers it.
    SendAckTo { addr: SocketAddrV4, incarnation: u64 },
    /// Forward a ping to `target`, instructing it to ack straight back
    /// to `reply_to` (the original requester) instead of to us (this
    /// node is acting as an indirect-ping proxy).
    ForwardPing {
        target: Uuid,
        reply_to: SocketAddrV4,
        incarnation: u64,
    },
}

/// The idempotent member-table update every incoming descriptor (from
/// anti-entropy, dissemination, or a failure-detection sender) goes
/// through. Returns `true` if anything in the table actually changed.
pub fn upsert(
    table: &mut MemberTable,
    dissemination: &mut DisseminationQueue,
    def: &MemberDescriptor,
) -> bool {
    let self_uuid = table.self_uuid();

    if table.find(&def.uuid).is_none() {
        if is_ghost_resurrection(table, &def.uuid, def.status) {
            return false;
        }
        table.reserve(1);
        let mut member = Member::new(def.uuid, addr_from(def), def.status, def.incarnation);
        member.payload = def.payload.clone();
        table.insert(member);
        on_member_update(table, dissemination, def.uuid);
        return true;
    }

    if Some(def.uuid) == self_uuid {
        let me = table.this_mut().expect("self_uuid implies this() is Some");
        let mut changed = false;
        if def.incarnation > me.incarnation {
            me.incarnation = def.incarnation;
            changed = true;
        }
        if def.status != Status::Alive && def.incarnation == me.incarnation {
            // Refutation: bump our own incarnation so the claim that we
            // are anything but Alive is obsolete everywhere it spreads.
            me.incarnation += 1;
            changed = true;
        }
        if changed {
            on_member_update(table, dissemination, def.uuid);
        }
        return changed;
    }

    let member = table.find(&def.uuid).expect("checked above");
    if def.incarnation < member.incarnation {
        return false;
    }

    let mut changed = false;
    {
        let member = table.find_mut(&def.uuid).expect("checked above");
        let new_addr = addr_from(def);
        if member.addr != new_addr {
            member.addr = new_addr;
            changed = true;
        }
        if member.accepts(def.incarnation, def.status) {
            member.incarnation = def.incarnation;
            member.status = def.status;
            changed = true;
        }
        if def.payload.is_some() && member.payload != def.payload {
            member.payload = def.payload.clone();
            changed = true;
        }
    }

    if changed {
        on_member_update(table, dissemination, def.uuid);
    }
    changed
}

fn addr_from(def: &MemberDescriptor) -> SocketAddrV4 {
    SocketAddrV4::new(def.addr, def.port)
}

/// Resets failure-detector bookkeeping and registers a fresh
/// dissemination event (SPEC_FULL.md §4.5: "On any of these updates,
/// call `on_member_update`").
fn on_member_update(table: &mut MemberTable, dissemination: &mut DisseminationQueue, uuid: Uuid) {
    let table_size = table.size_for_ttl();
    let Some(member) = table.find_mut(&uuid) else {
        return;
    };
    member.reset_failure_detector();
    let ttl = table_size.max(1);
    member.status_ttl = ttl;
    if member.old_uuid.is_some() {
        member.old_uuid_ttl = ttl;
    }
    if member.payload.is_some() {
        member.payload_ttl = ttl;
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
}

/// Dispatches one fully-decoded packet against the member table,
/// dissemination queue, and wait-ack heap, per SPEC_FULL.md §4.5.
/// Returns the actions the engine must still perform (acks, indirect
/// forwards).
pub fn handle_packet(
    table: &mut MemberTable,
    dissemination: &mut DisseminationQueue,
    heap: &mut WaitAckHeap,
    packet: &Packet,
    src_addr: SocketAddrV4,
) -> Vec<Action> {
    let mut actions = Vec::new();

    let Some(src_uuid) = packet.src_uuid else {
        return actions;
    };

    if let Some(fd) = &packet.failure_detection {
        // Receiving any failure-detection message at all is positive
        // liveness evidence about its sender, regardless of what
        // status we currently hold for them locally — a live member
        // talking to us must never be pinned back to a stale Dead or
        // Suspected record at its own fresh incarnation.
        let sender_incarnation = match fd {
            FailureDetection::Ping { incarnation, .. } => *incarnation,
            FailureDetection::Ack { incarnation } => *incarnation,
        };
        upsert(
            table,
            dissemination,
            &MemberDescriptor {
                status: Status::Alive,
                addr: *src_addr.ip(),
                port: src_addr.port(),
                uuid: src_uuid,
                incarnation: sender_incarnation,
                old_uuid: None,
                payload: None,
            },
        );

        let self_incarnation = table.this().map(|m| m.incarnation).unwrap_or(0);

        match fd {
            FailureDetection::Ping {
                forward_to,
                reply_to,
                ..
            } => {
                if let Some((fwd_addr, fwd_port)) = forward_to {
                    // We are the indirect-ping proxy: forward to the
                    // real target, telling it to ack straight back to
                    // the original requester instead of to us.
                    if let Some(target) = find_target_for_proxy(table, *fwd_addr, *fwd_port) {
                        actions.push(Action::ForwardPing {
                            target,
                            reply_to: src_addr,
                            incarnation: self_incarnation,
                        });
                    }
                } else if let Some((reply_addr, reply_port)) = reply_to {
                    // We are the ultimate target of an indirect ping:
                    // ack straight to the original requester, not to
                    // the proxy that relayed this to us.
                    actions.push(Action::SendAckTo {
                        addr: SocketAddrV4::new(*reply_addr, *reply_port),
                        incarnation: self_incarnation,
                    });
                } else if let Some(member) = table.find_mut(&src_uuid) {
                    if !member.ack_pending {
                        member.ack_pending = true;
                        actions.push(Action::SendAck {
                            to: src_uuid,
                            incarnation: self_incarnation,
                        });
                    }
                }
            }
            FailureDetection::Ack { .. } => {
                if let Some(member) = table.find_mut(&src_uuid) {
                    member.reset_failure_detector();
                    if let Some(key) = member.wait_ack_position.take() {
                        heap.remove(key);
                    }
                }
            }
        }
    }

    for d in &packet.dissemination {
        upsert(table, dissemination, d);
    }
    for d in &packet.anti_entropy {
        upsert(table, dissemination, d);
    }

    if let Some(incarnation) = packet.quit_incarnation {
        upsert(
            table,
            dissemination,
            &MemberDescriptor {
                status: Status::Left,
                addr: *src_addr.ip(),
                port: src_addr.port(),
                uuid: src_uuid,
                incarnation,
                old_uuid: None,
                payload: None,
            },
        );
    }

    actions
}

/// The `forward_to` address/port pair names the *ultimate* ping target;
/// this resolves that address back to a UUID in the local table
/// (indirect pings only target known members).
fn find_target_for_proxy(table: &MemberTable, addr: Ipv4Addr, port: u16) -> Option<Uuid> {
    table
        .iter()
        .find(|m| *m.addr.ip() == addr && m.addr.port() == port)
        .map(|m| m.uuid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddrV4;

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    fn descriptor(uuid: Uuid, status: Status, incarnation: u64) -> MemberDescriptor {
        MemberDescriptor {
            status,
            addr: Ipv4Addr::LOCALHOST,
            port: 1,
            uuid,
            incarnation,
            old_uuid: None,
            payload: None,
        }
    }

    #[test]
    fn upsert_creates_unknown_alive_member() {
        let mut table = MemberTable::new();
        let mut dissem = DisseminationQueue::new();
        let uuid = Uuid::new_v4();
        assert!(upsert(&mut table, &mut dissem, &descriptor(uuid, Status::Alive, 0)));
        assert!(table.contains(&uuid));
        assert_eq!(dissem.len(), 1);
    }

    #[test]
    fn upsert_drops_dead_descriptor_for_unknown_uuid() {
        let mut table = MemberTable::new();
        let mut dissem = DisseminationQueue::new();
        let uuid = Uuid::new_v4();
        assert!(!upsert(&mut table, &mut dissem, &descriptor(uuid, Status::Dead, 0)));
        assert!(!table.contains(&uuid));
    }

    #[test]
    fn upsert_ignores_stale_incarnation() {
        let mut table = MemberTable::new();
        let mut dissem = DisseminationQueue::new();
        let uuid = Uuid::new_v4();
        upsert(&mut table, &mut dissem, &descriptor(uuid, Status::Alive, 5));
        assert!(!upsert(
            &mut table,
            &mut dissem,
            &descriptor(uuid, Status::Suspected, 3)
        ));
        assert_eq!(table.find(&uuid).unwrap().incarnation, 5);
    }

    #[test]
    fn upsert_on_self_refutes_non_alive_claim_at_same_incarnation() {
        let mut table = MemberTable::new();
        let mut dissem = DisseminationQueue::new();
        let me = Uuid::new_v4();
        table.insert(Member::new(me, addr(1), Status::Alive, 4));
        table.mark_self(me);

        upsert(&mut table, &mut dissem, &descriptor(me, Status::Suspected, 4));

        let this = table.this().unwrap();
        assert_eq!(this.status, Status::Alive);
        assert_eq!(this.incarnation, 5);
    }

    #[test]
    fn handle_packet_schedules_ack_for_plain_ping() {
        let mut table = MemberTable::new();
        let mut dissem = DisseminationQueue::new();
        let mut heap = WaitAckHeap::new();
        let src = Uuid::new_v4();
        let packet = Packet {
            src_uuid: Some(src),
            failure_detection: Some(FailureDetection::Ping {
                incarnation: 0,
                hop_count: 1,
                forward_to: None,
                reply_to: None,
            }),
            ..Default::default()
        };
        let actions = handle_packet(&mut table, &mut dissem, &mut heap, &packet, addr(5000));
        assert_eq!(actions, vec![Action::SendAck { to: src, incarnation: 0 }]);
    }

    #[test]
    fn handle_packet_ping_from_locally_dead_sender_revives_it_to_alive() {
        // A member we believe Dead pings us again: this is positive
        // liveness evidence and must override the stale status instead
        // of being pinned to it at the sender's fresh incarnation.
        let mut table = MemberTable::new();
        let mut dissem = DisseminationQueue::new();
        let mut heap = WaitAckHeap::new();
        let src = Uuid::new_v4();
        table.insert(Member::new(src, addr(5000), Status::Dead, 3));

        let packet = Packet {
            src_uuid: Some(src),
            failure_detection: Some(FailureDetection::Ping {
                incarnation: 4,
                hop_count: 1,
                forward_to: None,
                reply_to: None,
            }),
            ..Default::default()
        };
        handle_packet(&mut table, &mut dissem, &mut heap, &packet, addr(5000));

        let member = table.find(&src).unwrap();
        assert_eq!(member.status, Status::Alive);
        assert_eq!(member.incarnation, 4);
    }

    #[test]
    fn handle_packet_forwards_indirect_ping_to_target_with_reply_to_sender() {
        let mut table = MemberTable::new();
        let mut dissem = DisseminationQueue::new();
        let mut heap = WaitAckHeap::new();
        let me = Uuid::new_v4();
        table.insert(Member::new(me, addr(1), Status::Alive, 7));
        table.mark_self(me);

        let requester = Uuid::new_v4();
        table.insert(Member::new(requester, addr(9000), Status::Alive, 0));
        let target = Uuid::new_v4();
        table.insert(Member::new(target, addr(9001), Status::Alive, 0));

        let packet = Packet {
            src_uuid: Some(requester),
            failure_detection: Some(FailureDetection::Ping {
                incarnation: 0,
                hop_count: 1,
                forward_to: Some((Ipv4Addr::LOCALHOST, 9001)),
                reply_to: None,
            }),
            ..Default::default()
        };
        let actions = handle_packet(&mut table, &mut dissem, &mut heap, &packet, addr(9000));
        assert_eq!(
            actions,
            vec![Action::ForwardPing {
                target,
                reply_to: addr(9000),
                incarnation: 7,
            }]
        );
    }

    #[test]
    fn handle_packet_final_hop_of_indirect_ping_acks_to_reply_to_not_sender() {
        let mut table = MemberTable::new();
        let mut dissem = DisseminationQueue::new();
        let mut heap = WaitAckHeap::new();
        let me = Uuid::new_v4();
        table.insert(Member::new(me, addr(1), Status::Alive, 2));
        table.mark_self(me);
        let proxy = Uuid::new_v4();
        table.insert(Member::new(proxy, addr(9001), Status::Alive, 0));

        let packet = Packet {
            src_uuid: Some(proxy),
            failure_detection: Some(FailureDetection::Ping {
                incarnation: 0,
                hop_count: 1,
                forward_to: None,
                reply_to: Some((Ipv4Addr::LOCALHOST, 9000)),
            }),
            ..Default::default()
        };
        let actions = handle_packet(&mut table, &mut dissem, &mut heap, &packet, addr(9001));
        assert_eq!(
            actions,
            vec![Action::SendAckTo {
                addr: addr(9000),
                incarnation: 2,
            }]
        );
    }

    #[test]
    fn handle_packet_ack_clears_wait_ack_entry() {
        let mut table = MemberTable::new();
        let mut dissem = DisseminationQueue::new();
        let mut heap = WaitAckHeap::new();
        let src = Uuid::new_v4();
        table.insert(Member::new(src, addr(5000), Status::Alive, 0));
        let key = heap.insert(src, std::time::Instant::now(), 1);
        table.find_mut(&src).unwrap().wait_ack_position = Some(key);

        let packet = Packet {
            src_uuid: Some(src),
            failure_detection: Some(FailureDetection::Ack { incarnation: 0 }),
            ..Default::default()
        };
        handle_packet(&mut table, &mut dissem, &mut heap, &packet, addr(5000));
        assert!(!heap.contains(key));
        assert!(table.find(&src).unwrap().wait_ack_position.is_none());
    }

    #[test]
    fn handle_packet_quit_marks_member_left() {
        let mut table = MemberTable::new();
        let mut dissem = DisseminationQueue::new();
        let mut heap = WaitAckHeap::new();
        let src = Uuid::new_v4();
        table.insert(Member::new(src, addr(5000), Status::Alive, 0));
        let packet = Packet {
            src_uuid: Some(src),
            quit_incarnation: Some(1),
            ..Default::default()
        };
        handle_packet(&mut table, &mut dissem, &mut heap, &packet, addr(5000));
        assert_eq!(table.find(&src).unwrap().status, Status::Left);
    }
}
