//! Builds one outgoing round packet: SRC_UUID, then failure-detection,
//! dissemination, and anti-entropy sections in that fixed priority
//! order, each appended while space remains under one UDP datagram
//! (SPEC_FULL.md §4.4).

use crate::codec::{FailureDetection, Packet};
use crate::dissemination::DisseminationQueue;
use crate::table::MemberTable;
use crate::transport::MAX_DATAGRAM_SIZE;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Best-effort packet assembly: anti-entropy is trimmed (never the
/// other sections, which are small and fixed) if the encoded packet
/// would exceed [`MAX_DATAGRAM_SIZE`].
pub fn build_round_packet(
    table: &MemberTable,
    dissemination: &DisseminationQueue,
    failure_detection: Option<FailureDetection>,
    quit_incarnation: Option<u64>,
) -> crate::error::Result<Vec<u8>> {
    let src_uuid = table.self_uuid();
    let mut packet = Packet {
        src_uuid,
        failure_detection,
        dissemination: dissemination
            .peek_front(32)
            .into_iter()
            .map(|e| e.to_descriptor())
            .collect(),
        anti_entropy: Vec::new(),
        quit_incarnation,
    };

    // Start generous, then trim anti-entropy until it fits.
    let mut sample_size = table.len().min(16);
    loop {
        packet.anti_entropy = table
            .random_sample(sample_size)
            .into_iter()
            .map(|m| crate::codec::MemberDescriptor {
                status: m.status,
                addr: *m.addr.ip(),
                port: m.addr.port(),
                uuid: m.uuid,
                incarnation: m.incarnation,
                old_uuid: None,
                payload: if m.payload_ttl > 0 { m.payload.clone() } else { None },
            })
            .collect();

        let encoded = crate::codec::encode_packet(&packet)?;
        if encoded.len() <= MAX_DATAGRAM_SIZE || sample_size == 0 {
            return Ok(encoded);
        }
        sample_size /= 2;
    }
}

/// Convenience for `quit()`'s terminal round: a QUIT-only packet with
/// no failure-detection or gossip sections.
pub fn build_quit_packet(self_uuid: uuid::Uuid, incarnation: u64) -> crate::error::Result<Vec<u8>> {
    crate::codec::encode_packet(&Packet {
        src_uuid: Some(self_uuid),
        quit_incarnation: Some(incarnation),
        ..Default::default()
    })
}

/// Splits a socket address into the `(addr, port)` pair the wire
/// format uses for the indirect-ping `forward_to`/`reply_to` fields.
pub fn addr_fields(addr: SocketAddrV4) -> (Ipv4Addr, u16) {
    (*addr.ip(), addr.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::{Member, Status};
    use std::net::SocketAddrV4;
    use uuid::Uuid;

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    #[test]
    fn build_round_packet_roundtrips_through_codec() {
        let mut table = MemberTable::new();
        let me = Uuid::new_v4();
        table.insert(Member::new(me, addr(1), Status::Alive, 0));
        table.mark_self(me);
        table.insert(Member::new(Uuid::new_v4(), addr(2), Status::Alive, 0));

        let dissem = DisseminationQueue::new();
        let bytes = build_round_packet(&table, &dissem, None, None).unwrap();
        let decoded = crate::codec::decode_packet(&bytes).unwrap();
        assert_eq!(decoded.src_uuid, Some(me));
    }

    #[test]
    fn build_quit_packet_carries_incarnation() {
        let me = Uuid::new_v4();
        let bytes = build_quit_packet(me, 7).unwrap();
        let decoded = crate::codec::decode_packet(&bytes).unwrap();
        assert_eq!(decoded.quit_incarnation, Some(7));
        assert_eq!(decoded.src_uuid, Some(me));
    }
}
