//! Hand-tagged MessagePack wire codec.
//!
//! Field tags are small integers, not struct names, so packets stay
//! compatible byte-for-byte with the reference implementation's wire
//! format (SPEC_FULL.md §4.6/§6). Built on `rmp`'s low-level
//! encode/decode primitives rather than `rmp-serde` derive, since the
//! tag layout does not correspond to any single Rust struct shape one
//! field per key.

use crate::error::{Error, Result};
use std::net::Ipv4Addr;
use uuid::Uuid;

const SRC_UUID: u8 = 0;
const ANTI_ENTROPY: u8 = 1;
const FAILURE_DETECTION: u8 = 2;
const DISSEMINATION: u8 = 3;
const QUIT: u8 = 4;

const D_STATUS: u8 = 0;
const D_ADDRESS: u8 = 1;
const D_PORT: u8 = 2;
const D_UUID: u8 = 3;
const D_INCARNATION: u8 = 4;
const D_OLD_UUID: u8 = 5;
const D_PAYLOAD: u8 = 6;

const FD_TYPE: u8 = 0;
const FD_INCARNATION: u8 = 1;
const FD_HOP_COUNT: u8 = 2;
const FD_FORWARD_ADDRESS: u8 = 3;
const FD_FORWARD_PORT: u8 = 4;
const FD_REPLY_ADDRESS: u8 = 5;
const FD_REPLY_PORT: u8 = 6;

/// One member descriptor, shared shape for anti-entropy and
/// dissemination entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberDescriptor {
    pub status: crate::member::Status,
    pub addr: Ipv4Addr,
    pub port: u16,
    pub uuid: Uuid,
    pub incarnation: u64,
    pub old_uuid: Option<Uuid>,
    pub payload: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDetection {
    Ping {
        incarnation: u64,
        hop_count: u8,
        /// Set by the original requester asking a proxy to relay this
        /// ping onward to the named address; absent on the copy the
        /// proxy itself forwards to the ultimate target.
        forward_to: Option<(Ipv4Addr, u16)>,
        /// Set by a proxy on the forwarded copy so the ultimate target
        /// acks straight back to the original requester's address
        /// instead of to the immediate (proxy) sender.
        reply_to: Option<(Ipv4Addr, u16)>,
    },
    Ack {
        incarnation: u64,
    },
}

/// A fully-decoded (or not-yet-encoded) packet body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    pub src_uuid: Option<Uuid>,
    pub failure_detection: Option<FailureDetection>,
    pub dissemination: Vec<MemberDescriptor>,
    pub anti_entropy: Vec<MemberDescriptor>,
    pub quit_incarnation: Option<u64>,
}

fn encode_descriptor(buf: &mut Vec<u8>, d: &MemberDescriptor) -> Result<()> {
    let mut len = 5u32; // status, addr, port, uuid, incarnation
    if d.old_uuid.is_some() {
        len += 1;
    }
    if d.payload.is_some() {
        len += 1;
    }
    rmp::encode::write_map_len(buf, len).map_err(encode_err)?;

    rmp::encode::write_uint(buf, D_STATUS as u64).map_err(encode_err)?;
    rmp::encode::write_sint(buf, d.status.as_wire_tag()).map_err(encode_err)?;

    rmp::encode::write_uint(buf, D_ADDRESS as u64).map_err(encode_err)?;
    rmp::encode::write_uint(buf, u32::from(d.addr) as u64).map_err(encode_err)?;

    rmp::encode::write_uint(buf, D_PORT as u64).map_err(encode_err)?;
    rmp::encode::write_uint(buf, d.port as u64).map_err(encode_err)?;

    rmp::encode::write_uint(buf, D_UUID as u64).map_err(encode_err)?;
    rmp::encode::write_bin(buf, d.uuid.as_bytes()).map_err(encode_err)?;

    rmp::encode::write_uint(buf, D_INCARNATION as u64).map_err(encode_err)?;
    rmp::encode::write_uint(buf, d.incarnation).map_err(encode_err)?;

    if let Some(old) = d.old_uuid {
        rmp::encode::write_uint(buf, D_OLD_UUID as u64).map_err(encode_err)?;
        rmp::encode::write_bin(buf, old.as_bytes()).map_err(encode_err)?;
    }
    if let Some(payload) = &d.payload {
        rmp::encode::write_uint(buf, D_PAYLOAD as u64).map_err(encode_err)?;
        rmp::encode::write_bin(buf, payload).map_err(encode_err)?;
    }
    Ok(())
}

fn decode_descriptor(bytes: &[u8], pos: &mut usize) -> Result<MemberDescriptor> {
    let len = read_map_len(bytes, pos)?;
    let mut status = None;
    let mut addr = None;
    let mut port = None;
    let mut uuid = None;
    let mut incarnation = None;
    let mut old_uuid = None;
    let mut payload = None;

    for _ in 0..len {
        let key = read_uint(bytes, pos)? as u8;
        match key {
            D_STATUS => {
                let tag = read_int(bytes, pos)?;
                status = Some(
                    crate::member::Status::from_wire_tag(tag)
                        .ok_or_else(|| Error::DecodeError(format!("unknown status tag {tag}")))?,
                );
            }
            D_ADDRESS => addr = Some(Ipv4Addr::from(read_uint(bytes, pos)? as u32)),
            D_PORT => port = Some(read_uint(bytes, pos)? as u16),
            D_UUID => uuid = Some(read_uuid(bytes, pos)?),
            D_INCARNATION => incarnation = Some(read_uint(bytes, pos)?),
            D_OLD_UUID => old_uuid = Some(read_uuid(bytes, pos)?),
            D_PAYLOAD => payload = Some(read_bin(bytes, pos)?),
            other => return Err(Error::DecodeError(format!("unexpected descriptor key {other}"))),
        }
    }

    Ok(MemberDescriptor {
        status: status.ok_or_else(|| Error::DecodeError("descriptor missing status".into()))?,
        addr: addr.ok_or_else(|| Error::DecodeError("descriptor missing addr".into()))?,
        port: port.ok_or_else(|| Error::DecodeError("descriptor missing port".into()))?,
        uuid: uuid.ok_or_else(|| Error::DecodeError("descriptor missing uuid".into()))?,
        incarnation: incarnation
            .ok_or_else(|| Error::DecodeError("descriptor missing incarnation".into()))?,
        old_uuid,
        payload,
    })
}

fn encode_failure_detection(buf: &mut Vec<u8>, fd: &FailureDetection) -> Result<()> {
    match fd {
        FailureDetection::Ping {
            incarnation,
            hop_count,
            forward_to,
            reply_to,
        } => {
            let mut len = 2u32; // type, incarnation
            if *hop_count > 1 {
                len += 1;
            }
            if forward_to.is_some() {
                len += 2;
            }
            if reply_to.is_some() {
                len += 2;
            }
            rmp::encode::write_map_len(buf, len).map_err(encode_err)?;
            rmp::encode::write_uint(buf, FD_TYPE as u64).map_err(encode_err)?;
            rmp::encode::write_uint(buf, 0).map_err(encode_err)?;
            rmp::encode::write_uint(buf, FD_INCARNATION as u64).map_err(encode_err)?;
            rmp::encode::write_uint(buf, *incarnation).map_err(encode_err)?;
            if *hop_count > 1 {
                rmp::encode::write_uint(buf, FD_HOP_COUNT as u64).map_err(encode_err)?;
                rmp::encode::write_uint(buf, *hop_count as u64).map_err(encode_err)?;
            }
            if let Some((fa, fp)) = forward_to {
                rmp::encode::write_uint(buf, FD_FORWARD_ADDRESS as u64).map_err(encode_err)?;
                rmp::encode::write_uint(buf, u32::from(*fa) as u64).map_err(encode_err)?;
                rmp::encode::write_uint(buf, FD_FORWARD_PORT as u64).map_err(encode_err)?;
                rmp::encode::write_uint(buf, *fp as u64).map_err(encode_err)?;
            }
            if let Some((ra, rp)) = reply_to {
                rmp::encode::write_uint(buf, FD_REPLY_ADDRESS as u64).map_err(encode_err)?;
                rmp::encode::write_uint(buf, u32::from(*ra) as u64).map_err(encode_err)?;
                rmp::encode::write_uint(buf, FD_REPLY_PORT as u64).map_err(encode_err)?;
                rmp::encode::write_uint(buf, *rp as u64).map_err(encode_err)?;
            }
        }
        FailureDetection::Ack { incarnation } => {
            rmp::encode::write_map_len(buf, 2).map_err(encode_err)?;
            rmp::encode::write_uint(buf, FD_TYPE as u64).map_err(encode_err)?;
            rmp::encode::write_uint(buf, 1).map_err(encode_err)?;
            rmp::encode::write_uint(buf, FD_INCARNATION as u64).map_err(encode_err)?;
            rmp::encode::write_uint(buf, *incarnation).map_err(encode_err)?;
        }
    }
    Ok(())
}

fn decode_failure_detection(bytes: &[u8], pos: &mut usize) -> Result<FailureDetection> {
    let len = read_map_len(bytes, pos)?;
    let mut kind = None;
    let mut incarnation = None;
    let mut hop_count = 1u8;
    let mut forward_addr = None;
    let mut forward_port = None;
    let mut reply_addr = None;
    let mut reply_port = None;

    for _ in 0..len {
        let key = read_uint(bytes, pos)? as u8;
        match key {
            FD_TYPE => kind = Some(read_uint(bytes, pos)?),
            FD_INCARNATION => incarnation = Some(read_uint(bytes, pos)?),
            FD_HOP_COUNT => hop_count = read_uint(bytes, pos)? as u8,
            FD_FORWARD_ADDRESS => forward_addr = Some(Ipv4Addr::from(read_uint(bytes, pos)? as u32)),
            FD_FORWARD_PORT => forward_port = Some(read_uint(bytes, pos)? as u16),
            FD_REPLY_ADDRESS => reply_addr = Some(Ipv4Addr::from(read_uint(bytes, pos)? as u32)),
            FD_REPLY_PORT => reply_port = Some(read_uint(bytes, pos)? as u16),
            other => return Err(Error::DecodeError(format!("unexpected fd key {other}"))),
        }
    }

    let incarnation =
        incarnation.ok_or_else(|| Error::DecodeError("fd body missing incarnation".into()))?;
    match kind {
        Some(0) => Ok(FailureDetection::Ping {
            incarnation,
            hop_count,
            forward_to: forward_addr.zip(forward_port),
            reply_to: reply_addr.zip(reply_port),
        }),
        Some(1) => Ok(FailureDetection::Ack { incarnation }),
        Some(other) => Err(Error::DecodeError(format!("unknown fd type {other}"))),
        None => Err(Error::DecodeError("fd body missing type".into())),
    }
}

/// Serializes a packet body to bytes. The root-map length is computed
/// up front from which optional sections are present, rather than
/// patched into a placeholder byte after the fact.
pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>> {
    let src_uuid = packet
        .src_uuid
        .ok_or_else(|| Error::ProtocolError("packet has no src_uuid".into()))?;

    let mut len = 1u32; // SRC_UUID always present
    if packet.failure_detection.is_some() {
        len += 1;
    }
    if !packet.dissemination.is_empty() {
        len += 1;
    }
    if !packet.anti_entropy.is_empty() {
        len += 1;
    }
    if packet.quit_incarnation.is_some() {
        len += 1;
    }

    let mut buf = Vec::with_capacity(256);
    rmp::encode::write_map_len(&mut buf, len).map_err(encode_err)?;

    rmp::encode::write_uint(&mut buf, SRC_UUID as u64).map_err(encode_err)?;
    rmp::encode::write_bin(&mut buf, src_uuid.as_bytes()).map_err(encode_err)?;

    if let Some(fd) = &packet.failure_detection {
        rmp::encode::write_uint(&mut buf, FAILURE_DETECTION as u64).map_err(encode_err)?;
        encode_failure_detection(&mut buf, fd)?;
    }

    if !packet.dissemination.is_empty() {
        rmp::encode::write_uint(&mut buf, DISSEMINATION as u64).map_err(encode_err)?;
        rmp::encode::write_array_len(&mut buf, packet.dissemination.len() as u32)
            .map_err(encode_err)?;
        for d in &packet.dissemination {
            encode_descriptor(&mut buf, d)?;
        }
    }

    if !packet.anti_entropy.is_empty() {
        rmp::encode::write_uint(&mut buf, ANTI_ENTROPY as u64).map_err(encode_err)?;
        rmp::encode::write_array_len(&mut buf, packet.anti_entropy.len() as u32)
            .map_err(encode_err)?;
        for d in &packet.anti_entropy {
            encode_descriptor(&mut buf, d)?;
        }
    }

    if let Some(incarnation) = packet.quit_incarnation {
        rmp::encode::write_uint(&mut buf, QUIT as u64).map_err(encode_err)?;
        rmp::encode::write_map_len(&mut buf, 1).map_err(encode_err)?;
        rmp::encode::write_uint(&mut buf, FD_INCARNATION as u64).map_err(encode_err)?;
        rmp::encode::write_uint(&mut buf, incarnation).map_err(encode_err)?;
    }

    Ok(buf)
}

/// Parses a packet body. The first map key must be `SRC_UUID`
/// (SPEC_FULL.md §4.5); every other key is dispatched by tag.
pub fn decode_packet(bytes: &[u8]) -> Result<Packet> {
    let mut pos = 0usize;
    let len = read_map_len(bytes, &mut pos)?;
    if len == 0 {
        return Err(Error::DecodeError("empty packet".into()));
    }

    let mut packet = Packet::default();

    let first_key = read_uint(bytes, &mut pos)? as u8;
    if first_key != SRC_UUID {
        return Err(Error::DecodeError("first key is not SRC_UUID".into()));
    }
    packet.src_uuid = Some(read_uuid(bytes, &mut pos)?);

    for _ in 1..len {
        let key = read_uint(bytes, &mut pos)? as u8;
        match key {
            SRC_UUID => return Err(Error::DecodeError("duplicate SRC_UUID".into())),
            FAILURE_DETECTION => {
                packet.failure_detection = Some(decode_failure_detection(bytes, &mut pos)?);
            }
            DISSEMINATION => {
                let n = read_array_len(bytes, &mut pos)?;
                for _ in 0..n {
                    packet.dissemination.push(decode_descriptor(bytes, &mut pos)?);
                }
            }
            ANTI_ENTROPY => {
                let n = read_array_len(bytes, &mut pos)?;
                for _ in 0..n {
                    packet.anti_entropy.push(decode_descriptor(bytes, &mut pos)?);
                }
            }
            QUIT => {
                let body_len = read_map_len(bytes, &mut pos)?;
                let mut incarnation = None;
                for _ in 0..body_len {
                    let k = read_uint(bytes, &mut pos)? as u8;
                    if k == FD_INCARNATION {
                        incarnation = Some(read_uint(bytes, &mut pos)?);
                    } else {
                        return Err(Error::DecodeError(format!("unexpected quit key {k}")));
                    }
                }
                packet.quit_incarnation =
                    Some(incarnation.ok_or_else(|| Error::DecodeError("quit missing incarnation".into()))?);
            }
            other => return Err(Error::DecodeError(format!("unexpected top-level key {other}"))),
        }
    }

    Ok(packet)
}

fn encode_err<E: std::fmt::Display>(e: E) -> Error {
    Error::DecodeError(format!("encode failure: {e}"))
}

fn read_map_len(bytes: &[u8], pos: &mut usize) -> Result<u32> {
    let mut cur = &bytes[*pos..];
    let len = rmp::decode::read_map_len(&mut cur)
        .map_err(|e| Error::DecodeError(format!("bad map header: {e}")))?;
    *pos = bytes.len() - cur.len();
    Ok(len)
}

fn read_array_len(bytes: &[u8], pos: &mut usize) -> Result<u32> {
    let mut cur = &bytes[*pos..];
    let len = rmp::decode::read_array_len(&mut cur)
        .map_err(|e| Error::DecodeError(format!("bad array header: {e}")))?;
    *pos = bytes.len() - cur.len();
    Ok(len)
}

fn read_uint(bytes: &[u8], pos: &mut usize) -> Result<u64> {
    let mut cur = &bytes[*pos..];
    let v = rmp::decode::read_int(&mut cur)
        .map_err(|e| Error::DecodeError(format!("bad uint: {e}")))?;
    *pos = bytes.len() - cur.len();
    Ok(v)
}

fn read_int(bytes: &[u8], pos: &mut usize) -> Result<i64> {
    let mut cur = &bytes[*pos..];
    let v = rmp::decode::read_int(&mut cur)
        .map_err(|e| Error::DecodeError(format!("bad int: {e}")))?;
    *pos = bytes.len() - cur.len();
    Ok(v)
}

fn read_bin(bytes: &[u8], pos: &mut usize) -> Result<Vec<u8>> {
    let mut cur = &bytes[*pos..];
    let len = rmp::decode::read_bin_len(&mut cur)
        .map_err(|e| Error::DecodeError(format!("bad bin header: {e}")))?;
    let start = bytes.len() - cur.len();
    let end = start + len as usize;
    if end > bytes.len() {
        return Err(Error::DecodeError("truncated bin payload".into()));
    }
    *pos = end;
    Ok(bytes[start..end].to_vec())
}

fn read_uuid(bytes: &[u8], pos: &mut usize) -> Result<Uuid> {
    let raw = read_bin(bytes, pos)?;
    Uuid::from_slice(&raw).map_err(|e| Error::DecodeError(format!("bad uuid bytes: {e}")))
}
