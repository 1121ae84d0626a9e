//! UDP transport: a trait so the engine can be driven by a fake
//! transport in tests, plus a `mio`-backed non-blocking implementation
//! for real use (SPEC_FULL.md §6). IPv4 only; `INADDR_ANY` is rejected
//! at bind time since pings and acks carry the bound address on the
//! wire as this instance's addressable identity.

use crate::error::{Error, Result};
use mio::net::UdpSocket;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tracing::debug;

pub const MAX_DATAGRAM_SIZE: usize = 1472;

/// Everything the engine needs from a UDP socket.
pub trait Transport {
    fn local_addr(&self) -> SocketAddrV4;
    fn send_to(&mut self, buf: &[u8], dst: SocketAddrV4) -> Result<usize>;
    /// Non-blocking receive; `Ok(None)` means "would block".
    fn recv_from(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddrV4)>>;
}

/// `mio`-registered non-blocking UDP socket bound to a single IPv4
/// address.
pub struct MioTransport {
    socket: UdpSocket,
    local: SocketAddrV4,
}

impl MioTransport {
    pub fn bind(addr: SocketAddrV4) -> Result<Self> {
        if addr.ip() == &Ipv4Addr::UNSPECIFIED {
            return Err(Error::IllegalParams(
                "cannot bind to INADDR_ANY; a concrete address is required".into(),
            ));
        }
        let socket = UdpSocket::bind(SocketAddr::V4(addr))?;
        debug!(%addr, "bound swim transport socket");
        Ok(Self { socket, local: addr })
    }

    pub fn registry_source(&mut self) -> &mut UdpSocket {
        &mut self.socket
    }
}

impl Transport for MioTransport {
    fn local_addr(&self) -> SocketAddrV4 {
        self.local
    }

    fn send_to(&mut self, buf: &[u8], dst: SocketAddrV4) -> Result<usize> {
        Ok(self.socket.send_to(buf, SocketAddr::V4(dst))?)
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddrV4)>> {
        match self.socket.recv_from(buf) {
            Ok((n, SocketAddr::V4(src))) => Ok(Some((n, src))),
            Ok((_, SocketAddr::V6(src))) => {
                Err(Error::IllegalParams(format!("received from non-IPv4 peer {src}")))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory transport for tests: a loopback queue of `(dst, bytes)`
/// pairs, with no actual socket or OS involvement.
#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Default)]
    pub struct FakeTransport {
        pub local: SocketAddrV4,
        pub outbox: VecDeque<(SocketAddrV4, Vec<u8>)>,
        pub inbox: VecDeque<(SocketAddrV4, Vec<u8>)>,
    }

    impl FakeTransport {
        pub fn new(local: SocketAddrV4) -> Self {
            Self {
                local,
                outbox: VecDeque::new(),
                inbox: VecDeque::new(),
            }
        }

        pub fn deliver(&mut self, from: SocketAddrV4, bytes: Vec<u8>) {
            self.inbox.push_back((from, bytes));
        }
    }

    impl Transport for FakeTransport {
        fn local_addr(&self) -> SocketAddrV4 {
            self.local
        }

        fn send_to(&mut self, buf: &[u8], dst: SocketAddrV4) -> Result<usize> {
            self.outbox.push_back((dst, buf.to_vec()));
            Ok(buf.len())
        }

        fn recv_from(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddrV4)>> {
            let Some((src, bytes)) = self.inbox.pop_front() else {
                return Ok(None);
            };
            let n = bytes.len().min(buf.len());
            buf[..n].copy_from_slice(&bytes[..n]);
            Ok(Some((n, src)))
        }
    }
}
