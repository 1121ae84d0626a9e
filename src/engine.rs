//! The engine: owns every component and runs the single-threaded,
//! cooperative event loop described in SPEC_FULL.md §5. All state
//! mutation happens inside event-loop callbacks; there is no
//! background thread and no shared-memory synchronization.

use crate::codec::{self, FailureDetection};
use crate::config::{Config, GcMode};
use crate::detector::{self, Escalation};
use crate::dissemination::DisseminationQueue;
use crate::encoder;
use crate::error::{Error, Result};
use crate::heap::WaitAckHeap;
use crate::ingest::{self, Action};
use crate::member::{Member, Status};
use crate::round::RoundScheduler;
use crate::table::MemberTable;
use crate::timer::PeriodicTimer;
use crate::transport::{MioTransport, Transport, MAX_DATAGRAM_SIZE};
use mio::{Events, Interest, Poll, Token};
use std::net::SocketAddrV4;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

const UDP_TOKEN: Token = Token(0);

/// A running membership engine, generic over its transport so tests
/// can drive it with an in-memory fake instead of a real socket.
pub struct SwimEngine<T: Transport> {
    table: MemberTable,
    heap: WaitAckHeap,
    dissemination: DisseminationQueue,
    round: RoundScheduler,
    cfg: Option<Config>,
    round_timer: Option<PeriodicTimer>,
    wait_ack_timer: Option<PeriodicTimer>,
    transport: Option<T>,
    recv_buf: Vec<u8>,
    quitting: bool,
}

impl<T: Transport> Default for SwimEngine<T> {
    fn default() -> Self {
        Self {
            table: MemberTable::new(),
            heap: WaitAckHeap::new(),
            dissemination: DisseminationQueue::new(),
            round: RoundScheduler::new(),
            cfg: None,
            round_timer: None,
            wait_ack_timer: None,
            transport: None,
            recv_buf: vec![0u8; MAX_DATAGRAM_SIZE],
            quitting: false,
        }
    }
}

impl<T: Transport> SwimEngine<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(&self) -> Option<&Config> {
        self.cfg.as_ref()
    }

    pub fn member_count(&self) -> usize {
        self.table.len()
    }

    /// Read access to the member table, for introspection by embedders
    /// and tests.
    pub fn member_table(&self) -> &MemberTable {
        &self.table
    }

    /// Mutable access to the member table. Intended for test harnesses
    /// that need to force specific TTL/incarnation states; normal
    /// callers should prefer `add_member`/`remove_member`.
    pub fn member_table_mut(&mut self) -> &mut MemberTable {
        &mut self.table
    }

    /// Read access to the transport, for test harnesses driving a fake
    /// transport directly.
    pub fn transport_ref(&self) -> &T {
        self.transport.as_ref().expect("engine not configured")
    }

    /// Mutable access to the transport.
    pub fn transport_mut(&mut self) -> &mut T {
        self.transport.as_mut().expect("engine not configured")
    }

    /// (Re)configures the engine. First call requires a non-empty URI
    /// and creates `self` as an Alive member at incarnation 0. Later
    /// calls with a different UUID perform a reserve→insert→remove
    /// rehash so the previous identity survives until the new one is
    /// fully installed (SPEC_FULL.md §4.7).
    pub fn cfg(&mut self, new_cfg: Config, bind: impl FnOnce(SocketAddrV4) -> Result<T>, now: Instant) -> Result<()> {
        let addr = parse_uri(&new_cfg.uri)?;

        match self.cfg.as_ref() {
            None => {
                self.table.reserve(1);
                let member = Member::new(new_cfg.uuid, addr, Status::Alive, 0);
                self.table.insert(member);
                self.table.mark_self(new_cfg.uuid);
                self.transport = Some(bind(addr)?);
            }
            Some(old) if old.uuid != new_cfg.uuid => {
                self.table
                    .rehash_for_uuid_change(old.uuid, new_cfg.uuid, &mut self.dissemination)?;
                if old.uri != new_cfg.uri {
                    self.transport = Some(bind(addr)?);
                }
            }
            Some(old) if old.uri != new_cfg.uri => {
                self.transport = Some(bind(addr)?);
            }
            _ => {}
        }

        self.round_timer = Some(match self.round_timer.take() {
            Some(mut t) => {
                t.set_period(new_cfg.heartbeat, now);
                t
            }
            None => PeriodicTimer::new(new_cfg.heartbeat, now),
        });
        self.wait_ack_timer = Some(match self.wait_ack_timer.take() {
            Some(mut t) => {
                t.set_period(new_cfg.ack_timeout, now);
                t
            }
            None => PeriodicTimer::new(new_cfg.ack_timeout, now),
        });

        self.cfg = Some(new_cfg);
        Ok(())
    }

    /// Adds a peer to probe, at incarnation 0, Alive.
    pub fn add_member(&mut self, uri: &str, uuid: Uuid) -> Result<()> {
        if self.table.contains(&uuid) {
            return Err(Error::ProtocolError(format!("member {uuid} already exists")));
        }
        let addr = parse_uri(uri)?;
        self.table.reserve(1);
        self.table.insert(Member::new(uuid, addr, Status::Alive, 0));
        Ok(())
    }

    pub fn remove_member(&mut self, uuid: Uuid) -> Result<()> {
        if Some(uuid) == self.table.self_uuid() {
            return Err(Error::ProtocolError("cannot remove self".into()));
        }
        self.table.remove(&uuid);
        self.dissemination.remove(&uuid);
        Ok(())
    }

    /// Fire-and-forget direct ping, outside the normal round schedule.
    pub fn probe_member(&mut self, uuid: Uuid, now: Instant) -> Result<()> {
        let cfg = self
            .cfg
            .as_ref()
            .ok_or_else(|| Error::IllegalParams("engine not configured".into()))?
            .clone();
        let Some(member) = self.table.find(&uuid) else {
            return Err(Error::ProtocolError(format!("unknown member {uuid}")));
        };
        let dst = member.addr;
        let self_uuid = self
            .table
            .self_uuid()
            .ok_or_else(|| Error::IllegalParams("engine not configured".into()))?;
        let incarnation = self.table.this().map(|m| m.incarnation).unwrap_or(0);
        let packet = codec::encode_packet(&codec::Packet {
            src_uuid: Some(self_uuid),
            failure_detection: Some(FailureDetection::Ping {
                incarnation,
                hop_count: 1,
                forward_to: None,
                reply_to: None,
            }),
            ..Default::default()
        })?;
        self.send(&packet, dst)?;
        detector::register_ping(&mut self.table, &mut self.heap, &cfg, uuid, 1, now);
        Ok(())
    }

    /// Runs one `round_tick`: encode a packet addressed to the head of
    /// the round queue, send it, and register the resulting ping
    /// (SPEC_FULL.md §4.2).
    pub fn round_tick(&mut self, now: Instant) -> Result<()> {
        let cfg = self
            .cfg
            .clone()
            .ok_or_else(|| Error::IllegalParams("engine not configured".into()))?;
        let Some(target) = self.round.next(&self.table) else {
            return Ok(());
        };
        let Some(dst) = self.table.find(&target).map(|m| m.addr) else {
            return Ok(());
        };
        let self_uuid = self
            .table
            .self_uuid()
            .ok_or_else(|| Error::IllegalParams("engine not configured".into()))?;
        let incarnation = self.table.this().map(|m| m.incarnation).unwrap_or(0);

        let packet = encoder::build_round_packet(
            &self.table,
            &self.dissemination,
            Some(FailureDetection::Ping {
                incarnation,
                hop_count: 1,
                forward_to: None,
                reply_to: None,
            }),
            None,
        )?;
        debug_assert!(self.table.self_uuid() == Some(self_uuid));

        self.send(&packet, dst)?;
        detector::register_ping(&mut self.table, &mut self.heap, &cfg, target, 1, now);
        let expired = self.dissemination.decay_after_round_step();
        for uuid in expired {
            self.table.remove(&uuid);
        }
        self.table.decay_member_ttls();
        Ok(())
    }

    /// Runs one `wait_ack_tick`: sweeps expired pings and applies
    /// failure-detector escalations, issuing indirect pings where
    /// needed.
    pub fn wait_ack_tick(&mut self, now: Instant) -> Result<()> {
        let cfg = self
            .cfg
            .clone()
            .ok_or_else(|| Error::IllegalParams("engine not configured".into()))?;
        let escalations = detector::run_wait_ack_tick(
            &mut self.table,
            &mut self.heap,
            &mut self.dissemination,
            cfg.gc_mode,
            now,
        );

        for escalation in escalations {
            match escalation {
                Escalation::RePing { uuid, addr } => {
                    self.send_ping(uuid, addr, 1, now, &cfg)?;
                }
                Escalation::BecameSuspected {
                    uuid,
                    addr,
                    indirect_ping_count,
                } => {
                    warn!(%uuid, "member suspected, issuing indirect pings");
                    self.issue_indirect_pings(uuid, addr, indirect_ping_count, now, &cfg)?;
                }
                Escalation::BecameDead { uuid } => {
                    warn!(%uuid, "member declared dead");
                }
                Escalation::Removed { uuid } => {
                    info!(%uuid, "member garbage collected");
                }
            }
        }
        Ok(())
    }

    fn send_ping(
        &mut self,
        uuid: Uuid,
        addr: SocketAddrV4,
        hop_count: u8,
        now: Instant,
        cfg: &Config,
    ) -> Result<()> {
        let self_uuid = self
            .table
            .self_uuid()
            .ok_or_else(|| Error::IllegalParams("engine not configured".into()))?;
        let incarnation = self.table.this().map(|m| m.incarnation).unwrap_or(0);
        let packet = codec::encode_packet(&codec::Packet {
            src_uuid: Some(self_uuid),
            failure_detection: Some(FailureDetection::Ping {
                incarnation,
                hop_count,
                forward_to: None,
                reply_to: None,
            }),
            ..Default::default()
        })?;
        self.send(&packet, addr)?;
        detector::register_ping(&mut self.table, &mut self.heap, cfg, uuid, hop_count, now);
        Ok(())
    }

    fn issue_indirect_pings(
        &mut self,
        target_uuid: Uuid,
        target_addr: SocketAddrV4,
        count: usize,
        now: Instant,
        cfg: &Config,
    ) -> Result<()> {
        let self_uuid = self
            .table
            .self_uuid()
            .ok_or_else(|| Error::IllegalParams("engine not configured".into()))?;
        let incarnation = self.table.this().map(|m| m.incarnation).unwrap_or(0);
        let (forward_addr, forward_port) = encoder::addr_fields(target_addr);

        let proxies: Vec<SocketAddrV4> = (0..count)
            .filter_map(|_| {
                self.table
                    .random(true)
                    .filter(|m| m.uuid != target_uuid)
                    .map(|m| m.addr)
            })
            .collect();

        for proxy in proxies {
            let packet = codec::encode_packet(&codec::Packet {
                src_uuid: Some(self_uuid),
                failure_detection: Some(FailureDetection::Ping {
                    incarnation,
                    hop_count: 2,
                    forward_to: Some((forward_addr, forward_port)),
                    reply_to: None,
                }),
                ..Default::default()
            })?;
            self.send(&packet, proxy)?;
        }
        detector::register_ping(&mut self.table, &mut self.heap, cfg, target_uuid, 2, now);
        Ok(())
    }

    /// Parses and dispatches one incoming datagram.
    pub fn handle_datagram(&mut self, bytes: &[u8], src: SocketAddrV4) -> Result<()> {
        let packet = match codec::decode_packet(bytes) {
            Ok(p) => p,
            Err(e) => {
                warn!(%src, error = %e, "dropping malformed packet");
                return Ok(());
            }
        };
        let actions = ingest::handle_packet(&mut self.table, &mut self.dissemination, &mut self.heap, &packet, src);
        for action in actions {
            self.perform_action(action)?;
        }
        Ok(())
    }

    fn perform_action(&mut self, action: Action) -> Result<()> {
        match action {
            Action::SendAck { to, incarnation } => {
                let Some(dst) = self.table.find(&to).map(|m| m.addr) else {
                    return Ok(());
                };
                let self_uuid = self
                    .table
                    .self_uuid()
                    .ok_or_else(|| Error::IllegalParams("engine not configured".into()))?;
                let packet = codec::encode_packet(&codec::Packet {
                    src_uuid: Some(self_uuid),
                    failure_detection: Some(FailureDetection::Ack { incarnation }),
                    ..Default::default()
                })?;
                self.send(&packet, dst)?;
                if let Some(member) = self.table.find_mut(&to) {
                    member.ack_pending = false;
                }
            }
            Action::SendAckTo { addr, incarnation } => {
                let self_uuid = self
                    .table
                    .self_uuid()
                    .ok_or_else(|| Error::IllegalParams("engine not configured".into()))?;
                let packet = codec::encode_packet(&codec::Packet {
                    src_uuid: Some(self_uuid),
                    failure_detection: Some(FailureDetection::Ack { incarnation }),
                    ..Default::default()
                })?;
                self.send(&packet, addr)?;
            }
            Action::ForwardPing {
                target,
                reply_to,
                incarnation,
            } => {
                let Some(dst) = self.table.find(&target).map(|m| m.addr) else {
                    return Ok(());
                };
                let self_uuid = self
                    .table
                    .self_uuid()
                    .ok_or_else(|| Error::IllegalParams("engine not configured".into()))?;
                let (reply_addr, reply_port) = encoder::addr_fields(reply_to);
                let packet = codec::encode_packet(&codec::Packet {
                    src_uuid: Some(self_uuid),
                    failure_detection: Some(FailureDetection::Ping {
                        incarnation,
                        hop_count: 1,
                        forward_to: None,
                        reply_to: Some((reply_addr, reply_port)),
                    }),
                    ..Default::default()
                })?;
                self.send(&packet, dst)?;
            }
        }
        Ok(())
    }

    /// Stops both timers and runs a terminal round sending `QUIT` to
    /// every known member (SPEC_FULL.md §4.7). The engine is expected
    /// to be dropped after this returns.
    pub fn quit(&mut self) -> Result<()> {
        self.quitting = true;
        self.round_timer = None;
        self.wait_ack_timer = None;
        let self_uuid = self
            .table
            .self_uuid()
            .ok_or_else(|| Error::IllegalParams("engine not configured".into()))?;
        let incarnation = self.table.this().map(|m| m.incarnation).unwrap_or(0);
        let addrs: Vec<SocketAddrV4> = self
            .table
            .iter()
            .filter(|m| Some(m.uuid) != self.table.self_uuid())
            .map(|m| m.addr)
            .collect();
        let packet = encoder::build_quit_packet(self_uuid, incarnation)?;
        for dst in addrs {
            self.send(&packet, dst)?;
        }
        Ok(())
    }

    pub fn is_quitting(&self) -> bool {
        self.quitting
    }

    fn send(&mut self, buf: &[u8], dst: SocketAddrV4) -> Result<()> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| Error::IllegalParams("engine not configured".into()))?;
        match transport.send_to(buf, dst) {
            Ok(_) => Ok(()),
            Err(e) => {
                // SPEC_FULL.md §7: OOM/transient send failures are
                // abandoned, not retried here; the ack-timeout sweep
                // re-pings naturally.
                warn!(%dst, error = %e, "send failed, abandoning this packet");
                Ok(())
            }
        }
    }

    /// Drains all currently-available datagrams without blocking.
    pub fn drain_incoming(&mut self) -> Result<()> {
        loop {
            let Some(transport) = self.transport.as_mut() else {
                return Ok(());
            };
            let mut buf = std::mem::take(&mut self.recv_buf);
            let result = transport.recv_from(&mut buf);
            self.recv_buf = buf;
            match result? {
                None => return Ok(()),
                Some((n, src)) => {
                    let bytes = self.recv_buf[..n].to_vec();
                    self.handle_datagram(&bytes, src)?;
                }
            }
        }
    }

    /// Smallest of the two timers' next-fire instants, used to size
    /// the event loop's poll timeout.
    pub fn next_wakeup(&self, now: Instant) -> Duration {
        let candidates = [
            self.round_timer.map(|t| t.next_fire()),
            self.wait_ack_timer.map(|t| t.next_fire()),
            self.heap.next_deadline(),
        ];
        candidates
            .into_iter()
            .flatten()
            .min()
            .map(|deadline| deadline.saturating_duration_since(now))
            .unwrap_or(Duration::from_secs(1))
    }

    /// Polls both timers and runs whichever have come due.
    pub fn drive_timers(&mut self, now: Instant) -> Result<()> {
        if let Some(mut timer) = self.round_timer.take() {
            let fired = timer.poll(now);
            self.round_timer = Some(timer);
            if fired {
                self.round_tick(now)?;
            }
        }
        if let Some(mut timer) = self.wait_ack_timer.take() {
            let fired = timer.poll(now);
            self.wait_ack_timer = Some(timer);
            if fired {
                self.wait_ack_tick(now)?;
            }
        }
        Ok(())
    }
}

impl SwimEngine<MioTransport> {
    /// Drives the engine against a real `mio` UDP socket until
    /// `quit()` is called. Registers the socket for readability once
    /// and loops `poll`→drain incoming→drive timers.
    pub fn run(&mut self) -> Result<()> {
        let mut poll = Poll::new()?;
        {
            let transport = self
                .transport
                .as_mut()
                .ok_or_else(|| Error::IllegalParams("engine not configured".into()))?;
            poll.registry()
                .register(transport.registry_source(), UDP_TOKEN, Interest::READABLE)?;
        }
        let mut events = Events::with_capacity(64);

        while !self.quitting {
            let now = Instant::now();
            let timeout = self.next_wakeup(now);
            poll.poll(&mut events, Some(timeout))?;

            if events.iter().any(|e| e.token() == UDP_TOKEN) {
                self.drain_incoming()?;
            }
            self.drive_timers(Instant::now())?;
        }
        Ok(())
    }
}

fn parse_uri(uri: &str) -> Result<SocketAddrV4> {
    SocketAddrV4::from_str(uri)
        .map_err(|_| Error::IllegalParams(format!("not an IPv4 host:port URI: {uri}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake::FakeTransport;
    use std::time::Duration;

    fn engine_with_self(uri: &str, uuid: Uuid, now: Instant) -> SwimEngine<FakeTransport> {
        let mut engine = SwimEngine::<FakeTransport>::new();
        let addr = parse_uri(uri).unwrap();
        engine
            .cfg(Config::new(uri, uuid), |a| Ok(FakeTransport::new(a)), now)
            .unwrap();
        assert_eq!(engine.table.self_uuid(), Some(uuid));
        let _ = addr;
        engine
    }

    #[test]
    fn cfg_installs_self_as_alive_incarnation_zero() {
        let now = Instant::now();
        let uuid = Uuid::new_v4();
        let engine = engine_with_self("127.0.0.1:9000", uuid, now);
        let me = engine.table.this().unwrap();
        assert_eq!(me.status, Status::Alive);
        assert_eq!(me.incarnation, 0);
    }

    #[test]
    fn add_member_rejects_duplicate_uuid() {
        let now = Instant::now();
        let uuid = Uuid::new_v4();
        let mut engine = engine_with_self("127.0.0.1:9000", uuid, now);
        let peer = Uuid::new_v4();
        engine.add_member("127.0.0.1:9001", peer).unwrap();
        assert!(engine.add_member("127.0.0.1:9002", peer).is_err());
    }

    #[test]
    fn remove_member_rejects_removing_self() {
        let now = Instant::now();
        let uuid = Uuid::new_v4();
        let mut engine = engine_with_self("127.0.0.1:9000", uuid, now);
        assert!(engine.remove_member(uuid).is_err());
    }

    #[test]
    fn round_tick_sends_a_packet_and_registers_a_ping() {
        let now = Instant::now();
        let uuid = Uuid::new_v4();
        let mut engine = engine_with_self("127.0.0.1:9000", uuid, now);
        let peer = Uuid::new_v4();
        engine.add_member("127.0.0.1:9001", peer).unwrap();

        engine.round_tick(now).unwrap();
        let transport = engine.transport.as_ref().unwrap();
        assert_eq!(transport.outbox.len(), 1);
        assert_eq!(engine.heap.len(), 1);
    }

    #[test]
    fn handle_datagram_from_unknown_peer_adds_it_to_table() {
        let now = Instant::now();
        let uuid = Uuid::new_v4();
        let mut engine = engine_with_self("127.0.0.1:9000", uuid, now);
        let peer = Uuid::new_v4();
        let src = SocketAddrV4::from_str("127.0.0.1:9001").unwrap();
        let packet = codec::encode_packet(&codec::Packet {
            src_uuid: Some(peer),
            failure_detection: Some(FailureDetection::Ping {
                incarnation: 0,
                hop_count: 1,
                forward_to: None,
                reply_to: None,
            }),
            ..Default::default()
        })
        .unwrap();
        engine.handle_datagram(&packet, src).unwrap();
        assert!(engine.table.contains(&peer));
        // A ping schedules an ack reply.
        assert_eq!(engine.transport.as_ref().unwrap().outbox.len(), 1);
    }

    #[test]
    fn quit_sends_quit_to_every_other_member() {
        let now = Instant::now();
        let uuid = Uuid::new_v4();
        let mut engine = engine_with_self("127.0.0.1:9000", uuid, now);
        engine.add_member("127.0.0.1:9001", Uuid::new_v4()).unwrap();
        engine.add_member("127.0.0.1:9002", Uuid::new_v4()).unwrap();

        engine.quit().unwrap();
        assert!(engine.is_quitting());
        assert_eq!(engine.transport.as_ref().unwrap().outbox.len(), 2);
    }

    #[test]
    fn drive_timers_runs_round_tick_once_heartbeat_elapses() {
        let now = Instant::now();
        let uuid = Uuid::new_v4();
        let mut engine = engine_with_self("127.0.0.1:9000", uuid, now);
        engine.add_member("127.0.0.1:9001", Uuid::new_v4()).unwrap();

        engine.drive_timers(now + Duration::from_secs(1)).unwrap();
        assert_eq!(engine.transport.as_ref().unwrap().outbox.len(), 1);
    }
}
