//! Tunable constants and the configuration surface for the SWIM engine.

use std::time::Duration;
use uuid::Uuid;

/// How often to send membership messages and pings. Nothing special in
/// this concrete default value — it's the reference implementation's.
pub const HEARTBEAT_RATE_DEFAULT: Duration = Duration::from_secs(1);

/// If a ping was sent, it is considered lost after this much time
/// without an ack.
pub const ACK_TIMEOUT_DEFAULT: Duration = Duration::from_secs(30);

/// If an Alive member has not answered this many consecutive pings, it
/// is moved to Suspected and indirect pings are issued on its behalf.
pub const NO_ACKS_TO_SUSPECT: u32 = 2;

/// If a Suspected member has not answered this many consecutive pings
/// (counted from when it became Alive, not when it became Suspected),
/// it is declared Dead.
pub const NO_ACKS_TO_DEAD: u32 = 3;

/// Once Dead, how many further missed pings before GC removes the
/// member entirely (subject to `status_ttl` also reaching zero).
pub const NO_ACKS_TO_GC: u32 = 2;

/// How many indirect ping proxies to use once a member is Suspected.
pub const INDIRECT_PING_COUNT: usize = 2;

/// Largest payload a member may attach to its descriptor; chosen so a
/// full packet (headers + one payload) still fits one UDP datagram.
pub const MAX_PAYLOAD_SIZE: usize = 512;

/// Whether dead members still being missed are eventually garbage
/// collected from the member table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcMode {
    /// Dead members are removed after `NO_ACKS_TO_GC` further missed
    /// pings and `status_ttl` decay (see SPEC_FULL.md §10.2).
    On,
    /// Dead members are kept in the table indefinitely.
    Off,
}

impl Default for GcMode {
    fn default() -> Self {
        GcMode::On
    }
}

/// Engine configuration, set via [`crate::engine::SwimEngine::cfg`].
///
/// Re-invoking `cfg` always applies every field passed in — there is no
/// `GcMode::Default` that silently preserves the prior mode; the caller
/// already has the previous `Config` if it wants to carry a field over.
#[derive(Debug, Clone)]
pub struct Config {
    /// Local bind URI, e.g. `"127.0.0.1:7946"`. Must resolve to an
    /// IPv4, non-`INADDR_ANY` address.
    pub uri: String,

    /// This instance's UUID. Required on the first `cfg()` call.
    pub uuid: Uuid,

    /// Round scheduler period.
    pub heartbeat: Duration,

    /// Ping-to-ack timeout; indirect pings multiply this by the hop
    /// count.
    pub ack_timeout: Duration,

    /// Whether Dead members are eventually garbage collected.
    pub gc_mode: GcMode,
}

impl Config {
    /// Build a config for a fresh instance at the given URI and UUID,
    /// with every timing constant at its reference default.
    pub fn new(uri: impl Into<String>, uuid: Uuid) -> Self {
        Self {
            uri: uri.into(),
            uuid,
            heartbeat: HEARTBEAT_RATE_DEFAULT,
            ack_timeout: ACK_TIMEOUT_DEFAULT,
            gc_mode: GcMode::On,
        }
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    pub fn with_gc_mode(mut self, gc_mode: GcMode) -> Self {
        self.gc_mode = gc_mode;
        self
    }
}
