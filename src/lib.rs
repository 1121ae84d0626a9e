//! # swim-membership
//!
//! A single-threaded, event-loop-driven implementation of the SWIM
//! (Scalable Weakly-consistent Infection-style process group
//! Membership) protocol: failure detection via direct and indirect
//! pings, anti-entropy gossip of the member table, and TTL-decaying
//! dissemination of state changes.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::time::Instant;
//! use swim_membership::config::Config;
//! use swim_membership::engine::SwimEngine;
//! use swim_membership::transport::MioTransport;
//! use uuid::Uuid;
//!
//! # fn main() -> swim_membership::error::Result<()> {
//! let mut engine = SwimEngine::<MioTransport>::new();
//! engine.cfg(
//!     Config::new("127.0.0.1:7946", Uuid::new_v4()),
//!     MioTransport::bind,
//!     Instant::now(),
//! )?;
//! engine.run()
//! # }
//! ```
//!
//! ## Module map
//!
//! - [`member`] / [`table`]: the member table and its unit of record.
//! - [`heap`]: the wait-ack deadline heap.
//! - [`round`]: the Fisher–Yates round scheduler.
//! - [`detector`]: the Alive→Suspected→Dead→GC state machine.
//! - [`dissemination`]: the TTL-decaying gossip queue.
//! - [`codec`] / [`encoder`] / [`ingest`]: wire format, packet
//!   assembly, and packet dispatch.
//! - [`transport`] / [`timer`]: UDP I/O and periodic timers.
//! - [`engine`]: ties every component together into a running
//!   instance.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]
#![allow(clippy::type_complexity)]

pub mod codec;
pub mod config;
pub mod detector;
pub mod dissemination;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod heap;
pub mod ingest;
pub mod member;
pub mod round;
pub mod table;
pub mod telemetry;
pub mod timer;
pub mod transport;

pub use config::Config;
pub use engine::SwimEngine;
pub use error::{Error, Result};
