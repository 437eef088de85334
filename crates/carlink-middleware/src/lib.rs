//! `carlink-middleware` – The Link
//!
//! Moves sensor frames and actuator commands between the car and the decision
//! server without caring what they mean.
//!
//! # Modules
//!
//! - [`codec`] – length-prefixed frame and fixed-width command encoding.
//! - [`mailbox`] – bounded latest-wins hand-off between tasks.
//! - [`backoff`] – capped exponential reconnect delays.
//! - [`supervisor`] – [`ConnectionSupervisor`]: owns the transport, runs the
//!   CONNECTING / CONNECTED / FAULTED state machine and reconnects.
//! - [`bus`] – topic-based broadcast bus for operational events.

pub mod backoff;
pub mod bus;
pub mod codec;
pub mod mailbox;
pub mod supervisor;

pub use backoff::{Backoff, BackoffConfig};
pub use bus::{EventBus, Topic, TopicReceiver};
pub use codec::{CodecLimits, DecodeError, WireMessage};
pub use mailbox::Mailbox;
pub use supervisor::{
    ConnectionSupervisor, Endpoint, InboundSink, LinkStatsSnapshot, Outbound, SupervisorConfig,
};
