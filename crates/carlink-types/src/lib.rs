//! `carlink-types` – shared data model for the car ↔ server link.
//!
//! Pure data: no I/O, no async.  Everything that crosses a crate boundary
//! (sensor frames, actuator commands, connection states, bus events and the
//! error taxonomy) lives here so that the middleware, hardware and runtime
//! crates agree on a single vocabulary.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Size in bytes of an encoded [`ActuatorCommand`] on the wire.
pub const COMMAND_LEN: usize = 4;

/// Size in bytes of the big-endian length prefix that precedes a frame.
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest frame payload a peer may declare (10 MiB).
pub const MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

// ────────────────────────────────────────────────────────────────────────────
// Actuator commands
// ────────────────────────────────────────────────────────────────────────────

/// Rotation direction of one actuator channel.
///
/// The discriminants are the wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Direction {
    Backward = 0,
    Forward = 1,
    Stop = 2,
}

impl Direction {
    /// Wire code of this direction.
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Direction {
    type Error = LinkError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Direction::Backward),
            1 => Ok(Direction::Forward),
            2 => Ok(Direction::Stop),
            other => Err(LinkError::Protocol(format!(
                "invalid direction code {other} (expected 0, 1 or 2)"
            ))),
        }
    }
}

/// Magnitude and direction for a single actuator channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelCommand {
    pub magnitude: u8,
    pub direction: Direction,
}

impl ChannelCommand {
    pub const STOP: ChannelCommand = ChannelCommand {
        magnitude: 0,
        direction: Direction::Stop,
    };

    pub const fn new(magnitude: u8, direction: Direction) -> Self {
        Self {
            magnitude,
            direction,
        }
    }

    /// The equivalent signed scalar: positive forward, negative backward,
    /// zero whenever the channel is stopped, whatever its magnitude byte.
    pub fn signed_speed(&self) -> i16 {
        match self.direction {
            Direction::Forward => i16::from(self.magnitude),
            Direction::Backward => -i16::from(self.magnitude),
            Direction::Stop => 0,
        }
    }

    /// PWM duty cycle in percent (0–100) for this channel.
    pub fn duty_cycle_percent(&self) -> f32 {
        match self.direction {
            Direction::Stop => 0.0,
            _ => f32::from(self.magnitude) / 255.0 * 100.0,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.signed_speed() == 0
    }
}

/// One command for the drive base.
///
/// The four wheels are driven as two groups: `left` (front-left + rear-left)
/// and `right` (front-right + rear-right).  Immutable once constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActuatorCommand {
    pub left: ChannelCommand,
    pub right: ChannelCommand,
}

impl ActuatorCommand {
    /// All channels stopped.  The single safe value used on every failure
    /// path.
    pub const NEUTRAL: ActuatorCommand = ActuatorCommand {
        left: ChannelCommand::STOP,
        right: ChannelCommand::STOP,
    };

    pub const fn new(left: ChannelCommand, right: ChannelCommand) -> Self {
        Self { left, right }
    }

    pub const fn forward(speed: u8) -> Self {
        Self::new(
            ChannelCommand::new(speed, Direction::Forward),
            ChannelCommand::new(speed, Direction::Forward),
        )
    }

    pub const fn backward(speed: u8) -> Self {
        Self::new(
            ChannelCommand::new(speed, Direction::Backward),
            ChannelCommand::new(speed, Direction::Backward),
        )
    }

    /// Turn in place to the left: left group backward, right group forward.
    pub const fn rotate_left(speed: u8) -> Self {
        Self::new(
            ChannelCommand::new(speed, Direction::Backward),
            ChannelCommand::new(speed, Direction::Forward),
        )
    }

    /// Turn in place to the right: left group forward, right group backward.
    pub const fn rotate_right(speed: u8) -> Self {
        Self::new(
            ChannelCommand::new(speed, Direction::Forward),
            ChannelCommand::new(speed, Direction::Backward),
        )
    }

    /// `true` when no channel would move.
    pub fn is_neutral(&self) -> bool {
        self.left.is_stopped() && self.right.is_stopped()
    }

    /// Encode as `[magA, magB, dirA, dirB]`.
    pub fn to_bytes(&self) -> [u8; COMMAND_LEN] {
        [
            self.left.magnitude,
            self.right.magnitude,
            self.left.direction.code(),
            self.right.direction.code(),
        ]
    }

    /// Decode `[magA, magB, dirA, dirB]`.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Protocol`] if either direction code is outside
    /// `{0, 1, 2}`.  Nothing is partially decoded in that case.
    pub fn from_bytes(bytes: [u8; COMMAND_LEN]) -> Result<Self, LinkError> {
        let left_dir = Direction::try_from(bytes[2])?;
        let right_dir = Direction::try_from(bytes[3])?;
        Ok(Self::new(
            ChannelCommand::new(bytes[0], left_dir),
            ChannelCommand::new(bytes[1], right_dir),
        ))
    }
}

impl fmt::Display for ActuatorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.left.magnitude,
            self.right.magnitude,
            self.left.direction.code(),
            self.right.direction.code()
        )
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Sensor frames
// ────────────────────────────────────────────────────────────────────────────

/// A compressed image captured at one instant.
///
/// The payload is opaque to the link (normally JPEG).  Frames are immutable;
/// ownership moves from the producer into the outbound mailbox and is never
/// shared for mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorFrame {
    payload: Vec<u8>,
    captured_at: DateTime<Utc>,
}

impl SensorFrame {
    /// Wrap `payload`, stamping it with the current time.
    pub fn new(payload: Vec<u8>) -> Self {
        Self::with_timestamp(payload, Utc::now())
    }

    pub fn with_timestamp(payload: Vec<u8>, captured_at: DateTime<Utc>) -> Self {
        Self {
            payload,
            captured_at,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Capture time on the agent, or decode time on the server.
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Connection state
// ────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of one peer link.  Mutated only by the connection
/// supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Faulted,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Faulted => "FAULTED",
        };
        f.write_str(s)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Bus events
// ────────────────────────────────────────────────────────────────────────────

/// Envelope for everything published on the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"carlink-middleware::supervisor"`
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Operational events routed over the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    /// The supervisor moved between two states.
    LinkState {
        from: ConnectionState,
        to: ConnectionState,
        peer: Option<String>,
    },
    /// The watchdog forced the neutral command.
    WatchdogTripped { silent_for_ms: u64, consecutive: u32 },
    /// The watchdog has fired repeatedly without a fresh command in between.
    WatchdogAlert { consecutive: u32 },
    /// The decision engine failed and the neutral command was substituted.
    DecisionFault(String),
    ActuationFault { component: String, details: String },
    /// The decision loop handed a command to the link.
    CommandIssued {
        command: ActuatorCommand,
        reasoning: String,
    },
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Error taxonomy shared by every carlink crate.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("link is not connected (state: {0})")]
    NotConnected(ConnectionState),

    #[error("transport fault: {0}")]
    Transport(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("capture failed on {component}: {details}")]
    Capture { component: String, details: String },

    #[error("actuation fault on {component}: {details}")]
    Actuation { component: String, details: String },

    #[error("decision engine error: {0}")]
    Decision(String),

    #[error("decision engine timed out after {0:?}")]
    DecisionTimeout(Duration),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("already started")]
    AlreadyStarted,
}
