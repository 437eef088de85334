//! In-process simulation drivers for CI/CD testing without physical hardware.
//!
//! [`SimCamera`] produces small synthetic JPEG-framed payloads and
//! [`SimActuator`] records every command it is given.  The actuator shares
//! its history through an [`ActuatorProbe`], so a test can hand the driver
//! to a pipeline and still observe what reached the wheels.
//!
//! # Example
//!
//! ```rust
//! use carlink_hal::{Actuator, SimActuator};
//! use carlink_types::ActuatorCommand;
//!
//! let (mut drive, probe) = SimActuator::new("drive_base");
//! drive.apply(&ActuatorCommand::forward(200)).unwrap();
//! assert_eq!(probe.last(), Some(ActuatorCommand::forward(200)));
//! ```

use std::sync::Arc;

use carlink_types::{ActuatorCommand, LinkError, SensorFrame};
use parking_lot::Mutex;
use tracing::debug;

use crate::actuator::Actuator;
use crate::camera::Camera;

// ────────────────────────────────────────────────────────────────────────────
// Stub camera
// ────────────────────────────────────────────────────────────────────────────

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// A simulated camera.  Each frame is `SOI | frame counter (u64 BE) | filler
/// | EOI`, which is enough for byte-level tests to tell frames apart.
pub struct SimCamera {
    id: String,
    frame_len: usize,
    captured: u64,
}

impl SimCamera {
    /// Create a simulated camera producing 64-byte frames.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            frame_len: 64,
            captured: 0,
        }
    }

    /// Total frame size in bytes (minimum 12: markers plus the counter).
    pub fn with_frame_len(mut self, frame_len: usize) -> Self {
        self.frame_len = frame_len.max(12);
        self
    }

    pub fn captured(&self) -> u64 {
        self.captured
    }

    /// Read the counter back out of a frame produced by a `SimCamera`.
    pub fn frame_number(frame: &SensorFrame) -> Option<u64> {
        let counter = frame.payload().get(2..10)?;
        Some(u64::from_be_bytes(counter.try_into().ok()?))
    }
}

impl Camera for SimCamera {
    fn id(&self) -> &str {
        &self.id
    }

    fn capture(&mut self) -> Result<SensorFrame, LinkError> {
        self.captured += 1;
        let mut payload = Vec::with_capacity(self.frame_len);
        payload.extend_from_slice(&JPEG_SOI);
        payload.extend_from_slice(&self.captured.to_be_bytes());
        payload.resize(self.frame_len - JPEG_EOI.len(), 0x80);
        payload.extend_from_slice(&JPEG_EOI);
        Ok(SensorFrame::new(payload))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Stub actuator
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct ProbeState {
    applied: Vec<ActuatorCommand>,
    faulted: bool,
    rejected: u64,
}

/// Shared view into a [`SimActuator`].  Cheap to clone.
#[derive(Clone, Default)]
pub struct ActuatorProbe {
    state: Arc<Mutex<ProbeState>>,
}

impl ActuatorProbe {
    /// Every command that reached the wheels, oldest first.
    pub fn applied(&self) -> Vec<ActuatorCommand> {
        self.state.lock().applied.clone()
    }

    pub fn last(&self) -> Option<ActuatorCommand> {
        self.state.lock().applied.last().copied()
    }

    pub fn count(&self) -> usize {
        self.state.lock().applied.len()
    }

    /// How many applied commands were the neutral command.
    pub fn neutral_count(&self) -> usize {
        self.state
            .lock()
            .applied
            .iter()
            .filter(|c| **c == ActuatorCommand::NEUTRAL)
            .count()
    }

    /// While faulted, every non-neutral command is rejected.  Neutral is
    /// always accepted.
    pub fn set_faulted(&self, faulted: bool) {
        self.state.lock().faulted = faulted;
    }

    /// Commands rejected because of an injected fault.
    pub fn rejected(&self) -> u64 {
        self.state.lock().rejected
    }

    pub fn clear(&self) {
        self.state.lock().applied.clear();
    }
}

/// A simulated drive base that records every applied command.
pub struct SimActuator {
    id: String,
    probe: ActuatorProbe,
}

impl SimActuator {
    /// Create a simulated drive base and the probe that observes it.
    pub fn new(id: impl Into<String>) -> (Self, ActuatorProbe) {
        let probe = ActuatorProbe::default();
        (
            Self {
                id: id.into(),
                probe: probe.clone(),
            },
            probe,
        )
    }
}

impl Actuator for SimActuator {
    fn id(&self) -> &str {
        &self.id
    }

    fn apply(&mut self, command: &ActuatorCommand) -> Result<(), LinkError> {
        let mut state = self.probe.state.lock();
        if state.faulted && *command != ActuatorCommand::NEUTRAL {
            state.rejected += 1;
            return Err(LinkError::Actuation {
                component: self.id.clone(),
                details: "injected fault".to_string(),
            });
        }
        debug!(
            actuator = %self.id,
            left_duty = command.left.duty_cycle_percent(),
            right_duty = command.right.duty_cycle_percent(),
            "[SIM] applying {command}"
        );
        state.applied.push(*command);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_camera_frames_are_jpeg_framed_and_numbered() {
        let mut cam = SimCamera::new("front");
        let first = cam.capture().unwrap();
        let second = cam.capture().unwrap();

        assert_eq!(first.len(), 64);
        assert_eq!(&first.payload()[..2], &JPEG_SOI);
        assert_eq!(&first.payload()[62..], &JPEG_EOI);
        assert_eq!(SimCamera::frame_number(&first), Some(1));
        assert_eq!(SimCamera::frame_number(&second), Some(2));
        assert_eq!(cam.captured(), 2);
    }

    #[test]
    fn sim_camera_frame_len_has_a_floor() {
        let mut cam = SimCamera::new("tiny").with_frame_len(3);
        assert_eq!(cam.capture().unwrap().len(), 12);
    }

    #[test]
    fn probe_sees_applied_commands() {
        let (mut drive, probe) = SimActuator::new("drive_base");
        drive.apply(&ActuatorCommand::forward(200)).unwrap();
        drive.apply(&ActuatorCommand::rotate_left(120)).unwrap();
        drive.emergency_stop();

        assert_eq!(
            probe.applied(),
            vec![
                ActuatorCommand::forward(200),
                ActuatorCommand::rotate_left(120),
                ActuatorCommand::NEUTRAL,
            ]
        );
        assert_eq!(probe.neutral_count(), 1);
    }

    #[test]
    fn faulted_actuator_still_accepts_neutral() {
        let (mut drive, probe) = SimActuator::new("drive_base");
        probe.set_faulted(true);

        assert!(matches!(
            drive.apply(&ActuatorCommand::forward(90)),
            Err(LinkError::Actuation { .. })
        ));
        assert!(drive.apply(&ActuatorCommand::NEUTRAL).is_ok());
        assert_eq!(probe.rejected(), 1);
        assert_eq!(probe.applied(), vec![ActuatorCommand::NEUTRAL]);

        probe.set_faulted(false);
        assert!(drive.apply(&ActuatorCommand::forward(90)).is_ok());
    }
}
