//! Generic `Actuator` trait for the drive base.
//!
//! The four wheels are driven as two groups (front-left + rear-left and
//! front-right + rear-right), so one [`ActuatorCommand`] carries exactly two
//! channels.

use carlink_types::{ActuatorCommand, LinkError};
use tracing::error;

/// The car's drive base.
pub trait Actuator: Send {
    /// Stable identifier, e.g. `"drive_base"`.
    fn id(&self) -> &str;

    /// Apply `command` to both wheel groups.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Actuation`] if the command cannot be applied.
    /// Implementations must still accept [`ActuatorCommand::NEUTRAL`] while
    /// faulted, as a best-effort stop.
    fn apply(&mut self, command: &ActuatorCommand) -> Result<(), LinkError>;

    /// Best-effort stop.  Never fails; a driver error is logged.
    fn emergency_stop(&mut self) {
        if let Err(e) = self.apply(&ActuatorCommand::NEUTRAL) {
            error!(actuator = %self.id(), error = %e, "emergency stop failed");
        }
    }
}
