//! `carlink-hal` – Hardware Abstraction Layer
//!
//! The car's sensor and drive base seen through two small traits, so the
//! pipelines never know which driver sits underneath.
//!
//! # Modules
//!
//! - [`camera`] – [`Camera`]: produces [`SensorFrame`][carlink_types::SensorFrame]s.
//! - [`actuator`] – [`Actuator`]: applies [`ActuatorCommand`][carlink_types::ActuatorCommand]s
//!   and must always accept the neutral command.
//! - [`sim`] – in-process drivers for tests and for running without hardware.

pub mod actuator;
pub mod camera;
pub mod sim;

pub use actuator::Actuator;
pub use camera::Camera;
pub use sim::{ActuatorProbe, SimActuator, SimCamera};
