//! `carlink-kernel` – Safety
//!
//! Ties actuation to link liveness.  It does not think; it stops the car.
//!
//! # Modules
//!
//! - [`watchdog`] – [`LinkWatchdog`][watchdog::LinkWatchdog]: forces the
//!   neutral command whenever no command has arrived within a bounded
//!   interval, and raises an operational alert when that keeps happening.

pub mod watchdog;

pub use watchdog::{LinkWatchdog, SafeStop, Trip, WatchdogConfig, WatchdogHandle};
