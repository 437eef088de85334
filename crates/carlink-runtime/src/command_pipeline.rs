//! [`CommandPipeline`] – agent side, link to wheels.
//!
//! Registered as the supervisor's [`InboundSink`]: every decoded command
//! feeds the watchdog and lands in a single-slot mailbox, and a dedicated
//! task applies the newest one to the actuator.  The watchdog reaches the
//! same actuator through [`SafeStop`] and only ever writes the neutral
//! command.
//!
//! Losing the link stops the car at once: a `FAULTED` or `DISCONNECTED`
//! transition drops any pending command and applies neutral without
//! waiting for the watchdog.  Moving commands are ignored until the link is
//! `CONNECTED` again.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use carlink_hal::Actuator;
use carlink_kernel::{SafeStop, Trip, WatchdogHandle};
use carlink_middleware::{EventBus, InboundSink, Mailbox, Topic};
use carlink_types::{ActuatorCommand, ConnectionState, Event, EventPayload, LinkError};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_SOURCE: &str = "carlink-runtime::command_pipeline";

/// Counters reported by [`CommandPipeline::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandStats {
    pub received: u64,
    pub applied: u64,
    pub superseded: u64,
    pub actuation_faults: u64,
    pub forced_neutral: u64,
    /// Neutral commands applied because the link went down.
    pub link_loss_stops: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    applied: AtomicU64,
    superseded: AtomicU64,
    actuation_faults: AtomicU64,
    forced_neutral: AtomicU64,
    link_loss_stops: AtomicU64,
}

pub struct CommandPipeline {
    actuator: Mutex<Box<dyn Actuator>>,
    pending: Mailbox<ActuatorCommand>,
    watchdog: WatchdogHandle,
    link_lost: AtomicBool,
    counters: Counters,
    bus: Option<EventBus>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CommandPipeline {
    pub fn new(actuator: Box<dyn Actuator>, watchdog: WatchdogHandle) -> Self {
        Self {
            actuator: Mutex::new(actuator),
            pending: Mailbox::slot(),
            watchdog,
            link_lost: AtomicBool::new(false),
            counters: Counters::default(),
            bus: None,
            task: Mutex::new(None),
        }
    }

    /// Publish actuation faults on `bus` ([`Topic::SystemAlerts`]).
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Spawn the actuation task.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::AlreadyStarted`] if the task is already running.
    pub fn start(self: &Arc<Self>) -> Result<(), LinkError> {
        let mut task = self.task.lock();
        if task.is_some() {
            return Err(LinkError::AlreadyStarted);
        }
        let pipeline = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            while let Some(command) = pipeline.pending.recv().await {
                pipeline.apply(&command);
            }
            debug!("actuation task drained");
        }));
        Ok(())
    }

    /// Stop accepting commands, wait for the actuation task, then apply a
    /// final neutral command.
    pub async fn stop(&self) {
        self.pending.close();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "actuation task ended abnormally");
            }
        }
        self.actuator.lock().emergency_stop();
        info!("drive base stopped");
    }

    pub fn stats(&self) -> CommandStats {
        let c = &self.counters;
        CommandStats {
            received: c.received.load(Ordering::Relaxed),
            applied: c.applied.load(Ordering::Relaxed),
            superseded: c.superseded.load(Ordering::Relaxed),
            actuation_faults: c.actuation_faults.load(Ordering::Relaxed),
            forced_neutral: c.forced_neutral.load(Ordering::Relaxed),
            link_loss_stops: c.link_loss_stops.load(Ordering::Relaxed),
        }
    }

    fn apply(&self, command: &ActuatorCommand) {
        let result = {
            let mut actuator = self.actuator.lock();
            // Checked under the actuator lock so it orders against stop_on_link_loss.
            if self.link_lost.load(Ordering::SeqCst) && !command.is_neutral() {
                self.counters.superseded.fetch_add(1, Ordering::Relaxed);
                debug!(command = %command, "link down; discarding stale command");
                return;
            }
            actuator.apply(command)
        };
        match result {
            Ok(()) => {
                self.counters.applied.fetch_add(1, Ordering::Relaxed);
                debug!(command = %command, "command applied");
            }
            Err(e) => {
                self.counters.actuation_faults.fetch_add(1, Ordering::Relaxed);
                warn!(command = %command, error = %e, "actuation fault; continuing");
                if let Some(bus) = &self.bus {
                    let (component, details) = match e {
                        LinkError::Actuation { component, details } => (component, details),
                        other => ("actuator".to_string(), other.to_string()),
                    };
                    let _ = bus.publish_to(
                        Topic::SystemAlerts,
                        Event::new(EVENT_SOURCE, EventPayload::ActuationFault { component, details }),
                    );
                }
            }
        }
    }
}

impl InboundSink<ActuatorCommand> for CommandPipeline {
    fn on_message(&self, command: ActuatorCommand) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        self.watchdog.feed();
        if self.pending.push(command).is_some() {
            self.counters.superseded.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn on_state(&self, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {
                self.link_lost.store(false, Ordering::SeqCst);
                self.watchdog.reset();
            }
            ConnectionState::Faulted | ConnectionState::Disconnected => self.stop_on_link_loss(state),
            ConnectionState::Connecting => {}
        }
    }
}

impl CommandPipeline {
    fn stop_on_link_loss(&self, state: ConnectionState) {
        if self.link_lost.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut actuator = self.actuator.lock();
        let dropped = self.pending.clear();
        actuator.emergency_stop();
        self.counters.link_loss_stops.fetch_add(1, Ordering::Relaxed);
        info!(state = %state, dropped_pending = dropped, "link lost; drive base stopped");
    }
}

impl SafeStop for CommandPipeline {
    fn force_neutral(&self, trip: &Trip) {
        self.counters.forced_neutral.fetch_add(1, Ordering::Relaxed);
        debug!(consecutive = trip.consecutive, "watchdog forcing neutral");
        self.actuator.lock().emergency_stop();
    }
}
