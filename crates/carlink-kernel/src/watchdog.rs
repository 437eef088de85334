//! [`LinkWatchdog`] – stop on silence.
//!
//! The command pipeline calls [`WatchdogHandle::feed`] for every valid
//! command it applies, and the connection layer calls
//! [`WatchdogHandle::reset`] when a link is established.  A periodic task
//! compares the last feed against the timeout; when it is exceeded the
//! registered [`SafeStop`] is told to force the neutral command.
//!
//! The watchdog re-arms after every trip, so a link that stays silent trips
//! it once per timeout window.  After `alert_after` consecutive trips the
//! silence is reported as an operational alert (an `error!` line plus a
//! [`Topic::SystemAlerts`] event), rate-limited to one per alert window.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use carlink_middleware::{EventBus, Topic};
use carlink_types::{Event, EventPayload, LinkError};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

const EVENT_SOURCE: &str = "carlink-kernel::watchdog";

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogConfig {
    /// Longest tolerated silence.
    pub timeout: Duration,
    /// How often the deadline is checked.
    pub check_interval: Duration,
    /// Consecutive trips before an operational alert is raised.
    pub alert_after: u32,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(200),
            check_interval: Duration::from_millis(50),
            alert_after: 5,
        }
    }
}

/// One watchdog firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trip {
    /// Time since the last feed or reset.
    pub silent_for: Duration,
    /// Trips since the last feed or reset, including this one.
    pub consecutive: u32,
}

/// Whatever owns the actuator.  Only ever asked for the neutral command.
pub trait SafeStop: Send + Sync + 'static {
    fn force_neutral(&self, trip: &Trip);
}

struct Deadline {
    last_fed: Instant,
    armed_at: Instant,
    consecutive: u32,
}

impl Deadline {
    fn new(now: Instant) -> Self {
        Self {
            last_fed: now,
            armed_at: now,
            consecutive: 0,
        }
    }

    fn feed(&mut self, now: Instant) {
        *self = Self::new(now);
    }
}

/// Cheap, cloneable handle for feeding the watchdog.
#[derive(Clone)]
pub struct WatchdogHandle {
    deadline: Arc<Mutex<Deadline>>,
}

impl WatchdogHandle {
    /// A valid command was applied.
    pub fn feed(&self) {
        self.deadline.lock().feed(Instant::now());
    }

    /// A fresh connection was established; grant it one full window.
    pub fn reset(&self) {
        self.deadline.lock().feed(Instant::now());
    }

    /// Time since the last feed or reset.
    pub fn silent_for(&self) -> Duration {
        self.deadline.lock().last_fed.elapsed()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// LinkWatchdog
// ────────────────────────────────────────────────────────────────────────────

/// Agent-side liveness watchdog with an explicit `start` / `stop` lifecycle.
pub struct LinkWatchdog {
    config: WatchdogConfig,
    deadline: Arc<Mutex<Deadline>>,
    trips: Arc<AtomicU64>,
    bus: Option<EventBus>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LinkWatchdog {
    pub fn new(config: WatchdogConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            deadline: Arc::new(Mutex::new(Deadline::new(Instant::now()))),
            trips: Arc::new(AtomicU64::new(0)),
            bus: None,
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// Publish trips and alerts on `bus` ([`Topic::SystemAlerts`]).
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    pub fn handle(&self) -> WatchdogHandle {
        WatchdogHandle {
            deadline: Arc::clone(&self.deadline),
        }
    }

    /// Total trips since construction.
    pub fn trips(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }

    /// Evaluate the deadline at `now`.  Returns the trip if the timeout has
    /// been exceeded, and re-arms the deadline.
    pub fn check_at(&self, now: Instant) -> Option<Trip> {
        check_deadline(&self.deadline, self.config.timeout, now)
    }

    /// Spawn the periodic check task.
    ///
    /// The deadline is reset on start, so the first trip can happen no
    /// earlier than one full timeout later.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::AlreadyStarted`] if the task is already running.
    pub fn start(&self, stop: Arc<dyn SafeStop>) -> Result<(), LinkError> {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(LinkError::AlreadyStarted);
        }
        self.shutdown.send_replace(false);
        self.handle().reset();

        let runner = WatchdogTask {
            config: self.config,
            deadline: Arc::clone(&self.deadline),
            trips: Arc::clone(&self.trips),
            bus: self.bus.clone(),
            alerts: alert_limiter(&self.config),
            stop,
        };
        let shutdown = self.shutdown.subscribe();
        *task = Some(tokio::spawn(runner.run(shutdown)));
        debug!(
            timeout_ms = self.config.timeout.as_millis() as u64,
            check_interval_ms = self.config.check_interval.as_millis() as u64,
            "watchdog started"
        );
        Ok(())
    }

    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "watchdog task ended abnormally");
            }
        }
    }
}

impl Drop for LinkWatchdog {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

fn check_deadline(deadline: &Mutex<Deadline>, timeout: Duration, now: Instant) -> Option<Trip> {
    let mut d = deadline.lock();
    if now.saturating_duration_since(d.armed_at) <= timeout {
        return None;
    }
    d.armed_at = now;
    d.consecutive = d.consecutive.saturating_add(1);
    Some(Trip {
        silent_for: now.saturating_duration_since(d.last_fed),
        consecutive: d.consecutive,
    })
}

/// At most one alert per `timeout * alert_after` window.
fn alert_limiter(config: &WatchdogConfig) -> DefaultDirectRateLimiter {
    let window = config.timeout.saturating_mul(config.alert_after.max(1));
    let quota = Quota::with_period(window)
        .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
        .allow_burst(NonZeroU32::MIN);
    RateLimiter::direct(quota)
}

struct WatchdogTask {
    config: WatchdogConfig,
    deadline: Arc<Mutex<Deadline>>,
    trips: Arc<AtomicU64>,
    bus: Option<EventBus>,
    alerts: DefaultDirectRateLimiter,
    stop: Arc<dyn SafeStop>,
}

impl WatchdogTask {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(trip) = check_deadline(&self.deadline, self.config.timeout, Instant::now()) {
                        self.on_trip(trip);
                    }
                }
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
            }
        }
        debug!("watchdog stopped");
    }

    fn on_trip(&self, trip: Trip) {
        self.trips.fetch_add(1, Ordering::Relaxed);
        let silent_for_ms = trip.silent_for.as_millis() as u64;
        warn!(
            silent_for_ms,
            consecutive = trip.consecutive,
            "no command within watchdog timeout; forcing neutral"
        );
        self.stop.force_neutral(&trip);
        self.publish(EventPayload::WatchdogTripped {
            silent_for_ms,
            consecutive: trip.consecutive,
        });

        if trip.consecutive >= self.config.alert_after && self.alerts.check().is_ok() {
            error!(
                silent_for_ms,
                consecutive = trip.consecutive,
                "sustained link or decision-loop failure: watchdog keeps firing"
            );
            self.publish(EventPayload::WatchdogAlert {
                consecutive: trip.consecutive,
            });
        }
    }

    fn publish(&self, payload: EventPayload) {
        if let Some(bus) = &self.bus {
            let _ = bus.publish_to(Topic::SystemAlerts, Event::new(EVENT_SOURCE, payload));
        }
    }
}
