//! [`DecisionLoop`] – server side, newest frame to one command.
//!
//! Each iteration takes the newest queued frame (older ones are discarded),
//! asks the engine for a command under a caller-side timeout and sends
//! exactly one command.  Any engine failure sends the neutral command
//! instead.  Iterations never start more often than once per `interval`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use carlink_middleware::{EventBus, Mailbox, Outbound, Topic};
use carlink_types::{ActuatorCommand, Event, EventPayload, LinkError, SensorFrame};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::decision::{Decision, DecisionContext, DecisionEngine};

const EVENT_SOURCE: &str = "carlink-runtime::decision_loop";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionLoopConfig {
    /// Minimum time between the starts of two iterations.
    pub interval: Duration,
    /// Caller-side bound on one `decide` call.
    pub decision_timeout: Duration,
}

impl Default for DecisionLoopConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            decision_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecisionStats {
    pub decisions: u64,
    /// Engine errors and timeouts, each answered with the neutral command.
    pub faults: u64,
    pub timeouts: u64,
    /// Commands the link accepted.
    pub sent: u64,
    /// Commands refused because the link was down.
    pub unsent: u64,
    /// Queued frames skipped in favour of a newer one.
    pub frames_skipped: u64,
}

#[derive(Default)]
struct Counters {
    decisions: AtomicU64,
    faults: AtomicU64,
    timeouts: AtomicU64,
    sent: AtomicU64,
    unsent: AtomicU64,
    frames_skipped: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct DecisionLoop {
    config: DecisionLoopConfig,
    context: Arc<Mutex<DecisionContext>>,
    counters: Arc<Counters>,
    bus: Option<EventBus>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DecisionLoop {
    pub fn new(config: DecisionLoopConfig, goal: impl Into<String>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            context: Arc::new(Mutex::new(DecisionContext::new(goal))),
            counters: Arc::new(Counters::default()),
            bus: None,
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// Publish issued commands and decision faults on `bus`
    /// ([`Topic::Decisions`]).
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Spawn the loop.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::AlreadyStarted`] if the loop is already running.
    pub fn start(
        &self,
        frames: Arc<Mailbox<SensorFrame>>,
        engine: Arc<dyn DecisionEngine>,
        link: Arc<dyn Outbound<ActuatorCommand>>,
    ) -> Result<(), LinkError> {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(LinkError::AlreadyStarted);
        }
        self.shutdown.send_replace(false);
        let run = LoopTask {
            config: self.config,
            frames,
            engine,
            link,
            context: Arc::clone(&self.context),
            counters: Arc::clone(&self.counters),
            bus: self.bus.clone(),
        };
        info!(
            engine = run.engine.name(),
            interval_ms = self.config.interval.as_millis() as u64,
            timeout_ms = self.config.decision_timeout.as_millis() as u64,
            "starting decision loop"
        );
        *task = Some(tokio::spawn(run.run(self.shutdown.subscribe())));
        Ok(())
    }

    /// Stop the loop.  Its last act is sending the neutral command.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "decision task ended abnormally");
            }
        }
    }

    /// Replace the goal; the control state starts over.
    pub fn set_goal(&self, goal: impl Into<String>) {
        let goal = goal.into();
        info!(goal = %goal, "goal updated");
        self.context.lock().set_goal(goal);
    }

    pub fn context(&self) -> DecisionContext {
        self.context.lock().clone()
    }

    pub fn stats(&self) -> DecisionStats {
        let c = &self.counters;
        DecisionStats {
            decisions: c.decisions.load(Ordering::Relaxed),
            faults: c.faults.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            sent: c.sent.load(Ordering::Relaxed),
            unsent: c.unsent.load(Ordering::Relaxed),
            frames_skipped: c.frames_skipped.load(Ordering::Relaxed),
        }
    }
}

impl Drop for DecisionLoop {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

struct LoopTask {
    config: DecisionLoopConfig,
    frames: Arc<Mailbox<SensorFrame>>,
    engine: Arc<dyn DecisionEngine>,
    link: Arc<dyn Outbound<ActuatorCommand>>,
    context: Arc<Mutex<DecisionContext>>,
    counters: Arc<Counters>,
    bus: Option<EventBus>,
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

impl LoopTask {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let (frame, skipped) = tokio::select! {
                next = self.frames.recv_latest() => match next {
                    Some(next) => next,
                    None => break,
                },
                _ = stopped(&mut shutdown) => break,
            };
            let started = Instant::now();
            if skipped > 0 {
                self.counters
                    .frames_skipped
                    .fetch_add(skipped as u64, Ordering::Relaxed);
                debug!(skipped, "skipped stale frames");
            }

            let decision = tokio::select! {
                decision = self.decide(&frame) => decision,
                _ = stopped(&mut shutdown) => break,
            };
            self.issue(decision, started.elapsed());

            let next_start = started + self.config.interval;
            tokio::select! {
                _ = tokio::time::sleep_until(next_start) => {}
                _ = stopped(&mut shutdown) => break,
            }
        }

        match self.link.send(ActuatorCommand::NEUTRAL) {
            Ok(()) => info!("final neutral command queued"),
            Err(e) => debug!(error = %e, "final neutral command not sent"),
        }
    }

    /// Run the engine; every failure becomes the neutral decision.
    async fn decide(&self, frame: &SensorFrame) -> Decision {
        Counters::bump(&self.counters.decisions);
        let context = self.context.lock().clone();
        let limit = self.config.decision_timeout;
        let outcome = match tokio::time::timeout(limit, self.engine.decide(frame, &context)).await
        {
            Ok(result) => result,
            Err(_) => {
                Counters::bump(&self.counters.timeouts);
                Err(LinkError::DecisionTimeout(limit))
            }
        };
        match outcome {
            Ok(decision) => decision,
            Err(e) => {
                Counters::bump(&self.counters.faults);
                warn!(engine = self.engine.name(), error = %e, "decision failed; sending neutral");
                self.publish(Topic::Decisions, EventPayload::DecisionFault(e.to_string()));
                Decision::neutral(format!("fallback: {e}"))
            }
        }
    }

    fn issue(&self, decision: Decision, elapsed: Duration) {
        match self.link.send(decision.command) {
            Ok(()) => {
                Counters::bump(&self.counters.sent);
                info!(
                    command = %decision.command,
                    inference_ms = elapsed.as_millis() as u64,
                    reasoning = %decision.reasoning,
                    "command issued"
                );
                self.context.lock().record(&decision);
                self.publish(
                    Topic::Decisions,
                    EventPayload::CommandIssued {
                        command: decision.command,
                        reasoning: decision.reasoning,
                    },
                );
            }
            Err(e) => {
                Counters::bump(&self.counters.unsent);
                debug!(command = %decision.command, error = %e, "command not sent");
            }
        }
    }

    fn publish(&self, topic: Topic, payload: EventPayload) {
        if let Some(bus) = &self.bus {
            let _ = bus.publish_to(topic, Event::new(EVENT_SOURCE, payload));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use carlink_types::ConnectionState;

    struct Scripted {
        reply: Result<ActuatorCommand, String>,
        delay: Duration,
        calls: AtomicU64,
    }

    impl Scripted {
        fn ok(command: ActuatorCommand) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(command),
                delay: Duration::ZERO,
                calls: AtomicU64::new(0),
            })
        }

        fn failing(msg: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Err(msg.to_string()),
                delay: Duration::ZERO,
                calls: AtomicU64::new(0),
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(ActuatorCommand::forward(90)),
                delay,
                calls: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl DecisionEngine for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn decide(
            &self,
            _frame: &SensorFrame,
            _context: &DecisionContext,
        ) -> Result<Decision, LinkError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match &self.reply {
                Ok(cmd) => Ok(Decision::new(*cmd, "scripted")),
                Err(msg) => Err(LinkError::Decision(msg.clone())),
            }
        }
    }

    #[derive(Default)]
    struct CapturingLink {
        sent: parking_lot::Mutex<Vec<ActuatorCommand>>,
    }

    impl Outbound<ActuatorCommand> for CapturingLink {
        fn send(&self, command: ActuatorCommand) -> Result<(), LinkError> {
            self.sent.lock().push(command);
            Ok(())
        }

        fn state(&self) -> ConnectionState {
            ConnectionState::Connected
        }
    }

    fn config(interval_ms: u64, timeout_ms: u64) -> DecisionLoopConfig {
        DecisionLoopConfig {
            interval: Duration::from_millis(interval_ms),
            decision_timeout: Duration::from_millis(timeout_ms),
        }
    }

    async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        for _ in 0..300 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting until {what}");
    }

    #[tokio::test]
    async fn one_command_per_frame() -> Result<(), LinkError> {
        let frames = Arc::new(Mailbox::new(2));
        let link = Arc::new(CapturingLink::default());
        let dl = DecisionLoop::new(config(10, 500), "go");
        dl.start(frames.clone(), Scripted::ok(ActuatorCommand::forward(200)), link.clone())?;

        frames.push(SensorFrame::new(vec![1]));
        wait_until("first command", || link.sent.lock().len() == 1).await;
        frames.push(SensorFrame::new(vec![2]));
        wait_until("second command", || link.sent.lock().len() == 2).await;

        assert!(link.sent.lock().iter().all(|c| *c == ActuatorCommand::forward(200)));
        assert_eq!(dl.context().steps_taken, 2);
        assert_eq!(dl.context().last_command, Some(ActuatorCommand::forward(200)));

        dl.stop().await;
        assert_eq!(link.sent.lock().last(), Some(&ActuatorCommand::NEUTRAL));
        Ok(())
    }

    #[tokio::test]
    async fn engine_error_sends_neutral() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut decisions = bus.subscribe_to(Topic::Decisions);
        let frames = Arc::new(Mailbox::slot());
        let link = Arc::new(CapturingLink::default());
        let dl = DecisionLoop::new(config(10, 500), "go").with_bus(bus.clone());
        dl.start(frames.clone(), Scripted::failing("unparseable reply"), link.clone())?;

        frames.push(SensorFrame::new(vec![0xFF, 0xD8]));
        wait_until("fallback sent", || !link.sent.lock().is_empty()).await;
        assert_eq!(link.sent.lock()[0], ActuatorCommand::NEUTRAL);

        let fault = tokio::time::timeout(Duration::from_secs(2), decisions.recv()).await??;
        assert!(matches!(fault.payload, EventPayload::DecisionFault(ref m) if m.contains("unparseable")));
        let issued = tokio::time::timeout(Duration::from_secs(2), decisions.recv()).await??;
        assert!(matches!(issued.payload, EventPayload::CommandIssued { command, .. } if command.is_neutral()));
        assert_eq!(dl.stats().faults, 1);

        dl.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn slow_engine_times_out_to_neutral() -> Result<(), LinkError> {
        let frames = Arc::new(Mailbox::slot());
        let link = Arc::new(CapturingLink::default());
        let dl = DecisionLoop::new(config(10, 50), "go");
        dl.start(frames.clone(), Scripted::slow(Duration::from_secs(5)), link.clone())?;

        let pushed = std::time::Instant::now();
        frames.push(SensorFrame::new(vec![3]));
        wait_until("fallback sent", || !link.sent.lock().is_empty()).await;
        assert!(pushed.elapsed() < Duration::from_secs(1));
        assert_eq!(link.sent.lock()[0], ActuatorCommand::NEUTRAL);
        assert_eq!(dl.stats().timeouts, 1);

        dl.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn newest_frame_wins_and_pacing_holds() -> Result<(), LinkError> {
        let frames = Arc::new(Mailbox::new(4));
        let link = Arc::new(CapturingLink::default());
        let engine = Scripted::ok(ActuatorCommand::rotate_left(100));
        let dl = DecisionLoop::new(config(200, 500), "go");
        for n in 0..4u8 {
            frames.push(SensorFrame::new(vec![n]));
        }
        dl.start(frames.clone(), engine.clone(), link.clone())?;

        wait_until("first decision", || engine.calls.load(Ordering::Relaxed) == 1).await;
        assert_eq!(dl.stats().frames_skipped, 3);

        // Frames keep arriving but the 200 ms pacing caps the call rate.
        for n in 0..10u8 {
            frames.push(SensorFrame::new(vec![n]));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let calls = engine.calls.load(Ordering::Relaxed);
        assert!(calls <= 2, "engine called {calls} times in ~200ms");

        dl.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn set_goal_resets_context() -> Result<(), LinkError> {
        let frames = Arc::new(Mailbox::slot());
        let link = Arc::new(CapturingLink::default());
        let dl = DecisionLoop::new(config(10, 500), "explore");
        dl.start(frames.clone(), Scripted::ok(ActuatorCommand::forward(10)), link.clone())?;
        frames.push(SensorFrame::new(vec![1]));
        wait_until("one step", || dl.context().steps_taken == 1).await;

        dl.set_goal("find the red ball");
        let ctx = dl.context();
        assert_eq!(ctx.goal, "find the red ball");
        assert_eq!(ctx.steps_taken, 0);
        dl.stop().await;
        Ok(())
    }
}
