//! [`FramePipeline`] – agent side, camera to link.
//!
//! One task ticks at the target cadence, captures a frame and offers it to
//! the link.  Frames offered while the link is down are dropped on the spot;
//! frames offered faster than the link drains them overwrite the single
//! outbound slot.  Nothing here waits on the peer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use carlink_hal::Camera;
use carlink_middleware::Outbound;
use carlink_types::{LinkError, SensorFrame};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const FPS_LOG_EVERY: u64 = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub captured: u64,
    /// Handed to a connected link.
    pub sent: u64,
    /// Discarded because the link was not connected.
    pub dropped: u64,
    pub capture_errors: u64,
}

#[derive(Default)]
struct Counters {
    captured: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
    capture_errors: AtomicU64,
}

pub struct FramePipeline {
    interval: Duration,
    counters: Arc<Counters>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FramePipeline {
    /// A pipeline ticking every `interval`.
    pub fn new(interval: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            interval,
            counters: Arc::new(Counters::default()),
            shutdown,
            task: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Spawn the capture task.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::AlreadyStarted`] if the task is already running.
    pub fn start(
        &self,
        camera: Box<dyn Camera>,
        link: Arc<dyn Outbound<SensorFrame>>,
    ) -> Result<(), LinkError> {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(LinkError::AlreadyStarted);
        }
        self.shutdown.send_replace(false);
        let run = CaptureTask {
            camera,
            link,
            interval: self.interval,
            counters: Arc::clone(&self.counters),
            shutdown: self.shutdown.subscribe(),
        };
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "starting frame pipeline"
        );
        *task = Some(tokio::spawn(run.run()));
        Ok(())
    }

    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "frame task ended abnormally");
            }
        }
    }

    pub fn stats(&self) -> FrameStats {
        let c = &self.counters;
        FrameStats {
            captured: c.captured.load(Ordering::Relaxed),
            sent: c.sent.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            capture_errors: c.capture_errors.load(Ordering::Relaxed),
        }
    }
}

impl Drop for FramePipeline {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

struct CaptureTask {
    camera: Box<dyn Camera>,
    link: Arc<dyn Outbound<SensorFrame>>,
    interval: Duration,
    counters: Arc<Counters>,
    shutdown: watch::Receiver<bool>,
}

impl CaptureTask {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut window_start = Instant::now();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            // Camera drivers return a ready frame; capture stays on this task.
            let frame = match self.camera.capture() {
                Ok(frame) => frame,
                Err(e) => {
                    self.counters.capture_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(camera = self.camera.id(), error = %e, "capture failed");
                    continue;
                }
            };
            let captured = self.counters.captured.fetch_add(1, Ordering::Relaxed) + 1;

            match self.link.send(frame) {
                Ok(()) => {
                    self.counters.sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(error = %e, "frame dropped");
                }
            }

            if captured % FPS_LOG_EVERY == 0 {
                let elapsed = window_start.elapsed().as_secs_f64();
                if elapsed > 0.0 {
                    info!(
                        frames = captured,
                        fps = %format_args!("{:.1}", FPS_LOG_EVERY as f64 / elapsed),
                        "capture rate"
                    );
                }
                window_start = Instant::now();
            }
        }
        debug!(camera = self.camera.id(), "frame pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carlink_hal::SimCamera;
    use carlink_middleware::{ConnectionSupervisor, Endpoint, Mailbox, SupervisorConfig};
    use carlink_types::{ActuatorCommand, ConnectionState};

    struct RecordingLink {
        connected: bool,
        frames: parking_lot::Mutex<Vec<u64>>,
    }

    impl Outbound<SensorFrame> for RecordingLink {
        fn send(&self, frame: SensorFrame) -> Result<(), LinkError> {
            if !self.connected {
                return Err(LinkError::NotConnected(ConnectionState::Disconnected));
            }
            if let Some(n) = SimCamera::frame_number(&frame) {
                self.frames.lock().push(n);
            }
            Ok(())
        }

        fn state(&self) -> ConnectionState {
            if self.connected {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            }
        }
    }

    fn link(connected: bool) -> Arc<RecordingLink> {
        Arc::new(RecordingLink {
            connected,
            frames: parking_lot::Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn frames_flow_in_capture_order() -> Result<(), LinkError> {
        let pipeline = FramePipeline::new(Duration::from_millis(10));
        let sink = link(true);
        pipeline.start(Box::new(SimCamera::new("cam")), sink.clone())?;
        tokio::time::sleep(Duration::from_millis(150)).await;
        pipeline.stop().await;

        let frames = sink.frames.lock().clone();
        assert!(frames.len() >= 5, "only {} frames", frames.len());
        assert!(frames.windows(2).all(|w| w[0] < w[1]));
        let stats = pipeline.stats();
        assert_eq!(stats.sent, stats.captured);
        assert_eq!(stats.dropped, 0);
        Ok(())
    }

    #[tokio::test]
    async fn disconnected_link_drops_every_frame() -> Result<(), LinkError> {
        let pipeline = FramePipeline::new(Duration::from_millis(10));
        let sink = link(false);
        pipeline.start(Box::new(SimCamera::new("cam")), sink.clone())?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        pipeline.stop().await;

        let stats = pipeline.stats();
        assert!(stats.captured > 0);
        assert_eq!(stats.sent, 0);
        assert_eq!(stats.dropped, stats.captured);
        assert!(sink.frames.lock().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn start_twice_is_rejected() -> Result<(), LinkError> {
        let pipeline = FramePipeline::new(Duration::from_millis(50));
        pipeline.start(Box::new(SimCamera::new("a")), link(true))?;
        assert!(matches!(
            pipeline.start(Box::new(SimCamera::new("b")), link(true)),
            Err(LinkError::AlreadyStarted)
        ));
        pipeline.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn stalled_peer_never_builds_a_backlog() -> Result<(), Box<dyn std::error::Error>> {
        // Accepts the connection and never reads from it.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let hold = tokio::spawn(async move { listener.accept().await.map(|(s, _)| s) });

        let supervisor = Arc::new(ConnectionSupervisor::<SensorFrame, ActuatorCommand>::new(
            Endpoint::Dial(addr.to_string()),
            SupervisorConfig::default(),
        ));
        let inbound: Arc<Mailbox<ActuatorCommand>> = Arc::new(Mailbox::slot());
        supervisor.start(inbound)?;

        let mut state = supervisor.subscribe_state();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| s.is_connected()),
        )
        .await??;

        let pipeline = FramePipeline::new(Duration::from_millis(2));
        pipeline.start(
            Box::new(SimCamera::new("cam").with_frame_len(256 * 1024)),
            supervisor.clone(),
        )?;
        for _ in 0..100 {
            assert!(supervisor.pending_outbound() <= 1);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        pipeline.stop().await;

        assert!(pipeline.stats().captured > 10);
        assert!(supervisor.stats().dropped > 0);
        supervisor.stop().await;
        hold.abort();
        Ok(())
    }
}
