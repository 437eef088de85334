//! [`Agent`] – the car side, assembled.
//!
//! ```text
//! camera ──► FramePipeline ──► supervisor (dial) ──► wire
//! wire ──► supervisor ──► CommandPipeline ──► actuator
//!                                 ▲
//!                 LinkWatchdog ───┘ (neutral on silence)
//! ```

use std::sync::Arc;
use std::time::Duration;

use carlink_hal::{Actuator, Camera};
use carlink_kernel::LinkWatchdog;
use carlink_middleware::{
    ConnectionSupervisor, Endpoint, EventBus, LinkStatsSnapshot, SupervisorConfig,
};
use carlink_types::{ActuatorCommand, ConnectionState, LinkError, SensorFrame};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::info;

use crate::command_pipeline::{CommandPipeline, CommandStats};
use crate::config::{AgentConfig, LinkTuning};
use crate::frame_pipeline::{FramePipeline, FrameStats};

/// Only the newest frame ever waits for the socket.
const FRAME_SLOT_DEPTH: usize = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentStats {
    pub link: LinkStatsSnapshot,
    pub frames: FrameStats,
    pub commands: CommandStats,
    pub watchdog_trips: u64,
}

pub struct Agent {
    bus: EventBus,
    supervisor: Arc<ConnectionSupervisor<SensorFrame, ActuatorCommand>>,
    watchdog: LinkWatchdog,
    commands: Arc<CommandPipeline>,
    frames: FramePipeline,
    camera: Mutex<Option<Box<dyn Camera>>>,
}

impl Agent {
    /// Wire the agent together without starting anything.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Config`] when either configuration is invalid.
    pub fn new(
        config: &AgentConfig,
        tuning: &LinkTuning,
        camera: Box<dyn Camera>,
        actuator: Box<dyn Actuator>,
    ) -> Result<Self, LinkError> {
        config.validate()?;
        tuning.validate()?;
        Ok(Self::assemble(
            config,
            tuning.supervisor_config(FRAME_SLOT_DEPTH),
            camera,
            actuator,
        ))
    }

    fn assemble(
        config: &AgentConfig,
        link: SupervisorConfig,
        camera: Box<dyn Camera>,
        actuator: Box<dyn Actuator>,
    ) -> Self {
        let bus = EventBus::default();
        let supervisor = Arc::new(
            ConnectionSupervisor::new(Endpoint::Dial(config.server_addr.clone()), link)
                .with_bus(bus.clone()),
        );
        let watchdog = LinkWatchdog::new(config.watchdog_config()).with_bus(bus.clone());
        let commands =
            Arc::new(CommandPipeline::new(actuator, watchdog.handle()).with_bus(bus.clone()));
        Self {
            bus,
            supervisor,
            watchdog,
            commands,
            frames: FramePipeline::new(config.frame_interval()),
            camera: Mutex::new(Some(camera)),
        }
    }

    /// Operational events from every component.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Start actuation, the watchdog, the link and frame capture, in that
    /// order.  An agent runs once; a stopped agent cannot be restarted.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::AlreadyStarted`] on a second call.
    pub fn start(&self) -> Result<(), LinkError> {
        let camera = self.camera.lock().take().ok_or(LinkError::AlreadyStarted)?;
        self.commands.start()?;
        self.watchdog.start(self.commands.clone())?;
        self.supervisor.start(self.commands.clone())?;
        self.frames.start(camera, self.supervisor.clone())?;
        info!(server = %self.supervisor.endpoint(), "agent started");
        Ok(())
    }

    /// Stop capture, close the link, stop the watchdog and leave the drive
    /// base in the neutral state.
    pub async fn stop(&self) {
        self.frames.stop().await;
        self.supervisor.stop().await;
        self.watchdog.stop().await;
        self.commands.stop().await;
        info!("agent stopped");
    }

    pub fn state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.supervisor.subscribe_state()
    }

    pub fn stats(&self) -> AgentStats {
        AgentStats {
            link: self.supervisor.stats(),
            frames: self.frames.stats(),
            commands: self.commands.stats(),
            watchdog_trips: self.watchdog.trips(),
        }
    }
}

/// One step of the motor self-test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelfTestStep {
    pub name: &'static str,
    pub command: ActuatorCommand,
}

/// The self-test sequence at `speed`.
pub fn self_test_steps(speed: u8) -> [SelfTestStep; 4] {
    [
        SelfTestStep {
            name: "forward",
            command: ActuatorCommand::forward(speed),
        },
        SelfTestStep {
            name: "backward",
            command: ActuatorCommand::backward(speed),
        },
        SelfTestStep {
            name: "rotate left",
            command: ActuatorCommand::rotate_left(speed),
        },
        SelfTestStep {
            name: "rotate right",
            command: ActuatorCommand::rotate_right(speed),
        },
    ]
}

/// Drive each self-test step for `hold`, stopping for `pause` after each.
///
/// # Errors
///
/// Returns the first actuation fault; the drive base is stopped first.
pub async fn run_self_test(
    actuator: &mut dyn Actuator,
    speed: u8,
    hold: Duration,
    pause: Duration,
) -> Result<(), LinkError> {
    for step in self_test_steps(speed) {
        info!(step = step.name, command = %step.command, "self-test");
        if let Err(e) = actuator.apply(&step.command) {
            actuator.emergency_stop();
            return Err(e);
        }
        tokio::time::sleep(hold).await;
        actuator.emergency_stop();
        tokio::time::sleep(pause).await;
    }
    info!(actuator = actuator.id(), "self-test complete");
    Ok(())
}
