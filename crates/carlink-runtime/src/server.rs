//! [`Server`] – the decision side, assembled.
//!
//! A listening supervisor feeds decoded frames into a bounded latest-wins
//! queue; the [`DecisionLoop`] drains it and sends commands back over the
//! same link.  Without an engine the server runs in manual mode and only
//! [`Server::send_manual`] produces commands.

use std::net::SocketAddr;
use std::sync::Arc;

use carlink_middleware::{
    ConnectionSupervisor, Endpoint, EventBus, LinkStatsSnapshot, Mailbox,
};
use carlink_types::{ActuatorCommand, ConnectionState, LinkError, SensorFrame};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::{LinkTuning, ServerConfig};
use crate::decision::{DecisionContext, DecisionEngine};
use crate::decision_loop::{DecisionLoop, DecisionLoopConfig, DecisionStats};

/// Commands are never queued behind one another.
const COMMAND_SLOT_DEPTH: usize = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub link: LinkStatsSnapshot,
    pub decisions: DecisionStats,
    /// Frames waiting for the decision loop.
    pub queued_frames: usize,
}

pub struct Server {
    bus: EventBus,
    supervisor: Arc<ConnectionSupervisor<ActuatorCommand, SensorFrame>>,
    frames: Arc<Mailbox<SensorFrame>>,
    decisions: DecisionLoop,
}

impl Server {
    /// # Errors
    ///
    /// Returns [`LinkError::Config`] when either configuration is invalid.
    pub fn new(config: &ServerConfig, tuning: &LinkTuning) -> Result<Self, LinkError> {
        config.validate()?;
        tuning.validate()?;
        let bus = EventBus::default();
        let supervisor = Arc::new(
            ConnectionSupervisor::new(
                Endpoint::Listen(config.listen_addr.clone()),
                tuning.supervisor_config(COMMAND_SLOT_DEPTH),
            )
            .with_bus(bus.clone()),
        );
        let decisions = DecisionLoop::new(
            DecisionLoopConfig {
                interval: config.decision_interval(),
                decision_timeout: config.decision_timeout(),
            },
            config.goal.clone(),
        )
        .with_bus(bus.clone());
        Ok(Self {
            bus,
            supervisor,
            frames: Arc::new(Mailbox::new(config.inbound_queue_depth)),
            decisions,
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Start listening; with `Some(engine)` also start the decision loop.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::AlreadyStarted`] if already running.
    pub fn start(&self, engine: Option<Arc<dyn DecisionEngine>>) -> Result<(), LinkError> {
        self.supervisor.start(self.frames.clone())?;
        match engine {
            Some(engine) => {
                self.decisions
                    .start(self.frames.clone(), engine, self.supervisor.clone())?;
            }
            None => info!("manual mode; no decision engine"),
        }
        info!(listen = %self.supervisor.endpoint(), "server started");
        Ok(())
    }

    /// Stop deciding, queue a final neutral command, then close the link
    /// once it has been written.
    pub async fn stop(&self) {
        self.decisions.stop().await;
        if let Err(e) = self.supervisor.send(ActuatorCommand::NEUTRAL) {
            debug!(error = %e, "no peer for the final neutral command");
        }
        self.supervisor.stop().await;
        self.frames.close();
        info!("server stopped");
    }

    /// Send one operator command through the normal link path.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::NotConnected`] when no car is connected.
    pub fn send_manual(&self, command: ActuatorCommand) -> Result<(), LinkError> {
        info!(command = %command, "manual command");
        self.supervisor.send(command)
    }

    pub fn set_goal(&self, goal: impl Into<String>) {
        self.decisions.set_goal(goal);
    }

    pub fn context(&self) -> DecisionContext {
        self.decisions.context()
    }

    /// Address actually bound, once the listener is up.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.supervisor.local_addr()
    }

    pub fn state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.supervisor.subscribe_state()
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            link: self.supervisor.stats(),
            decisions: self.decisions.stats(),
            queued_frames: self.frames.len(),
        }
    }
}
