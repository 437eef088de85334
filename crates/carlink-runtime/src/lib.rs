//! `carlink-runtime` – pipelines, decision engines and the two assembled
//! ends of the link.
//!
//! # Modules
//!
//! - [`agent`] – [`Agent`][agent::Agent]: the car side.  Wires a dialing
//!   supervisor, the [`FramePipeline`][frame_pipeline::FramePipeline], the
//!   [`CommandPipeline`][command_pipeline::CommandPipeline] and the link
//!   watchdog together; also hosts the motor self-test.
//! - [`server`] – [`Server`][server::Server]: the decision side.  A listening
//!   supervisor, a bounded latest-wins frame queue and the
//!   [`DecisionLoop`][decision_loop::DecisionLoop], or manual control.
//! - [`decision`] – the [`DecisionEngine`][decision::DecisionEngine] seam and
//!   the control state carried between decisions.
//! - [`vision`] – [`VisionDriver`][vision::VisionDriver]: an OpenAI-compatible
//!   vision-language engine.
//! - [`reply`] – prompt construction, model reply parsing and the manual
//!   command grammar.
//! - [`config`] – serde configuration structs with defaults and validation.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: `tracing`
//!   subscriber with optional OTLP span export.
//!
//! # Safety
//!
//! The agent never keeps acting on stale commands: the watchdog forces the
//! neutral command after `agent.watchdog_timeout_ms` of silence, whatever
//! the link state, and both ends finish with a neutral command on shutdown.

pub mod agent;
pub mod command_pipeline;
pub mod config;
pub mod decision;
pub mod decision_loop;
pub mod frame_pipeline;
pub mod reply;
pub mod server;
pub mod telemetry;
pub mod vision;

pub use agent::{Agent, AgentStats, run_self_test, self_test_steps};
pub use command_pipeline::{CommandPipeline, CommandStats};
pub use config::{AgentConfig, LinkTuning, ServerConfig, VisionConfig};
pub use decision::{Decision, DecisionContext, DecisionEngine};
pub use decision_loop::{DecisionLoop, DecisionLoopConfig, DecisionStats};
pub use frame_pipeline::{FramePipeline, FrameStats};
pub use reply::{build_prompt, parse_manual, parse_reply};
pub use server::{Server, ServerStats};
pub use telemetry::{TracerProviderGuard, init_tracing};
pub use vision::{VisionDriver, VisionError};
