//! Runtime configuration for the agent, the server, the link and the vision
//! engine.
//!
//! Every field has a serde default so a partial TOML table is always valid.
//! Loading from disk and environment overrides live in the CLI; this module
//! only describes the shape, the defaults and validation.

use std::time::Duration;

use carlink_kernel::WatchdogConfig;
use carlink_middleware::{BackoffConfig, CodecLimits, SupervisorConfig};
use carlink_types::{LinkError, MAX_FRAME_LEN};
use serde::{Deserialize, Serialize};

// ────────────────────────────────────────────────────────────────────────────
// Link tuning
// ────────────────────────────────────────────────────────────────────────────

/// Transport knobs shared by both roles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkTuning {
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Longest time a started message may take to arrive.  Idle links are
    /// not timed; TCP keepalive and the write timeout catch dead peers.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

fn default_max_frame_len() -> usize {
    MAX_FRAME_LEN
}
fn default_backoff_initial_ms() -> u64 {
    250
}
fn default_backoff_max_ms() -> u64 {
    5_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_read_timeout_ms() -> u64 {
    10_000
}
fn default_write_timeout_ms() -> u64 {
    1_000
}

impl Default for LinkTuning {
    fn default() -> Self {
        Self {
            max_frame_len: default_max_frame_len(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

impl LinkTuning {
    /// Supervisor settings with an outbound mailbox of `outbound_depth`.
    pub fn supervisor_config(&self, outbound_depth: usize) -> SupervisorConfig {
        SupervisorConfig {
            backoff: BackoffConfig {
                initial: Duration::from_millis(self.backoff_initial_ms),
                max: Duration::from_millis(self.backoff_max_ms),
                multiplier: self.backoff_multiplier,
            },
            limits: CodecLimits {
                max_frame_len: self.max_frame_len,
            },
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            outbound_depth,
        }
    }

    pub fn validate(&self) -> Result<(), LinkError> {
        if self.max_frame_len == 0 || self.max_frame_len > u32::MAX as usize {
            return Err(LinkError::Config(format!(
                "link.max_frame_len must be between 1 and {}",
                u32::MAX
            )));
        }
        if self.backoff_initial_ms == 0 || self.backoff_max_ms < self.backoff_initial_ms {
            return Err(LinkError::Config(
                "link.backoff_initial_ms must be > 0 and <= link.backoff_max_ms".into(),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(LinkError::Config(
                "link.backoff_multiplier must be a finite number >= 1.0".into(),
            ));
        }
        for (name, value) in [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("read_timeout_ms", self.read_timeout_ms),
            ("write_timeout_ms", self.write_timeout_ms),
        ] {
            if value == 0 {
                return Err(LinkError::Config(format!("link.{name} must be > 0")));
            }
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Agent
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// `host:port` of the decision server.
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    #[serde(default = "default_target_fps")]
    pub target_fps: u32,
    #[serde(default = "default_watchdog_timeout_ms")]
    pub watchdog_timeout_ms: u64,
    #[serde(default = "default_watchdog_check_interval_ms")]
    pub watchdog_check_interval_ms: u64,
    #[serde(default = "default_watchdog_alert_after")]
    pub watchdog_alert_after: u32,
}

fn default_server_addr() -> String {
    "127.0.0.1:5555".to_string()
}
fn default_target_fps() -> u32 {
    10
}
fn default_watchdog_timeout_ms() -> u64 {
    200
}
fn default_watchdog_check_interval_ms() -> u64 {
    50
}
fn default_watchdog_alert_after() -> u32 {
    5
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            target_fps: default_target_fps(),
            watchdog_timeout_ms: default_watchdog_timeout_ms(),
            watchdog_check_interval_ms: default_watchdog_check_interval_ms(),
            watchdog_alert_after: default_watchdog_alert_after(),
        }
    }
}

impl AgentConfig {
    pub fn frame_interval(&self) -> Duration {
        fps_to_interval(self.target_fps)
    }

    pub fn watchdog_config(&self) -> WatchdogConfig {
        WatchdogConfig {
            timeout: Duration::from_millis(self.watchdog_timeout_ms),
            check_interval: Duration::from_millis(self.watchdog_check_interval_ms),
            alert_after: self.watchdog_alert_after,
        }
    }

    pub fn validate(&self) -> Result<(), LinkError> {
        if self.server_addr.trim().is_empty() {
            return Err(LinkError::Config("agent.server_addr must not be empty".into()));
        }
        validate_fps("agent.target_fps", self.target_fps)?;
        if self.watchdog_timeout_ms == 0 || self.watchdog_check_interval_ms == 0 {
            return Err(LinkError::Config(
                "agent watchdog timeout and check interval must be > 0".into(),
            ));
        }
        if self.watchdog_check_interval_ms > self.watchdog_timeout_ms {
            return Err(LinkError::Config(
                "agent.watchdog_check_interval_ms must not exceed agent.watchdog_timeout_ms".into(),
            ));
        }
        if self.watchdog_alert_after == 0 {
            return Err(LinkError::Config("agent.watchdog_alert_after must be > 0".into()));
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Server
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Upper bound on decisions per second.
    #[serde(default = "default_target_fps")]
    pub target_fps: u32,
    #[serde(default = "default_inbound_queue_depth")]
    pub inbound_queue_depth: usize,
    /// Caller-side limit on one decision engine call.
    #[serde(default = "default_decision_timeout_ms")]
    pub decision_timeout_ms: u64,
    #[serde(default = "default_goal")]
    pub goal: String,
}

fn default_listen_addr() -> String {
    "0.0.0.0:5555".to_string()
}
fn default_inbound_queue_depth() -> usize {
    2
}
fn default_decision_timeout_ms() -> u64 {
    2_000
}
fn default_goal() -> String {
    "Explore the environment and avoid obstacles".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            target_fps: default_target_fps(),
            inbound_queue_depth: default_inbound_queue_depth(),
            decision_timeout_ms: default_decision_timeout_ms(),
            goal: default_goal(),
        }
    }
}

impl ServerConfig {
    pub fn decision_interval(&self) -> Duration {
        fps_to_interval(self.target_fps)
    }

    pub fn decision_timeout(&self) -> Duration {
        Duration::from_millis(self.decision_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), LinkError> {
        if self.listen_addr.trim().is_empty() {
            return Err(LinkError::Config("server.listen_addr must not be empty".into()));
        }
        validate_fps("server.target_fps", self.target_fps)?;
        if self.inbound_queue_depth == 0 {
            return Err(LinkError::Config("server.inbound_queue_depth must be >= 1".into()));
        }
        if self.decision_timeout_ms == 0 {
            return Err(LinkError::Config("server.decision_timeout_ms must be > 0".into()));
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Vision engine
// ────────────────────────────────────────────────────────────────────────────

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionConfig {
    /// Base URL of an OpenAI-compatible server, e.g. Ollama.
    #[serde(default = "default_vision_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Bearer token; empty for local servers.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl std::fmt::Debug for VisionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisionConfig")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field(
                "api_key",
                if self.api_key.is_empty() { &"<not set>" } else { &"<redacted>" },
            )
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .finish()
    }
}

fn default_vision_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_model() -> String {
    "qwen2.5vl".to_string()
}
fn default_max_tokens() -> u32 {
    100
}
fn default_temperature() -> f32 {
    0.7
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            base_url: default_vision_url(),
            model: default_model(),
            api_key: String::new(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

impl VisionConfig {
    pub fn validate(&self) -> Result<(), LinkError> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(LinkError::Config(format!(
                "vision.base_url must be an http(s) URL, got {:?}",
                self.base_url
            )));
        }
        if self.model.trim().is_empty() {
            return Err(LinkError::Config("vision.model must not be empty".into()));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(LinkError::Config("vision.temperature must be within 0.0..=2.0".into()));
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Helpers
// ────────────────────────────────────────────────────────────────────────────

fn fps_to_interval(fps: u32) -> Duration {
    Duration::from_secs_f64(1.0 / f64::from(fps.max(1)))
}

fn validate_fps(name: &str, fps: u32) -> Result<(), LinkError> {
    if fps == 0 || fps > 120 {
        return Err(LinkError::Config(format!("{name} must be between 1 and 120")));
    }
    Ok(())
}
