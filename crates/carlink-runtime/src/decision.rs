//! The seam between the decision loop and whatever picks the next command.

use async_trait::async_trait;
use carlink_types::{ActuatorCommand, LinkError, SensorFrame};

/// One command plus the engine's explanation for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub command: ActuatorCommand,
    pub reasoning: String,
}

impl Decision {
    pub fn new(command: ActuatorCommand, reasoning: impl Into<String>) -> Self {
        Self {
            command,
            reasoning: reasoning.into(),
        }
    }

    /// The fallback used whenever the engine fails.
    pub fn neutral(reason: impl Into<String>) -> Self {
        Self::new(ActuatorCommand::NEUTRAL, reason)
    }
}

/// Control state carried from one decision to the next.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecisionContext {
    pub goal: String,
    pub last_command: Option<ActuatorCommand>,
    pub last_reasoning: String,
    pub steps_taken: u64,
}

impl DecisionContext {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            ..Self::default()
        }
    }

    /// Switch to a new goal and forget everything about the old one.
    pub fn set_goal(&mut self, goal: impl Into<String>) {
        *self = Self::new(goal);
    }

    /// Remember a decision that was handed to the link.
    pub fn record(&mut self, decision: &Decision) {
        self.last_command = Some(decision.command);
        self.last_reasoning = decision.reasoning.clone();
        self.steps_taken += 1;
    }
}

/// Turns a frame into a command.
///
/// Latency is unbounded; the decision loop imposes its own timeout, so
/// implementations need not.
#[async_trait]
pub trait DecisionEngine: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// # Errors
    ///
    /// Returns [`LinkError::Decision`] when the engine fails or its output
    /// cannot be turned into a valid command.
    async fn decide(
        &self,
        frame: &SensorFrame,
        context: &DecisionContext,
    ) -> Result<Decision, LinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_tracks_last_command_and_steps() {
        let mut ctx = DecisionContext::new("find the door");
        ctx.record(&Decision::new(ActuatorCommand::forward(200), "path is clear"));
        ctx.record(&Decision::new(ActuatorCommand::rotate_left(150), "wall ahead"));

        assert_eq!(ctx.steps_taken, 2);
        assert_eq!(ctx.last_command, Some(ActuatorCommand::rotate_left(150)));
        assert_eq!(ctx.last_reasoning, "wall ahead");
    }

    #[test]
    fn set_goal_resets_state() {
        let mut ctx = DecisionContext::new("a");
        ctx.record(&Decision::new(ActuatorCommand::forward(10), "x"));
        ctx.set_goal("b");
        assert_eq!(ctx, DecisionContext::new("b"));
    }

    #[test]
    fn neutral_decision_carries_reason() {
        let d = Decision::neutral("engine timed out");
        assert!(d.command.is_neutral());
        assert_eq!(d.reasoning, "engine timed out");
    }
}
