//! Prompt construction and reply parsing for text-producing engines, plus
//! the operator's manual command syntax.
//!
//! A reply is read in three passes, first match wins:
//!
//! 1. a JSON object with `left_speed`, `right_speed`, `left_dir`,
//!    `right_dir` and optional `reasoning`;
//! 2. a `COMMAND: l,r,ldir,rdir` line (with an optional `REASONING:` line);
//! 3. the first four integers anywhere in the text.
//!
//! Speeds are clamped to `0..=255` and direction codes to `0..=2`.

use std::fmt::Write as _;
use std::sync::LazyLock;

use carlink_types::{ActuatorCommand, ChannelCommand, Direction, LinkError};
use regex::Regex;
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::decision::{Decision, DecisionContext};

/// Speed used by manual commands that do not name one.
pub const DEFAULT_MANUAL_SPEED: u8 = 200;

/// Shape of a structured reply; also published to the engine as a JSON
/// Schema.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ReplyCommand {
    /// Left wheel group speed, 0-255.
    pub left_speed: i64,
    /// Right wheel group speed, 0-255.
    pub right_speed: i64,
    /// Left direction: 0 = backward, 1 = forward, 2 = stop.
    pub left_dir: i64,
    /// Right direction: 0 = backward, 1 = forward, 2 = stop.
    pub right_dir: i64,
    /// One sentence on why.
    #[serde(default)]
    pub reasoning: String,
}

impl ReplyCommand {
    fn to_command(&self) -> ActuatorCommand {
        clamped_command(self.left_speed, self.right_speed, self.left_dir, self.right_dir)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Prompt
// ────────────────────────────────────────────────────────────────────────────

const CONTROL_NOTES: &str = "\
You drive a four-wheel robot car by looking through its front camera.
The wheels move in two groups, left and right.

Channels:
- left_speed, right_speed: 0-255 (0 = stopped, 255 = full power)
- left_dir, right_dir: 0 = backward, 1 = forward, 2 = stop

Answer with exactly two lines:
COMMAND: <left_speed>,<right_speed>,<left_dir>,<right_dir>
REASONING: <one short sentence>

Examples:
- straight ahead: COMMAND: 200,200,1,1
- reverse: COMMAND: 200,200,0,0
- spin left in place: COMMAND: 150,150,0,1
- spin right in place: COMMAND: 150,150,1,0
- halt: COMMAND: 0,0,2,2
- veer left while moving: COMMAND: 100,180,1,1
- veer right while moving: COMMAND: 180,100,1,1
";

/// Build the text prompt for one decision.
pub fn build_prompt(context: &DecisionContext) -> String {
    let mut prompt = String::with_capacity(1024);
    let _ = writeln!(prompt, "GOAL: {}\n", context.goal);
    prompt.push_str(CONTROL_NOTES);
    if let Some(last) = context.last_command {
        let _ = write!(prompt, "\nPREVIOUS COMMAND: {last}");
        if !context.last_reasoning.is_empty() {
            let _ = write!(prompt, "\nPREVIOUS REASONING: {}", context.last_reasoning);
        }
    }
    let _ = write!(prompt, "\n\nSTEPS TAKEN: {}", context.steps_taken);
    prompt.push_str("\n\nLook at the image and answer in the required format.");
    prompt
}

// ────────────────────────────────────────────────────────────────────────────
// Reply parsing
// ────────────────────────────────────────────────────────────────────────────

struct Patterns {
    command: Regex,
    reasoning: Regex,
    number: Regex,
}

static PATTERNS: LazyLock<Result<Patterns, regex::Error>> = LazyLock::new(|| {
    Ok(Patterns {
        command: Regex::new(r"COMMAND:\s*(\d+)\s*,\s*(\d+)\s*,\s*(\d+)\s*,\s*(\d+)")?,
        reasoning: Regex::new(r"(?i)REASONING:\s*(.+?)(?:\n|$)")?,
        number: Regex::new(r"\b(\d+)\b")?,
    })
});

fn patterns() -> Result<&'static Patterns, LinkError> {
    PATTERNS
        .as_ref()
        .map_err(|e| LinkError::Decision(format!("reply pattern failed to compile: {e}")))
}

/// Extract a command (and reasoning) from an engine's free-text reply.
///
/// # Errors
///
/// Returns [`LinkError::Decision`] when no command can be found.
pub fn parse_reply(reply: &str) -> Result<Decision, LinkError> {
    if let Some(structured) = parse_json(reply) {
        debug!(command = %structured.to_command(), "parsed structured reply");
        return Ok(Decision::new(structured.to_command(), structured.reasoning.trim()));
    }

    let p = patterns()?;
    let reasoning = p
        .reasoning
        .captures(reply)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default();

    if let Some(caps) = p.command.captures(reply) {
        let n: Vec<i64> = (1..=4)
            .filter_map(|i| caps.get(i))
            .map(|m| parse_saturating(m.as_str()))
            .collect();
        if let [l, r, ld, rd] = n[..] {
            return Ok(Decision::new(clamped_command(l, r, ld, rd), reasoning));
        }
    }

    warn!("no COMMAND line in reply; trying first four numbers");
    let numbers: Vec<i64> = p
        .number
        .captures_iter(reply)
        .filter_map(|c| c.get(1))
        .take(4)
        .map(|m| parse_saturating(m.as_str()))
        .collect();
    if let [l, r, ld, rd] = numbers[..] {
        return Ok(Decision::new(clamped_command(l, r, ld, rd), reasoning));
    }

    Err(LinkError::Decision(format!(
        "no command found in reply: {:?}",
        truncate(reply, 120)
    )))
}

fn parse_json(reply: &str) -> Option<ReplyCommand> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&reply[start..=end]).ok()
}

fn parse_saturating(digits: &str) -> i64 {
    digits.parse::<i64>().unwrap_or(i64::MAX)
}

fn clamped_command(left: i64, right: i64, left_dir: i64, right_dir: i64) -> ActuatorCommand {
    ActuatorCommand::new(
        ChannelCommand::new(clamp_speed(left), clamp_direction(left_dir)),
        ChannelCommand::new(clamp_speed(right), clamp_direction(right_dir)),
    )
}

fn clamp_speed(v: i64) -> u8 {
    v.clamp(0, 255) as u8
}

fn clamp_direction(v: i64) -> Direction {
    match v.clamp(0, 2) {
        0 => Direction::Backward,
        1 => Direction::Forward,
        _ => Direction::Stop,
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Manual commands
// ────────────────────────────────────────────────────────────────────────────

/// Parse an operator command.
///
/// Accepts `stop|s`, `forward|f|fwd [speed]`, `backward|b|back [speed]`,
/// `left|l|rotate_left [speed]`, `right|r|rotate_right [speed]`, or the raw
/// `l,r,ldir,rdir` form.  Unlike engine replies nothing is clamped: out of
/// range input is rejected.
pub fn parse_manual(input: &str) -> Option<ActuatorCommand> {
    let input = input.trim().to_lowercase();

    if input.contains(',') {
        if let Some(cmd) = parse_raw(&input) {
            return Some(cmd);
        }
    }

    let mut parts = input.split_whitespace();
    let verb = parts.next()?;
    let speed = match parts.next() {
        Some(s) => s.parse::<u8>().ok()?,
        None => DEFAULT_MANUAL_SPEED,
    };
    match verb {
        "stop" | "s" => Some(ActuatorCommand::NEUTRAL),
        "forward" | "f" | "fwd" => Some(ActuatorCommand::forward(speed)),
        "backward" | "b" | "back" => Some(ActuatorCommand::backward(speed)),
        "left" | "l" | "rotate_left" => Some(ActuatorCommand::rotate_left(speed)),
        "right" | "r" | "rotate_right" => Some(ActuatorCommand::rotate_right(speed)),
        _ => None,
    }
}

fn parse_raw(input: &str) -> Option<ActuatorCommand> {
    let fields: Vec<&str> = input.split(',').map(str::trim).collect();
    let [l, r, ld, rd] = fields[..] else {
        return None;
    };
    Some(ActuatorCommand::new(
        ChannelCommand::new(l.parse().ok()?, Direction::try_from(ld.parse::<u8>().ok()?).ok()?),
        ChannelCommand::new(r.parse().ok()?, Direction::try_from(rd.parse::<u8>().ok()?).ok()?),
    ))
}
