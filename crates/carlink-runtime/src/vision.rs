//! [`VisionDriver`] – vision-language decision engine.
//!
//! Talks to any server exposing an OpenAI-compatible `/v1/chat/completions`
//! endpoint that accepts image content, such as
//! [Ollama](https://ollama.com) (`http://localhost:11434`) running a Qwen VL
//! model.  Each frame is sent inline as a base64 JPEG data URL alongside the
//! prompt from [`build_prompt`][crate::reply::build_prompt]; the
//! [`ReplyCommand`] JSON Schema is passed as `response_format` so servers
//! that support structured output answer in JSON.
//!
//! # Example
//!
//! ```rust,no_run
//! use carlink_runtime::config::VisionConfig;
//! use carlink_runtime::vision::VisionDriver;
//!
//! let driver = VisionDriver::from_config(&VisionConfig::default());
//! // Requires a running model server – skipped in unit tests.
//! // let decision = driver.decide(&frame, &context).await?;
//! ```

use std::time::Instant;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use carlink_types::{LinkError, SensorFrame};
use schemars::schema_for;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::VisionConfig;
use crate::decision::{Decision, DecisionContext, DecisionEngine};
use crate::reply::{ReplyCommand, build_prompt, parse_reply};

const SYSTEM_PROMPT: &str = "You are the driver of a small robot car. \
Keep it moving toward the goal, avoid collisions, and stop when unsure.";

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from vision driver operations.
#[derive(Error, Debug)]
pub enum VisionError {
    /// The HTTP request to the model server failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// The response from the model server could not be parsed.
    #[error("Unexpected response format: {0}")]
    BadResponse(String),
}

impl From<VisionError> for LinkError {
    fn from(e: VisionError) -> Self {
        LinkError::Decision(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request / response shapes (OpenAI-compatible)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize)]
struct RequestMessage {
    role: &'static str,
    content: MessageContent,
}

#[derive(Debug, Serialize)]
struct JsonSchemaFormat {
    name: &'static str,
    schema: serde_json::Value,
}

/// `response_format` field that asks for structured JSON Schema output.
#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
    json_schema: JsonSchemaFormat,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<RequestMessage>,
    stream: bool,
    max_tokens: u32,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ReplyMessage,
}

#[derive(Deserialize)]
struct ReplyMessage {
    #[serde(default)]
    content: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// VisionDriver
// ─────────────────────────────────────────────────────────────────────────────

/// An async client for an OpenAI-compatible vision chat endpoint.
///
/// Construct once and reuse for every decision.
pub struct VisionDriver {
    base_url: String,
    model: String,
    api_key: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
}

impl VisionDriver {
    pub fn from_config(config: &VisionConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            client: reqwest::Client::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_request(&self, frame: &SensorFrame, prompt: &str) -> ChatRequest<'_> {
        let schema = serde_json::to_value(schema_for!(ReplyCommand))
            .unwrap_or(serde_json::Value::Null);
        ChatRequest {
            model: &self.model,
            messages: vec![
                RequestMessage {
                    role: "system",
                    content: MessageContent::Text(SYSTEM_PROMPT.to_string()),
                },
                RequestMessage {
                    role: "user",
                    content: MessageContent::Parts(vec![
                        ContentPart::ImageUrl {
                            image_url: ImageUrl {
                                url: jpeg_data_url(frame),
                            },
                        },
                        ContentPart::Text {
                            text: prompt.to_string(),
                        },
                    ]),
                },
            ],
            stream: false,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            response_format: ResponseFormat {
                kind: "json_schema",
                json_schema: JsonSchemaFormat {
                    name: "drive_command",
                    schema,
                },
            },
        }
    }

    /// Send one frame and prompt; return the assistant's reply text.
    ///
    /// # Errors
    ///
    /// Returns [`VisionError::Http`] if the request fails, or
    /// [`VisionError::BadResponse`] if the response shape is unexpected.
    pub async fn complete(&self, frame: &SensorFrame, prompt: &str) -> Result<String, VisionError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = self.build_request(frame, prompt);

        let mut request = self.client.post(&url).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response: ChatResponse = request
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| VisionError::BadResponse("empty choices array".into()))
    }
}

#[async_trait]
impl DecisionEngine for VisionDriver {
    fn name(&self) -> &str {
        &self.model
    }

    async fn decide(
        &self,
        frame: &SensorFrame,
        context: &DecisionContext,
    ) -> Result<Decision, LinkError> {
        let prompt = build_prompt(context);
        let started = Instant::now();
        let reply = self.complete(frame, &prompt).await?;
        let inference_ms = started.elapsed().as_millis() as u64;
        debug!(reply = %reply, "vision reply");

        let decision = parse_reply(&reply)?;
        info!(
            model = %self.model,
            inference_ms,
            command = %decision.command,
            reasoning = %decision.reasoning,
            "vision decision"
        );
        Ok(decision)
    }
}

fn jpeg_data_url(frame: &SensorFrame) -> String {
    format!("data:image/jpeg;base64,{}", BASE64.encode(frame.payload()))
}
