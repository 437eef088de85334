//! Startup check of the vision model server.
//!
//! Asks `/api/tags` (Ollama's model list) whether the configured model has
//! been pulled.  Purely informational; the server starts either way.

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ModelTag {
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

/// Outcome of [`probe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    /// The server answered and lists the model.
    Ready { models: usize },
    /// The server answered but the model is missing.
    ModelMissing { available: Vec<String> },
    Unreachable(String),
}

pub fn probe(base_url: &str, model: &str) -> ProbeResult {
    match fetch_models(base_url) {
        Ok(models) => classify(model, &models),
        Err(e) => ProbeResult::Unreachable(e),
    }
}

fn fetch_models(base_url: &str) -> Result<Vec<ModelTag>, String> {
    let url = format!("{}/api/tags", base_url.trim_end_matches('/'));
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(3))
        .build()
        .map_err(|e| format!("HTTP client init failed: {}", e))?;
    let response = client
        .get(&url)
        .send()
        .map_err(|e| format!("unreachable at {}: {}", url, e))?;
    if !response.status().is_success() {
        return Err(format!("{} returned HTTP {}", url, response.status()));
    }
    let tags: TagsResponse = response
        .json()
        .map_err(|e| format!("unexpected /api/tags response: {}", e))?;
    Ok(tags.models)
}

/// Model names match with or without the `:latest` tag.
fn classify(model: &str, models: &[ModelTag]) -> ProbeResult {
    let wanted = model.trim_end_matches(":latest");
    let found = models
        .iter()
        .any(|m| m.name == model || m.name.trim_end_matches(":latest") == wanted);
    if found {
        ProbeResult::Ready {
            models: models.len(),
        }
    } else {
        ProbeResult::ModelMissing {
            available: models.iter().map(|m| m.name.clone()).collect(),
        }
    }
}
