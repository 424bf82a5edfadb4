//! Urgency classifier over an OpenAI-compatible chat completions API.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use sundial_core::triage::{Classification, ScoringError, TextClassifier};
use tracing::instrument;

const SYSTEM_PROMPT: &str = "You triage a person's inbox. Rate how urgently the message needs \
their attention from 0 (ignore) to 100 (act now). Reply with a JSON object \
{\"score\": <integer 0-100>, \"reasoning\": <one short sentence>}.";

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Verdict {
    score: f64,
    #[serde(default)]
    reasoning: String,
}

#[derive(Clone)]
pub struct LlmClassifier {
    client: Client,
    api_base: String,
    api_key: String,
    model: String,
}

impl LlmClassifier {
    pub fn new(
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: std::time::Duration,
    ) -> Result<Self, ScoringError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ScoringError::ClassifierUnavailable(format!("http client: {e}")))?;
        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
        })
    }
}

/// Pull the verdict out of the model's reply, tolerating code fences.
fn parse_verdict(content: &str) -> Result<Classification, ScoringError> {
    let trimmed = content.trim();
    let json = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => {
            return Err(ScoringError::ClassifierUnavailable(
                "classifier reply had no JSON object".to_string(),
            ));
        }
    };
    let v: Verdict = serde_json::from_str(json)
        .map_err(|e| ScoringError::ClassifierUnavailable(format!("classifier reply: {e}")))?;
    if !v.score.is_finite() {
        return Err(ScoringError::ClassifierUnavailable(
            "classifier score is not a number".to_string(),
        ));
    }
    Ok(Classification {
        score: v.score.round().clamp(0.0, 100.0) as u8,
        reasoning: if v.reasoning.trim().is_empty() {
            "classifier".to_string()
        } else {
            v.reasoning
        },
    })
}

#[async_trait]
impl TextClassifier for LlmClassifier {
    #[instrument(level = "debug", skip(self, text), fields(model = %self.model, chars = text.len()))]
    async fn classify(&self, text: &str) -> Result<Classification, ScoringError> {
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "model": self.model,
                "temperature": 0,
                "response_format": {"type": "json_object"},
                "messages": [
                    {"role": "system", "content": SYSTEM_PROMPT},
                    {"role": "user", "content": text},
                ],
            }))
            .send()
            .await
            .map_err(|e| ScoringError::ClassifierUnavailable(e.to_string()))?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let secs = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(crate::http::parse_retry_after)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(60);
            return Err(ScoringError::Throttled {
                reset_at: Utc::now() + Duration::seconds(secs),
            });
        }
        if !status.is_success() {
            return Err(ScoringError::ClassifierUnavailable(format!(
                "classifier returned {status}"
            )));
        }

        let body: ChatResponse = resp
            .json()
            .await
            .map_err(|e| ScoringError::ClassifierUnavailable(format!("decode: {e}")))?;
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ScoringError::ClassifierUnavailable("empty completion".to_string()))?;
        parse_verdict(&content)
    }
}
