use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A model's judgement of one piece of free text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub score: u8,
    pub reasoning: String,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScoringError {
    #[error("classifier unavailable: {0}")]
    ClassifierUnavailable(String),

    #[error("classifier throttled until {reset_at}")]
    Throttled { reset_at: DateTime<Utc> },
}

/// Probabilistic scorer for items without structured urgency signals (email).
#[async_trait]
pub trait TextClassifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Classification, ScoringError>;
}
