//! Sundial core library: credential vault, rate limiting, webhook verification,
//! provider sync orchestration and triage scoring.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod models;
pub mod o11y;
pub mod pinned;
pub mod ratelimit;
pub mod store;
pub mod sync;
pub mod triage;
pub mod vault;
pub mod webhooks;

pub use error::{Error, Result};
pub use models::{
    Due, ItemDetails, ItemKind, NormalizedItem, SyncedItem, TaskPriority, TriageQueueItem,
    TriageStatus, UserId,
};
pub use config::SundialConfig;
pub use pinned::{PinSummary, PinTarget};
pub use ratelimit::{
    FailureMode, LimiterPolicies, Limiters, RateLimitDecision, RateLimitExceeded, RateLimiter,
};
pub use sync::{
    AdapterError, AdapterOutcome, ProviderAdapter, SyncConfig, SyncEngine, SyncRun,
};
pub use triage::{TriageEngine, TriageOutcome};
pub use vault::{CredentialManager, CredentialVault, CryptoError};
pub use webhooks::{IngestOutcome, VerificationError, WebhookIngestor, WebhookVerifier};
