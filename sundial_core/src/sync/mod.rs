//! Sync orchestration across provider adapters.

pub mod engine;
pub mod models;
pub mod traits;

pub use engine::{SyncConfig, SyncEngine};
pub use models::{
    AdapterOutcome, DisconnectOutcome, FailureKind, ProviderSyncResult, SyncFailure, SyncRun,
};
pub use traits::{
    AdapterError, FetchResult, ProviderAdapter, ProviderRawItem, RevokePolicy, WebhookDelta,
    WebhookDescriptor,
};
