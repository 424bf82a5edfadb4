//! Triage scoring: deterministic rules plus a pluggable text classifier,
//! merged into a per-user queue that never overrides user decisions.

pub mod engine;
pub mod rules;
pub mod traits;

pub use engine::{DeferredItem, ItemScore, MAX_QUEUE_READ, TriageEngine, TriageOutcome};
pub use traits::{Classification, ScoringError, TextClassifier};
