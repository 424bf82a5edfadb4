//! Persistence traits and the SQLite backend.

pub mod sqlite;
pub mod traits;

pub use sqlite::SqliteStore;
pub use traits::{
    CredentialStore, ItemStore, MergeOutcome, RescoreCandidate, TriageQueueStore, UpsertOutcome,
};
