//! Provider adapters and the LLM classifier for Sundial.
//!
//! Each adapter implements `sundial_core::ProviderAdapter` and keeps its own
//! vendor auth handling. Feature flags gate each provider.

pub mod http;

#[cfg(feature = "classifier")]
pub mod classifier;
#[cfg(feature = "google")]
pub mod google;
#[cfg(feature = "plaid")]
pub mod plaid;
#[cfg(feature = "todoist")]
pub mod todoist;
