use crate::ratelimit::{LimiterPolicies, RateLimitPolicy};
use crate::sync::SyncConfig;
use crate::vault::CredentialVault;
use crate::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub key_prefix: String,
}

#[derive(Debug, Clone)]
pub struct TodoistConfig {
    /// Needed only for remote token revocation.
    pub client_id: Option<String>,
    /// OAuth client secret; also the webhook HMAC key.
    pub client_secret: String,
}

#[derive(Debug, Clone)]
pub struct PlaidConfig {
    pub client_id: String,
    pub secret: String,
    /// `sandbox`, `development` or `production`.
    pub env: String,
}

#[derive(Debug, Clone)]
pub struct GoogleConfig {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
}

/// Process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct SundialConfig {
    pub master_key: Option<String>,
    pub database_path: PathBuf,
    pub cron_secret: Option<String>,
    /// Counters live in SQLite when unset.
    pub redis: Option<RedisConfig>,
    pub sync: SyncConfig,
    pub limits: LimiterPolicies,
    pub todoist: Option<TodoistConfig>,
    pub plaid: Option<PlaidConfig>,
    pub google: Option<GoogleConfig>,
    pub classifier: Option<ClassifierConfig>,
}

impl SundialConfig {
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |k: &str| get(k).filter(|v| !v.trim().is_empty());
        let parse_u64 = |k: &str, default: u64| -> Result<u64> {
            match get(k) {
                None => Ok(default),
                Some(v) => v
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| Error::InvalidInput(format!("{k} must be an integer, got '{v}'"))),
            }
        };

        let database_path = get("SUNDIAL_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/sundial.db"));

        let redis = get("SUNDIAL_REDIS_URL").map(|url| RedisConfig {
            url,
            key_prefix: get("SUNDIAL_REDIS_KEY_PREFIX").unwrap_or_else(|| "sundial".to_string()),
        });

        let sync = SyncConfig {
            adapter_timeout: Duration::from_millis(parse_u64("SUNDIAL_ADAPTER_TIMEOUT_MS", 30_000)?),
            max_concurrent_users: parse_u64("SUNDIAL_MAX_CONCURRENT_USERS", 4)? as usize,
        };

        let defaults = LimiterPolicies::default();
        let policy = |env: &str, base: RateLimitPolicy| -> Result<RateLimitPolicy> {
            let cap = parse_u64(&format!("SUNDIAL_RATE_{env}_CAP"), base.cap)?;
            let window = parse_u64(&format!("SUNDIAL_RATE_{env}_WINDOW_SECS"), base.window.as_secs())?;
            Ok(RateLimitPolicy {
                cap,
                window: Duration::from_secs(window),
                ..base
            })
        };
        let limits = LimiterPolicies {
            outbound_provider: policy("OUTBOUND", defaults.outbound_provider)?,
            inbound_webhook: policy("INBOUND", defaults.inbound_webhook)?,
            user_sync: policy("USER_SYNC", defaults.user_sync)?,
            ai_classifier: policy("CLASSIFIER", defaults.ai_classifier)?,
        };

        let todoist = get("TODOIST_CLIENT_SECRET").map(|client_secret| TodoistConfig {
            client_id: get("TODOIST_CLIENT_ID"),
            client_secret,
        });

        let plaid = match (get("PLAID_CLIENT_ID"), get("PLAID_SECRET")) {
            (Some(client_id), Some(secret)) => Some(PlaidConfig {
                client_id,
                secret,
                env: get("PLAID_ENV").unwrap_or_else(|| "sandbox".to_string()),
            }),
            (None, None) => None,
            _ => {
                return Err(Error::InvalidInput(
                    "PLAID_CLIENT_ID and PLAID_SECRET must be set together".to_string(),
                ));
            }
        };

        let google = match (get("GOOGLE_CLIENT_ID"), get("GOOGLE_CLIENT_SECRET")) {
            (Some(client_id), Some(client_secret)) => Some(GoogleConfig {
                client_id,
                client_secret,
            }),
            (None, None) => None,
            _ => {
                return Err(Error::InvalidInput(
                    "GOOGLE_CLIENT_ID and GOOGLE_CLIENT_SECRET must be set together".to_string(),
                ));
            }
        };

        let classifier = match get("SUNDIAL_CLASSIFIER_API_KEY") {
            None => None,
            Some(api_key) => Some(ClassifierConfig {
                api_base: get("SUNDIAL_CLASSIFIER_API_BASE")
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
                api_key,
                model: get("SUNDIAL_CLASSIFIER_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
                timeout: Duration::from_millis(parse_u64("SUNDIAL_CLASSIFIER_TIMEOUT_MS", 15_000)?),
            }),
        };

        let cfg = Self {
            master_key: get("SUNDIAL_MASTER_KEY"),
            database_path,
            cron_secret: get("SUNDIAL_CRON_SECRET"),
            redis,
            sync,
            limits,
            todoist,
            plaid,
            google,
            classifier,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn validate(&self) -> Result<()> {
        // Parsing the key is the check; the vault itself is rebuilt at startup.
        CredentialVault::from_key_material(self.master_key.as_deref())?;

        if self.sync.adapter_timeout.is_zero() {
            return Err(Error::InvalidInput(
                "SUNDIAL_ADAPTER_TIMEOUT_MS must be > 0".to_string(),
            ));
        }
        if self.sync.max_concurrent_users == 0 {
            return Err(Error::InvalidInput(
                "SUNDIAL_MAX_CONCURRENT_USERS must be > 0".to_string(),
            ));
        }
        for p in [
            &self.limits.outbound_provider,
            &self.limits.inbound_webhook,
            &self.limits.user_sync,
            &self.limits.ai_classifier,
        ] {
            if p.cap == 0 || p.window.is_zero() {
                return Err(Error::InvalidInput(format!(
                    "rate limit '{}' needs a positive cap and window",
                    p.name
                )));
            }
        }
        if let Some(secret) = &self.cron_secret {
            if secret.len() < 16 {
                return Err(Error::InvalidInput(
                    "SUNDIAL_CRON_SECRET must be at least 16 characters".to_string(),
                ));
            }
        }
        if let Some(plaid) = &self.plaid {
            if !matches!(plaid.env.as_str(), "sandbox" | "development" | "production") {
                return Err(Error::InvalidInput(format!(
                    "PLAID_ENV must be sandbox, development or production, got '{}'",
                    plaid.env
                )));
            }
        }
        if let Some(c) = &self.classifier {
            if !c.api_base.starts_with("http") {
                return Err(Error::InvalidInput(
                    "SUNDIAL_CLASSIFIER_API_BASE must be an http(s) url".to_string(),
                ));
            }
        }
        Ok(())
    }
}
