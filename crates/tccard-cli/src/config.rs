use std::path::PathBuf;
use std::time::Duration;

use tccard_analytics::CounterStoreConfig;
use tccard_core::DEFAULT_CARD_BASE_URL;
use tccard_storage::{BackoffPolicy, HttpClientConfig};

#[derive(Debug, Clone)]
pub struct TccardConfig {
    pub sources_file: PathBuf,
    pub collector_url: Option<String>,
    pub contact_form_url: Option<String>,
    pub card_base_url: String,
    pub state_dir: PathBuf,
    pub http_timeout_ms: u64,
    pub max_retries: usize,
    pub backoff_base_ms: u64,
    pub visit_cooldown_secs: u64,
    pub retry_interval_secs: u64,
    pub user_agent: String,
}

impl TccardConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let number = |key: &str, default: u64| {
            var(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        let non_empty = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        Self {
            sources_file: var("TCCARD_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./sources.yaml")),
            collector_url: non_empty("TCCARD_COLLECTOR_URL"),
            contact_form_url: non_empty("TCCARD_CONTACT_FORM_URL"),
            card_base_url: non_empty("TCCARD_CARD_BASE_URL")
                .unwrap_or_else(|| DEFAULT_CARD_BASE_URL.to_string()),
            state_dir: var("TCCARD_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./state")),
            http_timeout_ms: number("TCCARD_HTTP_TIMEOUT_MS", 5000),
            max_retries: number("TCCARD_MAX_RETRIES", 3) as usize,
            backoff_base_ms: number("TCCARD_BACKOFF_BASE_MS", 1000),
            visit_cooldown_secs: number("TCCARD_VISIT_COOLDOWN_SECS", 30 * 60),
            retry_interval_secs: number("TCCARD_RETRY_INTERVAL_SECS", 30),
            user_agent: var("TCCARD_USER_AGENT")
                .unwrap_or_else(|| format!("tccard/{}", env!("CARGO_PKG_VERSION"))),
        }
    }

    pub fn http_client(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_millis(self.http_timeout_ms),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                base_delay: Duration::from_millis(self.backoff_base_ms),
                ..BackoffPolicy::default()
            },
        }
    }

    pub fn counter_store(&self) -> CounterStoreConfig {
        CounterStoreConfig {
            visit_cooldown: Duration::from_secs(self.visit_cooldown_secs),
            retry_interval: Duration::from_secs(self.retry_interval_secs),
        }
    }
}
