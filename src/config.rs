use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::db::Database;

/// Runtime configuration. Everything here has a sensible default; values
/// stored in the `settings` table or environment take precedence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Fingerprint score a template must reach before zone extraction is
    /// trusted and the AI fallback is skipped. Range 0-100.
    pub match_threshold: f64,
    /// Minimum share of zone-extracted lines (against template expectation)
    /// before the worker falls back to the AI anyway. Range 0-1.
    pub min_zone_coverage: f64,
    /// Per-line deviation between qty × unit price and the stated total
    /// before a discount is flagged, as a fraction (0.01 = 1%).
    pub line_tolerance: Decimal,
    /// Header-level deviation between Σ line totals and the declared net
    /// total before a data-quality warning is raised.
    pub header_tolerance: Decimal,
    /// AI provider endpoint and model.
    pub ai_endpoint: String,
    pub ai_model: String,
    /// Encrypted at rest; decrypted on load. Absence is a configuration
    /// error surfaced when the AI path is actually needed.
    pub ai_api_key: Option<String>,
    /// In-call retry bound for overloaded responses.
    pub ai_max_attempts: u32,
    /// Backoff base for in-call retries, in milliseconds.
    pub ai_backoff_ms: u64,
    /// Per-request timeout for the AI call, distinct from the job timeout.
    pub ai_timeout_secs: u64,
    /// Retry worker: cooldown before a transiently failed invoice is
    /// re-submitted, and the overall retry bound.
    pub retry_cooldown_secs: i64,
    pub max_retries: u32,
    pub retry_interval_secs: u64,
    /// Recovery sweep: stuck timeout, sweep interval and batch bound.
    pub stuck_timeout_secs: i64,
    pub recovery_interval_secs: u64,
    pub recovery_batch: u32,
    /// Template learning: sample size before confidence is trusted and the
    /// success-rate floor below which a template is deactivated.
    pub learning_min_samples: u32,
    pub deactivate_floor: f64,
    /// Number of concurrent worker tasks.
    pub worker_count: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            match_threshold: 80.0,
            min_zone_coverage: 0.5,
            line_tolerance: Decimal::new(1, 2),   // 1%
            header_tolerance: Decimal::new(2, 2), // 2%
            ai_endpoint: "https://generativelanguage.googleapis.com/v1beta/models".to_string(),
            ai_model: "gemini-2.0-flash".to_string(),
            ai_api_key: None,
            ai_max_attempts: 3,
            ai_backoff_ms: 500,
            ai_timeout_secs: 60,
            retry_cooldown_secs: 300,
            max_retries: 3,
            retry_interval_secs: 60,
            stuck_timeout_secs: 300,
            recovery_interval_secs: 120,
            recovery_batch: 25,
            learning_min_samples: 3,
            deactivate_floor: 20.0,
            worker_count: 2,
        }
    }
}

impl Settings {
    /// Defaults overlaid with persisted settings and environment. The API
    /// key env var wins over the (encrypted) settings row.
    pub fn load(db: &Database) -> Self {
        let mut settings = Settings::default();

        if let Some(value) = get_parsed(db, "match_threshold") {
            settings.match_threshold = value;
        }
        if let Some(value) = get_parsed(db, "min_zone_coverage") {
            settings.min_zone_coverage = value;
        }
        if let Some(value) = get_parsed(db, "line_tolerance") {
            settings.line_tolerance = value;
        }
        if let Some(value) = get_parsed(db, "header_tolerance") {
            settings.header_tolerance = value;
        }
        if let Some(value) = get_string(db, "ai_endpoint") {
            settings.ai_endpoint = value;
        }
        if let Some(value) = get_string(db, "ai_model") {
            settings.ai_model = value;
        }
        if let Some(value) = get_parsed(db, "ai_max_attempts") {
            settings.ai_max_attempts = value;
        }
        if let Some(value) = get_parsed(db, "max_retries") {
            settings.max_retries = value;
        }
        if let Some(value) = get_parsed(db, "stuck_timeout_secs") {
            settings.stuck_timeout_secs = value;
        }
        if let Some(value) = get_parsed(db, "retry_cooldown_secs") {
            settings.retry_cooldown_secs = value;
        }
        if let Some(value) = get_parsed(db, "worker_count") {
            settings.worker_count = value;
        }

        settings.ai_api_key = std::env::var("INVOX_AI_API_KEY").ok().or_else(|| {
            get_string(db, "ai_api_key")
                .and_then(|stored| crate::services::crypto::decrypt_api_key(&stored).ok())
        });

        settings
    }
}

/// Persist the AI API key, encrypted at rest.
pub fn store_api_key(db: &Database, key: &str) -> crate::error::Result<()> {
    let encrypted = crate::services::crypto::encrypt_api_key(key)?;
    db.set_setting("ai_api_key", &encrypted)?;
    Ok(())
}

fn get_string(db: &Database, key: &str) -> Option<String> {
    db.get_setting(key).ok().flatten()
}

fn get_parsed<T: std::str::FromStr>(db: &Database, key: &str) -> Option<T> {
    get_string(db, key).and_then(|v| v.parse().ok())
}
