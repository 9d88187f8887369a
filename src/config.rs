use std::time::Duration;

use anyhow::Context;

use crate::classifier::{HttpClassifierConfig, RetryPolicy};
use crate::queue::{ClaimPolicy, QueueSettings};
use crate::triage::DEFAULT_MINUTES_PER_PATIENT;

const DEFAULT_TRIAGE_URL: &str = "https://api.groq.com/openai/v1/chat/completions";
const DEFAULT_TRIAGE_MODEL: &str = "llama-3.3-70b-versatile";

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub max_connections: u32,
    pub queue: QueueSettings,
    pub classifier: HttpClassifierConfig,
}

/// Settings for the chat-completions endpoint shared by triage and the
/// intake assistant.
#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub classifier: HttpClassifierConfig,
    pub retry: RetryPolicy,
}

impl ModelSettings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = non_blank(lookup);

        let defaults = RetryPolicy::default();
        let max_attempts = parse_or(
            get("TRIAGE_MAX_ATTEMPTS"),
            "TRIAGE_MAX_ATTEMPTS",
            defaults.max_attempts,
        )?;
        let backoff_ms = parse_or(
            get("TRIAGE_BACKOFF_MS"),
            "TRIAGE_BACKOFF_MS",
            defaults.initial_backoff.as_millis() as u64,
        )?;
        let timeout_secs = parse_or(get("TRIAGE_TIMEOUT_SECS"), "TRIAGE_TIMEOUT_SECS", 20u64)?;

        Ok(Self {
            classifier: HttpClassifierConfig {
                endpoint: get("TRIAGE_API_URL").unwrap_or_else(|| DEFAULT_TRIAGE_URL.to_string()),
                api_key: get("TRIAGE_API_KEY"),
                model: get("TRIAGE_MODEL").unwrap_or_else(|| DEFAULT_TRIAGE_MODEL.to_string()),
                request_timeout: Duration::from_secs(timeout_secs),
            },
            retry: RetryPolicy {
                max_attempts: max_attempts.max(1),
                initial_backoff: Duration::from_millis(backoff_ms),
            },
        })
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let model = ModelSettings::from_lookup(&lookup)?;
        let get = non_blank(lookup);

        let database_url = get("DATABASE_URL")
            .context("DATABASE_URL must be set to a production Postgres instance")?;

        let max_connections = parse_or(get("MEDIQ_MAX_CONNECTIONS"), "MEDIQ_MAX_CONNECTIONS", 5)?;
        let minutes_per_patient = parse_or(
            get("MEDIQ_MINUTES_PER_PATIENT"),
            "MEDIQ_MINUTES_PER_PATIENT",
            DEFAULT_MINUTES_PER_PATIENT,
        )?;
        let claim_policy = match get("MEDIQ_CLAIM_POLICY") {
            Some(value) => value
                .parse::<ClaimPolicy>()
                .context("MEDIQ_CLAIM_POLICY must be `any` or `next-only`")?,
            None => ClaimPolicy::default(),
        };

        Ok(Self {
            database_url,
            max_connections,
            queue: QueueSettings {
                minutes_per_patient,
                claim_policy,
                retry: model.retry,
            },
            classifier: model.classifier,
        })
    }
}

fn non_blank(lookup: impl Fn(&str) -> Option<String>) -> impl Fn(&str) -> Option<String> {
    move |key| {
        lookup(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}

fn parse_or<T>(value: Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("{key} has an invalid value: {raw}")),
        None => Ok(default),
    }
}
