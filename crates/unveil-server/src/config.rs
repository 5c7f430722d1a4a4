use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::error;

use unveil_engine::DispatchSettings;
use unveil_messaging::ComplianceConfig;

/// Placeholder JWT secrets that MUST NOT be used.
pub const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
];

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub webhook_secret: Option<String>,
    pub compliance: ComplianceConfig,
    pub scheduler_interval_secs: u64,
    pub scheduler_batch_size: u32,
    pub claim_timeout: chrono::Duration,
    pub dispatch: DispatchSettings,
    pub sms_webhook_url: Option<String>,
    pub push_webhook_url: Option<String>,
    pub email_webhook_url: Option<String>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Keys are the full `UNVEIL_*` names.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let jwt_secret = get("UNVEIL_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("UNVEIL_JWT_SECRET is unset or still a placeholder");
        }

        let webhook_secret = get("UNVEIL_WEBHOOK_SECRET");
        let sms_webhook_url = get("UNVEIL_SMS_WEBHOOK_URL");
        let push_webhook_url = get("UNVEIL_PUSH_WEBHOOK_URL");
        let email_webhook_url = get("UNVEIL_EMAIL_WEBHOOK_URL");
        let any_relay = sms_webhook_url.is_some() || push_webhook_url.is_some() || email_webhook_url.is_some();
        if any_relay && webhook_secret.is_none() {
            bail!("UNVEIL_WEBHOOK_SECRET is required when a relay URL is configured");
        }

        let dispatch = DispatchSettings {
            batch_size: number(&get, "UNVEIL_PROVIDER_BATCH_SIZE", 25usize)?.max(1),
            max_concurrent_batches: number(&get, "UNVEIL_PROVIDER_CONCURRENCY", 4usize)?.max(1),
            provider_timeout: Duration::from_secs(number(&get, "UNVEIL_PROVIDER_TIMEOUT_SECS", 30u64)?),
        };

        let claim_timeout_secs: i64 = number(&get, "UNVEIL_CLAIM_TIMEOUT_SECS", 900)?;

        Ok(Self {
            host: get("UNVEIL_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: number(&get, "UNVEIL_PORT", 3000)?,
            db_path: get("UNVEIL_DB_PATH").unwrap_or_else(|| "unveil.db".into()).into(),
            jwt_secret,
            webhook_secret,
            compliance: compliance(&get),
            scheduler_interval_secs: number(&get, "UNVEIL_SCHEDULER_INTERVAL_SECS", 60)?,
            scheduler_batch_size: number(&get, "UNVEIL_SCHEDULER_BATCH_SIZE", 50)?,
            claim_timeout: chrono::Duration::seconds(claim_timeout_secs),
            dispatch,
            sms_webhook_url,
            push_webhook_url,
            email_webhook_url,
        })
    }

    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}

fn number<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.parse().with_context(|| format!("{key} must be a number, got {raw:?}")),
        None => Ok(default),
    }
}

pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// An unreadable compliance flag degrades to raw bodies rather than
/// guessing which footer policy was meant.
fn compliance<G>(get: &G) -> ComplianceConfig
where
    G: Fn(&str) -> Option<String>,
{
    let mut config = ComplianceConfig::default();
    for key in ["UNVEIL_SMS_KILL_SWITCH", "UNVEIL_SMS_FULL_FALLBACK"] {
        let Some(raw) = get(key) else { continue };
        match parse_flag(&raw) {
            Some(value) if key == "UNVEIL_SMS_KILL_SWITCH" => config.kill_switch = value,
            Some(value) => config.full_fallback = config.full_fallback || value,
            None => {
                error!("{} has unreadable value {:?}; sending raw SMS bodies", key, raw);
                config.full_fallback = true;
            }
        }
    }
    config
}
