//! Configuration types, read from the environment.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::migration::router::{AutoRollbackConfig, RolloutMode, RoutingConfig};
use crate::phone::DEFAULT_COUNTRY_CODE;
use crate::pipeline::area::{ALL_AREAS, Area};
use crate::pipeline::evaluator::EvaluatorConfig;

const DEFAULT_WHATSAPP_API_BASE: &str = "https://graph.facebook.com/v21.0";

/// WhatsApp Cloud API credentials.
#[derive(Debug, Clone)]
pub struct WhatsAppConfig {
    pub api_base: String,
    pub phone_number_id: String,
    pub access_token: SecretString,
    pub send_timeout: Duration,
}

/// Present only when a legacy implementation is configured.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub legacy_url: String,
    pub legacy_timeout: Duration,
    pub routing: RoutingConfig,
    pub health_window: chrono::Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub whatsapp: WhatsAppConfig,
    pub evaluator: EvaluatorConfig,
    pub country_code: String,
    /// Per-queue notification webhook (`LEAD_ROUTER_NOTIFY_<AREA>`).
    pub notify_urls: HashMap<Area, String>,
    pub notify_timeout: Duration,
    pub migration: Option<MigrationConfig>,
    /// Daily-rolling log files go here when set.
    pub log_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup (the environment in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);

        let whatsapp = WhatsAppConfig {
            api_base: env
                .string("WHATSAPP_API_BASE")
                .unwrap_or_else(|| DEFAULT_WHATSAPP_API_BASE.to_string()),
            phone_number_id: env.required("WHATSAPP_PHONE_NUMBER_ID")?,
            access_token: SecretString::from(env.required("WHATSAPP_ACCESS_TOKEN")?),
            send_timeout: Duration::from_secs(env.parse_or("LEAD_ROUTER_SEND_TIMEOUT_SECS", 10)?),
        };

        let defaults = EvaluatorConfig::default();
        let evaluator = EvaluatorConfig {
            antiloop_window_minutes: env
                .parse_or("LEAD_ROUTER_ANTILOOP_MINUTES", defaults.antiloop_window_minutes)?,
            messaging_window_hours: env
                .parse_or("LEAD_ROUTER_MESSAGING_WINDOW_HOURS", defaults.messaging_window_hours)?,
            lead_window_hours: env.parse_or("LEAD_ROUTER_LEAD_WINDOW_HOURS", defaults.lead_window_hours)?,
            ..defaults
        };

        let notify_urls = ALL_AREAS
            .iter()
            .filter_map(|area| {
                let key = format!("LEAD_ROUTER_NOTIFY_{}", area.as_str().to_uppercase());
                env.string(&key).map(|url| (*area, url))
            })
            .collect();

        let migration = match env.string("LEAD_ROUTER_LEGACY_URL") {
            Some(legacy_url) => Some(migration_config(&env, legacy_url)?),
            None => None,
        };

        Ok(Self {
            port: env.parse_or("LEAD_ROUTER_PORT", 8080)?,
            db_path: env
                .string("LEAD_ROUTER_DB_PATH")
                .unwrap_or_else(|| "./data/lead-router.db".to_string())
                .into(),
            whatsapp,
            evaluator,
            country_code: env
                .string("LEAD_ROUTER_COUNTRY_CODE")
                .unwrap_or_else(|| DEFAULT_COUNTRY_CODE.to_string()),
            notify_urls,
            notify_timeout: Duration::from_secs(env.parse_or("LEAD_ROUTER_NOTIFY_TIMEOUT_SECS", 5)?),
            migration,
            log_dir: env.string("LEAD_ROUTER_LOG_DIR").map(PathBuf::from),
        })
    }
}

fn migration_config(env: &Env<'_>, legacy_url: String) -> Result<MigrationConfig, ConfigError> {
    let percentage: u8 = env.parse_or("LEAD_ROUTER_ROLLOUT_PERCENTAGE", 0)?;
    if percentage > 100 {
        return Err(ConfigError::InvalidValue {
            key: "LEAD_ROUTER_ROLLOUT_PERCENTAGE".into(),
            message: format!("{percentage} is above 100"),
        });
    }

    let defaults = AutoRollbackConfig::default();
    let routing = RoutingConfig {
        percentage,
        mode: env.parse_or("LEAD_ROUTER_ROLLOUT_MODE", RolloutMode::Active)?,
        auto_rollback: AutoRollbackConfig {
            enabled: env.parse_or("LEAD_ROUTER_AUTO_ROLLBACK", defaults.enabled)?,
            max_error_rate: env.parse_or("LEAD_ROUTER_MAX_ERROR_RATE", defaults.max_error_rate)?,
            max_p95_latency_ms: env.parse_or("LEAD_ROUTER_MAX_P95_MS", defaults.max_p95_latency_ms)?,
            max_consecutive_failures: env
                .parse_or("LEAD_ROUTER_MAX_CONSECUTIVE_FAILURES", defaults.max_consecutive_failures)?,
        },
    };

    Ok(MigrationConfig {
        legacy_url,
        legacy_timeout: Duration::from_secs(env.parse_or("LEAD_ROUTER_LEGACY_TIMEOUT_SECS", 10)?),
        routing,
        health_window: chrono::Duration::minutes(env.parse_or("LEAD_ROUTER_HEALTH_WINDOW_MINUTES", 10)?),
    })
}

struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    /// Non-empty, trimmed value.
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.string(key)
            .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(key) {
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
            None => Ok(default),
        }
    }
}
