use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use snackngo_core::compensation::CompensationRule;
use snackngo_core::config::EngineConfig;
use snackngo_extract::GeminiConfig;

/// Everything the binary reads from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub jwt_secret: String,
    pub admin_key: Option<String>,
    pub gemini: GeminiConfig,
    pub engine: EngineConfig,
}

/// Read `key`, falling back to `default` when unset.
fn var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.into())
}

/// Read and parse `key`, falling back to `default` when unset.
fn parsed_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {:?}", key, raw)),
        Err(_) => Ok(default),
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let defaults = EngineConfig::default();
        let rule = CompensationRule::default();

        let utc_offset =
            EngineConfig::offset_from_minutes(parsed_or("SNACKNGO_UTC_OFFSET_MINUTES", 0)?);

        let engine = EngineConfig {
            max_extraction_attempts: parsed_or(
                "SNACKNGO_MAX_EXTRACTION_ATTEMPTS",
                defaults.max_extraction_attempts,
            )?,
            reminder_delay: Duration::from_secs(parsed_or(
                "SNACKNGO_REMINDER_DELAY_SECS",
                defaults.reminder_delay.as_secs(),
            )?),
            max_reminders: parsed_or("SNACKNGO_MAX_REMINDERS", defaults.max_reminders)?,
            utc_offset,
            compensation: CompensationRule {
                submission_credit_cents: parsed_or(
                    "SNACKNGO_SUBMISSION_CREDIT_CENTS",
                    rule.submission_credit_cents,
                )?,
                raffle_base_cents: parsed_or("SNACKNGO_RAFFLE_BASE_CENTS", rule.raffle_base_cents)?,
            },
            ..defaults
        };

        let mut gemini = GeminiConfig::new(
            std::env::var("GOOGLE_API_KEY").unwrap_or_default(),
            PathBuf::from(var_or("SNACKNGO_SCREENSHOT_DIR", "screenshots")),
            utc_offset,
        );
        if let Ok(model) = std::env::var("SNACKNGO_GEMINI_MODEL") {
            gemini.model = model;
        }
        if let Ok(url) = std::env::var("SNACKNGO_GEMINI_URL") {
            gemini.base_url = url;
        }
        gemini.request_timeout = Duration::from_secs(parsed_or(
            "SNACKNGO_GEMINI_TIMEOUT_SECS",
            gemini.request_timeout.as_secs(),
        )?);

        Ok(Self {
            db_path: PathBuf::from(var_or("SNACKNGO_DB_PATH", "snackngo.db")),
            host: var_or("SNACKNGO_HOST", "0.0.0.0"),
            port: parsed_or("SNACKNGO_PORT", 3000)?,
            jwt_secret: var_or("SNACKNGO_JWT_SECRET", "dev-secret-change-me"),
            admin_key: std::env::var("SNACKNGO_ADMIN_KEY")
                .ok()
                .filter(|k| !k.is_empty()),
            gemini,
            engine,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_keys_use_defaults() {
        assert_eq!(var_or("SNACKNGO_TEST_UNSET_HOST", "0.0.0.0"), "0.0.0.0");
        assert_eq!(parsed_or::<u16>("SNACKNGO_TEST_UNSET_PORT", 3000).unwrap(), 3000);
    }

    #[test]
    fn defaults_match_engine_defaults() {
        let settings = Settings::from_env().unwrap();
        let defaults = EngineConfig::default();
        assert_eq!(settings.engine.max_commit_retries, defaults.max_commit_retries);
        assert!(settings.engine.max_extraction_attempts > 0);
        assert_eq!(settings.gemini.request_timeout, Duration::from_secs(30));
    }
}
