use std::{env, fmt::Display, fs::read_to_string, path::PathBuf, str::FromStr};

use chrono::Duration;
use log::{info, warn};

use crate::error::ConfigError;

// upper bounds keep the derived durations well inside chrono's range
const MAX_SESSION_HOURS: i64 = 24 * 365;
const MAX_OTP_TTL_MINUTES: i64 = 24 * 60;
const MAX_OTP_RESEND_SECONDS: i64 = 24 * 60 * 60;

/// SMTP relay settings, present only when mail delivery is configured
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
    pub starttls: bool,
}

/// Server configuration
///
/// Every value comes from the environment and falls back to a logged default.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub static_dir: PathBuf,
    pub session_hours: i64,
    pub otp_ttl_minutes: i64,
    pub otp_max_attempts: u32,
    pub otp_resend_seconds: i64,
    pub archive_interval_seconds: u64,
    pub smtp: Option<SmtpConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 3000,
            data_dir: PathBuf::from("database"),
            static_dir: PathBuf::from("static"),
            session_hours: 24,
            otp_ttl_minutes: 10,
            otp_max_attempts: 5,
            otp_resend_seconds: 60,
            archive_interval_seconds: 3600,
            smtp: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let config = Self {
            bind: try_load("GLUCOLOG_BIND", "127.0.0.1")?,
            port: try_load("GLUCOLOG_PORT", "3000")?,
            data_dir: try_load("GLUCOLOG_DATA_DIR", "database")?,
            static_dir: try_load("GLUCOLOG_STATIC_DIR", "static")?,
            session_hours: in_range(
                "GLUCOLOG_SESSION_HOURS",
                try_load("GLUCOLOG_SESSION_HOURS", "24")?,
                1,
                MAX_SESSION_HOURS,
            )?,
            otp_ttl_minutes: in_range(
                "GLUCOLOG_OTP_TTL_MINUTES",
                try_load("GLUCOLOG_OTP_TTL_MINUTES", "10")?,
                1,
                MAX_OTP_TTL_MINUTES,
            )?,
            otp_max_attempts: try_load_positive("GLUCOLOG_OTP_MAX_ATTEMPTS", "5")?,
            otp_resend_seconds: in_range(
                "GLUCOLOG_OTP_RESEND_SECONDS",
                try_load("GLUCOLOG_OTP_RESEND_SECONDS", "60")?,
                0,
                MAX_OTP_RESEND_SECONDS,
            )?,
            archive_interval_seconds: try_load_positive("GLUCOLOG_ARCHIVE_INTERVAL_SECONDS", "3600")?,
            smtp: load_smtp()?,
        };

        if config.smtp.is_none() {
            warn!("SMTP is not configured, outgoing mail will only be logged");
        }

        Ok(config)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::hours(self.session_hours)
    }

    pub fn otp_ttl(&self) -> Duration {
        Duration::minutes(self.otp_ttl_minutes)
    }

    pub fn otp_resend_cooldown(&self) -> Duration {
        Duration::seconds(self.otp_resend_seconds)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse<T: FromStr>(key: &'static str, value: String) -> Result<T, ConfigError>
where
    T::Err: Display,
{
    value.trim().parse().map_err(|e: T::Err| {
        warn!("Invalid {key} value: {e}");
        ConfigError::Invalid {
            key,
            value,
            reason: e.to_string(),
        }
    })
}

fn try_load<T: FromStr>(key: &'static str, default: &str) -> Result<T, ConfigError>
where
    T::Err: Display,
{
    let value = var(key).unwrap_or_else(|| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });
    parse(key, value)
}

fn try_load_positive<T>(key: &'static str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default + Display,
    T::Err: Display,
{
    let value: T = try_load(key, default)?;
    if value <= T::default() {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

fn in_range<T>(key: &'static str, value: T, min: T, max: T) -> Result<T, ConfigError>
where
    T: PartialOrd + Display,
{
    if value < min || value > max {
        warn!("Invalid {key} value {value}: must be between {min} and {max}");
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: format!("must be between {min} and {max}"),
        });
    }
    Ok(value)
}

fn read_secret(path: &str) -> Result<String, ConfigError> {
    read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|source| {
            warn!("Failed to read secret from {path}: {source}");
            ConfigError::Secret {
                path: path.to_string(),
                source,
            }
        })
}

fn load_smtp() -> Result<Option<SmtpConfig>, ConfigError> {
    let (Some(host), Some(username)) = (var("SMTP_HOST"), var("SMTP_USERNAME")) else {
        return Ok(None);
    };

    let password = match (var("SMTP_PASSWORD"), var("SMTP_PASSWORD_FILE")) {
        (Some(password), _) => password,
        (None, Some(path)) => read_secret(&path)?,
        (None, None) => {
            warn!("SMTP_HOST is set but no SMTP password was provided");
            return Ok(None);
        }
    };

    let from = var("SMTP_FROM").unwrap_or_else(|| format!("Glucolog <{username}>"));

    Ok(Some(SmtpConfig {
        host,
        port: try_load("SMTP_PORT", "465")?,
        username,
        password,
        from,
        starttls: try_load("SMTP_STARTTLS", "false")?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_reports_the_offending_key() {
        let err = parse::<u16>("GLUCOLOG_PORT", "not-a-port".to_string()).unwrap_err();
        match err {
            ConfigError::Invalid { key, value, .. } => {
                assert_eq!(key, "GLUCOLOG_PORT");
                assert_eq!(value, "not-a-port");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn default_durations() {
        let config = Config::default();
        assert_eq!(config.session_ttl(), Duration::hours(24));
        assert_eq!(config.otp_ttl(), Duration::minutes(10));
        assert_eq!(config.address(), "127.0.0.1:3000");
    }

    #[test]
    fn durations_outside_chrono_range_are_rejected() {
        let err = in_range("GLUCOLOG_SESSION_HOURS", i64::MAX, 1, MAX_SESSION_HOURS).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "GLUCOLOG_SESSION_HOURS",
                ..
            }
        ));
        assert!(in_range("GLUCOLOG_OTP_TTL_MINUTES", 0, 1, MAX_OTP_TTL_MINUTES).is_err());
        assert!(in_range("GLUCOLOG_OTP_RESEND_SECONDS", -5, 0, MAX_OTP_RESEND_SECONDS).is_err());
        assert_eq!(in_range("GLUCOLOG_OTP_RESEND_SECONDS", 0, 0, MAX_OTP_RESEND_SECONDS).unwrap(), 0);

        // the largest accepted values still produce durations
        let config = Config {
            session_hours: MAX_SESSION_HOURS,
            otp_ttl_minutes: MAX_OTP_TTL_MINUTES,
            otp_resend_seconds: MAX_OTP_RESEND_SECONDS,
            ..Config::default()
        };
        assert_eq!(config.session_ttl(), Duration::days(365));
        assert_eq!(config.otp_ttl(), Duration::days(1));
        assert_eq!(config.otp_resend_cooldown(), Duration::days(1));
    }

    #[test]
    fn missing_secret_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing");
        assert!(read_secret(path.to_str().unwrap()).is_err());
    }
}
