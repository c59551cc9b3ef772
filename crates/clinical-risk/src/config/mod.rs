use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::Duration;

use crate::alerts::AlertConfig;
use crate::delivery::DeliveryConfig;
use crate::domain::RiskBand;
use crate::forecast::ForecastConfig;
use crate::intake::AssessmentSettings;
use crate::phi::{PatientRefHasher, PhiKey};
use crate::population::TrendConfig;

const MAX_TREND_WINDOW_DAYS: u32 = 3650;

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }

    pub fn is_production(self) -> bool {
        self == Self::Production
    }
}

/// Top-level configuration for the application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub engine: EngineConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig { log_level },
            engine: EngineConfig::from_env(environment)?,
        })
    }
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Tracing and metrics controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

/// Scoring, population, alerting, and delivery parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub similarity_k: usize,
    pub trend_window_days: u32,
    pub trend_min_samples: usize,
    pub forecast_horizon_days: u32,
    pub forecast_neighbor_floor: usize,
    pub alert_band_threshold: RiskBand,
    pub alert_cooldown_minutes: u32,
    pub webhook_timeout_secs: u64,
    /// Seconds after the first attempt at which each retry runs.
    pub webhook_retry_offsets: Vec<u64>,
    pub webhook_workers: usize,
    /// `None` outside production means a throwaway key is generated at startup.
    pub phi_key: Option<PhiKey>,
    pub patient_hasher: Option<PatientRefHasher>,
    pub retention_days: u32,
    pub scoring_tables: Option<PathBuf>,
    pub population_csv: Option<PathBuf>,
    pub subscriptions_file: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            similarity_k: 10,
            trend_window_days: 90,
            trend_min_samples: 30,
            forecast_horizon_days: 90,
            forecast_neighbor_floor: 5,
            alert_band_threshold: RiskBand::High,
            alert_cooldown_minutes: 1440,
            webhook_timeout_secs: 10,
            webhook_retry_offsets: vec![60, 180, 300],
            webhook_workers: 4,
            phi_key: None,
            patient_hasher: None,
            retention_days: 2555,
            scoring_tables: None,
            population_csv: None,
            subscriptions_file: None,
        }
    }
}

impl EngineConfig {
    fn from_env(environment: AppEnvironment) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let forecast_horizon_days =
            parse_var("APP_FORECAST_HORIZON_DAYS", defaults.forecast_horizon_days)?;
        let max_horizon = ForecastConfig::default().max_horizon_days;
        if forecast_horizon_days == 0 || forecast_horizon_days > max_horizon {
            return Err(ConfigError::InvalidValue {
                name: "APP_FORECAST_HORIZON_DAYS",
                reason: format!("must be between 1 and {max_horizon}"),
            });
        }

        let alert_band_threshold = match env::var("APP_ALERT_BAND_THRESHOLD") {
            Ok(value) => value.parse::<RiskBand>().map_err(|err| ConfigError::InvalidValue {
                name: "APP_ALERT_BAND_THRESHOLD",
                reason: err.to_string(),
            })?,
            Err(_) => defaults.alert_band_threshold,
        };

        let webhook_retry_offsets = match env::var("APP_WEBHOOK_RETRY_OFFSETS") {
            Ok(value) => parse_offsets(&value)?,
            Err(_) => defaults.webhook_retry_offsets.clone(),
        };

        let trend_window_days = parse_var("APP_TREND_WINDOW_DAYS", defaults.trend_window_days)?;
        if !(1..=MAX_TREND_WINDOW_DAYS).contains(&trend_window_days) {
            return Err(ConfigError::InvalidValue {
                name: "APP_TREND_WINDOW_DAYS",
                reason: format!("must be between 1 and {MAX_TREND_WINDOW_DAYS}"),
            });
        }

        let webhook_workers = parse_var("APP_WEBHOOK_WORKERS", defaults.webhook_workers)?;
        if webhook_workers == 0 {
            return Err(ConfigError::InvalidValue {
                name: "APP_WEBHOOK_WORKERS",
                reason: "must be at least 1".to_string(),
            });
        }

        let phi_key = match env::var("APP_PHI_KEY") {
            Ok(value) => Some(PhiKey::from_hex(&value).map_err(|_| ConfigError::InvalidPhiKey)?),
            Err(_) if environment.is_production() => {
                return Err(ConfigError::MissingSecret { name: "APP_PHI_KEY" })
            }
            Err(_) => None,
        };

        let patient_hasher = match env::var("APP_PATIENT_HASH_SALT") {
            Ok(value) if !value.trim().is_empty() => Some(PatientRefHasher::new(value)),
            _ if environment.is_production() => {
                return Err(ConfigError::MissingSecret {
                    name: "APP_PATIENT_HASH_SALT",
                })
            }
            _ => None,
        };

        Ok(Self {
            similarity_k: parse_var("APP_SIMILARITY_K", defaults.similarity_k)?,
            trend_window_days,
            trend_min_samples: parse_var("APP_TREND_MIN_SAMPLES", defaults.trend_min_samples)?,
            forecast_horizon_days,
            forecast_neighbor_floor: parse_var(
                "APP_FORECAST_NEIGHBOR_FLOOR",
                defaults.forecast_neighbor_floor,
            )?,
            alert_band_threshold,
            alert_cooldown_minutes: parse_var(
                "APP_ALERT_COOLDOWN_MINUTES",
                defaults.alert_cooldown_minutes,
            )?,
            webhook_timeout_secs: parse_var(
                "APP_WEBHOOK_TIMEOUT_SECS",
                defaults.webhook_timeout_secs,
            )?,
            webhook_retry_offsets,
            webhook_workers,
            phi_key,
            patient_hasher,
            retention_days: parse_var("APP_RETENTION_DAYS", defaults.retention_days)?,
            scoring_tables: path_var("APP_SCORING_TABLES"),
            population_csv: path_var("APP_POPULATION_CSV"),
            subscriptions_file: path_var("APP_SUBSCRIPTIONS_FILE"),
        })
    }

    pub fn assessment_settings(&self) -> AssessmentSettings {
        AssessmentSettings {
            similarity_k: self.similarity_k,
            trend_window: Duration::days(i64::from(self.trend_window_days)),
            forecast_horizon_days: self.forecast_horizon_days,
            retention: Duration::days(i64::from(self.retention_days)),
            trend: TrendConfig {
                min_samples: self.trend_min_samples,
                ..TrendConfig::default()
            },
            forecast: ForecastConfig {
                neighbor_floor: self.forecast_neighbor_floor,
                ..ForecastConfig::default()
            },
            alerts: AlertConfig {
                band_threshold: self.alert_band_threshold,
                cooldown: Duration::minutes(i64::from(self.alert_cooldown_minutes)),
                ..AlertConfig::default()
            },
        }
    }

    pub fn delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            retry_offsets: self
                .webhook_retry_offsets
                .iter()
                .copied()
                .map(StdDuration::from_secs)
                .collect(),
            request_timeout: StdDuration::from_secs(self.webhook_timeout_secs),
            worker_count: self.webhook_workers,
            ..DeliveryConfig::default()
        }
    }
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
            name,
            reason: format!("'{}' is not a valid value", value.trim()),
        }),
        Err(_) => Ok(default),
    }
}

fn path_var(name: &str) -> Option<PathBuf> {
    env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
}

fn parse_offsets(value: &str) -> Result<Vec<u64>, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidValue {
        name: "APP_WEBHOOK_RETRY_OFFSETS",
        reason: reason.to_string(),
    };

    let offsets = value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<u64>()
                .map_err(|_| invalid("offsets must be whole seconds"))
        })
        .collect::<Result<Vec<u64>, ConfigError>>()?;

    if offsets.windows(2).any(|pair| pair[0] >= pair[1]) {
        return Err(invalid("offsets must be strictly increasing"));
    }
    Ok(offsets)
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    InvalidValue { name: &'static str, reason: String },
    InvalidPhiKey,
    MissingSecret { name: &'static str },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::InvalidValue { name, reason } => write!(f, "{name}: {reason}"),
            ConfigError::InvalidPhiKey => {
                write!(f, "APP_PHI_KEY must be 64 hex characters (32 bytes)")
            }
            ConfigError::MissingSecret { name } => {
                write!(f, "{name} must be set in production")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidHost { source } => Some(source),
            ConfigError::InvalidPort
            | ConfigError::InvalidValue { .. }
            | ConfigError::InvalidPhiKey
            | ConfigError::MissingSecret { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::{Mutex, OnceLock};

    const VARS: &[&str] = &[
        "APP_ENV",
        "APP_HOST",
        "APP_PORT",
        "APP_LOG_LEVEL",
        "APP_SIMILARITY_K",
        "APP_TREND_WINDOW_DAYS",
        "APP_TREND_MIN_SAMPLES",
        "APP_FORECAST_HORIZON_DAYS",
        "APP_FORECAST_NEIGHBOR_FLOOR",
        "APP_ALERT_BAND_THRESHOLD",
        "APP_ALERT_COOLDOWN_MINUTES",
        "APP_WEBHOOK_TIMEOUT_SECS",
        "APP_WEBHOOK_RETRY_OFFSETS",
        "APP_WEBHOOK_WORKERS",
        "APP_PHI_KEY",
        "APP_PATIENT_HASH_SALT",
        "APP_RETENTION_DAYS",
        "APP_SCORING_TABLES",
        "APP_POPULATION_CSV",
        "APP_SUBSCRIPTIONS_FILE",
    ];

    fn env_guard() -> &'static Mutex<()> {
        static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
        GUARD.get_or_init(|| Mutex::new(()))
    }

    fn reset_env() {
        for name in VARS {
            env::remove_var(name);
        }
    }

    #[test]
    fn load_uses_defaults_when_env_missing() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        let config = AppConfig::load().expect("config loads with defaults");
        assert_eq!(config.environment, AppEnvironment::Development);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.telemetry.log_level, "info");
        assert_eq!(config.engine.similarity_k, 10);
        assert_eq!(config.engine.webhook_retry_offsets, vec![60, 180, 300]);
        assert_eq!(config.engine.alert_band_threshold, RiskBand::High);
        assert!(config.engine.phi_key.is_none());
        assert!(config.engine.scoring_tables.is_none());
    }

    #[test]
    fn accepts_localhost_host() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("APP_HOST", "localhost");
        let config = AppConfig::load().expect("config loads");
        let addr = config.server.socket_addr().expect("localhost resolves");
        assert_eq!(addr, SocketAddr::new(IpAddr::from([127, 0, 0, 1]), 3000));
    }

    #[test]
    fn engine_overrides_flow_into_component_settings() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("APP_SIMILARITY_K", "25");
        env::set_var("APP_ALERT_BAND_THRESHOLD", "critical");
        env::set_var("APP_ALERT_COOLDOWN_MINUTES", "60");
        env::set_var("APP_WEBHOOK_RETRY_OFFSETS", "30, 90");
        env::set_var("APP_WEBHOOK_WORKERS", "2");
        let config = AppConfig::load().expect("config loads");

        let settings = config.engine.assessment_settings();
        assert_eq!(settings.similarity_k, 25);
        assert_eq!(settings.alerts.band_threshold, RiskBand::Critical);
        assert_eq!(settings.alerts.cooldown, Duration::minutes(60));

        let delivery = config.engine.delivery_config();
        assert_eq!(
            delivery.retry_offsets,
            vec![StdDuration::from_secs(30), StdDuration::from_secs(90)]
        );
        assert_eq!(delivery.worker_count, 2);
        assert_eq!(delivery.max_attempts(), 3);
        reset_env();
    }

    #[test]
    fn rejects_unordered_retry_offsets() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("APP_WEBHOOK_RETRY_OFFSETS", "60,30");
        match AppConfig::load() {
            Err(ConfigError::InvalidValue { name, .. }) => {
                assert_eq!(name, "APP_WEBHOOK_RETRY_OFFSETS")
            }
            other => panic!("expected invalid offsets, got {other:?}"),
        }
        reset_env();
    }

    #[test]
    fn rejects_non_numeric_similarity_k() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("APP_SIMILARITY_K", "ten");
        let err = AppConfig::load().expect_err("invalid k");
        assert_eq!(err.to_string(), "APP_SIMILARITY_K: 'ten' is not a valid value");
        reset_env();
    }

    #[test]
    fn rejects_out_of_range_horizon() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("APP_FORECAST_HORIZON_DAYS", "400");
        assert!(matches!(
            AppConfig::load(),
            Err(ConfigError::InvalidValue {
                name: "APP_FORECAST_HORIZON_DAYS",
                ..
            })
        ));
        reset_env();
    }

    #[test]
    fn rejects_empty_or_oversized_trend_window() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        for value in ["0", "3651"] {
            reset_env();
            env::set_var("APP_TREND_WINDOW_DAYS", value);
            match AppConfig::load() {
                Err(ConfigError::InvalidValue { name, reason }) => {
                    assert_eq!(name, "APP_TREND_WINDOW_DAYS");
                    assert_eq!(reason, "must be between 1 and 3650");
                }
                other => panic!("expected invalid trend window, got {other:?}"),
            }
        }

        env::set_var("APP_TREND_WINDOW_DAYS", "1");
        let config = AppConfig::load().expect("one day is accepted");
        assert_eq!(
            config.engine.assessment_settings().trend_window,
            Duration::days(1)
        );
        reset_env();
    }

    #[test]
    fn production_requires_phi_secrets() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("APP_ENV", "production");
        assert!(matches!(
            AppConfig::load(),
            Err(ConfigError::MissingSecret { name: "APP_PHI_KEY" })
        ));

        env::set_var("APP_PHI_KEY", "ab".repeat(32));
        assert!(matches!(
            AppConfig::load(),
            Err(ConfigError::MissingSecret {
                name: "APP_PATIENT_HASH_SALT"
            })
        ));

        env::set_var("APP_PATIENT_HASH_SALT", "pepper");
        let config = AppConfig::load().expect("secrets present");
        assert!(config.engine.phi_key.is_some());
        assert!(config.engine.patient_hasher.is_some());
        reset_env();
    }

    #[test]
    fn malformed_phi_key_is_rejected_without_echoing_it() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("APP_PHI_KEY", "deadbeef");
        let err = AppConfig::load().expect_err("short key");
        assert!(matches!(err, ConfigError::InvalidPhiKey));
        assert!(!err.to_string().contains("deadbeef"));
        reset_env();
    }
}
