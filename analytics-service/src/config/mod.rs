use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AnalyticsConfig {
    pub common: core_config::Config,
    pub mongodb: MongoConfig,
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub redis: Option<RedisConfig>,
    pub otlp_endpoint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MongoConfig {
    pub uri: Secret<String>,
    pub database: String,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub timeout_seconds: u64,
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StoreBackend {
    Mongo,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mongo" | "mongodb" => Ok(StoreBackend::Mongo),
            "memory" => Ok(StoreBackend::Memory),
            _ => Err(format!("Invalid store backend: {}", s)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_seconds: u64,
    pub purge_interval_seconds: u64,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_seconds.max(1))
    }
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: Secret<String>,
}

impl AnalyticsConfig {
    pub fn load() -> Result<Self, AppError> {
        // Common config handles .env and the APP__ prefix.
        let mut common = core_config::Config::load()?;
        if let Ok(level) = env::var("LOG_LEVEL") {
            common.log_level = level;
        }

        let is_prod = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string()) == "prod";

        let backend: StoreBackend = get_env("STORE_BACKEND", Some("mongo"), is_prod)?
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;
        let needs_mongo = is_prod && backend == StoreBackend::Mongo;

        let timeout_seconds: u64 = parse_env("STORE_TIMEOUT_SECONDS", 10)?;
        if timeout_seconds == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "STORE_TIMEOUT_SECONDS must be greater than zero"
            )));
        }

        Ok(AnalyticsConfig {
            common,
            mongodb: MongoConfig {
                uri: Secret::new(get_env(
                    "MONGODB_URI",
                    Some("mongodb://localhost:27017"),
                    needs_mongo,
                )?),
                database: get_env("MONGODB_DATABASE", Some("invoicing_db"), needs_mongo)?,
            },
            store: StoreConfig {
                backend,
                timeout_seconds,
            },
            cache: CacheConfig {
                enabled: parse_env("CACHE_ENABLED", true)?,
                ttl_seconds: parse_env("CACHE_TTL_SECONDS", 300)?,
                purge_interval_seconds: parse_env("CACHE_PURGE_INTERVAL_SECONDS", 60)?,
            },
            redis: env::var("REDIS_URL").ok().map(|url| RedisConfig {
                url: Secret::new(url),
            }),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
        })
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(val) => val.parse().map_err(|e: T::Err| {
            AppError::ConfigError(anyhow::anyhow!("{} has an invalid value: {}", key, e))
        }),
        Err(_) => Ok(default),
    }
}
