//! Application configuration module
//! Handles environment variable loading, configuration validation, and application settings

use std::env;
use std::str::FromStr;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    /// `None` when external services are skipped
    pub database: Option<DatabaseConfig>,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
    pub payment: PaymentConfig,
    pub skip_externals: bool,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout: u64,   // seconds
    pub idle_timeout: Option<u64>, // seconds
}

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub redis_url: String,
    pub default_ttl: u64, // seconds
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log format options
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Plain,
}

/// Payment orchestration settings
#[derive(Debug, Clone)]
pub struct PaymentConfig {
    /// How long a pending attempt blocks a new one for the same order
    pub pending_ttl_secs: u64,
    pub checkout_ticket_ttl_secs: u64,
    pub route_refresh_interval_secs: u64,
    /// Every charge settles through the sandbox channel
    pub sandbox_mode: bool,
    /// Public base URL providers call back on, e.g. `https://pay.example.com`
    pub callback_base_url: String,
    pub background_queue_capacity: usize,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            pending_ttl_secs: 1800,
            checkout_ticket_ttl_secs: 900,
            route_refresh_interval_secs: 180,
            sandbox_mode: false,
            callback_base_url: "http://localhost:8000".to_string(),
            background_queue_capacity: 1024,
        }
    }
}

fn parse_var<T: FromStr>(name: &str, default: &str) -> Result<T, ConfigError> {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue(name.to_string()))
}

fn flag(name: &str) -> bool {
    env::var(name)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenv::dotenv().ok();

        let skip_externals = flag("SKIP_EXTERNALS");
        let database = if skip_externals {
            None
        } else {
            Some(DatabaseConfig::from_env()?)
        };

        Ok(AppConfig {
            server: ServerConfig::from_env()?,
            database,
            cache: CacheConfig::from_env()?,
            logging: LoggingConfig::from_env()?,
            payment: PaymentConfig::from_env()?,
            skip_externals,
        })
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        if let Some(database) = &self.database {
            database.validate()?;
        }
        if !self.skip_externals {
            self.cache.validate()?;
        }
        self.logging.validate()?;
        self.payment.validate()?;

        Ok(())
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(ServerConfig {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: parse_var("SERVER_PORT", "8000")?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue(
                "SERVER_PORT cannot be 0".to_string(),
            ));
        }

        if self.host.is_empty() {
            return Err(ConfigError::InvalidValue(
                "SERVER_HOST cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(DatabaseConfig {
            url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::MissingVariable("DATABASE_URL".to_string()))?,
            max_connections: parse_var("DB_MAX_CONNECTIONS", "20")?,
            min_connections: parse_var("DB_MIN_CONNECTIONS", "5")?,
            connection_timeout: parse_var("DB_CONNECTION_TIMEOUT", "30")?,
            idle_timeout: env::var("DB_IDLE_TIMEOUT")
                .ok()
                .and_then(|val| val.parse().ok()),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::InvalidValue("DATABASE_URL".to_string()));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()));
        }

        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidValue(
                "DB_MIN_CONNECTIONS must be <= DB_MAX_CONNECTIONS".to_string(),
            ));
        }

        Ok(())
    }
}

impl CacheConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(CacheConfig {
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            default_ttl: parse_var("CACHE_DEFAULT_TTL", "3600")?,
            max_connections: parse_var("CACHE_MAX_CONNECTIONS", "10")?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::InvalidValue("REDIS_URL".to_string()));
        }

        if !self.redis_url.starts_with("redis://") && !self.redis_url.starts_with("rediss://") {
            return Err(ConfigError::InvalidValue(
                "REDIS_URL must start with redis:// or rediss://".to_string(),
            ));
        }

        Ok(())
    }
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "plain".to_string())
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Plain,
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.level.to_uppercase().as_str()) {
            return Err(ConfigError::InvalidValue("LOG_LEVEL".to_string()));
        }

        Ok(())
    }
}

impl PaymentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = PaymentConfig::default();
        Ok(PaymentConfig {
            pending_ttl_secs: parse_var(
                "PAYMENT_PENDING_TTL_SECS",
                &defaults.pending_ttl_secs.to_string(),
            )?,
            checkout_ticket_ttl_secs: parse_var(
                "CHECKOUT_TICKET_TTL_SECS",
                &defaults.checkout_ticket_ttl_secs.to_string(),
            )?,
            route_refresh_interval_secs: parse_var(
                "ROUTE_REFRESH_INTERVAL_SECS",
                &defaults.route_refresh_interval_secs.to_string(),
            )?,
            sandbox_mode: flag("PAYMENT_SANDBOX_MODE"),
            callback_base_url: env::var("PAYMENT_CALLBACK_BASE_URL")
                .unwrap_or(defaults.callback_base_url),
            background_queue_capacity: parse_var(
                "BACKGROUND_QUEUE_CAPACITY",
                &defaults.background_queue_capacity.to_string(),
            )?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pending_ttl_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "PAYMENT_PENDING_TTL_SECS".to_string(),
            ));
        }
        if self.route_refresh_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "ROUTE_REFRESH_INTERVAL_SECS".to_string(),
            ));
        }
        if self.background_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "BACKGROUND_QUEUE_CAPACITY".to_string(),
            ));
        }
        if !self.callback_base_url.starts_with("http://")
            && !self.callback_base_url.starts_with("https://")
        {
            return Err(ConfigError::InvalidValue(
                "PAYMENT_CALLBACK_BASE_URL must be a valid URL".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid value for configuration: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_validation() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8000,
        };

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_port_validation() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_payment_defaults_are_valid() {
        let config = PaymentConfig::default();
        assert_eq!(config.pending_ttl_secs, 1800);
        assert_eq!(config.route_refresh_interval_secs, 180);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_payment_callback_url_must_be_http() {
        let config = PaymentConfig {
            callback_base_url: "pay.example.com".to_string(),
            ..PaymentConfig::default()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_level_validation() {
        let config = LoggingConfig {
            level: "chatty".to_string(),
            format: LogFormat::Plain,
        };
        assert!(config.validate().is_err());
    }
}
