use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub tokens: TokenConfig,
    pub devices: DeviceConfig,
    pub security: SecurityConfig,
    pub swagger: SwaggerConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub access_lifetime_minutes: i64,
    pub refresh_lifetime_hours: i64,
    pub long_term_lifetime_days: i64,
    pub rotation_threshold: f64,
    pub auto_rotate: bool,
    pub min_refresh_interval_seconds: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub max_devices_per_user: u32,
    pub default_trust_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
    pub mobile_api_key: String,
    pub require_signatures: bool,
    pub require_nonce: bool,
    pub timestamp_tolerance_seconds: i64,
    pub trusted_paths: Vec<String>,
    pub excluded_paths: Vec<String>,
    pub max_failed_attempts: i64,
    pub lockout_duration_seconds: i64,
    pub instrument_success: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwaggerConfig {
    pub enabled: SwaggerMode,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum SwaggerMode {
    Public,
    Disabled,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub register_attempts: u32,
    pub register_window_seconds: u64,
    pub global_ip_limit: u32,
    pub global_ip_window_seconds: u64,
}

impl AuthConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let config = AuthConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("device-auth-service"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None, is_prod)?,
                max_connections: get_env("DATABASE_MAX_CONNECTIONS", Some("10"), is_prod)?
                    .parse()
                    .unwrap_or(10),
            },
            redis: RedisConfig {
                url: get_env("REDIS_URL", None, is_prod)?,
            },
            tokens: TokenConfig {
                access_lifetime_minutes: get_env("ACCESS_TOKEN_TTL_MINUTES", Some("15"), is_prod)?
                    .parse()
                    .map_err(|e: std::num::ParseIntError| {
                        AppError::ConfigError(anyhow::anyhow!(e.to_string()))
                    })?,
                refresh_lifetime_hours: get_env("REFRESH_TOKEN_TTL_HOURS", Some("24"), is_prod)?
                    .parse()
                    .map_err(|e: std::num::ParseIntError| {
                        AppError::ConfigError(anyhow::anyhow!(e.to_string()))
                    })?,
                long_term_lifetime_days: get_env("LONG_TERM_TOKEN_TTL_DAYS", Some("30"), is_prod)?
                    .parse()
                    .map_err(|e: std::num::ParseIntError| {
                        AppError::ConfigError(anyhow::anyhow!(e.to_string()))
                    })?,
                rotation_threshold: get_env("ROTATION_THRESHOLD", Some("0.8"), is_prod)?
                    .parse()
                    .unwrap_or(0.8),
                auto_rotate: get_env("AUTO_ROTATE", Some("true"), is_prod)?
                    .parse()
                    .unwrap_or(true),
                min_refresh_interval_seconds: get_env(
                    "MIN_REFRESH_INTERVAL_SECONDS",
                    Some("60"),
                    is_prod,
                )?
                .parse()
                .unwrap_or(60),
            },
            devices: DeviceConfig {
                max_devices_per_user: get_env("MAX_DEVICES_PER_USER", Some("5"), is_prod)?
                    .parse()
                    .unwrap_or(5),
                default_trust_days: get_env("TRUST_DEFAULT_DAYS", Some("30"), is_prod)?
                    .parse()
                    .unwrap_or(30),
            },
            security: SecurityConfig {
                allowed_origins: get_env(
                    "ALLOWED_ORIGINS",
                    Some("http://localhost:3000"),
                    is_prod,
                )?
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
                mobile_api_key: get_env("MOBILE_API_KEY", None, true)?,
                require_signatures: get_env("REQUIRE_SIGNATURES", Some("true"), is_prod)?
                    .parse()
                    .unwrap_or(true),
                require_nonce: get_env("REQUIRE_NONCE", Some("true"), is_prod)?
                    .parse()
                    .unwrap_or(true),
                timestamp_tolerance_seconds: get_env(
                    "TIMESTAMP_TOLERANCE_SECONDS",
                    Some("300"),
                    is_prod,
                )?
                .parse()
                .unwrap_or(300),
                trusted_paths: split_paths(&get_env("TRUSTED_PATHS", Some(""), is_prod)?),
                excluded_paths: split_paths(&get_env(
                    "SIGNATURE_EXCLUDED_PATHS",
                    Some("/devices/register"),
                    is_prod,
                )?),
                max_failed_attempts: get_env("MAX_FAILED_ATTEMPTS", Some("5"), is_prod)?
                    .parse()
                    .unwrap_or(5),
                lockout_duration_seconds: get_env(
                    "LOCKOUT_DURATION_SECONDS",
                    Some("900"),
                    is_prod,
                )?
                .parse()
                .unwrap_or(900),
                instrument_success: get_env("INSTRUMENT_VALIDATION_SUCCESS", Some("false"), is_prod)?
                    .parse()
                    .unwrap_or(false),
            },
            swagger: SwaggerConfig {
                enabled: get_env("ENABLE_SWAGGER", Some("public"), is_prod)?
                    .parse()
                    .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?,
            },
            rate_limit: RateLimitConfig {
                register_attempts: get_env("RATE_LIMIT_REGISTER_ATTEMPTS", Some("3"), is_prod)?
                    .parse()
                    .unwrap_or(3),
                register_window_seconds: get_env(
                    "RATE_LIMIT_REGISTER_WINDOW_SECONDS",
                    Some("3600"),
                    is_prod,
                )?
                .parse()
                .unwrap_or(3600),
                global_ip_limit: get_env("RATE_LIMIT_GLOBAL_IP_LIMIT", Some("100"), is_prod)?
                    .parse()
                    .unwrap_or(100),
                global_ip_window_seconds: get_env(
                    "RATE_LIMIT_GLOBAL_IP_WINDOW_SECONDS",
                    Some("60"),
                    is_prod,
                )?
                .parse()
                .unwrap_or(60),
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.tokens.access_lifetime_minutes <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "ACCESS_TOKEN_TTL_MINUTES must be positive"
            )));
        }

        if self.tokens.refresh_lifetime_hours <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "REFRESH_TOKEN_TTL_HOURS must be positive"
            )));
        }

        if !(0.0..=1.0).contains(&self.tokens.rotation_threshold) {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "ROTATION_THRESHOLD must be within [0.0, 1.0]"
            )));
        }

        if self.devices.default_trust_days <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "TRUST_DEFAULT_DAYS must be positive"
            )));
        }

        if self.security.timestamp_tolerance_seconds <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "TIMESTAMP_TOLERANCE_SECONDS must be positive"
            )));
        }

        if self.security.mobile_api_key.len() < 16 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "MOBILE_API_KEY must be at least 16 characters"
            )));
        }

        // In production, ensure stricter validation
        if self.environment == Environment::Prod {
            if self.security.allowed_origins.iter().any(|o| o == "*") {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Wildcard CORS origin not allowed in production"
                )));
            }

            if !self.security.require_signatures {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "REQUIRE_SIGNATURES must be enabled in production"
                )));
            }

            if self.swagger.enabled == SwaggerMode::Public {
                tracing::warn!(
                    "Swagger is publicly accessible in production - consider disabling it"
                );
            }
        }

        Ok(())
    }
}

fn split_paths(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
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

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

impl std::str::FromStr for SwaggerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "public" => Ok(SwaggerMode::Public),
            "disabled" => Ok(SwaggerMode::Disabled),
            _ => Err(format!("Invalid swagger mode: {}", s)),
        }
    }
}
