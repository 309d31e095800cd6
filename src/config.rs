use std::{env, net::SocketAddr, time::Duration};

use thiserror::Error;

#[cfg(test)]
use once_cell::sync::Lazy;
#[cfg(test)]
pub(crate) static ENV_MUTEX: Lazy<std::sync::Mutex<()>> = Lazy::new(|| std::sync::Mutex::new(()));

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    http_bind: SocketAddr,
    db_dsn: String,
    db_max_connections: u32,
    db_acquire_timeout: Duration,
    apply_schema: bool,
    discord_token: String,
    discord_api_base_url: String,
    discord_page_size: usize,
    discord_default_retry_after: Duration,
    coref_base_url: String,
    sentiment_base_url: String,
    sentiment_language: String,
    external_connect_timeout: Duration,
    external_total_timeout: Duration,
    message_min_chars: usize,
    message_max_chars: usize,
    cluster_max_gap: Duration,
    cluster_max_span: Duration,
    sentiment_unit_ceiling: usize,
    otel_sampling_ratio: f64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {source}")]
    Invalid {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl Config {
    /// Reads and validates the worker configuration from the environment.
    ///
    /// # Errors
    /// [`ConfigError::Missing`] when a required variable is unset, [`ConfigError::Invalid`]
    /// when a value does not parse or is out of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_dsn = env_var("HARMONY_DB_DSN")?;
        let db_max_connections = parse_u32("HARMONY_DB_MAX_CONNECTIONS", 10)?;
        let db_acquire_timeout = parse_duration_secs("HARMONY_DB_ACQUIRE_TIMEOUT_SECS", 30)?;
        let apply_schema = parse_bool("HARMONY_APPLY_SCHEMA", true)?;
        let http_bind = parse_socket_addr("HARMONY_HTTP_BIND", "0.0.0.0:9010")?;

        // Discord
        let discord_token = env_var("DISCORD_TOKEN")?;
        let discord_api_base_url = with_trailing_slash(
            env::var("DISCORD_API_BASE_URL")
                .unwrap_or_else(|_| "https://discord.com/api/".to_string()),
        );
        let discord_page_size = parse_positive_usize("DISCORD_PAGE_SIZE", 100)?;
        let discord_default_retry_after =
            parse_duration_ms("DISCORD_DEFAULT_RETRY_AFTER_MS", 1000)?;

        // NLP services
        let coref_base_url = with_trailing_slash(env_var("COREF_BASE_URL")?);
        let sentiment_base_url = with_trailing_slash(env_var("SENTIMENT_BASE_URL")?);
        let sentiment_language =
            env::var("SENTIMENT_LANGUAGE").unwrap_or_else(|_| "en".to_string());
        let external_connect_timeout = parse_duration_ms("EXTERNAL_CONNECT_TIMEOUT_MS", 3000)?;
        let external_total_timeout = parse_duration_ms("EXTERNAL_TOTAL_TIMEOUT_MS", 30000)?;

        // Pipeline tunables
        let message_min_chars = parse_usize("MESSAGE_MIN_CHARS", 10)?;
        let message_max_chars = parse_usize("MESSAGE_MAX_CHARS", 50)?;
        if message_min_chars > message_max_chars {
            return Err(ConfigError::Invalid {
                name: "MESSAGE_MIN_CHARS",
                source: anyhow::anyhow!(
                    "{message_min_chars} is greater than MESSAGE_MAX_CHARS ({message_max_chars})"
                ),
            });
        }
        let cluster_max_gap = parse_duration_secs("CLUSTER_MAX_GAP_SECS", 120)?;
        let cluster_max_span = parse_duration_secs("CLUSTER_MAX_SPAN_SECS", 600)?;
        let sentiment_unit_ceiling = parse_positive_usize("SENTIMENT_UNIT_CEILING", 1000)?;

        let otel_sampling_ratio = parse_f64("OTEL_SAMPLING_RATIO", 1.0)?;
        if !(0.0..=1.0).contains(&otel_sampling_ratio) {
            return Err(ConfigError::Invalid {
                name: "OTEL_SAMPLING_RATIO",
                source: anyhow::anyhow!("must be between 0.0 and 1.0"),
            });
        }

        Ok(Self {
            http_bind,
            db_dsn,
            db_max_connections,
            db_acquire_timeout,
            apply_schema,
            discord_token,
            discord_api_base_url,
            discord_page_size,
            discord_default_retry_after,
            coref_base_url,
            sentiment_base_url,
            sentiment_language,
            external_connect_timeout,
            external_total_timeout,
            message_min_chars,
            message_max_chars,
            cluster_max_gap,
            cluster_max_span,
            sentiment_unit_ceiling,
            otel_sampling_ratio,
        })
    }

    #[must_use]
    pub fn http_bind(&self) -> SocketAddr {
        self.http_bind
    }

    #[must_use]
    pub fn db_dsn(&self) -> &str {
        &self.db_dsn
    }

    #[must_use]
    pub fn db_max_connections(&self) -> u32 {
        self.db_max_connections
    }

    #[must_use]
    pub fn db_acquire_timeout(&self) -> Duration {
        self.db_acquire_timeout
    }

    #[must_use]
    pub fn apply_schema(&self) -> bool {
        self.apply_schema
    }

    #[must_use]
    pub fn discord_token(&self) -> &str {
        &self.discord_token
    }

    #[must_use]
    pub fn discord_api_base_url(&self) -> &str {
        &self.discord_api_base_url
    }

    #[must_use]
    pub fn discord_page_size(&self) -> usize {
        self.discord_page_size
    }

    #[must_use]
    pub fn discord_default_retry_after(&self) -> Duration {
        self.discord_default_retry_after
    }

    #[must_use]
    pub fn coref_base_url(&self) -> &str {
        &self.coref_base_url
    }

    #[must_use]
    pub fn sentiment_base_url(&self) -> &str {
        &self.sentiment_base_url
    }

    #[must_use]
    pub fn sentiment_language(&self) -> &str {
        &self.sentiment_language
    }

    #[must_use]
    pub fn external_connect_timeout(&self) -> Duration {
        self.external_connect_timeout
    }

    #[must_use]
    pub fn external_total_timeout(&self) -> Duration {
        self.external_total_timeout
    }

    #[must_use]
    pub fn message_min_chars(&self) -> usize {
        self.message_min_chars
    }

    #[must_use]
    pub fn message_max_chars(&self) -> usize {
        self.message_max_chars
    }

    #[must_use]
    pub fn cluster_max_gap(&self) -> Duration {
        self.cluster_max_gap
    }

    #[must_use]
    pub fn cluster_max_span(&self) -> Duration {
        self.cluster_max_span
    }

    #[must_use]
    pub fn sentiment_unit_ceiling(&self) -> usize {
        self.sentiment_unit_ceiling
    }

    #[must_use]
    pub fn otel_sampling_ratio(&self) -> f64 {
        self.otel_sampling_ratio
    }
}

fn env_var(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

/// `Url::join` drops the last path segment of a base without a trailing slash.
fn with_trailing_slash(mut url: String) -> String {
    if !url.ends_with('/') {
        url.push('/');
    }
    url
}

fn parse_socket_addr(name: &'static str, default: &str) -> Result<SocketAddr, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_duration_secs(name: &'static str, default_secs: u64) -> Result<Duration, ConfigError> {
    let value = parse_u64(name, default_secs)?;
    Ok(Duration::from_secs(value))
}

fn parse_duration_ms(name: &'static str, default_ms: u64) -> Result<Duration, ConfigError> {
    let value = parse_u64(name, default_ms)?;
    Ok(Duration::from_millis(value))
}

fn parse_usize(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<usize>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_positive_usize(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    let parsed = parse_usize(name, default)?;
    if parsed == 0 {
        return Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("must be greater than zero"),
        });
    }
    Ok(parsed)
}

fn parse_u32(name: &'static str, default: u32) -> Result<u32, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<u32>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<u64>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_f64(name: &'static str, default: f64) -> Result<f64, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<f64>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    match raw.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("invalid boolean value: {raw}"),
        }),
    }
}

#[cfg(test)]
const ALL_VARS: &[&str] = &[
    "HARMONY_DB_DSN",
    "HARMONY_DB_MAX_CONNECTIONS",
    "HARMONY_DB_ACQUIRE_TIMEOUT_SECS",
    "HARMONY_APPLY_SCHEMA",
    "HARMONY_HTTP_BIND",
    "DISCORD_TOKEN",
    "DISCORD_API_BASE_URL",
    "DISCORD_PAGE_SIZE",
    "DISCORD_DEFAULT_RETRY_AFTER_MS",
    "COREF_BASE_URL",
    "SENTIMENT_BASE_URL",
    "SENTIMENT_LANGUAGE",
    "EXTERNAL_CONNECT_TIMEOUT_MS",
    "EXTERNAL_TOTAL_TIMEOUT_MS",
    "MESSAGE_MIN_CHARS",
    "MESSAGE_MAX_CHARS",
    "CLUSTER_MAX_GAP_SECS",
    "CLUSTER_MAX_SPAN_SECS",
    "SENTIMENT_UNIT_CEILING",
    "OTEL_SAMPLING_RATIO",
];

/// Removes every variable [`Config::from_env`] reads. Callers hold [`ENV_MUTEX`].
#[cfg(test)]
pub(crate) fn reset_test_env() {
    for name in ALL_VARS {
        // SAFETY: callers serialise environment access through `ENV_MUTEX`.
        unsafe {
            env::remove_var(name);
        }
    }
}
