//! Configuration module for the forwarder.
//!
//! The pipeline consumes a finished [`ForwarderConfig`]. This module also
//! provides environment-based acquisition and the startup validation the
//! command line applies before the pipeline is built.

use std::env;
use std::time::Duration;

use uuid::Uuid;

use crate::record::RecordKind;
use crate::routing::{parse_pair, RoutingConfig, StaticMetadata};

/// Default ingestion server suffix, appended to the region
pub const DEFAULT_SERVER: &str = ".data.logs.insight.rapid7.com";

/// Default port for TLS connections
pub const DEFAULT_SECURE_PORT: u16 = 443;

/// Default port for plain-text connections
pub const DEFAULT_PLAIN_PORT: u16 = 80;

/// Default interval between stats samples in seconds
pub const DEFAULT_STATS_INTERVAL_SECS: u64 = 30;

/// Default base delay for reconnect backoff (in milliseconds).
const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 500;

/// Maximum delay between reconnect attempts (in milliseconds).
const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 30_000;

/// Errors raised while acquiring or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No stream is both enabled and tokened
    #[error("no forwarding targets enabled")]
    NoTargets,

    /// Every stream was switched off
    #[error("you need to enable either logs, stats or events")]
    NothingEnabled,

    /// A supplied token is not a UUID
    #[error("{kind} enabled but {kind} token is not a valid UUID")]
    InvalidToken { kind: RecordKind },

    /// A static metadata entry without `=`
    #[error("invalid metadata entry '{0}': expected NAME=VALUE")]
    InvalidMetadata(String),

    /// Port zero was requested
    #[error("port must be a positive integer")]
    InvalidPort,

    /// An environment variable could not be parsed
    #[error("configuration error for {env_var}: {message}")]
    Env { env_var: String, message: String },
}

impl ConfigError {
    fn env(env_var: &str, message: impl Into<String>) -> Self {
        ConfigError::Env {
            env_var: env_var.to_string(),
            message: message.into(),
        }
    }
}

/// What the filter does with a record it cannot route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnroutablePolicy {
    /// Skip the record and keep going
    #[default]
    Drop,
    /// Stop the pipeline with an error
    Reject,
}

/// Backoff between consecutive failed connection attempts.
///
/// The first attempt after a working connection drops is immediate; only
/// attempts that follow a failed attempt wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(DEFAULT_RECONNECT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_RECONNECT_MAX_DELAY_MS),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the next attempt after `failures` consecutive failures.
    ///
    /// delay = min(base * 2^(failures - 1) + jitter, max), jitter up to 25%.
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let base = self.base_delay.as_millis() as u64;
        let max = self.max_delay.as_millis() as u64;

        let exponential = base.saturating_mul(1 << (failures - 1).min(10));
        let jitter = rand::random::<u64>() % (exponential / 4 + 1);

        Duration::from_millis(exponential.saturating_add(jitter).min(max))
    }
}

/// Resolved ingestion endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

impl Endpoint {
    /// Host is `region` followed by `server`; the port defaults by mode.
    pub fn resolve(
        region: &str,
        server: &str,
        port: Option<u16>,
        secure: bool,
    ) -> Result<Self, ConfigError> {
        let port = match port {
            Some(0) => return Err(ConfigError::InvalidPort),
            Some(port) => port,
            None if secure => DEFAULT_SECURE_PORT,
            None => DEFAULT_PLAIN_PORT,
        };

        Ok(Self {
            host: format!("{}{}", region, server),
            port,
            secure,
        })
    }

    /// Endpoint for a plain-text connection to an explicit address.
    pub fn plain(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            secure: false,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Finished configuration consumed by the pipeline.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Region prefix of the ingestion host
    pub region: String,

    /// Server suffix of the ingestion host
    pub server: String,

    /// Explicit port; `None` picks the default for the mode
    pub port: Option<u16>,

    /// Connect over TLS
    pub secure: bool,

    /// Forward container logs
    pub logs: bool,

    /// Forward stats samples
    pub stats: bool,

    /// Forward Docker events
    pub docker_events: bool,

    pub logs_token: Option<String>,
    pub stats_token: Option<String>,
    pub events_token: Option<String>,

    /// Fallback for any kind without its own token
    pub token: Option<String>,

    /// Static metadata added to every record
    pub add: StaticMetadata,

    /// Producers parse log lines as JSON
    pub json: bool,

    /// Interval between stats samples
    pub stats_interval: Duration,

    /// Handling of records that cannot be routed
    pub unroutable: UnroutablePolicy,

    /// Reconnect backoff
    pub reconnect: ReconnectPolicy,
}

impl ForwarderConfig {
    /// Configuration for `region` with everything else at its default.
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            server: DEFAULT_SERVER.to_string(),
            port: None,
            secure: true,
            logs: true,
            stats: true,
            docker_events: true,
            logs_token: None,
            stats_token: None,
            events_token: None,
            token: None,
            add: StaticMetadata::new(),
            json: false,
            stats_interval: Duration::from_secs(DEFAULT_STATS_INTERVAL_SECS),
            unroutable: UnroutablePolicy::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// Load configuration from `INSIGHT_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if `INSIGHT_REGION` is missing or a numeric,
    /// boolean or metadata variable cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let region = env::var("INSIGHT_REGION")
            .map_err(|_| ConfigError::env("INSIGHT_REGION", "must be set"))?;

        let mut config = Self::new(region);

        if let Ok(server) = env::var("INSIGHT_SERVER") {
            config.server = server;
        }
        config.port = Self::parse_port()?;
        config.secure = parse_bool_var("INSIGHT_SECURE", config.secure)?;
        config.logs = parse_bool_var("INSIGHT_LOGS", config.logs)?;
        config.stats = parse_bool_var("INSIGHT_STATS", config.stats)?;
        config.docker_events = parse_bool_var("INSIGHT_DOCKER_EVENTS", config.docker_events)?;

        config.logs_token = env::var("INSIGHT_LOGSTOKEN").ok();
        config.stats_token = env::var("INSIGHT_STATSTOKEN").ok();
        config.events_token = env::var("INSIGHT_EVENTSTOKEN").ok();
        config.token = env::var("INSIGHT_TOKEN").ok();

        if let Ok(add) = env::var("INSIGHT_ADD") {
            for entry in add.split(',').map(str::trim).filter(|e| !e.is_empty()) {
                let (key, value) = parse_pair(entry)?;
                config.add.insert(key, value);
            }
        }

        if let Ok(value) = env::var("INSIGHT_STATSINTERVAL") {
            let secs: u64 = value.parse().map_err(|_| {
                ConfigError::env(
                    "INSIGHT_STATSINTERVAL",
                    format!("'{}' is not a valid number", value),
                )
            })?;
            config.stats_interval = Duration::from_secs(secs.max(1));
        }

        Ok(config)
    }

    /// Parse the port from the environment; unset means "pick by mode".
    fn parse_port() -> Result<Option<u16>, ConfigError> {
        let env_var = "INSIGHT_PORT";

        match env::var(env_var) {
            Ok(value) => {
                let port: u16 = value.parse().map_err(|_| {
                    ConfigError::env(env_var, format!("'{}' is not a valid port number", value))
                })?;

                if port == 0 {
                    return Err(ConfigError::env(env_var, "port must be greater than 0"));
                }

                Ok(Some(port))
            }
            Err(_) => Ok(None),
        }
    }

    /// Whether the stream for `kind` is switched on.
    pub fn is_enabled(&self, kind: RecordKind) -> bool {
        match kind {
            RecordKind::Logs => self.logs,
            RecordKind::Events => self.docker_events,
            RecordKind::Stats => self.stats,
        }
    }

    /// Routing tokens with the fallback token applied.
    pub fn routing(&self) -> RoutingConfig {
        RoutingConfig::resolve(
            self.logs_token.as_deref(),
            self.events_token.as_deref(),
            self.stats_token.as_deref(),
            self.token.as_deref(),
        )
    }

    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        Endpoint::resolve(&self.region, &self.server, self.port, self.secure)
    }

    /// Startup checks applied to command-line configuration.
    ///
    /// At least one stream must be switched on, and every token supplied
    /// for an enabled stream must be a UUID. Enabled streams without any
    /// token are left for the source set to skip.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.logs || self.stats || self.docker_events) {
            return Err(ConfigError::NothingEnabled);
        }

        let routing = self.routing();
        for kind in RecordKind::all() {
            if !self.is_enabled(*kind) {
                continue;
            }
            if let Some(token) = routing.token_for(*kind) {
                if !is_valid_token(token) {
                    return Err(ConfigError::InvalidToken { kind: *kind });
                }
            }
        }

        self.endpoint().map(|_| ())
    }
}

/// Tokens are lowercase hyphenated UUIDs.
pub fn is_valid_token(token: &str) -> bool {
    Uuid::try_parse(token)
        .map(|uuid| uuid.hyphenated().to_string() == token)
        .unwrap_or(false)
}

/// Best-effort hostname used for the default `host=` metadata entry.
pub fn default_hostname() -> String {
    env::var("HOSTNAME")
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|name| name.trim().to_string())
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn parse_bool_var(env_var: &str, default: bool) -> Result<bool, ConfigError> {
    match env::var(env_var) {
        Ok(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::env(
                env_var,
                format!("'{}' is not a valid boolean", value),
            )),
        },
        Err(_) => Ok(default),
    }
}
