//! Container Forwarder - streams container logs, events and stats to a
//! token-routed ingestion endpoint.
//!
//! Records from the simulated container producers are enriched with static
//! metadata, prefixed with the token for their stream and written as
//! newline-delimited frames over one TCP or TLS connection that reconnects
//! on failure.
//!
//! ## Configuration
//!
//! Every option can be given on the command line; the tokens, region,
//! server and port also fall back to their `INSIGHT_*` environment
//! variables. `RUST_LOG` overrides `--log-level`.

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use container_forwarder::config::{
    default_hostname, ConfigError, ForwarderConfig, UnroutablePolicy, DEFAULT_SERVER,
};
use container_forwarder::pipeline::{Pipeline, PipelineError};
use container_forwarder::routing::{parse_pair, StaticMetadata};
use container_forwarder::simulate::{SimulatedContainers, SimulationConfig};
use container_forwarder::transport::ConnectionError;

/// Forward container logs, events and stats
#[derive(Parser, Debug)]
#[command(name = "container-forwarder")]
#[command(version, about, long_about = None)]
struct Args {
    /// Region of the ingestion endpoint, e.g. eu or us
    #[arg(short, long, env = "INSIGHT_REGION")]
    region: String,

    /// Add NAME=VALUE to every record (repeatable, defaults to host=<hostname>)
    #[arg(short, long = "add", value_name = "NAME=VALUE")]
    add: Vec<String>,

    /// Seconds between stats samples
    #[arg(short = 'i', long = "statsinterval", default_value_t = 30)]
    stats_interval: u64,

    /// Stream log lines as JSON objects
    #[arg(short, long)]
    json: bool,

    /// Token for Docker events
    #[arg(short = 'e', long = "eventstoken", env = "INSIGHT_EVENTSTOKEN")]
    events_token: Option<String>,

    /// Token for container logs
    #[arg(short = 'l', long = "logstoken", env = "INSIGHT_LOGSTOKEN")]
    logs_token: Option<String>,

    /// Token for stats samples
    #[arg(short = 'k', long = "statstoken", env = "INSIGHT_STATSTOKEN")]
    stats_token: Option<String>,

    /// Token for any stream without its own
    #[arg(short, long, env = "INSIGHT_TOKEN")]
    token: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, env = "INSIGHT_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Deprecated, use --log-level debug
    #[arg(long, hide = true)]
    debug: bool,

    /// Do not stream Docker events
    #[arg(long)]
    no_docker_events: bool,

    /// Deprecated spelling of --no-docker-events
    #[arg(long = "no-dockerEvents", hide = true)]
    no_docker_events_legacy: bool,

    /// Do not stream container logs
    #[arg(long)]
    no_logs: bool,

    /// Do not stream stats
    #[arg(long)]
    no_stats: bool,

    /// Connect in plain text
    #[arg(long)]
    no_secure: bool,

    /// Port of the ingestion endpoint (default 443, or 80 with --no-secure)
    #[arg(long, env = "INSIGHT_PORT")]
    port: Option<u16>,

    /// Server suffix appended to the region
    #[arg(long, env = "INSIGHT_SERVER", default_value = DEFAULT_SERVER)]
    server: String,

    /// Skip records that cannot be routed (default)
    #[arg(long, conflicts_with = "reject_unroutable")]
    drop_unroutable: bool,

    /// Stop with an error on a record that cannot be routed
    #[arg(long)]
    reject_unroutable: bool,

    /// Stop each simulated producer after this many records
    #[arg(long, value_name = "N")]
    limit: Option<usize>,
}

impl Args {
    fn log_level(&self) -> &str {
        if self.debug {
            "debug"
        } else {
            &self.log_level
        }
    }

    fn warn_deprecated(&self) {
        if self.no_docker_events_legacy {
            warn!("'--no-dockerEvents' has been renamed to '--no-docker-events' and will be removed");
        }
        if self.debug {
            warn!("'--debug' is deprecated, use '--log-level debug'");
        }
    }

    fn metadata(&self) -> Result<StaticMetadata, ConfigError> {
        let mut metadata = StaticMetadata::from_pairs([("host", default_hostname())]);
        for entry in &self.add {
            let (key, value) = parse_pair(entry)?;
            metadata.insert(key, value);
        }
        Ok(metadata)
    }

    /// Build and validate the forwarder configuration.
    fn into_config(self) -> Result<ForwarderConfig, ConfigError> {
        let mut config = ForwarderConfig::new(self.region.clone());
        config.add = self.metadata()?;
        config.server = self.server;
        config.port = self.port;
        config.secure = !self.no_secure;
        config.logs = !self.no_logs;
        config.stats = !self.no_stats;
        config.docker_events = !(self.no_docker_events || self.no_docker_events_legacy);
        config.logs_token = self.logs_token;
        config.stats_token = self.stats_token;
        config.events_token = self.events_token;
        config.token = self.token;
        config.json = self.json;
        config.stats_interval = std::time::Duration::from_secs(self.stats_interval.max(1));
        config.unroutable = if self.reject_unroutable {
            UnroutablePolicy::Reject
        } else {
            UnroutablePolicy::Drop
        };

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();

    init_tracing(args.log_level());
    args.warn_deprecated();

    let limit = args.limit;
    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };

    let mut simulation = SimulationConfig::for_forwarder(&config);
    simulation.limit = limit;
    let producers = match SimulatedContainers::new(simulation) {
        Ok(containers) => containers.producers(),
        Err(e) => {
            error!(error = %e, "Invalid simulation settings");
            std::process::exit(1);
        }
    };

    let pipeline = match Pipeline::new(config) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };

    info!(
        endpoint = %pipeline.endpoint(),
        streams = pipeline.routing().routable_kinds().count(),
        "Container Forwarder starting"
    );

    tokio::select! {
        result = pipeline.run(producers) => match result {
            Ok(report) => {
                info!(
                    frames = report.filter.frames_emitted,
                    dropped = report.filter.records_dropped,
                    bytes = report.connection.bytes_written,
                    lost = report.connection.frames_lost,
                    "All streams closed"
                );
            }
            Err(PipelineError::Connection(e @ ConnectionError::Unauthorized { .. })) => {
                error!(error = %e, "Secure connection rejected, exiting");
                std::process::exit(1);
            }
            Err(e) => {
                error!(error = %e, "Forwarder stopped");
                std::process::exit(1);
            }
        },
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => info!("Shutdown signal received, stopping..."),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        },
    }

    info!("Container Forwarder stopped");
}

/// Initialize the tracing subscriber; `RUST_LOG` takes precedence over `level`.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use container_forwarder::record::RecordKind;

    const TOKEN: &str = "0f3c4a6e-8d1b-4c2a-9e5f-7a6b5c4d3e2f";

    fn parse(extra: &[&str]) -> Result<Args, clap::Error> {
        let mut argv = vec!["container-forwarder", "--region", "eu"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv)
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["--token", TOKEN]).unwrap();
        assert_eq!(args.stats_interval, 30);
        assert_eq!(args.log_level(), "info");

        let config = args.into_config().unwrap();
        assert!(config.secure);
        assert!(config.logs && config.stats && config.docker_events);
        assert_eq!(config.unroutable, UnroutablePolicy::Drop);
        assert!(config.add.get("host").is_some());
        assert_eq!(config.routing().token_for(RecordKind::Stats), Some(TOKEN));
    }

    #[test]
    fn test_add_overrides_default_host() {
        let args = parse(&["--token", TOKEN, "-a", "host=h1", "-a", "env=prod"]).unwrap();
        let config = args.into_config().unwrap();

        let entries: Vec<_> = config.add.iter().collect();
        assert_eq!(entries, vec![("host", "h1"), ("env", "prod")]);
    }

    #[test]
    fn test_malformed_add_rejected() {
        let args = parse(&["--token", TOKEN, "--add", "novalue"]).unwrap();
        assert!(matches!(
            args.into_config(),
            Err(ConfigError::InvalidMetadata(_))
        ));
    }

    #[test]
    fn test_legacy_no_docker_events() {
        let args = parse(&["--token", TOKEN, "--no-dockerEvents"]).unwrap();
        let config = args.into_config().unwrap();
        assert!(!config.docker_events);
    }

    #[test]
    fn test_debug_flag_sets_level() {
        let args = parse(&["--debug"]).unwrap();
        assert_eq!(args.log_level(), "debug");
    }

    #[test]
    fn test_all_streams_disabled() {
        let args = parse(&["--token", TOKEN, "--no-logs", "--no-stats", "--no-docker-events"])
            .unwrap();
        assert!(matches!(args.into_config(), Err(ConfigError::NothingEnabled)));
    }

    #[test]
    fn test_reject_unroutable() {
        let args = parse(&["--token", TOKEN, "--reject-unroutable"]).unwrap();
        assert_eq!(args.into_config().unwrap().unroutable, UnroutablePolicy::Reject);

        assert!(parse(&["--drop-unroutable", "--reject-unroutable"]).is_err());
    }

    #[test]
    fn test_plain_text_port() {
        let args = parse(&["--token", TOKEN, "--no-secure"]).unwrap();
        let endpoint = args.into_config().unwrap().endpoint().unwrap();
        assert_eq!(endpoint.port, 80);
        assert!(!endpoint.secure);
    }
}
