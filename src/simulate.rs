//! Simulated container producers.
//!
//! Generates realistic container records for each stream so the forwarder
//! can run without a container runtime: log lines with weighted levels,
//! lifecycle events and periodic stats samples. Records carry the same
//! container metadata (`v`, `id`, `image`, `name`) a real collector attaches.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::distributions::{Distribution, WeightedError, WeightedIndex};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ForwarderConfig;
use crate::record::{Fields, Record, RecordKind};
use crate::source::{Producer, Producers, RecordStream, SOURCE_CHANNEL_CAPACITY};

/// Container images the simulation picks from.
const IMAGES: &[&str] = &[
    "nginx:1.25",
    "redis:7-alpine",
    "postgres:16",
    "node:20-slim",
    "python:3.12-slim",
];

/// Lifecycle events emitted by the simulated runtime.
const EVENT_TYPES: &[&str] = &["create", "start", "restart", "pause", "unpause", "stop", "die"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn all() -> [LogLevel; 4] {
        [
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warn,
            LogLevel::Error,
        ]
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Settings for the simulated producers.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Number of simulated containers
    pub containers: usize,

    /// Interval between log lines
    pub log_interval: Duration,

    /// Interval between lifecycle events
    pub event_interval: Duration,

    /// Interval between stats samples
    pub stats_interval: Duration,

    /// Emit log lines as JSON objects instead of text
    pub json: bool,

    /// Stop each producer after this many records
    pub limit: Option<usize>,

    /// Relative weights of debug, info, warn and error lines
    pub level_weights: [u32; 4],
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            containers: 3,
            log_interval: Duration::from_millis(200),
            event_interval: Duration::from_secs(15),
            stats_interval: Duration::from_secs(30),
            json: false,
            limit: None,
            // Mostly info, occasional warnings and errors
            level_weights: [15, 65, 13, 7],
        }
    }
}

impl SimulationConfig {
    /// Defaults with the forwarder's JSON mode and stats interval applied.
    pub fn for_forwarder(config: &ForwarderConfig) -> Self {
        Self {
            json: config.json,
            stats_interval: config.stats_interval,
            ..Self::default()
        }
    }
}

/// Identity of one simulated container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub image: String,
}

impl Container {
    fn random(index: usize, rng: &mut impl Rng) -> Self {
        let image = IMAGES.choose(rng).copied().unwrap_or("busybox:latest");
        let service = image.split(':').next().unwrap_or(image);
        let id = Uuid::new_v4().simple().to_string();

        Self {
            id: id[..12].to_string(),
            name: format!("{}-{}", service, index + 1),
            image: image.to_string(),
        }
    }

    /// Metadata attached to every record of this container.
    pub fn meta(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert("v".to_string(), json!(0));
        fields.insert("id".to_string(), json!(self.id));
        fields.insert("image".to_string(), json!(self.image));
        fields.insert("name".to_string(), json!(self.name));
        fields
    }
}

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("invalid log level weights: {0}")]
    LevelWeights(#[from] WeightedError),
}

/// Source of simulated container records.
pub struct SimulatedContainers {
    config: SimulationConfig,
    containers: Vec<Container>,
    level_weights: WeightedIndex<u32>,
}

impl SimulatedContainers {
    pub fn new(config: SimulationConfig) -> Result<Self, SimulationError> {
        let level_weights = WeightedIndex::new(config.level_weights)?;

        let mut rng = rand::thread_rng();
        let containers = (0..config.containers.max(1))
            .map(|index| Container::random(index, &mut rng))
            .collect();

        Ok(Self {
            config,
            containers,
            level_weights,
        })
    }

    pub fn containers(&self) -> &[Container] {
        &self.containers
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Generate one record of `kind` for a random container.
    pub fn generate(&self, kind: RecordKind) -> Record {
        let mut rng = rand::thread_rng();
        let index = rng.gen_range(0..self.containers.len());
        let container = &self.containers[index];

        match kind {
            RecordKind::Logs => self.log_record(&mut rng, container),
            RecordKind::Events => self.event_record(&mut rng, container),
            RecordKind::Stats => self.stats_record(&mut rng, container),
        }
    }

    fn log_record(&self, rng: &mut impl Rng, container: &Container) -> Record {
        let level = LogLevel::all()[self.level_weights.sample(rng)];
        let message = log_message(rng, level);
        let now = Utc::now();

        let line = if self.config.json {
            json!({
                "time": now.to_rfc3339(),
                "level": level,
                "msg": message,
                "request_id": Uuid::new_v4().to_string(),
            })
        } else {
            Value::String(format!("{} {} {}", now.to_rfc3339(), level, message))
        };

        Record::log(line, container.meta())
    }

    fn event_record(&self, rng: &mut impl Rng, container: &Container) -> Record {
        let event_type = EVENT_TYPES.choose(rng).copied().unwrap_or("start");
        let mut meta = container.meta();
        meta.insert("time".to_string(), json!(Utc::now().timestamp()));
        if event_type == "die" {
            meta.insert("exitCode".to_string(), json!(rng.gen_range(0..=2)));
        }

        Record::event(event_type, meta)
    }

    fn stats_record(&self, rng: &mut impl Rng, container: &Container) -> Record {
        let limit: u64 = 512 * 1024 * 1024;
        let usage = rng.gen_range(limit / 20..limit / 2);

        let stats = json!({
            "cpu_percent": (rng.gen_range(0.0..85.0_f64) * 100.0).round() / 100.0,
            "memory_stats": {
                "usage": usage,
                "limit": limit,
            },
            "networks": {
                "eth0": {
                    "rx_bytes": rng.gen_range(10_000..50_000_000u64),
                    "tx_bytes": rng.gen_range(10_000..20_000_000u64),
                },
            },
            "blkio_stats": {
                "read_bytes": rng.gen_range(0..10_000_000u64),
                "write_bytes": rng.gen_range(0..5_000_000u64),
            },
        });

        Record::stats(stats, container.meta())
    }

    /// One producer per kind, sharing this container set.
    pub fn producers(self) -> Producers {
        let shared = Arc::new(self);
        RecordKind::all()
            .iter()
            .fold(Producers::new(), |producers, kind| {
                producers.with(
                    *kind,
                    SimulatedProducer {
                        kind: *kind,
                        source: shared.clone(),
                    },
                )
            })
    }
}

fn log_message(rng: &mut impl Rng, level: LogLevel) -> String {
    match level {
        LogLevel::Debug => format!(
            "cache lookup key=session:{} hit={}",
            rng.gen_range(1000..9999),
            rng.gen_bool(0.8)
        ),
        LogLevel::Info => format!(
            "GET /api/v1/items/{} 200 {}ms",
            rng.gen_range(1..500),
            rng.gen_range(2..120)
        ),
        LogLevel::Warn => format!(
            "slow query took {}ms, threshold 500ms",
            rng.gen_range(500..3000)
        ),
        LogLevel::Error => format!(
            "upstream connection refused after {} attempts",
            rng.gen_range(1..5)
        ),
    }
}

/// Producer for one kind, emitting on that kind's interval.
pub struct SimulatedProducer {
    kind: RecordKind,
    source: Arc<SimulatedContainers>,
}

impl SimulatedProducer {
    fn period(&self) -> Duration {
        let config = self.source.config();
        match self.kind {
            RecordKind::Logs => config.log_interval,
            RecordKind::Events => config.event_interval,
            RecordKind::Stats => config.stats_interval,
        }
    }
}

impl Producer for SimulatedProducer {
    fn start(self: Box<Self>) -> RecordStream {
        let (tx, rx) = mpsc::channel(SOURCE_CHANNEL_CAPACITY);
        tokio::spawn(run_producer(*self, tx));
        rx
    }
}

/// Emit records on the producer's interval until the limit is reached or
/// the stream is dropped.
async fn run_producer(producer: SimulatedProducer, tx: mpsc::Sender<Record>) {
    let mut ticker = interval(producer.period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let limit = producer.source.config().limit;
    let mut produced: usize = 0;

    loop {
        if limit.is_some_and(|limit| produced >= limit) {
            info!(source = %producer.kind, produced, "simulated producer reached its limit");
            break;
        }

        ticker.tick().await;

        let record = producer.source.generate(producer.kind);
        if tx.send(record).await.is_err() {
            debug!(source = %producer.kind, "stream dropped, simulated producer stopping");
            break;
        }
        produced += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn fast_config(limit: usize) -> SimulationConfig {
        SimulationConfig {
            containers: 2,
            log_interval: Duration::from_millis(1),
            event_interval: Duration::from_millis(1),
            stats_interval: Duration::from_millis(1),
            limit: Some(limit),
            ..SimulationConfig::default()
        }
    }

    fn simulation(config: SimulationConfig) -> SimulatedContainers {
        SimulatedContainers::new(config).unwrap()
    }

    #[test]
    fn test_containers_have_distinct_identity() {
        let sim = simulation(fast_config(1));
        let containers = sim.containers();
        assert_eq!(containers.len(), 2);
        assert_ne!(containers[0].id, containers[1].id);
        assert_eq!(containers[0].id.len(), 12);
        assert!(containers[0].name.ends_with("-1"));
        assert!(containers[1].name.ends_with("-2"));
    }

    #[test]
    fn test_generated_records_match_kind() {
        let sim = simulation(fast_config(1));

        for kind in RecordKind::all() {
            let record = sim.generate(*kind);
            assert_eq!(record.kind(), Some(*kind));

            let fields = record.fields();
            let first = fields.keys().next().unwrap();
            assert_eq!(first, kind.discriminant());
            assert!(fields.contains_key("id"));
            assert!(fields.contains_key("image"));
            assert!(fields.contains_key("name"));
        }
    }

    #[test]
    fn test_plain_log_lines_are_text() {
        let sim = simulation(fast_config(1));
        let record = sim.generate(RecordKind::Logs);
        let line = record.fields()["line"].as_str().unwrap();
        assert!(
            ["DEBUG", "INFO", "WARN", "ERROR"]
                .iter()
                .any(|level| line.contains(level)),
            "line without level: {}",
            line
        );
    }

    #[test]
    fn test_json_log_lines_are_objects() {
        let mut config = fast_config(1);
        config.json = true;
        let sim = simulation(config);

        let record = sim.generate(RecordKind::Logs);
        let line = record.fields()["line"].as_object().unwrap();
        assert!(line.contains_key("level"));
        assert!(line.contains_key("msg"));
    }

    #[test]
    fn test_event_types_are_known() {
        let sim = simulation(fast_config(1));
        for _ in 0..20 {
            let record = sim.generate(RecordKind::Events);
            let event_type = record.fields()["type"].as_str().unwrap();
            assert!(EVENT_TYPES.contains(&event_type));
        }
    }

    #[test]
    fn test_stats_sample_shape() {
        let sim = simulation(fast_config(1));
        let record = sim.generate(RecordKind::Stats);
        let stats = &record.fields()["stats"];

        let usage = stats["memory_stats"]["usage"].as_u64().unwrap();
        let limit = stats["memory_stats"]["limit"].as_u64().unwrap();
        assert!(usage < limit);
        assert!(stats["networks"]["eth0"]["rx_bytes"].is_u64());
    }

    fn sampled_levels(sim: &SimulatedContainers, count: usize) -> Vec<LogLevel> {
        let mut rng = rand::thread_rng();
        (0..count)
            .map(|_| LogLevel::all()[sim.level_weights.sample(&mut rng)])
            .collect()
    }

    #[test]
    fn test_level_sampling_covers_levels() {
        let levels = sampled_levels(&simulation(fast_config(1)), 2000);
        assert!(levels.contains(&LogLevel::Info));
        assert!(levels.contains(&LogLevel::Error));
    }

    #[test]
    fn test_level_sampling_follows_weights() {
        let mut config = fast_config(1);
        config.level_weights = [0, 0, 0, 1];
        let levels = sampled_levels(&simulation(config), 200);
        assert!(levels.iter().all(|level| *level == LogLevel::Error));
    }

    #[test]
    fn test_zero_level_weights_rejected() {
        let mut config = fast_config(1);
        config.level_weights = [0; 4];
        assert!(matches!(
            SimulatedContainers::new(config),
            Err(SimulationError::LevelWeights(_))
        ));
    }

    #[test]
    fn test_producers_cover_every_kind() {
        let producers = simulation(fast_config(1)).producers();
        assert!(RecordKind::all().iter().all(|kind| producers.has(*kind)));
    }

    #[tokio::test]
    async fn test_producer_stops_at_limit() {
        let producer = SimulatedProducer {
            kind: RecordKind::Stats,
            source: Arc::new(simulation(fast_config(3))),
        };
        let mut stream = Box::new(producer).start();

        let mut received = 0;
        while let Some(record) = timeout(Duration::from_secs(2), stream.recv())
            .await
            .expect("producer should close its stream")
        {
            assert_eq!(record.kind(), Some(RecordKind::Stats));
            received += 1;
        }
        assert_eq!(received, 3);
    }
}
