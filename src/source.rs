//! Source set: the producer streams feeding the pipeline.
//!
//! Producers are external collaborators. Each one hands over a bounded
//! channel of [`Record`]s; the source set decides which of them to start and
//! pumps their output into the single merged input of the filter, followed
//! by a close notification once a stream ends.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::{ConfigError, ForwarderConfig};
use crate::record::{Record, RecordKind};
use crate::routing::RoutingConfig;

/// Capacity of each producer's output channel.
pub const SOURCE_CHANNEL_CAPACITY: usize = 256;

/// Output of one producer.
pub type RecordStream = mpsc::Receiver<Record>;

/// Something that produces a stream of records once started.
pub trait Producer: Send {
    /// Start producing. The stream closes when the producer is done.
    fn start(self: Box<Self>) -> RecordStream;
}

/// A pre-built stream is a producer that is already running.
impl Producer for RecordStream {
    fn start(self: Box<Self>) -> RecordStream {
        *self
    }
}

/// Merged input of the filter.
#[derive(Debug)]
pub enum SourceEvent {
    /// A record from the named stream
    Record(Record),
    /// The named stream ended; sent once, after its last record
    Closed(RecordKind),
}

/// Producers available for each kind.
#[derive(Default)]
pub struct Producers {
    logs: Option<Box<dyn Producer>>,
    events: Option<Box<dyn Producer>>,
    stats: Option<Box<dyn Producer>>,
}

impl Producers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the producer for `kind`, replacing any previous one.
    #[must_use]
    pub fn with(mut self, kind: RecordKind, producer: impl Producer + 'static) -> Self {
        *self.slot_mut(kind) = Some(Box::new(producer));
        self
    }

    pub fn has(&self, kind: RecordKind) -> bool {
        match kind {
            RecordKind::Logs => self.logs.is_some(),
            RecordKind::Events => self.events.is_some(),
            RecordKind::Stats => self.stats.is_some(),
        }
    }

    fn take(&mut self, kind: RecordKind) -> Option<Box<dyn Producer>> {
        self.slot_mut(kind).take()
    }

    fn slot_mut(&mut self, kind: RecordKind) -> &mut Option<Box<dyn Producer>> {
        match kind {
            RecordKind::Logs => &mut self.logs,
            RecordKind::Events => &mut self.events,
            RecordKind::Stats => &mut self.stats,
        }
    }
}

/// The running producer streams.
pub struct SourceSet {
    kinds: Vec<RecordKind>,
    pumps: Vec<JoinHandle<()>>,
}

impl SourceSet {
    /// Kinds that would be started: enabled, tokened, and with a producer.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoTargets`] when no kind qualifies.
    pub fn plan(
        config: &ForwarderConfig,
        routing: &RoutingConfig,
        producers: &Producers,
    ) -> Result<Vec<RecordKind>, ConfigError> {
        let kinds: Vec<RecordKind> = RecordKind::all()
            .iter()
            .copied()
            .filter(|kind| {
                let enabled = config.is_enabled(*kind);
                let tokened = routing.token_for(*kind).is_some();
                let available = producers.has(*kind);
                if !(enabled && tokened && available) {
                    debug!(
                        source = %kind,
                        enabled,
                        tokened,
                        available,
                        "condition for source stream not met"
                    );
                }
                enabled && tokened && available
            })
            .collect();

        if kinds.is_empty() {
            return Err(ConfigError::NoTargets);
        }
        Ok(kinds)
    }

    /// Start the planned producers and pump them into `events`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: &ForwarderConfig,
        routing: &RoutingConfig,
        mut producers: Producers,
        events: mpsc::Sender<SourceEvent>,
    ) -> Result<Self, ConfigError> {
        let kinds = Self::plan(config, routing, &producers)?;

        let mut pumps = Vec::with_capacity(kinds.len());
        for kind in &kinds {
            let Some(producer) = producers.take(*kind) else {
                continue;
            };
            let stream = producer.start();
            pumps.push(tokio::spawn(pump(*kind, stream, events.clone())));
            info!(source = %kind, "source stream created");
        }

        Ok(Self { kinds, pumps })
    }

    /// Kinds of the streams that were created.
    pub fn kinds(&self) -> &[RecordKind] {
        &self.kinds
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Stop pumping; producers see their channel close and wind down.
    pub fn abort(&self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

/// Forward one stream into the merged input, then report its closure.
async fn pump(kind: RecordKind, mut stream: RecordStream, events: mpsc::Sender<SourceEvent>) {
    while let Some(record) = stream.recv().await {
        if events.send(SourceEvent::Record(record)).await.is_err() {
            debug!(source = %kind, "merged input closed, stopping source pump");
            return;
        }
    }

    debug!(source = %kind, "source stream closed");
    let _ = events.send(SourceEvent::Closed(kind)).await;
}
