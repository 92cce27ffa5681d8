//! Forwarding pipeline: sources, filter, lifecycle and connection wired
//! together.
//!
//! The filter and the lifecycle coordinator share one loop over the merged
//! source input. Each source's close notification follows its last record,
//! so when the coordinator sees the final close every frame has already
//! been queued for the connection manager.

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, Endpoint, ForwarderConfig, ReconnectPolicy, UnroutablePolicy};
use crate::connection::{ConnectionManager, ConnectionState, ConnectionStats};
use crate::filter::{FilterError, FilterStats, RoutingFilter};
use crate::lifecycle::LifecycleCoordinator;
use crate::routing::{RoutingConfig, StaticMetadata};
use crate::source::{Producers, SourceEvent, SourceSet};
use crate::transport::{ConnectionError, Connector, TcpConnector};

/// Capacity of the merged source input.
const EVENT_CHANNEL_CAPACITY: usize = 1_000;

/// Capacity of the frame queue between filter and connection.
const FRAME_CHANNEL_CAPACITY: usize = 1_000;

/// Errors that stop the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error("pipeline task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Outcome of a pipeline that ran until all sources closed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub filter: FilterStats,
    pub connection: ConnectionStats,
}

pub struct Pipeline {
    config: ForwarderConfig,
    endpoint: Endpoint,
    routing: RoutingConfig,
    metadata: StaticMetadata,
    policy: UnroutablePolicy,
    reconnect: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
}

impl Pipeline {
    /// Resolve endpoint, routing tokens and metadata from `config`.
    pub fn new(config: ForwarderConfig) -> Result<Self, ConfigError> {
        let endpoint = config.endpoint()?;
        let routing = config.routing();
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Ok(Self {
            endpoint,
            routing,
            metadata: config.add.clone(),
            policy: config.unroutable,
            reconnect: config.reconnect.clone(),
            config,
            state,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn routing(&self) -> &RoutingConfig {
        &self.routing
    }

    /// Watch the connection state.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Run against the configured endpoint over TCP or TLS.
    ///
    /// Configuration errors are reported before any connection attempt.
    pub async fn run(self, producers: Producers) -> Result<PipelineReport, PipelineError> {
        SourceSet::plan(&self.config, &self.routing, &producers)?;
        let connector = TcpConnector::new(self.endpoint.clone())?;
        self.run_with(connector, producers).await
    }

    /// Run with a custom connector.
    pub async fn run_with<C: Connector>(
        self,
        connector: C,
        producers: Producers,
    ) -> Result<PipelineReport, PipelineError> {
        let (event_tx, mut event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let sources = SourceSet::start(&self.config, &self.routing, producers, event_tx)?;

        info!(
            endpoint = %self.endpoint,
            secure = self.endpoint.secure,
            sources = sources.len(),
            metadata = self.metadata.len(),
            "starting forwarding pipeline"
        );

        let shutdown = CancellationToken::new();
        let mut lifecycle =
            LifecycleCoordinator::new(sources.kinds().iter().copied(), shutdown.clone());

        let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let manager = ConnectionManager::with_state(connector, self.reconnect, self.state);
        let mut connection = tokio::spawn(manager.run(frame_rx, shutdown.clone()));

        let mut filter = RoutingFilter::new(self.routing, self.metadata, self.policy);
        let dispatch = async move {
            while let Some(event) = event_rx.recv().await {
                match event {
                    SourceEvent::Record(record) => {
                        let Some(frame) = filter.process(&record)? else {
                            continue;
                        };
                        if frame_tx.send(frame).await.is_err() {
                            debug!("connection manager stopped, dispatch ending");
                            break;
                        }
                    }
                    SourceEvent::Closed(kind) => {
                        if lifecycle.source_closed(kind) {
                            break;
                        }
                    }
                }
            }
            Ok::<FilterStats, FilterError>(filter.into_stats())
        };
        tokio::pin!(dispatch);

        let filter_stats = tokio::select! {
            dispatched = &mut dispatch => match dispatched {
                Ok(stats) => stats,
                Err(e) => {
                    warn!(error = %e, "filter rejected a record, stopping pipeline");
                    shutdown.cancel();
                    sources.abort();
                    let _ = connection.await;
                    return Err(e.into());
                }
            },
            finished = &mut connection => {
                sources.abort();
                let stats = finished??;
                warn!("connection manager stopped before the sources closed");
                return Ok(PipelineReport {
                    filter: FilterStats::default(),
                    connection: stats,
                });
            }
        };

        // Sources ended without the coordinator reaching zero only if the
        // merged input closed early; make sure the connection still winds down.
        shutdown.cancel();
        let connection_stats = connection.await??;

        info!(
            records = filter_stats.records_received,
            frames = filter_stats.frames_emitted,
            dropped = filter_stats.records_dropped,
            reconnects = connection_stats.reconnects,
            "forwarding pipeline finished"
        );

        Ok(PipelineReport {
            filter: filter_stats,
            connection: connection_stats,
        })
    }
}
