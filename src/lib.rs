//! Container Forwarder Library
//!
//! This library forwards container records to a token-routed ingestion
//! endpoint over a single self-healing TCP or TLS connection:
//!
//! - **record**: Records and their classification into logs, events and stats
//! - **routing**: Per-stream tokens and static metadata
//! - **config**: Forwarder configuration, endpoint and reconnect policy
//! - **source**: Producer streams merged into the filter input
//! - **filter**: Enrichment, routing and wire framing
//! - **transport**: Plain TCP and TLS connectors
//! - **connection**: Connection manager with reconnection
//! - **lifecycle**: Shutdown once every source stream has closed
//! - **pipeline**: Wires the stages together
//! - **simulate**: Simulated container producers
//!
//! # Example
//!
//! ```no_run
//! use container_forwarder::config::ForwarderConfig;
//! use container_forwarder::pipeline::Pipeline;
//! use container_forwarder::simulate::{SimulatedContainers, SimulationConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut config = ForwarderConfig::new("eu");
//!     config.token = Some("0f3c4a6e-8d1b-4c2a-9e5f-7a6b5c4d3e2f".to_string());
//!     config.validate().expect("invalid configuration");
//!
//!     let producers = SimulatedContainers::new(SimulationConfig::for_forwarder(&config))
//!         .expect("invalid simulation settings")
//!         .producers();
//!
//!     let pipeline = Pipeline::new(config).expect("invalid configuration");
//!     let report = pipeline.run(producers).await.expect("forwarding failed");
//!     println!("forwarded {} frames", report.filter.frames_emitted);
//! }
//! ```

// Module declarations
pub mod config;
pub mod connection;
pub mod filter;
pub mod lifecycle;
pub mod pipeline;
pub mod record;
pub mod routing;
pub mod simulate;
pub mod source;
pub mod transport;

// Re-export commonly used types at crate root for convenience
pub use config::{ConfigError, Endpoint, ForwarderConfig, ReconnectPolicy, UnroutablePolicy};
pub use connection::{ConnectionManager, ConnectionState, ConnectionStats};
pub use filter::{FilterError, FilterStats, RoutingFilter};
pub use pipeline::{Pipeline, PipelineError, PipelineReport};
pub use record::{Fields, Record, RecordKind};
pub use routing::{RoutingConfig, StaticMetadata};
pub use source::{Producer, Producers, SourceSet};
pub use transport::{ConnectionError, Connector, TcpConnector, Transport};
