//! Enrichment and routing filter.
//!
//! Turns each [`Record`] into one wire frame of the form
//! `<token> <json>\n`, or nothing when the record cannot be routed.

use serde_json::Value;
use tracing::{debug, trace};

use crate::config::UnroutablePolicy;
use crate::record::{Fields, Record, RecordKind};
use crate::routing::{RoutingConfig, StaticMetadata};

/// Errors from the filter stage.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    /// Record has no discriminant field
    #[error("record has no line, type or stats field")]
    Unclassified,

    /// Record kind has no token configured
    #[error("no token configured for {kind} records")]
    MissingToken { kind: RecordKind },

    /// JSON encoding failed
    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Counters kept by the filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterStats {
    /// Records taken from the sources
    pub records_received: u64,

    /// Frames handed to the connection
    pub frames_emitted: u64,

    /// Records skipped as unroutable
    pub records_dropped: u64,
}

/// Per-record transform: enrich, route, frame.
pub struct RoutingFilter {
    routing: RoutingConfig,
    metadata: StaticMetadata,
    policy: UnroutablePolicy,
    stats: FilterStats,
}

impl RoutingFilter {
    pub fn new(routing: RoutingConfig, metadata: StaticMetadata, policy: UnroutablePolicy) -> Self {
        Self {
            routing,
            metadata,
            policy,
            stats: FilterStats::default(),
        }
    }

    /// Copy of the record's fields with every metadata key overlaid.
    ///
    /// Metadata wins on collision; an overridden key keeps its position.
    pub fn enrich(&self, record: &Record) -> Fields {
        let mut fields = record.fields().clone();
        for (key, value) in self.metadata.iter() {
            fields.insert(key.to_string(), Value::String(value.to_string()));
        }
        fields
    }

    /// Kind and token for a record.
    pub fn route(&self, record: &Record) -> Result<(RecordKind, &str), FilterError> {
        let kind = record.kind().ok_or(FilterError::Unclassified)?;
        let token = self
            .routing
            .token_for(kind)
            .ok_or(FilterError::MissingToken { kind })?;
        Ok((kind, token))
    }

    /// Process one record into at most one frame.
    ///
    /// Unroutable records yield `Ok(None)` under [`UnroutablePolicy::Drop`]
    /// and an error under [`UnroutablePolicy::Reject`].
    pub fn process(&mut self, record: &Record) -> Result<Option<Vec<u8>>, FilterError> {
        self.stats.records_received += 1;

        let enriched = self.enrich(record);
        trace!(fields = enriched.len(), "enriched record");

        let (kind, token) = match self.route(record) {
            Ok(route) => route,
            Err(e) => match self.policy {
                UnroutablePolicy::Drop => {
                    debug!(reason = %e, "unable to route record, skipping");
                    self.stats.records_dropped += 1;
                    return Ok(None);
                }
                UnroutablePolicy::Reject => return Err(e),
            },
        };

        let frame = encode_frame(token, &enriched)?;
        trace!(kind = %kind, bytes = frame.len(), "framed record");

        self.stats.frames_emitted += 1;
        Ok(Some(frame))
    }

    pub fn stats(&self) -> &FilterStats {
        &self.stats
    }

    pub fn into_stats(self) -> FilterStats {
        self.stats
    }
}

/// Encode `<token> <json>\n`.
///
/// JSON encoding escapes newlines inside strings, so the trailing `\n` is
/// the only one in the frame.
pub fn encode_frame(token: &str, fields: &Fields) -> Result<Vec<u8>, serde_json::Error> {
    let mut frame = Vec::with_capacity(token.len() + 128);
    frame.extend_from_slice(token.as_bytes());
    frame.push(b' ');
    serde_json::to_writer(&mut frame, fields)?;
    frame.push(b'\n');
    Ok(frame)
}
