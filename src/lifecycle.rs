//! Lifecycle coordinator.
//!
//! Tracks which source streams are still open. When the last one closes it
//! cancels the shutdown token, which stops reconnection and closes the
//! outbound connection.

use std::collections::BTreeSet;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::record::RecordKind;

pub struct LifecycleCoordinator {
    open: BTreeSet<RecordKind>,
    shutdown: CancellationToken,
}

impl LifecycleCoordinator {
    /// Start tracking the streams that were actually created.
    pub fn new(kinds: impl IntoIterator<Item = RecordKind>, shutdown: CancellationToken) -> Self {
        Self {
            open: kinds.into_iter().collect(),
            shutdown,
        }
    }

    /// Number of streams still open.
    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn is_finished(&self) -> bool {
        self.open.is_empty()
    }

    /// Record that the stream for `kind` closed.
    ///
    /// Each stream is counted once; repeated or unknown notifications are
    /// ignored. Returns `true` when this closes the last stream.
    pub fn source_closed(&mut self, kind: RecordKind) -> bool {
        if !self.open.remove(&kind) {
            debug!(source = %kind, "ignoring close of a stream that is not open");
            return false;
        }

        debug!(
            source = %kind,
            remaining = self.open.len(),
            "stream closed"
        );

        if self.open.is_empty() {
            info!("all source streams closed, shutting down connection");
            self.shutdown.cancel();
            return true;
        }
        false
    }
}
