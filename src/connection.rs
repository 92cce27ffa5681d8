//! Connection manager: owns the single outbound connection.
//!
//! The manager runs as one task and drives an explicit state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Connecting -> ... -> Closed
//!                     |
//!                     +-> Fatal (secure authorization failed)
//! ```
//!
//! Frames from the filter arrive over a bounded channel. While the manager
//! is connecting it stops reading that channel, so the filter and the
//! sources behind it pause instead of buffering without limit. The filter
//! ending does not end the connection; only the shutdown token does.
//!
//! Shutdown never waits on a peer that stopped reading: a blocked write is
//! abandoned when the token fires, and the final flush of queued frames is
//! bounded by the flush timeout.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::ReconnectPolicy;
use crate::transport::{ConnectionError, Connector};

/// Time allowed to write queued frames and close the transport at shutdown.
pub const DEFAULT_SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// States of the outbound connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Secure authorization failed; terminal
    Fatal,
    /// Shut down after all sources closed; terminal
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Fatal => write!(f, "fatal"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Statistics about connection operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Successful connection handshakes
    pub connects: u64,

    /// Connections re-established after a loss
    pub reconnects: u64,

    /// Failed connection attempts
    pub failed_attempts: u64,

    /// Frames written to a connection
    pub frames_written: u64,

    /// Bytes written to a connection
    pub bytes_written: u64,

    /// Frames lost to a failed write or discarded at shutdown
    pub frames_lost: u64,
}

/// Why a connected session ended.
enum Session {
    /// Shutdown requested between frames; the stream is at a frame boundary
    Shutdown,
    /// Shutdown requested while a write was blocked
    Interrupted,
    Lost(String),
}

/// Keeps the filter's output drained into one live connection.
pub struct ConnectionManager<C: Connector> {
    connector: C,
    policy: ReconnectPolicy,
    flush_timeout: Duration,
    state: watch::Sender<ConnectionState>,
    stats: ConnectionStats,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, policy: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self::with_state(connector, policy, state)
    }

    /// Create a manager publishing its state on an existing channel.
    pub fn with_state(
        connector: C,
        policy: ReconnectPolicy,
        state: watch::Sender<ConnectionState>,
    ) -> Self {
        state.send_replace(ConnectionState::Disconnected);
        Self {
            connector,
            policy,
            flush_timeout: DEFAULT_SHUTDOWN_FLUSH_TIMEOUT,
            state,
            stats: ConnectionStats::default(),
        }
    }

    /// Bound the time spent flushing queued frames at shutdown.
    #[must_use]
    pub fn with_flush_timeout(mut self, flush_timeout: Duration) -> Self {
        self.flush_timeout = flush_timeout;
        self
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Run until `shutdown` is cancelled or a fatal error occurs.
    ///
    /// Transport failures are never returned: the manager reconnects,
    /// immediately after a live connection drops and with backoff after
    /// failed attempts.
    pub async fn run(
        mut self,
        mut frames: mpsc::Receiver<Vec<u8>>,
        shutdown: CancellationToken,
    ) -> Result<ConnectionStats, ConnectionError> {
        let endpoint = self.connector.endpoint().to_string();
        let mut failures: u32 = 0;
        let mut frames_open = true;

        loop {
            self.set_state(ConnectionState::Connecting);

            let attempt = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(self.close(&mut frames)),
                attempt = self.connector.connect() => attempt,
            };

            let stream = match attempt {
                Ok(stream) => stream,
                Err(e) if e.is_fatal() => {
                    error!(endpoint = %endpoint, error = %e, "unrecoverable connection failure");
                    self.set_state(ConnectionState::Fatal);
                    return Err(e);
                }
                Err(e) => {
                    failures += 1;
                    self.stats.failed_attempts += 1;
                    let delay = self.policy.delay(failures);
                    warn!(
                        endpoint = %endpoint,
                        error = %e,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        "connection attempt failed, retrying"
                    );

                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => return Ok(self.close(&mut frames)),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
            };

            failures = 0;
            self.stats.connects += 1;
            if self.stats.connects > 1 {
                self.stats.reconnects += 1;
            }
            self.set_state(ConnectionState::Connected);
            info!(endpoint = %endpoint, "connected to ingestion endpoint");

            let (mut reader, mut writer) = tokio::io::split(stream);
            let session = self
                .session(&mut reader, &mut writer, &mut frames, &mut frames_open, &shutdown)
                .await;

            match session {
                Session::Shutdown => {
                    let deadline = Instant::now() + self.flush_timeout;
                    if self.flush_queued(&mut writer, &mut frames, deadline).await {
                        match timeout_at(deadline, writer.shutdown()).await {
                            Ok(Err(e)) => debug!(error = %e, "error while shutting down connection"),
                            Err(_) => debug!("timed out shutting down connection"),
                            Ok(Ok(())) => {}
                        }
                    }
                    return Ok(self.close(&mut frames));
                }
                Session::Interrupted => {
                    warn!(endpoint = %endpoint, "write blocked at shutdown, dropping connection");
                    return Ok(self.close(&mut frames));
                }
                Session::Lost(reason) => {
                    warn!(endpoint = %endpoint, reason = %reason, "connection lost, reconnecting");
                }
            }
        }
    }

    /// Pump frames into a live connection until it ends or shutdown.
    async fn session<R, W>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        frames: &mut mpsc::Receiver<Vec<u8>>,
        frames_open: &mut bool,
        shutdown: &CancellationToken,
    ) -> Session
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut scratch = [0u8; 512];

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Session::Shutdown,
                read = reader.read(&mut scratch) => match read {
                    Ok(0) => return Session::Lost("remote closed the connection".to_string()),
                    Ok(n) => trace!(bytes = n, "discarding inbound bytes"),
                    Err(e) => return Session::Lost(e.to_string()),
                },
                frame = frames.recv(), if *frames_open => match frame {
                    Some(frame) => {
                        tokio::select! {
                            biased;
                            _ = shutdown.cancelled() => {
                                self.stats.frames_lost += 1;
                                return Session::Interrupted;
                            }
                            written = write_frame(writer, &frame) => match written {
                                Ok(()) => self.frame_written(&frame),
                                Err(e) => {
                                    self.stats.frames_lost += 1;
                                    return Session::Lost(e.to_string());
                                }
                            },
                        }
                    }
                    None => {
                        debug!("filter output ended, keeping connection open");
                        *frames_open = false;
                    }
                },
            }
        }
    }

    fn frame_written(&mut self, frame: &[u8]) {
        self.stats.frames_written += 1;
        self.stats.bytes_written += frame.len() as u64;
    }

    /// Write frames already queued when shutdown was requested.
    ///
    /// Returns `false` if a write failed or `deadline` passed; the frame in
    /// flight is then counted as lost.
    async fn flush_queued<W>(
        &mut self,
        writer: &mut W,
        frames: &mut mpsc::Receiver<Vec<u8>>,
        deadline: Instant,
    ) -> bool
    where
        W: AsyncWrite + Unpin,
    {
        while let Ok(frame) = frames.try_recv() {
            match timeout_at(deadline, write_frame(writer, &frame)).await {
                Ok(Ok(())) => self.frame_written(&frame),
                Ok(Err(e)) => {
                    warn!(error = %e, "failed to flush queued frame during shutdown");
                    self.stats.frames_lost += 1;
                    return false;
                }
                Err(_) => {
                    warn!(
                        timeout_ms = self.flush_timeout.as_millis() as u64,
                        "timed out flushing queued frames during shutdown"
                    );
                    self.stats.frames_lost += 1;
                    return false;
                }
            }
        }
        true
    }

    fn close(&mut self, frames: &mut mpsc::Receiver<Vec<u8>>) -> ConnectionStats {
        frames.close();
        while frames.try_recv().is_ok() {
            self.stats.frames_lost += 1;
        }

        self.set_state(ConnectionState::Closed);
        info!(
            connects = self.stats.connects,
            reconnects = self.stats.reconnects,
            frames_written = self.stats.frames_written,
            bytes_written = self.stats.bytes_written,
            frames_lost = self.stats.frames_lost,
            "connection closed"
        );
        self.stats.clone()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "connection state changed");
        }
    }
}

async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await
}
