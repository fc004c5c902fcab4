//! Relay loop: accept one sensor at a time and forward its frames
//!
//! The loop moves through three states:
//!
//! ```text
//! AwaitingConnection --accept--> Streaming --peer gone / fatal error--> AwaitingConnection
//!          \                         |
//!           `-------- cancel --------+--> ShuttingDown
//! ```
//!
//! Inside `Streaming` each frame is read, filtered, rendered and published in
//! order. A failed frame is logged and skipped; only a dead or misaligned
//! connection sends the loop back to `accept`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::pipeline::{SampleFilter, SampleSink};
use crate::reader::FrameReader;
use crate::session::BrokerSession;
use crate::transport::Transport;
use crate::types::Frame;
use crate::{BridgeError, Result};

/// Diagnostic written back to the sensor after a failed frame
pub const ERROR_REPLY: &[u8] = b"Error receiving data";

/// Longest time spent writing [`ERROR_REPLY`] before giving up on it
const ERROR_REPLY_TIMEOUT: Duration = Duration::from_secs(1);

/// Consecutive accept failures tolerated before the loop gives up
const MAX_ACCEPT_ERRORS: u32 = 10;

/// Per-connection failure policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOptions {
    /// Consecutive empty idle timeouts tolerated before the connection is dropped
    pub read_retry_budget: u32,

    /// Write [`ERROR_REPLY`] to the sensor after a failed frame
    pub reply_on_error: bool,

    /// Drop the connection when a publish fails instead of skipping the frame
    pub publish_errors_are_fatal: bool,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self { read_retry_budget: 3, reply_on_error: true, publish_errors_are_fatal: false }
    }
}

/// Where the relay loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Listening, no sensor connected
    AwaitingConnection,
    /// Serving one sensor
    Streaming {
        /// Remote address of the sensor
        peer: SocketAddr,
    },
    /// Cancelled; `run` is about to return
    ShuttingDown,
}

/// Counters since the relay started
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Sensor connections accepted
    pub connections_served: u64,
    /// Complete frames read
    pub frames_received: u64,
    /// Frames the broker accepted
    pub frames_published: u64,
    /// Frames lost to a failed or timed-out publish
    pub frames_dropped: u64,
    /// Idle timeouts across all connections
    pub read_timeouts: u64,
}

/// Snapshot published on the status channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStatus {
    pub state: RelayState,
    pub stats: RelayStats,
}

/// How one inbound connection ended
#[derive(Debug)]
pub enum ConnectionOutcome {
    /// The sensor hung up
    Closed {
        /// Frames completed on this connection
        frames: u64,
    },
    /// The relay dropped the connection after an error
    Dropped(BridgeError),
    /// Shutdown was requested
    Cancelled,
}

/// The relay orchestrator
pub struct RelayLoop<T: Transport> {
    options: RelayOptions,
    reader: FrameReader,
    session: Arc<BrokerSession<T>>,
    filter: Box<dyn SampleFilter>,
    sink: Box<dyn SampleSink>,
    status: watch::Sender<RelayStatus>,
}

impl<T: Transport> RelayLoop<T> {
    pub fn new(
        options: RelayOptions,
        reader: FrameReader,
        session: Arc<BrokerSession<T>>,
        filter: Box<dyn SampleFilter>,
        sink: Box<dyn SampleSink>,
    ) -> Self {
        let (status, _) = watch::channel(RelayStatus {
            state: RelayState::AwaitingConnection,
            stats: RelayStats::default(),
        });
        Self { options, reader, session, filter, sink, status }
    }

    /// Watch state transitions and counters
    pub fn subscribe(&self) -> watch::Receiver<RelayStatus> {
        self.status.subscribe()
    }

    /// Counters so far
    pub fn stats(&self) -> RelayStats {
        self.status.borrow().stats
    }

    /// Accept and serve sensors until `cancel` fires.
    ///
    /// Only one connection is served at a time; `accept` is not called again
    /// until the previous socket has been shut down.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Io`] if accepting keeps failing
    pub async fn run(mut self, listener: TcpListener, cancel: CancellationToken) -> Result<RelayStats> {
        match listener.local_addr() {
            Ok(addr) => info!("Relay listening on {}", addr),
            Err(e) => debug!("Listener address unavailable: {}", e),
        }
        let mut accept_errors = 0u32;

        loop {
            self.set_state(RelayState::AwaitingConnection);

            let accepted = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Relay cancelled while awaiting connection");
                    break;
                }
                accepted = listener.accept() => accepted,
            };

            let (mut stream, peer) = match accepted {
                Ok(accepted) => {
                    accept_errors = 0;
                    accepted
                }
                Err(e) => {
                    accept_errors += 1;
                    error!("Accept failed ({}/{}): {}", accept_errors, MAX_ACCEPT_ERRORS, e);
                    if accept_errors >= MAX_ACCEPT_ERRORS {
                        self.set_state(RelayState::ShuttingDown);
                        return Err(BridgeError::io("accepting connections", e));
                    }

                    let backoff = Duration::from_millis(50 * (1 << accept_errors.min(5)));
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => continue,
                    }
                }
            };

            info!(%peer, "Sensor connected");
            self.status.send_modify(|s| {
                s.stats.connections_served += 1;
                s.state = RelayState::Streaming { peer };
            });

            let outcome = self.serve_connection(&mut stream, peer, &cancel).await;
            match &outcome {
                ConnectionOutcome::Closed { frames } => info!(%peer, frames, "Sensor disconnected"),
                ConnectionOutcome::Dropped(e) => warn!(%peer, "Dropping sensor connection: {}", e),
                ConnectionOutcome::Cancelled => info!(%peer, "Relay cancelled while streaming"),
            }

            if let Err(e) = stream.shutdown().await {
                trace!("Socket shutdown: {}", e);
            }
            drop(stream);

            if matches!(outcome, ConnectionOutcome::Cancelled) {
                break;
            }
        }

        self.set_state(RelayState::ShuttingDown);
        let stats = self.stats();
        info!(
            connections = stats.connections_served,
            received = stats.frames_received,
            published = stats.frames_published,
            dropped = stats.frames_dropped,
            "Relay stopped"
        );
        Ok(stats)
    }

    /// Stream frames from one connection until it ends.
    ///
    /// Publishes are never interrupted by `cancel`; they finish or time out.
    pub async fn serve_connection<S>(
        &mut self,
        stream: &mut S,
        peer: SocketAddr,
        cancel: &CancellationToken,
    ) -> ConnectionOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.reader.reset();
        let mut idle_timeouts = 0u32;

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return ConnectionOutcome::Cancelled,
                result = self.reader.read_frame(stream) => result,
            };

            match result {
                Ok(frame) => {
                    idle_timeouts = 0;
                    self.status.send_modify(|s| s.stats.frames_received += 1);

                    if let Err(e) = self.forward(frame).await {
                        reply_error(self.options.reply_on_error, stream).await;
                        if self.options.publish_errors_are_fatal {
                            return ConnectionOutcome::Dropped(e);
                        }
                    }
                }
                Err(BridgeError::ConnectionClosed { received, expected }) => {
                    if received > 0 {
                        debug!(%peer, "Discarded partial frame ({} of {} bytes)", received, expected);
                    }
                    return ConnectionOutcome::Closed { frames: self.reader.frames_read() };
                }
                Err(e) if e.is_connection_fatal() => {
                    reply_error(self.options.reply_on_error, stream).await;
                    return ConnectionOutcome::Dropped(e);
                }
                Err(e) => {
                    idle_timeouts += 1;
                    self.status.send_modify(|s| s.stats.read_timeouts += 1);
                    reply_error(self.options.reply_on_error, stream).await;

                    if idle_timeouts > self.options.read_retry_budget {
                        return ConnectionOutcome::Dropped(e);
                    }
                    debug!(
                        %peer,
                        "{} (retry {}/{})", e, idle_timeouts, self.options.read_retry_budget
                    );
                }
            }
        }
    }

    async fn forward(&mut self, frame: Frame) -> Result<()> {
        let sequence = frame.sequence;
        let raw_len = frame.len();
        let frame = Frame::new(self.filter.filter(frame.samples), sequence);
        trace!(sequence, raw = raw_len, filtered = frame.len(), filter = self.filter.name(), "Frame ready");

        self.sink.render(&frame);

        if frame.is_empty() {
            debug!(sequence, "Filter left no samples, nothing to publish");
            return Ok(());
        }

        match self.session.publish_frame(&frame).await {
            Ok(()) => {
                self.status.send_modify(|s| s.stats.frames_published += 1);
                Ok(())
            }
            Err(e) => {
                self.status.send_modify(|s| s.stats.frames_dropped += 1);
                warn!(sequence, "Dropped frame: {}", e);
                Err(e)
            }
        }
    }

    fn set_state(&self, state: RelayState) {
        self.status.send_if_modified(|s| {
            if s.state == state {
                return false;
            }
            debug!("Relay state: {:?} -> {:?}", s.state, state);
            s.state = state;
            true
        });
    }
}

async fn reply_error<S>(enabled: bool, stream: &mut S)
where
    S: AsyncWrite + Unpin + Send,
{
    if !enabled {
        return;
    }
    match tokio::time::timeout(ERROR_REPLY_TIMEOUT, stream.write_all(ERROR_REPLY)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => trace!("Error reply not delivered: {}", e),
        Err(_) => trace!("Error reply timed out"),
    }
}
