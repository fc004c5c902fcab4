//! Test doubles for the inbound socket and the broker transport
//!
//! [`ScriptedReader`] replays a byte stream in caller-chosen pieces and then
//! ends the way a real peer would: hang up, go silent, or fail.
//! [`RecordingTransport`] stands in for the broker and records every call.

#![cfg(any(test, feature = "benchmark"))]

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, ReadBuf};

use crate::transport::{ConnectParams, Transport};
use crate::{BridgeError, Result};

/// Encode samples the way the sensor puts them on the wire
pub fn le_bytes(samples: &[u16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

#[derive(Debug, Clone, Copy)]
enum StreamEnd {
    Eof,
    Stall,
    Fail(io::ErrorKind),
}

/// In-memory peer delivering a fixed script of chunks
///
/// Each read returns at most one chunk, truncated to the caller's buffer; the
/// rest of that chunk is served by the next read.
#[derive(Debug)]
pub struct ScriptedReader {
    chunks: VecDeque<Vec<u8>>,
    end: StreamEnd,
}

impl ScriptedReader {
    /// Deliver `chunks` in order, then report end of stream
    pub fn from_chunks(chunks: Vec<Vec<u8>>) -> Self {
        Self { chunks: chunks.into_iter().filter(|c| !c.is_empty()).collect(), end: StreamEnd::Eof }
    }

    /// Deliver `bytes` one byte per read
    pub fn single_bytes(bytes: &[u8]) -> Self {
        Self::from_chunks(bytes.iter().map(|b| vec![*b]).collect())
    }

    /// Deliver `bytes` in pieces of the given sizes, cycling through `sizes`
    pub fn chunked(bytes: &[u8], sizes: &[usize]) -> Self {
        let mut chunks = Vec::new();
        let mut rest = bytes;
        let mut sizes = sizes.iter().copied().filter(|s| *s > 0).cycle();

        while !rest.is_empty() {
            let size = sizes.next().unwrap_or(rest.len()).min(rest.len());
            let (head, tail) = rest.split_at(size);
            chunks.push(head.to_vec());
            rest = tail;
        }
        Self::from_chunks(chunks)
    }

    /// Never complete a read once the script runs out
    pub fn then_stall(mut self) -> Self {
        self.end = StreamEnd::Stall;
        self
    }

    /// Fail every read with `kind` once the script runs out
    pub fn then_fail(mut self, kind: io::ErrorKind) -> Self {
        self.end = StreamEnd::Fail(kind);
        self
    }
}

impl AsyncRead for ScriptedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let Some(mut chunk) = self.chunks.pop_front() else {
            return match self.end {
                StreamEnd::Eof => Poll::Ready(Ok(())),
                StreamEnd::Stall => Poll::Pending,
                StreamEnd::Fail(kind) => Poll::Ready(Err(io::Error::new(kind, "scripted failure"))),
            };
        };

        let take = chunk.len().min(buf.remaining());
        buf.put_slice(&chunk[..take]);
        if take < chunk.len() {
            let rest = chunk.split_off(take);
            self.chunks.push_front(rest);
        }
        Poll::Ready(Ok(()))
    }
}

/// How [`RecordingTransport`] answers publishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishBehavior {
    /// Record the message and succeed
    Accept,
    /// Fail with `PublishRejected`
    Reject,
    /// Never complete
    Stall,
}

#[derive(Debug)]
struct Recording {
    connects: Vec<ConnectParams>,
    published: Vec<(String, Vec<u8>)>,
    disconnects: usize,
    connected: bool,
    refuse_connects: bool,
    behavior: PublishBehavior,
    connect_delay: Duration,
    connecting: bool,
    overlapping_calls: usize,
}

/// Broker stand-in that records every call; clones share one recording
#[derive(Debug, Clone)]
pub struct RecordingTransport {
    recording: Arc<Mutex<Recording>>,
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            recording: Arc::new(Mutex::new(Recording {
                connects: Vec::new(),
                published: Vec::new(),
                disconnects: 0,
                connected: false,
                refuse_connects: false,
                behavior: PublishBehavior::Accept,
                connect_delay: Duration::ZERO,
                connecting: false,
                overlapping_calls: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Recording> {
        self.recording.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_publish_behavior(&self, behavior: PublishBehavior) {
        self.lock().behavior = behavior;
    }

    pub fn refuse_connects(&self, refuse: bool) {
        self.lock().refuse_connects = refuse;
    }

    /// Make each connect take `delay` before the broker answers
    pub fn set_connect_delay(&self, delay: Duration) {
        self.lock().connect_delay = delay;
    }

    /// Publishes that arrived while a connect was still in flight
    pub fn overlapping_calls(&self) -> usize {
        self.lock().overlapping_calls
    }

    /// Simulate the broker dropping the connection
    pub fn drop_connection(&self) {
        self.lock().connected = false;
    }

    pub fn connects(&self) -> Vec<ConnectParams> {
        self.lock().connects.clone()
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.lock().published.clone()
    }

    pub fn disconnects(&self) -> usize {
        self.lock().disconnects
    }
}

#[async_trait::async_trait]
impl Transport for RecordingTransport {
    async fn connect(&mut self, params: &ConnectParams) -> Result<()> {
        let delay = {
            let mut recording = self.lock();
            recording.connects.push(params.clone());
            recording.connecting = true;
            recording.connect_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut recording = self.lock();
        recording.connecting = false;
        if recording.refuse_connects {
            recording.connected = false;
            return Err(BridgeError::publish_rejected("broker refused connection: NotAuthorized"));
        }
        recording.connected = true;
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let behavior = {
            let mut recording = self.lock();
            if recording.connecting {
                recording.overlapping_calls += 1;
            }
            recording.behavior
        };
        match behavior {
            PublishBehavior::Accept => {
                self.lock().published.push((topic.to_string(), payload));
                Ok(())
            }
            PublishBehavior::Reject => Err(BridgeError::publish_rejected("broker rejected message")),
            PublishBehavior::Stall => std::future::pending().await,
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        let mut recording = self.lock();
        recording.disconnects += 1;
        recording.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }
}
