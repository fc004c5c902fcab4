//! Fixed-length frame reassembly over a byte stream
//!
//! TCP delivers the sensor's frames in whatever pieces the network chooses,
//! from single bytes to several frames at once. [`FrameReader`] asks the
//! socket only for what the current frame still needs, so bytes of the next
//! frame normally stay in the socket buffer.
//!
//! The one exception is a frame whose last bytes look like the start of a
//! keep-alive marker (`...P`, `...PI`, `...PIN`). Those bytes only become
//! samples once the following byte proves they are not a marker, so the
//! reader peeks up to three bytes past the frame and carries them into the
//! next one. If the peer goes quiet or hangs up instead, the tail is taken as
//! sample data.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use crate::marker::MarkerFilter;
use crate::types::{Frame, FrameLength};
use crate::{BridgeError, Result};

/// Reads complete frames from one inbound connection
#[derive(Debug, Clone)]
pub struct FrameReader {
    /// Bytes per frame after marker stripping
    length: FrameLength,

    /// Longest wait for a single read before giving up on the frame
    idle_timeout: Duration,

    /// Keep-alive marker removal
    markers: MarkerFilter,

    /// Stripped bytes already read past the previous frame
    carry: Vec<u8>,

    /// Frames completed on the current connection
    sequence: u64,
}

impl FrameReader {
    /// Create a reader that strips the default `PING` marker
    pub fn new(length: FrameLength, idle_timeout: Duration) -> Self {
        Self {
            length,
            idle_timeout,
            markers: MarkerFilter::default(),
            carry: Vec::new(),
            sequence: 0,
        }
    }

    /// Replace the keep-alive marker filter
    pub fn with_markers(mut self, markers: MarkerFilter) -> Self {
        self.markers = markers;
        self
    }

    /// Configured frame length
    pub fn frame_length(&self) -> FrameLength {
        self.length
    }

    /// Configured per-read idle timeout
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Frames completed since the last [`reset`](Self::reset)
    pub fn frames_read(&self) -> u64 {
        self.sequence
    }

    /// Forget all per-connection state before serving a new peer
    pub fn reset(&mut self) {
        self.carry.clear();
        self.sequence = 0;
    }

    /// Read exactly one frame from `conn`.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::ConnectionClosed`] when a read returns zero bytes or the
    ///   peer resets the connection; the connection must not be read again.
    /// - [`BridgeError::ReadTimeout`] when no byte arrives within the idle
    ///   timeout. `discarded` reports how much of the frame was thrown away.
    /// - [`BridgeError::Io`] for any other socket failure.
    ///
    /// On error the partially assembled frame is dropped; nothing is carried
    /// into the next call.
    pub async fn read_frame<R>(&mut self, conn: &mut R) -> Result<Frame>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let expected = self.length.bytes();
        let mut buffer = std::mem::take(&mut self.carry);
        buffer.reserve(expected);
        let mut chunk = vec![0u8; expected];

        loop {
            let settled = buffer.len() - self.markers.pending_len(&buffer);
            if settled >= expected {
                break;
            }

            // Never read past the frame unless a marker-like tail forces a peek
            let wanted = expected.saturating_sub(buffer.len()).max(1);

            let read =
                match tokio::time::timeout(self.idle_timeout, conn.read(&mut chunk[..wanted])).await
                {
                    Err(_) if buffer.len() >= expected => {
                        trace!("Marker-like frame tail timed out, keeping it as samples");
                        break;
                    }
                    Err(_) => {
                        return Err(BridgeError::read_timeout(self.idle_timeout, buffer.len()));
                    }
                    Ok(Ok(0)) if buffer.len() >= expected => break,
                    Ok(Ok(0)) => return Err(BridgeError::connection_closed(buffer.len(), expected)),
                    Ok(Ok(read)) => read,
                    Ok(Err(e)) if is_disconnect(&e) => {
                        return Err(BridgeError::connection_closed(buffer.len(), expected));
                    }
                    Ok(Err(e)) => return Err(BridgeError::io("reading frame", e)),
                };

            let stripped = self.markers.extend(&mut buffer, &chunk[..read]);
            if stripped > 0 {
                trace!("Stripped {} keep-alive bytes", stripped);
            }
        }

        self.carry = buffer.split_off(expected);
        self.sequence += 1;
        trace!("Frame {} complete ({}, {} bytes carried)", self.sequence, self.length, self.carry.len());

        Ok(Frame::from_le_bytes(&buffer, self.sequence))
    }
}

/// Read one frame with the default `PING` marker filter.
///
/// Convenience for one-off reads; a long-lived connection should keep a
/// [`FrameReader`] so marker look-ahead bytes reach the next frame.
pub async fn read_frame<R>(
    conn: &mut R,
    length: FrameLength,
    idle_timeout: Duration,
) -> Result<Frame>
where
    R: AsyncRead + Unpin + ?Sized,
{
    FrameReader::new(length, idle_timeout).read_frame(conn).await
}

fn is_disconnect(error: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        error.kind(),
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::UnexpectedEof
    )
}
