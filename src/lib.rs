//! TCP to MQTT relay for streaming ECG samples.
//!
//! A sensor connects over TCP and streams little-endian 16-bit samples in
//! fixed-length frames, interleaved with `PING` keep-alive markers. The bridge
//! reassembles each frame, optionally filters it, and publishes it as
//! `{"ecg": [...]}` to an IoT hub over MQTT, authenticating with short-lived
//! shared access signatures that it renews on its own schedule.
//!
//! # Features
//!
//! - **Exact framing**: partial reads, split markers and peer hang-ups never
//!   produce a partial frame
//! - **Bounded publishing**: a stalled broker costs one frame, never the stream
//! - **Credential renewal**: tokens are re-signed before they expire
//! - **One sensor at a time**: the relay returns to `accept` after every fault
//!
//! ## Example
//!
//! ```rust,no_run
//! use ecg_bridge::{Bridge, BridgeConfig, MqttTransport};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> ecg_bridge::Result<()> {
//!     let mut config = BridgeConfig::load("bridge.yaml")?;
//!     config.apply_env()?;
//!     config.validate()?;
//!
//!     let issuer = config.credential_issuer()?;
//!     let bridge = Bridge::build(&config, issuer, MqttTransport::new())?;
//!     let listener = tokio::net::TcpListener::bind(config.listen_addr()).await
//!         .map_err(|e| ecg_bridge::BridgeError::io("binding listener", e))?;
//!
//!     let stats = bridge.relay.run(listener, CancellationToken::new()).await?;
//!     println!("published {} frames", stats.frames_published);
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

// Core types and error handling
mod error;
#[cfg_attr(any(test, feature = "benchmark"), path = "test_utils.rs")]
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;

// Inbound side
pub mod marker;
pub mod reader;

// Outbound side
pub mod credential;
pub mod session;
pub mod transport;
pub mod transports;

// Orchestration
pub mod config;
pub mod pipeline;
pub mod relay;

pub use error::*;
pub use types::*;

pub use config::BridgeConfig;
pub use credential::{Credential, CredentialIssuer, SecretKey};
pub use marker::{MarkerFilter, strip_markers};
pub use pipeline::{SampleFilter, SampleSink};
pub use reader::{FrameReader, read_frame};
pub use relay::{ConnectionOutcome, RelayLoop, RelayOptions, RelayState, RelayStats, RelayStatus};
pub use session::{BrokerSession, SessionSettings, SessionState};
pub use transport::{ConnectParams, Transport};
pub use transports::MqttTransport;

/// A relay loop wired to its broker session.
///
/// The session is shared so the caller can start its renewal task and close
/// it after the relay stops.
pub struct Bridge<T: Transport> {
    /// Inbound side; consumed by [`RelayLoop::run`]
    pub relay: RelayLoop<T>,
    /// Outbound session, shared with the relay and the renewal task
    pub session: Arc<BrokerSession<T>>,
}

impl<T: Transport> Bridge<T> {
    /// Build every component from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns the configuration error for a bad frame length or filter.
    pub fn build(config: &BridgeConfig, issuer: CredentialIssuer, transport: T) -> Result<Self> {
        let session = Arc::new(BrokerSession::new(config.session_settings(), issuer, transport));
        let relay = RelayLoop::new(
            config.relay_options(),
            config.frame_reader()?,
            Arc::clone(&session),
            config.build_filter()?,
            config.build_sink(),
        );
        Ok(Self { relay, session })
    }
}
