//! Broker session: credential lifecycle and bounded publishing
//!
//! [`BrokerSession`] owns the one outbound connection of the process. The
//! transport sits behind an async mutex, so the renewal task and the relay's
//! publishes take turns on it and never touch the connection at the same time.
//!
//! ## Freshness
//!
//! [`ensure_fresh`](BrokerSession::ensure_fresh) reconnects with a newly issued
//! credential whenever:
//! - there is no credential yet,
//! - the previous publish failed or timed out (the session is stale),
//! - the transport reports the connection lost, or
//! - the renewal fraction of the credential's validity has elapsed
//!   (always the case at or after expiry).
//!
//! ## Bounded publish
//!
//! [`publish`](BrokerSession::publish) gives up after the configured timeout,
//! including any time spent waiting for the renewal task or reconnecting.
//! Nothing is queued for retry: a failed frame is gone.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::credential::CredentialIssuer;
use crate::transport::{ConnectParams, Transport};
use crate::types::{EcgPayload, Frame};
use crate::{BridgeError, Result};

/// API version the hub expects in the MQTT user name
pub const API_VERSION: &str = "2021-04-12";

/// MQTT over TLS port
pub const MQTT_TLS_PORT: u16 = 8883;

/// Connection state of the outbound session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No live connection
    Disconnected,
    /// A connect attempt is in progress
    Connecting,
    /// Connected with a valid credential
    Connected,
}

/// Immutable settings for the broker session
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Hub host name, e.g. `myhub.azure-devices.net`
    pub hub_host: String,

    /// Device identity registered on the hub
    pub device_id: String,

    /// Broker port
    pub port: u16,

    /// Wrap the connection in TLS
    pub tls: bool,

    /// Lifetime of each issued credential
    pub token_validity: Duration,

    /// Fraction of `token_validity` after which the credential is renewed
    pub renew_at_fraction: f64,

    /// Upper bound on one publish call
    pub publish_timeout: Duration,

    /// Upper bound on one connect attempt.
    ///
    /// A reconnect triggered by a publish is also bounded by
    /// `publish_timeout`, whichever is shorter.
    pub connect_timeout: Duration,

    /// MQTT keep-alive interval
    pub keep_alive: Duration,
}

impl SessionSettings {
    /// Settings with defaults for everything except the device identity
    pub fn new(hub_host: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            hub_host: hub_host.into(),
            device_id: device_id.into(),
            port: MQTT_TLS_PORT,
            tls: true,
            token_validity: Duration::from_secs(3600),
            renew_at_fraction: 0.9,
            publish_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            keep_alive: Duration::from_secs(60),
        }
    }

    /// Resource the credential is scoped to
    pub fn resource_uri(&self) -> String {
        format!("{}/devices/{}", self.hub_host, self.device_id)
    }

    /// MQTT user name
    pub fn username(&self) -> String {
        format!("{}/{}/?api-version={}", self.hub_host, self.device_id, API_VERSION)
    }

    /// Device-to-cloud telemetry topic
    pub fn topic(&self) -> String {
        format!("devices/{}/messages/events/", self.device_id)
    }
}

struct SessionInner<T> {
    transport: T,
    credential: Option<crate::credential::Credential>,
}

/// The single outbound broker session of the process
pub struct BrokerSession<T: Transport> {
    settings: SessionSettings,
    issuer: CredentialIssuer,
    inner: Mutex<SessionInner<T>>,
    /// Set when a publish failed; forces a reconnect on the next `ensure_fresh`
    stale: AtomicBool,
    state: watch::Sender<SessionState>,
}

impl<T: Transport> BrokerSession<T> {
    /// Create a disconnected session; nothing touches the network until
    /// [`ensure_fresh`](Self::ensure_fresh) or [`publish`](Self::publish)
    pub fn new(settings: SessionSettings, issuer: CredentialIssuer, transport: T) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            settings,
            issuer,
            inner: Mutex::new(SessionInner { transport, credential: None }),
            stale: AtomicBool::new(false),
            state,
        }
    }

    /// Session settings
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Current connection state
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch connection state changes
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Whether the last publish failed and the next one will reconnect first
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    /// Expiry of the credential in use, if connected
    pub async fn credential_expiry(&self) -> Option<u64> {
        self.inner.lock().await.credential.as_ref().map(|c| c.expires_at())
    }

    /// Reconnect with a new credential if the current one is missing, aging
    /// out, or the connection went bad. Does nothing otherwise.
    ///
    /// # Errors
    ///
    /// [`BridgeError::PublishRejected`] when issuing or connecting fails; the
    /// session stays stale and the next call tries again.
    pub async fn ensure_fresh(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.refresh(&mut inner).await
    }

    /// Publish one message within the publish timeout.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::PublishTimeout`] if the call did not finish in time
    /// - [`BridgeError::PublishRejected`] if the broker or renewal refused it
    ///
    /// Either way the session is marked stale and the message is dropped.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let limit = self.settings.publish_timeout;

        let attempt = async {
            let mut inner = self.inner.lock().await;
            self.refresh(&mut inner).await?;
            inner.transport.publish(topic, payload).await
        };

        let result = match tokio::time::timeout(limit, attempt).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::PublishTimeout { duration: limit }),
        };

        if let Err(e) = &result {
            debug!("Publish failed, marking session stale: {}", e);
            self.stale.store(true, Ordering::SeqCst);
        }
        result
    }

    /// Serialize a frame as `{"ecg": [...]}` and publish it on the telemetry topic
    pub async fn publish_frame(&self, frame: &Frame) -> Result<()> {
        let payload = EcgPayload::from_frame(frame).to_bytes()?;
        trace!("Publishing frame {} ({} bytes)", frame.sequence, payload.len());
        self.publish(&self.settings.topic(), payload).await
    }

    /// Close the broker connection
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if let Err(e) = inner.transport.disconnect().await {
            warn!("Error while closing broker session: {}", e);
        }
        inner.credential = None;
        self.state.send_replace(SessionState::Disconnected);
        info!("Broker session closed");
    }

    /// Run [`ensure_fresh`](Self::ensure_fresh) every `every` until `cancel` fires.
    ///
    /// The first check runs immediately, which opens the session at startup.
    pub fn spawn_renewal(self: &Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let session = Arc::clone(self);

        tokio::spawn(async move {
            info!("Credential renewal task started (every {:?})", every);
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = session.ensure_fresh().await {
                            warn!("Credential renewal failed: {}", e);
                        }
                    }
                }
            }

            info!("Credential renewal task stopped");
        })
    }

    async fn refresh(&self, inner: &mut SessionInner<T>) -> Result<()> {
        let now = self.issuer.now();

        let reason = match &inner.credential {
            None => "no credential",
            Some(_) if self.stale.load(Ordering::SeqCst) => "session stale",
            Some(_) if !inner.transport.is_connected() => "connection lost",
            Some(credential) if credential.is_expired_at(now) => {
                let expired = BridgeError::CredentialExpired { expired_at: credential.expires_at() };
                warn!("{}", expired);
                "credential expired"
            }
            Some(credential)
                if credential.needs_renewal_at(now, self.settings.renew_at_fraction) =>
            {
                "renewal window reached"
            }
            Some(_) => return Ok(()),
        };

        debug!("Reconnecting broker session: {}", reason);
        self.stale.store(true, Ordering::SeqCst);
        self.reconnect(inner).await
    }

    async fn reconnect(&self, inner: &mut SessionInner<T>) -> Result<()> {
        if inner.credential.take().is_some() {
            if let Err(e) = inner.transport.disconnect().await {
                debug!("Ignoring error while dropping old session: {}", e);
            }
        }

        self.state.send_replace(SessionState::Connecting);
        let _attempt = ConnectAttempt { state: &self.state };

        let credential = self
            .issuer
            .issue(&self.settings.resource_uri(), self.settings.token_validity)
            .map_err(|e| {
                BridgeError::publish_rejected_with_source("credential renewal failed", Box::new(e))
            })?;

        let params = ConnectParams {
            host: self.settings.hub_host.clone(),
            port: self.settings.port,
            client_id: self.settings.device_id.clone(),
            username: self.settings.username(),
            password: credential.password(),
            keep_alive: self.settings.keep_alive,
            tls: self.settings.tls,
        };

        let limit = self.settings.connect_timeout;
        let outcome = match tokio::time::timeout(limit, inner.transport.connect(&params)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(BridgeError::publish_rejected(format!("connect timed out after {limit:?}"))),
        };

        match outcome {
            Ok(()) => {
                info!(
                    expires_at = credential.expires_at(),
                    validity_secs = self.settings.token_validity.as_secs(),
                    "Broker session connected"
                );
                inner.credential = Some(credential);
                self.stale.store(false, Ordering::SeqCst);
                self.state.send_replace(SessionState::Connected);
                Ok(())
            }
            Err(e) => {
                Err(match e {
                    BridgeError::PublishRejected { .. } => e,
                    other => BridgeError::publish_rejected_with_source(
                        "broker connect failed",
                        Box::new(other),
                    ),
                })
            }
        }
    }
}

/// Falls back to `Disconnected` unless the attempt reached `Connected`.
///
/// Also runs when a publish timeout drops the attempt mid-connect.
struct ConnectAttempt<'a> {
    state: &'a watch::Sender<SessionState>,
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        self.state.send_if_modified(|state| {
            if *state == SessionState::Connecting {
                *state = SessionState::Disconnected;
                true
            } else {
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{ManualClock, SecretKey};
    use crate::test_utils::{PublishBehavior, RecordingTransport};
    use std::time::Instant;

    const START: u64 = 1_700_000_000;

    fn session_with(
        transport: RecordingTransport,
        validity: Duration,
    ) -> (BrokerSession<RecordingTransport>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(START));
        let key = SecretKey::from_base64(Some("c2VjcmV0LWRldmljZS1rZXk=")).unwrap();
        let issuer = CredentialIssuer::new(key, None).with_clock(clock.clone());

        let mut settings = SessionSettings::new("myhub.azure-devices.net", "ecg-01");
        settings.token_validity = validity;
        settings.publish_timeout = Duration::from_millis(200);
        settings.connect_timeout = Duration::from_millis(200);

        (BrokerSession::new(settings, issuer, transport), clock)
    }

    #[test]
    fn settings_format_hub_identities() {
        let settings = SessionSettings::new("myhub.azure-devices.net", "ecg-01");
        assert_eq!(settings.username(), "myhub.azure-devices.net/ecg-01/?api-version=2021-04-12");
        assert_eq!(settings.topic(), "devices/ecg-01/messages/events/");
        assert_eq!(settings.resource_uri(), "myhub.azure-devices.net/devices/ecg-01");
        assert_eq!(settings.port, 8883);
    }

    #[tokio::test]
    async fn first_publish_connects_with_signed_password() {
        let transport = RecordingTransport::new();
        let (session, _) = session_with(transport.clone(), Duration::from_secs(3600));

        session.publish("t", b"{}".to_vec()).await.unwrap();

        let connects = transport.connects();
        assert_eq!(connects.len(), 1);
        assert!(connects[0].password.starts_with("SharedAccessSignature sr="));
        assert_eq!(connects[0].username, "myhub.azure-devices.net/ecg-01/?api-version=2021-04-12");
        assert_eq!(transport.published(), vec![("t".to_string(), b"{}".to_vec())]);
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn ensure_fresh_is_idempotent_inside_window() {
        let transport = RecordingTransport::new();
        let (session, clock) = session_with(transport.clone(), Duration::from_secs(1000));

        session.ensure_fresh().await.unwrap();
        clock.advance(Duration::from_secs(899));
        session.ensure_fresh().await.unwrap();
        session.ensure_fresh().await.unwrap();

        assert_eq!(transport.connects().len(), 1);
    }

    #[tokio::test]
    async fn renews_at_ninety_percent() {
        let transport = RecordingTransport::new();
        let (session, clock) = session_with(transport.clone(), Duration::from_secs(1000));

        session.ensure_fresh().await.unwrap();
        clock.advance(Duration::from_secs(900));
        session.ensure_fresh().await.unwrap();

        assert_eq!(transport.connects().len(), 2);
        assert_eq!(session.credential_expiry().await, Some(START + 900 + 1000));
    }

    #[tokio::test]
    async fn renews_exactly_at_expiry_even_with_full_fraction() {
        let transport = RecordingTransport::new();
        let (mut session, clock) = session_with(transport.clone(), Duration::from_secs(100));
        session.settings.renew_at_fraction = 1.0;

        session.ensure_fresh().await.unwrap();
        clock.set(START + 99);
        session.ensure_fresh().await.unwrap();
        assert_eq!(transport.connects().len(), 1);

        clock.set(START + 100);
        session.ensure_fresh().await.unwrap();
        assert_eq!(transport.connects().len(), 2);
    }

    #[tokio::test]
    async fn lost_connection_triggers_reconnect() {
        let transport = RecordingTransport::new();
        let (session, _) = session_with(transport.clone(), Duration::from_secs(3600));

        session.ensure_fresh().await.unwrap();
        transport.drop_connection();
        session.ensure_fresh().await.unwrap();

        assert_eq!(transport.connects().len(), 2);
    }

    #[tokio::test]
    async fn stalled_broker_returns_within_timeout() {
        let transport = RecordingTransport::new();
        transport.set_publish_behavior(PublishBehavior::Stall);
        let (session, _) = session_with(transport.clone(), Duration::from_secs(3600));

        let started = Instant::now();
        let error = session.publish("t", vec![1, 2, 3]).await.unwrap_err();

        assert!(matches!(error, BridgeError::PublishTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(2), "publish blocked {:?}", started.elapsed());
        assert!(session.is_stale());
    }

    #[tokio::test]
    async fn rejected_publish_marks_stale_and_next_publish_reconnects() {
        let transport = RecordingTransport::new();
        transport.set_publish_behavior(PublishBehavior::Reject);
        let (session, _) = session_with(transport.clone(), Duration::from_secs(3600));

        let error = session.publish("t", vec![1]).await.unwrap_err();
        assert!(matches!(error, BridgeError::PublishRejected { .. }));
        assert!(session.is_stale());

        transport.set_publish_behavior(PublishBehavior::Accept);
        session.publish("t", vec![2]).await.unwrap();

        assert_eq!(transport.connects().len(), 2);
        assert_eq!(transport.published().len(), 1);
        assert!(!session.is_stale());
    }

    #[tokio::test]
    async fn refused_connect_escalates_as_rejection() {
        let transport = RecordingTransport::new();
        transport.refuse_connects(true);
        let (session, _) = session_with(transport.clone(), Duration::from_secs(3600));

        let error = session.ensure_fresh().await.unwrap_err();
        assert!(matches!(error, BridgeError::PublishRejected { .. }));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(transport.published().is_empty());
    }

    #[tokio::test]
    async fn publish_frame_sends_json_on_telemetry_topic() {
        let transport = RecordingTransport::new();
        let (session, _) = session_with(transport.clone(), Duration::from_secs(3600));

        session.publish_frame(&Frame::new(vec![1, 2, 3, 4], 1)).await.unwrap();

        let published = transport.published();
        assert_eq!(published[0].0, "devices/ecg-01/messages/events/");
        assert_eq!(published[0].1, br#"{"ecg":[1,2,3,4]}"#.to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_task_connects_and_stops_on_cancel() {
        let transport = RecordingTransport::new();
        let (session, _) = session_with(transport.clone(), Duration::from_secs(3600));
        let session = Arc::new(session);
        let cancel = CancellationToken::new();

        let handle = session.spawn_renewal(Duration::from_secs(30), cancel.clone());
        let mut state = session.subscribe_state();
        state.wait_for(|s| *s == SessionState::Connected).await.unwrap();

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(transport.connects().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_timeout_during_slow_connect_leaves_session_disconnected() {
        let transport = RecordingTransport::new();
        transport.set_connect_delay(Duration::from_secs(3));
        let (mut session, _) = session_with(transport.clone(), Duration::from_secs(3600));
        session.settings.connect_timeout = Duration::from_secs(10);

        let error = session.publish("t", vec![1]).await.unwrap_err();

        assert!(matches!(error, BridgeError::PublishTimeout { .. }));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.is_stale());

        transport.set_connect_delay(Duration::ZERO);
        session.publish("t", vec![2]).await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(transport.published(), vec![("t".to_string(), vec![2])]);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_waits_for_renewal_in_progress() {
        let transport = RecordingTransport::new();
        transport.set_connect_delay(Duration::from_secs(1));
        let (mut session, _) = session_with(transport.clone(), Duration::from_secs(3600));
        session.settings.publish_timeout = Duration::from_secs(5);
        session.settings.connect_timeout = Duration::from_secs(5);
        let session = Arc::new(session);

        let mut state = session.subscribe_state();
        let renewal = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.ensure_fresh().await }
        });
        state.wait_for(|s| *s == SessionState::Connecting).await.unwrap();

        session.publish("t", vec![7]).await.unwrap();
        renewal.await.unwrap().unwrap();

        assert_eq!(transport.overlapping_calls(), 0);
        assert_eq!(transport.connects().len(), 1);
        assert_eq!(transport.published(), vec![("t".to_string(), vec![7])]);
    }

    #[tokio::test]
    async fn close_disconnects_transport() {
        let transport = RecordingTransport::new();
        let (session, _) = session_with(transport.clone(), Duration::from_secs(3600));

        session.ensure_fresh().await.unwrap();
        session.close().await;

        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(transport.disconnects() >= 1);
    }
}
