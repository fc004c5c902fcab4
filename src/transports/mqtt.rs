//! MQTT 3.1.1 transport over TLS, backed by rumqttc

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS,
    Transport as WireTransport,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::transport::{ConnectParams, Transport};
use crate::{BridgeError, Result};

/// Largest MQTT packet the hub accepts
pub const MAX_PACKET_SIZE: usize = 256 * 1024;

/// Requests buffered between the client handle and the event loop
const DEFAULT_REQUEST_CAPACITY: usize = 16;

/// How long a graceful disconnect may take before the event loop is dropped
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Broker transport speaking MQTT through rumqttc
///
/// Each `connect` builds a fresh client and event loop, waits for the
/// broker's CONNACK, then hands the event loop to a background task. The
/// task flips the health flag as soon as the connection drops so the session
/// reconnects with a new credential instead of letting rumqttc silently
/// retry with a stale one.
pub struct MqttTransport {
    qos: QoS,
    request_capacity: usize,
    client: Option<AsyncClient>,
    healthy: Arc<AtomicBool>,
    driver: Option<JoinHandle<()>>,
}

impl Default for MqttTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MqttTransport {
    /// Create a transport publishing at QoS 0
    pub fn new() -> Self {
        Self {
            qos: QoS::AtMostOnce,
            request_capacity: DEFAULT_REQUEST_CAPACITY,
            client: None,
            healthy: Arc::new(AtomicBool::new(false)),
            driver: None,
        }
    }

    /// Publish with a different QoS level
    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    fn options(params: &ConnectParams) -> MqttOptions {
        let mut options = MqttOptions::new(&params.client_id, &params.host, params.port);
        options
            .set_credentials(&params.username, &params.password)
            .set_keep_alive(params.keep_alive)
            .set_clean_session(true)
            .set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        if params.tls {
            options.set_transport(WireTransport::tls_with_default_config());
        }
        options
    }

    async fn stop_driver(&mut self) {
        self.healthy.store(false, Ordering::SeqCst);

        if let Some(client) = self.client.take() {
            if let Err(e) = client.disconnect().await {
                debug!("Disconnect request not delivered: {}", e);
            }
        }

        if let Some(mut driver) = self.driver.take() {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut driver).await.is_err() {
                debug!("MQTT event loop did not stop in time, aborting");
                driver.abort();
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for MqttTransport {
    async fn connect(&mut self, params: &ConnectParams) -> Result<()> {
        self.stop_driver().await;

        debug!(host = %params.host, port = params.port, tls = params.tls, "Opening MQTT connection");

        let (client, mut eventloop) =
            AsyncClient::new(Self::options(params), self.request_capacity);
        wait_for_connack(&mut eventloop).await?;

        let healthy = Arc::new(AtomicBool::new(true));
        self.driver = Some(spawn_driver(eventloop, Arc::clone(&healthy)));
        self.healthy = healthy;
        self.client = Some(client);

        info!(host = %params.host, client_id = %params.client_id, "MQTT session established");
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let client = self.client.as_ref().ok_or_else(|| BridgeError::publish_rejected("not connected"))?;
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(BridgeError::publish_rejected("broker connection lost"));
        }

        client
            .publish(topic, self.qos, false, payload)
            .await
            .map_err(|e| BridgeError::publish_rejected(format!("publish request failed: {e}")))
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.stop_driver().await;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client.is_some() && self.healthy.load(Ordering::SeqCst)
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<()> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    return Ok(());
                }
                return Err(BridgeError::publish_rejected(format!(
                    "broker refused connection: {:?}",
                    ack.code
                )));
            }
            Ok(event) => trace!(?event, "MQTT event before CONNACK"),
            Err(e) => {
                return Err(BridgeError::publish_rejected(format!("broker connection failed: {e}")));
            }
        }
    }
}

fn spawn_driver(mut eventloop: EventLoop, healthy: Arc<AtomicBool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("Broker closed the MQTT session");
                    break;
                }
                Ok(event) => trace!(?event, "MQTT event"),
                Err(e) => {
                    if healthy.load(Ordering::SeqCst) {
                        warn!("MQTT connection lost: {}", e);
                    } else {
                        debug!("MQTT event loop stopped: {}", e);
                    }
                    break;
                }
            }
        }
        healthy.store(false, Ordering::SeqCst);
    })
}
