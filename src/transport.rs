//! Transport trait for the outbound broker connection

use std::time::Duration;

use crate::Result;

/// Everything needed to open one authenticated broker connection
#[derive(Clone)]
pub struct ConnectParams {
    /// Broker host name
    pub host: String,

    /// Broker port (8883 for MQTT over TLS)
    pub port: u16,

    /// MQTT client identifier (the device id)
    pub client_id: String,

    /// MQTT user name
    pub username: String,

    /// MQTT password (a shared access signature)
    pub password: String,

    /// MQTT keep-alive interval
    pub keep_alive: Duration,

    /// Whether to wrap the connection in TLS
    pub tls: bool,
}

impl std::fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("keep_alive", &self.keep_alive)
            .field("tls", &self.tls)
            .finish()
    }
}

/// Publish capability the relay needs from a broker client
///
/// Implementations own one connection at a time. [`BrokerSession`] serializes
/// every call, so implementations never see `connect` and `publish` overlap.
///
/// [`BrokerSession`]: crate::session::BrokerSession
#[async_trait::async_trait]
pub trait Transport: Send + 'static {
    /// Open a connection, replacing any previous one.
    ///
    /// Returns once the broker has accepted the credentials, or with
    /// [`PublishRejected`](crate::BridgeError::PublishRejected) if it refused them.
    async fn connect(&mut self, params: &ConnectParams) -> Result<()>;

    /// Hand one message to the broker connection
    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Close the connection if one is open
    async fn disconnect(&mut self) -> Result<()>;

    /// Whether the last connection is still believed healthy
    fn is_connected(&self) -> bool;
}
