//! Loopback tests: a sensor over real TCP, a broker stand-in on a channel

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ecg_bridge::credential::ManualClock;
use ecg_bridge::{
    Bridge, BridgeConfig, ConnectParams, CredentialIssuer, RelayState, RelayStats, SecretKey,
    Transport,
};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const KEY: &str = "c2VjcmV0LWRldmljZS1rZXk=";

struct ChannelTransport {
    messages: mpsc::UnboundedSender<(String, Vec<u8>)>,
    connected: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    async fn connect(&mut self, params: &ConnectParams) -> ecg_bridge::Result<()> {
        assert!(params.password.starts_with("SharedAccessSignature sr="));
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> ecg_bridge::Result<()> {
        let _ = self.messages.send((topic.to_string(), payload));
        Ok(())
    }

    async fn disconnect(&mut self) -> ecg_bridge::Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

struct Harness {
    addr: std::net::SocketAddr,
    messages: mpsc::UnboundedReceiver<(String, Vec<u8>)>,
    status: tokio::sync::watch::Receiver<ecg_bridge::RelayStatus>,
    cancel: CancellationToken,
    relay: JoinHandle<ecg_bridge::Result<RelayStats>>,
}

async fn start_bridge(config: BridgeConfig) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let (tx, messages) = mpsc::unbounded_channel();
    let transport = ChannelTransport { messages: tx, connected: Arc::new(AtomicBool::new(false)) };
    let issuer = CredentialIssuer::new(SecretKey::from_base64(Some(KEY)).unwrap(), None)
        .with_clock(Arc::new(ManualClock::new(1_700_000_000)));
    let bridge = Bridge::build(&config, issuer, transport).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let status = bridge.relay.subscribe();
    let cancel = CancellationToken::new();
    let relay = tokio::spawn(bridge.relay.run(listener, cancel.clone()));

    Harness { addr, messages, status, cancel, relay }
}

fn small_frames() -> BridgeConfig {
    BridgeConfig {
        frame_byte_length: 8,
        idle_timeout_seconds: 1,
        hub_host: "myhub.azure-devices.net".to_string(),
        device_id: "ecg-01".to_string(),
        ..BridgeConfig::default()
    }
}

fn le_bytes(samples: &[u16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

async fn next_message(harness: &mut Harness) -> (String, String) {
    let (topic, body) = tokio::time::timeout(Duration::from_secs(5), harness.messages.recv())
        .await
        .expect("no publish within 5s")
        .expect("transport dropped");
    (topic, String::from_utf8(body).unwrap())
}

#[tokio::test]
async fn frames_and_keepalives_become_two_messages() {
    let mut harness = start_bridge(small_frames()).await;

    let mut sensor = TcpStream::connect(harness.addr).await.unwrap();
    sensor.write_all(&le_bytes(&[1, 2, 3, 4])).await.unwrap();
    sensor.write_all(b"PING").await.unwrap();
    sensor.write_all(&le_bytes(&[100, 200])).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    sensor.write_all(&le_bytes(&[300, 400])).await.unwrap();
    drop(sensor);

    let (topic, first) = next_message(&mut harness).await;
    assert_eq!(topic, "devices/ecg-01/messages/events/");
    assert_eq!(first, r#"{"ecg":[1,2,3,4]}"#);

    let (_, second) = next_message(&mut harness).await;
    assert_eq!(second, r#"{"ecg":[100,200,300,400]}"#);

    harness.cancel.cancel();
    let stats = harness.relay.await.unwrap().unwrap();
    assert_eq!(stats.frames_published, 2);
    assert_eq!(stats.frames_dropped, 0);
}

#[tokio::test]
async fn truncated_frame_is_dropped_and_next_sensor_is_served() {
    let mut harness = start_bridge(small_frames()).await;

    let mut sensor = TcpStream::connect(harness.addr).await.unwrap();
    sensor.write_all(&[0x01, 0x00, 0x02]).await.unwrap();
    drop(sensor);

    harness
        .status
        .wait_for(|s| s.stats.connections_served == 1 && s.state == RelayState::AwaitingConnection)
        .await
        .unwrap();
    assert!(harness.messages.try_recv().is_err());

    let mut sensor = TcpStream::connect(harness.addr).await.unwrap();
    sensor.write_all(&le_bytes(&[9, 8, 7, 6])).await.unwrap();
    drop(sensor);

    let (_, body) = next_message(&mut harness).await;
    assert_eq!(body, r#"{"ecg":[9,8,7,6]}"#);

    harness.cancel.cancel();
    let stats = harness.relay.await.unwrap().unwrap();
    assert_eq!(stats.connections_served, 2);
    assert_eq!(stats.frames_received, 1);
}

#[tokio::test]
async fn moving_average_from_yaml_config() {
    let yaml = r#"
frameByteLength: 8
hubHost: myhub.azure-devices.net
deviceId: ecg-01
filter:
  kind: movingAverage
  window: 2
"#;
    let mut harness = start_bridge(BridgeConfig::from_yaml_str(yaml).unwrap()).await;

    let mut sensor = TcpStream::connect(harness.addr).await.unwrap();
    sensor.write_all(&le_bytes(&[10, 20, 30, 40])).await.unwrap();
    drop(sensor);

    let (_, body) = next_message(&mut harness).await;
    assert_eq!(body, r#"{"ecg":[15,25,35]}"#);

    harness.cancel.cancel();
    harness.relay.await.unwrap().unwrap();
}
