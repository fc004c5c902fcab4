//! ecg-bridge - relay ECG frames from a TCP sensor to an IoT hub.
//!
//! Usage: `ecg-bridge [config.yaml]`. The config path may also come from
//! `ECG_BRIDGE_CONFIG`; without either, defaults plus `ECG_BRIDGE_*` variables apply.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use ecg_bridge::{Bridge, BridgeConfig, BridgeError, MqttTransport};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = load_config()?;
    if let Err(e) = config.validate() {
        report_startup_error(&e);
        bail!("refusing to start: {e}");
    }

    info!(
        listen = %config.listen_addr(),
        hub = %config.hub_host,
        device = %config.device_id,
        frame_bytes = config.frame_byte_length,
        "starting ecg-bridge"
    );

    let issuer = config.credential_issuer().context("failed to load device secret")?;
    let bridge = Bridge::build(&config, issuer, MqttTransport::new())
        .context("failed to build relay")?;

    let listener = TcpListener::bind(config.listen_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr()))?;

    let cancel = CancellationToken::new();
    let renewal = bridge.session.spawn_renewal(config.renewal_check(), cancel.clone());
    let mut relay = tokio::spawn(bridge.relay.run(listener, cancel.clone()));

    let finished = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                error!(error = %err, "failed to listen for shutdown signal");
            }
            info!("shutdown requested");
            cancel.cancel();
            relay.await
        }
        finished = &mut relay => finished,
    };
    cancel.cancel();

    match finished {
        Ok(Ok(stats)) => info!(
            published = stats.frames_published,
            dropped = stats.frames_dropped,
            "relay finished"
        ),
        Ok(Err(err)) => error!(error = %err, "relay failed"),
        Err(err) => error!(error = %err, "relay task panicked"),
    }

    if let Err(err) = renewal.await {
        warn!(error = %err, "renewal task ended abnormally");
    }
    bridge.session.close().await;

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).init();
}

fn load_config() -> Result<BridgeConfig> {
    let path = env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| env::var_os("ECG_BRIDGE_CONFIG").map(PathBuf::from));

    let mut config = match &path {
        Some(path) => BridgeConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => BridgeConfig::default(),
    };
    config.apply_env().context("invalid ECG_BRIDGE_* override")?;
    Ok(config)
}

fn report_startup_error(e: &BridgeError) {
    error!("{}", e);
    for suggestion in e.recovery_suggestions() {
        error!("  - {}", suggestion);
    }
}
