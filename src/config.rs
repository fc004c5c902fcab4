//! Bridge configuration from YAML and the environment
//!
//! Options are read from an optional YAML file and then overridden by
//! `ECG_BRIDGE_*` environment variables. The device secret is never part of
//! the file: it comes from the environment variable named by `secretKeyEnv`.
//!
//! ```yaml
//! port: 8080
//! frameByteLength: 4000
//! idleTimeoutSeconds: 3
//! hubHost: myhub.azure-devices.net
//! deviceId: ecg-01
//! filter:
//!   kind: movingAverage
//!   window: 10
//! render: log
//! ```

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::credential::{CredentialIssuer, SecretKey};
use crate::marker::{DEFAULT_MARKER, MarkerFilter};
use crate::pipeline::{DEFAULT_WINDOW, LogSink, MovingAverage, NoopSink, Passthrough, SampleFilter, SampleSink};
use crate::reader::FrameReader;
use crate::relay::RelayOptions;
use crate::session::{MQTT_TLS_PORT, SessionSettings};
use crate::types::FrameLength;
use crate::{BridgeError, Result};

/// Prefix of every environment override
pub const ENV_PREFIX: &str = "ECG_BRIDGE_";

/// Environment variable holding the device secret unless configured otherwise
pub const DEFAULT_SECRET_KEY_ENV: &str = "IOTHUB_DEVICE_KEY";

/// Which filter runs on each frame before publishing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterKind {
    None,
    MovingAverage,
}

/// Filter selection; accepts `filter: none` or `filter: {kind: movingAverage, window: 5}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "FilterRepr")]
pub struct FilterConfig {
    pub kind: FilterKind,
    pub window: usize,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FilterRepr {
    Kind(FilterKind),
    #[serde(rename_all = "camelCase")]
    Detailed {
        kind: FilterKind,
        #[serde(default = "default_window")]
        window: usize,
    },
}

impl From<FilterRepr> for FilterConfig {
    fn from(repr: FilterRepr) -> Self {
        match repr {
            FilterRepr::Kind(kind) => Self { kind, window: DEFAULT_WINDOW },
            FilterRepr::Detailed { kind, window } => Self { kind, window },
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self { kind: FilterKind::None, window: DEFAULT_WINDOW }
    }
}

fn default_window() -> usize {
    DEFAULT_WINDOW
}

/// Local rendering of frames
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RenderKind {
    #[default]
    None,
    Log,
}

/// Complete bridge configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Inbound listen address
    pub host: String,
    /// Inbound listen port
    pub port: u16,

    /// Bytes per frame after marker stripping
    #[serde(alias = "bufferSize")]
    pub frame_byte_length: usize,
    pub idle_timeout_seconds: u64,
    /// Consecutive empty idle timeouts tolerated per connection
    pub read_retry_budget: u32,
    /// Empty disables marker stripping
    pub keep_alive_marker: String,
    pub reply_on_error: bool,
    pub publish_errors_are_fatal: bool,

    pub hub_host: String,
    pub device_id: String,
    pub broker_port: u16,
    pub tls: bool,
    /// Shared access policy name, when the key belongs to a hub policy
    pub policy_name: Option<String>,
    /// Name of the environment variable holding the base64 device key
    pub secret_key_env: String,
    pub token_validity_seconds: u64,
    pub renew_at_fraction: f64,
    pub renewal_check_seconds: u64,
    pub publish_timeout_millis: u64,
    /// Bounds connects made by the renewal task; a reconnect on the publish
    /// path is cut off at `publishTimeoutMillis` instead
    pub connect_timeout_seconds: u64,
    /// MQTT keep-alive interval
    pub keep_alive_seconds: u64,

    pub filter: FilterConfig,
    pub render: RenderKind,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            frame_byte_length: 4000,
            idle_timeout_seconds: 3,
            read_retry_budget: 3,
            keep_alive_marker: String::from_utf8_lossy(DEFAULT_MARKER).into_owned(),
            reply_on_error: true,
            publish_errors_are_fatal: false,
            hub_host: String::new(),
            device_id: String::new(),
            broker_port: MQTT_TLS_PORT,
            tls: true,
            policy_name: None,
            secret_key_env: DEFAULT_SECRET_KEY_ENV.to_string(),
            token_validity_seconds: 3600,
            renew_at_fraction: 0.9,
            renewal_check_seconds: 30,
            publish_timeout_millis: 5000,
            connect_timeout_seconds: 10,
            keep_alive_seconds: 60,
            filter: FilterConfig::default(),
            render: RenderKind::None,
        }
    }
}

impl BridgeConfig {
    /// Parse a YAML document; missing options take their defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml_ng::from_str(yaml).map_err(|e| BridgeError::config("yaml", e.to_string()))
    }

    /// Read and parse a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::io(format!("reading config file {}", path.display()), e))?;
        debug!("Loaded configuration from {}", path.display());
        Self::from_yaml_str(&yaml)
    }

    /// Apply `ECG_BRIDGE_*` overrides from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| lookup(&format!("{ENV_PREFIX}{suffix}"));

        if let Some(v) = var("HOST") {
            self.host = v;
        }
        override_parsed(&mut self.port, var("PORT"), "PORT")?;
        override_parsed(&mut self.frame_byte_length, var("BUFFER_SIZE"), "BUFFER_SIZE")?;
        override_parsed(&mut self.frame_byte_length, var("FRAME_BYTE_LENGTH"), "FRAME_BYTE_LENGTH")?;
        override_parsed(&mut self.idle_timeout_seconds, var("IDLE_TIMEOUT_SECONDS"), "IDLE_TIMEOUT_SECONDS")?;
        override_parsed(&mut self.read_retry_budget, var("READ_RETRY_BUDGET"), "READ_RETRY_BUDGET")?;
        if let Some(v) = var("KEEP_ALIVE_MARKER") {
            self.keep_alive_marker = v;
        }
        override_parsed(&mut self.reply_on_error, var("REPLY_ON_ERROR"), "REPLY_ON_ERROR")?;
        override_parsed(
            &mut self.publish_errors_are_fatal,
            var("PUBLISH_ERRORS_ARE_FATAL"),
            "PUBLISH_ERRORS_ARE_FATAL",
        )?;
        if let Some(v) = var("HUB_HOST") {
            self.hub_host = v;
        }
        if let Some(v) = var("DEVICE_ID") {
            self.device_id = v;
        }
        override_parsed(&mut self.broker_port, var("BROKER_PORT"), "BROKER_PORT")?;
        override_parsed(&mut self.tls, var("TLS"), "TLS")?;
        if let Some(v) = var("POLICY_NAME") {
            self.policy_name = Some(v).filter(|p| !p.is_empty());
        }
        if let Some(v) = var("SECRET_KEY_ENV") {
            self.secret_key_env = v;
        }
        override_parsed(
            &mut self.token_validity_seconds,
            var("TOKEN_VALIDITY_SECONDS"),
            "TOKEN_VALIDITY_SECONDS",
        )?;
        override_parsed(&mut self.renew_at_fraction, var("RENEW_AT_FRACTION"), "RENEW_AT_FRACTION")?;
        override_parsed(
            &mut self.renewal_check_seconds,
            var("RENEWAL_CHECK_SECONDS"),
            "RENEWAL_CHECK_SECONDS",
        )?;
        override_parsed(
            &mut self.publish_timeout_millis,
            var("PUBLISH_TIMEOUT_MILLIS"),
            "PUBLISH_TIMEOUT_MILLIS",
        )?;
        override_parsed(
            &mut self.connect_timeout_seconds,
            var("CONNECT_TIMEOUT_SECONDS"),
            "CONNECT_TIMEOUT_SECONDS",
        )?;
        override_parsed(&mut self.keep_alive_seconds, var("KEEP_ALIVE_SECONDS"), "KEEP_ALIVE_SECONDS")?;
        if let Some(v) = var("FILTER") {
            self.filter.kind = match v.as_str() {
                "none" => FilterKind::None,
                "movingAverage" => FilterKind::MovingAverage,
                other => {
                    return Err(BridgeError::config(
                        format!("{ENV_PREFIX}FILTER"),
                        format!("expected 'none' or 'movingAverage', got '{other}'"),
                    ));
                }
            };
        }
        override_parsed(&mut self.filter.window, var("FILTER_WINDOW"), "FILTER_WINDOW")?;
        if let Some(v) = var("RENDER") {
            self.render = match v.as_str() {
                "none" => RenderKind::None,
                "log" => RenderKind::Log,
                other => {
                    return Err(BridgeError::config(
                        format!("{ENV_PREFIX}RENDER"),
                        format!("expected 'none' or 'log', got '{other}'"),
                    ));
                }
            };
        }
        Ok(())
    }

    /// Check every option and the device secret from the process environment.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::MalformedFrameLength`] for a zero or odd frame length
    /// - [`BridgeError::InvalidKey`] if the secret is missing or unusable
    /// - [`BridgeError::Config`] for any other bad option
    pub fn validate(&self) -> Result<()> {
        self.validate_with(|name| std::env::var(name).ok())
    }

    /// [`validate`](Self::validate) with an arbitrary variable lookup
    pub fn validate_with<F>(&self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.frame_length()?;

        if self.idle_timeout_seconds == 0 {
            return Err(BridgeError::config("idleTimeoutSeconds", "must be at least 1"));
        }
        if self.hub_host.trim().is_empty() {
            return Err(BridgeError::config("hubHost", "hub host name is required"));
        }
        if self.device_id.trim().is_empty() {
            return Err(BridgeError::config("deviceId", "device id is required"));
        }
        if !(self.renew_at_fraction > 0.0 && self.renew_at_fraction <= 1.0) {
            return Err(BridgeError::config(
                "renewAtFraction",
                format!("must be in (0, 1], got {}", self.renew_at_fraction),
            ));
        }
        if self.token_validity_seconds == 0 {
            return Err(BridgeError::config("tokenValiditySeconds", "must be at least 1"));
        }
        if self.publish_timeout_millis == 0 {
            return Err(BridgeError::config("publishTimeoutMillis", "must be at least 1"));
        }
        if self.connect_timeout_seconds == 0 {
            return Err(BridgeError::config("connectTimeoutSeconds", "must be at least 1"));
        }
        if self.renewal_check_seconds == 0 {
            return Err(BridgeError::config("renewalCheckSeconds", "must be at least 1"));
        }
        if self.filter.kind == FilterKind::MovingAverage {
            MovingAverage::new(self.filter.window)?;
        }

        self.secret_key_with(lookup)?;
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn frame_length(&self) -> Result<FrameLength> {
        FrameLength::new(self.frame_byte_length)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    pub fn renewal_check(&self) -> Duration {
        Duration::from_secs(self.renewal_check_seconds)
    }

    pub fn markers(&self) -> MarkerFilter {
        MarkerFilter::new(self.keep_alive_marker.as_bytes())
    }

    pub fn frame_reader(&self) -> Result<FrameReader> {
        Ok(FrameReader::new(self.frame_length()?, self.idle_timeout()).with_markers(self.markers()))
    }

    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            read_retry_budget: self.read_retry_budget,
            reply_on_error: self.reply_on_error,
            publish_errors_are_fatal: self.publish_errors_are_fatal,
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            port: self.broker_port,
            tls: self.tls,
            token_validity: Duration::from_secs(self.token_validity_seconds),
            renew_at_fraction: self.renew_at_fraction,
            publish_timeout: Duration::from_millis(self.publish_timeout_millis),
            connect_timeout: Duration::from_secs(self.connect_timeout_seconds),
            keep_alive: Duration::from_secs(self.keep_alive_seconds),
            ..SessionSettings::new(self.hub_host.clone(), self.device_id.clone())
        }
    }

    /// Read the device secret from the process environment
    pub fn secret_key(&self) -> Result<SecretKey> {
        self.secret_key_with(|name| std::env::var(name).ok())
    }

    pub fn secret_key_with<F>(&self, lookup: F) -> Result<SecretKey>
    where
        F: Fn(&str) -> Option<String>,
    {
        SecretKey::from_base64(lookup(&self.secret_key_env).as_deref()).map_err(|e| match e {
            BridgeError::InvalidKey { reason } => {
                BridgeError::invalid_key(format!("{reason} (from ${})", self.secret_key_env))
            }
            other => other,
        })
    }

    pub fn credential_issuer(&self) -> Result<CredentialIssuer> {
        Ok(CredentialIssuer::new(self.secret_key()?, self.policy_name.clone()))
    }

    pub fn build_filter(&self) -> Result<Box<dyn SampleFilter>> {
        Ok(match self.filter.kind {
            FilterKind::None => Box::new(Passthrough),
            FilterKind::MovingAverage => Box::new(MovingAverage::new(self.filter.window)?),
        })
    }

    pub fn build_sink(&self) -> Box<dyn SampleSink> {
        match self.render {
            RenderKind::None => Box::new(NoopSink),
            RenderKind::Log => Box::new(LogSink::new()),
        }
    }
}

fn override_parsed<T>(slot: &mut T, value: Option<String>, suffix: &str) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = value {
        *slot = raw.trim().parse().map_err(|e| {
            BridgeError::config(format!("{ENV_PREFIX}{suffix}"), format!("cannot parse '{raw}': {e}"))
        })?;
    }
    Ok(())
}
