//! Time-limited shared access signatures for the broker session
//!
//! The hub authenticates devices with a token derived from the device's
//! shared secret:
//!
//! ```text
//! sig = base64(HMAC-SHA256(base64decode(key), urlencode(uri) + "\n" + expiry))
//! token = "sr=" + urlencode(uri) + "&sig=" + urlencode(sig) + "&se=" + expiry [+ "&skn=" + policy]
//! ```
//!
//! Expiry is fixed when the credential is issued, so a credential ages from
//! the moment it is created, not from the moment it is used.
//!
//! ```rust
//! use ecg_bridge::credential::{CredentialIssuer, ManualClock, SecretKey};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let key = SecretKey::from_base64(Some("c2VjcmV0LWRldmljZS1rZXk=")).unwrap();
//! let clock = Arc::new(ManualClock::new(1_700_000_000));
//! let issuer = CredentialIssuer::new(key, None).with_clock(clock);
//!
//! let credential = issuer.issue("myhub.azure-devices.net/devices/ecg-01", Duration::from_secs(3600)).unwrap();
//! assert_eq!(credential.expires_at(), 1_700_003_600);
//! assert!(credential.password().starts_with("SharedAccessSignature sr="));
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use sha2::Sha256;

use crate::{BridgeError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Prefix the broker expects in front of the token in the password field
pub const PASSWORD_PREFIX: &str = "SharedAccessSignature ";

/// Characters left alone by form-style URL encoding
const FORM_ENCODE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

/// Source of wall-clock time in whole seconds since the Unix epoch
pub trait Clock: Send + Sync + 'static {
    /// Current time in epoch seconds
    fn now(&self) -> u64;
}

/// The operating system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
    }
}

/// A clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Start the clock at the given epoch second
    pub fn new(now: u64) -> Self {
        Self { now: AtomicU64::new(now) }
    }

    /// Jump to an absolute time
    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Move forward by `by`
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_secs(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Decoded device secret
///
/// Validated at construction so a bad key stops the process at startup
/// instead of surfacing later as an opaque broker rejection.
#[derive(Clone)]
pub struct SecretKey {
    bytes: Vec<u8>,
}

impl SecretKey {
    /// Decode a standard base64 secret.
    ///
    /// # Errors
    ///
    /// [`BridgeError::InvalidKey`] if the key is absent, empty or not valid base64.
    pub fn from_base64(encoded: Option<&str>) -> Result<Self> {
        let encoded = encoded.ok_or_else(|| BridgeError::invalid_key("secret key is absent"))?;
        let encoded = encoded.trim();
        if encoded.is_empty() {
            return Err(BridgeError::invalid_key("secret key is empty"));
        }

        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| BridgeError::invalid_key(format!("secret key is not valid base64: {e}")))?;
        if bytes.is_empty() {
            return Err(BridgeError::invalid_key("secret key decodes to zero bytes"));
        }

        Ok(Self { bytes })
    }

    fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKey").field("len", &self.bytes.len()).finish_non_exhaustive()
    }
}

/// An issued, immutable authorization token
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    resource_uri: String,
    signature: String,
    issued_at: u64,
    expires_at: u64,
    policy_name: Option<String>,
}

impl Credential {
    /// Resource the token grants access to
    pub fn resource_uri(&self) -> &str {
        &self.resource_uri
    }

    /// Base64 HMAC-SHA256 signature
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Issuance time in epoch seconds
    pub fn issued_at(&self) -> u64 {
        self.issued_at
    }

    /// Expiry in epoch seconds; the credential is invalid strictly after this
    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }

    /// Signing policy name, when signed with a shared access policy key
    pub fn policy_name(&self) -> Option<&str> {
        self.policy_name.as_deref()
    }

    /// Serialized token: `sr`, `sig`, `se` and optionally `skn`, in that order
    pub fn token(&self) -> String {
        let mut token = format!(
            "sr={}&sig={}&se={}",
            form_encode(&self.resource_uri),
            form_encode(&self.signature),
            self.expires_at
        );
        if let Some(policy) = &self.policy_name {
            token.push_str("&skn=");
            token.push_str(&form_encode(policy));
        }
        token
    }

    /// MQTT password field: the token behind the `SharedAccessSignature ` prefix
    pub fn password(&self) -> String {
        format!("{PASSWORD_PREFIX}{}", self.token())
    }

    /// Whether the credential can no longer be used at `now`
    pub fn is_expired_at(&self, now: u64) -> bool {
        now > self.expires_at
    }

    /// Seconds of validity left at `now`
    pub fn remaining_at(&self, now: u64) -> u64 {
        self.expires_at.saturating_sub(now)
    }

    /// Whether `fraction` of the validity window has elapsed at `now`.
    ///
    /// Always true once `now` reaches `expires_at`, whatever the fraction.
    pub fn needs_renewal_at(&self, now: u64, fraction: f64) -> bool {
        let window = self.expires_at.saturating_sub(self.issued_at);
        let renew_after = (window as f64 * fraction.clamp(0.0, 1.0)).floor() as u64;
        let renew_at = self.issued_at.saturating_add(renew_after).min(self.expires_at);
        now >= renew_at
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("resource_uri", &self.resource_uri)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("policy_name", &self.policy_name)
            .finish_non_exhaustive()
    }
}

/// Signs credentials for one device key
#[derive(Clone)]
pub struct CredentialIssuer {
    key: SecretKey,
    policy_name: Option<String>,
    clock: Arc<dyn Clock>,
}

impl CredentialIssuer {
    /// Create an issuer on the system clock
    pub fn new(key: SecretKey, policy_name: Option<String>) -> Self {
        Self { key, policy_name, clock: Arc::new(SystemClock) }
    }

    /// Replace the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Current time on the issuer's clock
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Issue a credential for `resource_uri` valid for `validity` from now
    pub fn issue(&self, resource_uri: &str, validity: Duration) -> Result<Credential> {
        let issued_at = self.clock.now();
        let expires_at = issued_at.saturating_add(validity.as_secs());

        let string_to_sign = format!("{}\n{}", form_encode(resource_uri), expires_at);
        let mut mac = HmacSha256::new_from_slice(self.key.as_bytes())
            .map_err(|e| BridgeError::invalid_key(e.to_string()))?;
        mac.update(string_to_sign.as_bytes());
        let signature = STANDARD.encode(mac.finalize().into_bytes());

        Ok(Credential {
            resource_uri: resource_uri.to_string(),
            signature,
            issued_at,
            expires_at,
            policy_name: self.policy_name.clone(),
        })
    }
}

impl std::fmt::Debug for CredentialIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialIssuer")
            .field("key", &self.key)
            .field("policy_name", &self.policy_name)
            .finish_non_exhaustive()
    }
}

/// Validate `secret_key_base64` and issue one credential on the system clock.
pub fn issue(
    resource_uri: &str,
    secret_key_base64: Option<&str>,
    policy_name: Option<&str>,
    validity_seconds: u64,
) -> Result<Credential> {
    let key = SecretKey::from_base64(secret_key_base64)?;
    CredentialIssuer::new(key, policy_name.map(str::to_string))
        .issue(resource_uri, Duration::from_secs(validity_seconds))
}

/// URL-encode like an HTML form: unreserved characters kept, space as `+`
fn form_encode(value: &str) -> String {
    utf8_percent_encode(value, FORM_ENCODE).to_string().replace("%20", "+")
}
