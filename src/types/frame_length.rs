//! Validated frame size

use serde::{Deserialize, Deserializer};

use crate::{BridgeError, Result};

/// Number of bytes in one inbound frame
///
/// Always even and non-zero: every frame decodes to a whole number of
/// 16-bit samples. Construct with [`FrameLength::new`] or
/// [`FrameLength::from_samples`]; deserialization applies the same check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameLength(usize);

impl FrameLength {
    /// Validate a frame length in bytes
    pub fn new(bytes: usize) -> Result<Self> {
        if bytes == 0 || bytes % 2 != 0 {
            return Err(BridgeError::MalformedFrameLength { length: bytes });
        }
        Ok(Self(bytes))
    }

    /// Frame length for a given sample count
    pub fn from_samples(samples: usize) -> Result<Self> {
        let bytes = samples
            .checked_mul(2)
            .ok_or(BridgeError::MalformedFrameLength { length: usize::MAX })?;
        Self::new(bytes)
    }

    /// Length in bytes
    pub fn bytes(self) -> usize {
        self.0
    }

    /// Number of samples per frame
    pub fn samples(self) -> usize {
        self.0 / 2
    }
}

impl<'de> Deserialize<'de> for FrameLength {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = usize::deserialize(deserializer)?;
        FrameLength::new(bytes).map_err(serde::de::Error::custom)
    }
}

impl std::fmt::Display for FrameLength {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} bytes", self.0)
    }
}
