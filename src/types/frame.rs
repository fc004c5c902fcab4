//! Sample frame types

/// A complete batch of samples reassembled from the inbound stream
///
/// Frames only exist once every byte of the configured frame length has
/// arrived. Nothing in the crate builds a frame from a partial read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Decoded samples, in stream order
    pub samples: Vec<u16>,

    /// Per-connection frame counter, starting at 1
    pub sequence: u64,
}

impl Frame {
    /// Create a frame from already decoded samples
    pub fn new(samples: Vec<u16>, sequence: u64) -> Self {
        Self { samples, sequence }
    }

    /// Decode a frame from its little-endian wire bytes
    pub fn from_le_bytes(bytes: &[u8], sequence: u64) -> Self {
        Self { samples: decode_samples(bytes), sequence }
    }

    /// Number of samples in the frame
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Wire size of the samples, two bytes each
    pub fn byte_len(&self) -> usize {
        self.samples.len() * 2
    }

    /// Whether the frame carries no samples
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Decode little-endian unsigned 16-bit samples.
///
/// A trailing odd byte is ignored; frame lengths are validated even long
/// before bytes reach this function.
pub fn decode_samples(bytes: &[u8]) -> Vec<u16> {
    bytes.chunks_exact(2).map(|pair| u16::from_le_bytes([pair[0], pair[1]])).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn decodes_little_endian_in_order() {
        let frame = Frame::from_le_bytes(&[0x01, 0x00, 0x02, 0x00, 0x03, 0x00, 0x04, 0x00], 1);
        assert_eq!(frame.samples, vec![1, 2, 3, 4]);
        assert_eq!(frame.len(), 4);
        assert_eq!(frame.byte_len(), 8);
    }

    #[test]
    fn decodes_full_range() {
        assert_eq!(decode_samples(&[0xFF, 0xFF, 0x00, 0x80, 0x34, 0x12]), vec![65535, 32768, 0x1234]);
    }

    proptest! {
        #[test]
        fn decoding_inverts_le_encoding(samples in prop::collection::vec(any::<u16>(), 0..512)) {
            let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
            prop_assert_eq!(decode_samples(&bytes), samples);
        }
    }
}
