//! Keep-alive marker stripping
//!
//! Some sensor transports inject a literal keep-alive marker (ASCII `PING`)
//! into the byte stream between or even inside frames. Those bytes are not
//! samples and must vanish before the frame length is counted, otherwise
//! every later sample is shifted by the marker length.
//!
//! Stripping runs to a fixed point: removing one marker can join two halves
//! into a new one (`PIPINGNG`), and that one is removed too. The result
//! never contains the marker, so stripping twice equals stripping once.

/// Marker injected by the sensor transport when it has nothing to send
pub const DEFAULT_MARKER: &[u8] = b"PING";

/// Removes a fixed byte marker from an accumulating buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerFilter {
    marker: Vec<u8>,
}

impl Default for MarkerFilter {
    fn default() -> Self {
        Self::new(DEFAULT_MARKER)
    }
}

impl MarkerFilter {
    /// Create a filter for the given marker (an empty marker disables stripping)
    pub fn new(marker: impl Into<Vec<u8>>) -> Self {
        Self { marker: marker.into() }
    }

    /// A filter that passes every byte through
    pub fn disabled() -> Self {
        Self { marker: Vec::new() }
    }

    /// Whether any stripping happens at all
    pub fn is_enabled(&self) -> bool {
        !self.marker.is_empty()
    }

    /// The marker bytes
    pub fn marker(&self) -> &[u8] {
        &self.marker
    }

    /// Append `chunk` to `buffer` and strip every marker the new bytes complete.
    ///
    /// `buffer` must already be marker-free, which holds whenever it is only
    /// ever grown through this method. Returns the number of marker bytes removed.
    pub fn extend(&self, buffer: &mut Vec<u8>, chunk: &[u8]) -> usize {
        if !self.is_enabled() {
            buffer.extend_from_slice(chunk);
            return 0;
        }

        // A marker split across reads starts at most marker.len() - 1 bytes back
        let from = buffer.len().saturating_sub(self.marker.len() - 1);
        buffer.extend_from_slice(chunk);
        self.strip_from(buffer, from)
    }

    /// Length of the longest tail of `buffer` that could still turn into a marker.
    ///
    /// Those bytes are not final yet: the next byte on the wire decides whether
    /// they are samples or the start of a keep-alive.
    pub fn pending_len(&self, buffer: &[u8]) -> usize {
        if !self.is_enabled() {
            return 0;
        }
        let longest = (self.marker.len() - 1).min(buffer.len());
        (1..=longest).rev().find(|&n| buffer.ends_with(&self.marker[..n])).unwrap_or(0)
    }

    /// Strip every marker from `bytes`, returning the remaining bytes in order
    pub fn strip(&self, bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(bytes.len());
        self.extend(&mut out, bytes);
        out
    }

    fn strip_from(&self, buffer: &mut Vec<u8>, mut from: usize) -> usize {
        let len = self.marker.len();
        let mut removed = 0;

        while let Some(offset) = find(&buffer[from..], &self.marker) {
            let at = from + offset;
            buffer.drain(at..at + len);
            removed += len;
            from = at.saturating_sub(len - 1);
        }

        removed
    }
}

/// Strip `marker` from `bytes` (convenience over [`MarkerFilter::strip`])
pub fn strip_markers(bytes: &[u8], marker: &[u8]) -> Vec<u8> {
    MarkerFilter::new(marker).strip(bytes)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        find(haystack, needle).is_some()
    }

    #[test]
    fn strips_whole_markers() {
        assert_eq!(strip_markers(b"PING\x01\x00PING\x02\x00PING", b"PING"), b"\x01\x00\x02\x00");
    }

    #[test]
    fn strips_markers_joined_by_removal() {
        assert_eq!(strip_markers(b"PIPINGNG", b"PING"), b"");
        assert_eq!(strip_markers(b"\x01PPIPINGNGING\x02", b"PING"), b"\x01\x02");
    }

    #[test]
    fn keeps_marker_prefixes() {
        assert_eq!(strip_markers(b"PIN", b"PING"), b"PIN");
        assert_eq!(strip_markers(b"PINPONG", b"PING"), b"PINPONG");
    }

    #[test]
    fn strips_marker_split_across_chunks() {
        let filter = MarkerFilter::default();
        let mut buffer = Vec::new();

        assert_eq!(filter.extend(&mut buffer, b"\x01\x00P"), 0);
        assert_eq!(filter.extend(&mut buffer, b"I"), 0);
        assert_eq!(filter.extend(&mut buffer, b"N"), 0);
        assert_eq!(filter.extend(&mut buffer, b"G\x02\x00"), 4);
        assert_eq!(buffer, b"\x01\x00\x02\x00");
    }

    #[test]
    fn pending_tail_is_longest_marker_prefix() {
        let filter = MarkerFilter::default();
        assert_eq!(filter.pending_len(b"\x01\x00"), 0);
        assert_eq!(filter.pending_len(b"\x01P"), 1);
        assert_eq!(filter.pending_len(b"\x01PI"), 2);
        assert_eq!(filter.pending_len(b"PIN"), 3);
        assert_eq!(filter.pending_len(b"PINX"), 0);
        assert_eq!(MarkerFilter::disabled().pending_len(b"PIN"), 0);
    }

    #[test]
    fn disabled_filter_passes_everything() {
        let filter = MarkerFilter::disabled();
        assert!(!filter.is_enabled());
        assert_eq!(filter.strip(b"PING"), b"PING");
    }

    fn marker_heavy_bytes() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(prop::sample::select(vec![b'P', b'I', b'N', b'G', 0u8, 1u8]), 0..64)
    }

    proptest! {
        #[test]
        fn stripping_is_idempotent(bytes in marker_heavy_bytes()) {
            let once = strip_markers(&bytes, DEFAULT_MARKER);
            prop_assert!(!contains(&once, DEFAULT_MARKER));
            prop_assert_eq!(strip_markers(&once, DEFAULT_MARKER), once);
        }

        #[test]
        fn inserted_markers_vanish(
            data in marker_heavy_bytes(),
            offsets in prop::collection::vec(any::<prop::sample::Index>(), 0..6)
        ) {
            prop_assume!(!contains(&data, DEFAULT_MARKER));

            let mut cut_points: Vec<usize> = offsets.iter().map(|i| i.index(data.len() + 1)).collect();
            cut_points.sort_unstable();

            let mut noisy = Vec::new();
            let mut last = 0;
            for cut in cut_points {
                noisy.extend_from_slice(&data[last..cut]);
                noisy.extend_from_slice(DEFAULT_MARKER);
                last = cut;
            }
            noisy.extend_from_slice(&data[last..]);

            prop_assert_eq!(strip_markers(&noisy, DEFAULT_MARKER), data);
        }

        #[test]
        fn chunked_extend_matches_one_shot(
            bytes in marker_heavy_bytes(),
            chunk in 1usize..8
        ) {
            let filter = MarkerFilter::default();
            let mut buffer = Vec::new();
            for piece in bytes.chunks(chunk) {
                filter.extend(&mut buffer, piece);
            }
            prop_assert_eq!(buffer, filter.strip(&bytes));
        }
    }
}
