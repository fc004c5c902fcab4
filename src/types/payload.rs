//! Outbound message body

use serde::Serialize;

use super::Frame;
use crate::Result;

/// JSON body published for every frame: `{"ecg": [..samples..]}`
#[derive(Debug, Serialize)]
pub struct EcgPayload<'a> {
    /// Samples in original stream order
    pub ecg: &'a [u16],
}

impl<'a> EcgPayload<'a> {
    /// Borrow the samples of a frame
    pub fn from_frame(frame: &'a Frame) -> Self {
        Self { ecg: &frame.samples }
    }

    /// Serialize to UTF-8 JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_single_array_field() {
        let frame = Frame::new(vec![1, 2, 3, 4], 1);
        let bytes = EcgPayload::from_frame(&frame).to_bytes().unwrap();
        assert_eq!(std::str::from_utf8(&bytes).unwrap(), r#"{"ecg":[1,2,3,4]}"#);
    }

    #[test]
    fn round_trips_through_json_value() {
        let frame = Frame::new(vec![0, 65535, 512], 9);
        let bytes = EcgPayload::from_frame(&frame).to_bytes().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        let samples = value["ecg"].as_array().expect("ecg must be an array");
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[1], 65535);
        assert_eq!(value.as_object().unwrap().len(), 1);
    }
}
