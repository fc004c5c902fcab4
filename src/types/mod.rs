//! Core data types flowing through the relay.
//!
//! - [`Frame`] is one complete batch of decoded samples
//! - [`FrameLength`] is the validated byte size of a frame on the wire
//! - [`EcgPayload`] is the JSON body published for each frame
//!
//! ## Usage Example
//!
//! ```rust
//! use ecg_bridge::types::{EcgPayload, Frame, FrameLength};
//!
//! let length = FrameLength::new(8).unwrap();
//! let frame = Frame::from_le_bytes(&[1, 0, 2, 0, 3, 0, 4, 0], 1);
//! assert_eq!(frame.len(), length.samples());
//!
//! let body = EcgPayload::from_frame(&frame).to_bytes().unwrap();
//! assert_eq!(body, br#"{"ecg":[1,2,3,4]}"#);
//! ```

mod frame;
mod frame_length;
mod payload;

pub use frame::{Frame, decode_samples};
pub use frame_length::FrameLength;
pub use payload::EcgPayload;
