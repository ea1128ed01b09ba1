//! Telemetry protocol support for the oximeter's fixed 5-byte framing.

pub mod decoder;

pub use decoder::{decode_frame, FrameError, Reading, PACKET_SIZE};
