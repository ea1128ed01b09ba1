//! Decoder for the oximeter's proprietary telemetry packets.
//!
//! The device pushes notifications whose payload is one or more fixed-size
//! 5-byte packets. Decoding is a pure function of the input bytes; the
//! capture timestamp is supplied by the caller, so identical buffers always
//! produce identical readings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Fixed size of one telemetry packet in bytes.
pub const PACKET_SIZE: usize = 5;

/// High bit of byte 0, set on every well-formed packet.
const SYNC_BIT: u8 = 0x80;

/// Signal-strength nibble value meaning "no finger / recalibrating".
const SIGNAL_NO_FINGER: u8 = 0x0F;

/// SpO2 field value meaning "no calibration / no reading".
const SPO2_SENTINEL: u8 = 127;

/// Highest SpO2 the device reports as a calibrated percentage.
const SPO2_MAX: u8 = 100;

/// Reassembled pulse-rate value meaning "nothing to sense".
const PULSE_SENTINEL: u16 = 255;

/// Byte-2 flag bits.
mod flags {
    /// Set while the probe has no finger contact.
    pub const FINGER_OUT: u8 = 0x10;
    /// Set on samples where a pulse beat was detected.
    pub const PULSE_DETECT: u8 = 0x20;
    /// Bit 7 of the pulse rate.
    pub const RATE_HIGH: u8 = 0x40;
}

/// One decoded physiological snapshot.
///
/// `spo2` and `pulse_rate` are `None` whenever the sensor reports a sentinel
/// or has no finger contact, so a consumer can never mistake device noise
/// for a measurement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reading {
    /// Oxygen saturation percentage (0..=100).
    pub spo2: Option<u8>,
    /// Pulse rate in beats per minute (0..=254).
    pub pulse_rate: Option<u8>,
    /// Raw signal-strength nibble (0..=15, 15 meaning no finger).
    pub signal_strength: u8,
    /// Whether the probe currently has valid finger contact.
    pub finger_present: bool,
    /// Plethysmographic waveform sample (0..=127).
    pub pleth: u8,
    /// Pulse bar-graph intensity (0..=15).
    pub bar_graph: u8,
    /// A pulse beat was detected in this sample.
    pub pulse_detected: bool,
    /// When the containing frame was received from the link layer.
    pub captured_at: DateTime<Utc>,
}

/// Buffers that cannot be decoded at all.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty telemetry frame")]
    Empty,
    #[error("frame length {0} is not a multiple of the 5-byte packet size")]
    BadLength(usize),
}

/// Decode every packet in `frame` in sequence order.
///
/// The buffer must be a positive multiple of [`PACKET_SIZE`] bytes long or
/// the whole frame is rejected. A packet whose sync bit is clear is skipped
/// and logged without disturbing the packets that follow it.
pub fn decode_frame(
    frame: &[u8],
    captured_at: DateTime<Utc>,
) -> Result<Vec<Reading>, FrameError> {
    if frame.is_empty() {
        return Err(FrameError::Empty);
    }
    if frame.len() % PACKET_SIZE != 0 {
        return Err(FrameError::BadLength(frame.len()));
    }

    let mut readings = Vec::with_capacity(frame.len() / PACKET_SIZE);
    for (index, packet) in frame.chunks_exact(PACKET_SIZE).enumerate() {
        match decode_packet(packet, captured_at) {
            Some(reading) => readings.push(reading),
            None => warn!(packet = index, "skipping desynchronized telemetry packet"),
        }
    }
    Ok(readings)
}

/// Decode a single packet, or `None` when the sync bit is missing.
fn decode_packet(packet: &[u8], captured_at: DateTime<Utc>) -> Option<Reading> {
    debug_assert_eq!(packet.len(), PACKET_SIZE);
    if packet[0] & SYNC_BIT == 0 {
        return None;
    }

    let signal_strength = packet[0] & 0x0F;
    let pleth = packet[1] & 0x7F;
    let bar_graph = packet[2] & 0x0F;
    let finger_out = packet[2] & flags::FINGER_OUT != 0;
    let pulse_detected = packet[2] & flags::PULSE_DETECT != 0;
    let rate = u16::from(packet[2] & flags::RATE_HIGH) << 1 | u16::from(packet[3] & 0x7F);
    let spo2_raw = packet[4] & 0x7F;

    let finger_present = !finger_out
        && signal_strength != SIGNAL_NO_FINGER
        && spo2_raw != SPO2_SENTINEL
        && rate != PULSE_SENTINEL;

    // Values past the calibrated ceiling are treated like the sentinel so
    // they never reach a display.
    let spo2 = (finger_present && spo2_raw <= SPO2_MAX).then_some(spo2_raw);
    let pulse_rate = finger_present.then_some(rate as u8);

    Some(Reading {
        spo2,
        pulse_rate,
        signal_strength,
        finger_present,
        pleth,
        bar_graph,
        pulse_detected,
        captured_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    /// signal 5, pleth 64, bar 10, pulse beat, rate 72, SpO2 98
    const GOOD: [u8; 5] = [0x85, 0x40, 0x2A, 0x48, 0x62];

    #[test]
    fn decodes_a_valid_packet() {
        let readings = decode_frame(&GOOD, at()).unwrap();
        assert_eq!(readings.len(), 1);
        let r = &readings[0];
        assert_eq!(r.spo2, Some(98));
        assert_eq!(r.pulse_rate, Some(72));
        assert_eq!(r.signal_strength, 5);
        assert!(r.finger_present);
        assert_eq!(r.pleth, 64);
        assert_eq!(r.bar_graph, 10);
        assert!(r.pulse_detected);
        assert_eq!(r.captured_at, at());
    }

    #[test]
    fn decoding_is_deterministic() {
        let buf: Vec<u8> = [GOOD, GOOD, [0x8F, 0x00, 0x00, 0x7F, 0x7F]].concat();
        let first = decode_frame(&buf, at()).unwrap();
        let second = decode_frame(&buf, at()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn rejects_empty_buffer() {
        assert_eq!(decode_frame(&[], at()), Err(FrameError::Empty));
    }

    #[test]
    fn rejects_length_not_multiple_of_packet_size() {
        for len in [1, 4, 6, 9, 11] {
            let buf = vec![0x80u8; len];
            assert_eq!(decode_frame(&buf, at()), Err(FrameError::BadLength(len)));
        }
    }

    #[test]
    fn skips_desynchronized_packet_and_continues() {
        // Packet 2 has the sync bit clear; packets 1 and 3 must still decode.
        let buf: Vec<u8> = [GOOD, [0x10, 0x00, 0x00, 0x00, 0x00], GOOD].concat();
        let readings = decode_frame(&buf, at()).unwrap();
        assert_eq!(readings.len(), 2);
        assert!(readings.iter().all(|r| r.spo2 == Some(98)));
    }

    #[test]
    fn ten_byte_buffer_with_one_desynced_packet_yields_one_reading() {
        let buf: Vec<u8> = [GOOD, [0x10, 0x00, 0x00, 0x00, 0x00]].concat();
        let readings = decode_frame(&buf, at()).unwrap();
        assert_eq!(readings.len(), 1);
    }

    #[test]
    fn reassembles_pulse_rate_high_bit() {
        // Rate high bit set in byte 2, low bits 0x20 in byte 3.
        let packet = [0x85, 0x00, 0x40, 0x20, 0x62];
        let readings = decode_frame(&packet, at()).unwrap();
        assert_eq!(readings[0].pulse_rate, Some(160));
    }

    #[test]
    fn spo2_sentinel_decodes_to_absent() {
        let packet = [0x85, 0x00, 0x00, 0x48, 0x7F];
        let r = &decode_frame(&packet, at()).unwrap()[0];
        assert_eq!(r.spo2, None);
        // A sentinel also means there is nothing valid to sense.
        assert!(!r.finger_present);
        assert_eq!(r.pulse_rate, None);
    }

    #[test]
    fn pulse_sentinel_decodes_to_absent() {
        // 0x40 high bit + 0x7F low bits reassemble to 255.
        let packet = [0x85, 0x00, 0x40, 0x7F, 0x62];
        let r = &decode_frame(&packet, at()).unwrap()[0];
        assert_eq!(r.pulse_rate, None);
        assert!(!r.finger_present);
        assert_eq!(r.spo2, None);
    }

    #[test]
    fn no_finger_signal_forces_values_absent() {
        // Signal nibble 15 with otherwise plausible numeric fields.
        let packet = [0x8F, 0x10, 0x2A, 0x48, 0x62];
        let r = &decode_frame(&packet, at()).unwrap()[0];
        assert!(!r.finger_present);
        assert_eq!(r.spo2, None);
        assert_eq!(r.pulse_rate, None);
        assert_eq!(r.signal_strength, 15);
        // Waveform fields still come through for display.
        assert_eq!(r.pleth, 0x10);
        assert_eq!(r.bar_graph, 10);
    }

    #[test]
    fn finger_out_flag_forces_values_absent() {
        let packet = [0x85, 0x00, 0x10, 0x48, 0x62];
        let r = &decode_frame(&packet, at()).unwrap()[0];
        assert!(!r.finger_present);
        assert_eq!(r.spo2, None);
        assert_eq!(r.pulse_rate, None);
    }

    #[test]
    fn out_of_range_spo2_is_absent_but_finger_still_present() {
        // Raw 110 is between the calibrated ceiling and the sentinel.
        let packet = [0x85, 0x00, 0x00, 0x48, 0x6E];
        let r = &decode_frame(&packet, at()).unwrap()[0];
        assert!(r.finger_present);
        assert_eq!(r.spo2, None);
        assert_eq!(r.pulse_rate, Some(72));
    }
}
