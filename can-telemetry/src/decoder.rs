//! Frame decoding API
//!
//! `FrameDecoder` turns one raw frame into one decoded sample using a signal
//! database. Decode errors are per frame: callers skip the frame and carry on.

use crate::dtc;
use crate::message_decoder::{MessageDecoder, ShortPayload};
use crate::signals::database::{MessageLayout, SignalDatabase};
use crate::types::{BusError, DecodeError, DecodedSample, RawFrame};

/// Decodes raw frames into samples
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameDecoder;

impl FrameDecoder {
    /// Decode a frame.
    ///
    /// Diagnostic frames that are not in the database still produce a sample when
    /// they carry trouble codes, so fault reporting does not depend on the DBC.
    ///
    /// # Example
    /// ```
    /// use can_telemetry::{ByteOrder, FrameDecoder, MessageLayout, Protocol, RawFrame,
    ///     SignalDatabase, SignalDescriptor};
    ///
    /// let layout = MessageLayout::new(0x0C1, "EngineSpeed", 2).with_signal(
    ///     SignalDescriptor::new("RPM", 7, 16, ByteOrder::BigEndian).with_unit("rpm"),
    /// );
    /// let db = SignalDatabase::from_layouts(Protocol::J1939, vec![layout]).unwrap();
    ///
    /// let sample = FrameDecoder::decode(&RawFrame::new(0x0C1, vec![0x03, 0xE8]), &db).unwrap();
    /// assert_eq!(sample.value("RPM"), Some(1000.0));
    /// ```
    pub fn decode(frame: &RawFrame, db: &SignalDatabase) -> Result<DecodedSample, DecodeError> {
        if !frame.is_data_frame() {
            return Err(DecodeError::NotADataFrame { id: frame.can_id });
        }

        let dtc_codes = dtc::extract_codes(frame, db.protocol());

        let Some(layout) = db.lookup(frame.can_id) else {
            if !dtc_codes.is_empty() {
                return Ok(DecodedSample {
                    can_id: frame.can_id,
                    timestamp: frame.timestamp(),
                    message_name: None,
                    signals: Vec::new(),
                    dtc_codes,
                });
            }
            log::trace!("Unknown CAN ID: 0x{:X}", frame.can_id);
            return Err(DecodeError::UnknownIdentifier { id: frame.can_id });
        };

        log::debug!("Decoding message: {} (ID 0x{:X})", layout.name, frame.can_id);
        let mut sample = Self::decode_with_layout(frame, layout)?;
        sample.dtc_codes = dtc_codes;
        Ok(sample)
    }

    /// Decode a frame against a known layout
    pub fn decode_with_layout(frame: &RawFrame, layout: &MessageLayout) -> Result<DecodedSample, DecodeError> {
        let truncated = |signal: &str, short: ShortPayload| {
            log::warn!(
                "Signal '{}' requires {} bytes but frame 0x{:X} only has {} bytes",
                signal,
                short.required_bytes,
                frame.can_id,
                frame.data.len()
            );
            DecodeError::Truncated {
                id: frame.can_id,
                signal: signal.to_string(),
                required_bytes: short.required_bytes,
                available_bytes: frame.data.len(),
            }
        };

        // For multiplexed messages, the multiplexor picks the active group
        let multiplexer_value = match layout.multiplexor() {
            Some(mux) => Some(
                MessageDecoder::extract_raw(&frame.data, mux).map_err(|e| truncated(&mux.name, e))? as u64,
            ),
            None => None,
        };

        let mut signals = Vec::with_capacity(layout.signals.len());
        for signal in &layout.signals {
            if let Some(required) = signal.multiplexer_value {
                if multiplexer_value != Some(required) {
                    continue;
                }
            }
            let decoded = MessageDecoder::decode_signal(&frame.data, signal)
                .map_err(|e| truncated(&signal.name, e))?;
            signals.push(decoded);
        }

        Ok(DecodedSample {
            can_id: frame.can_id,
            timestamp: frame.timestamp(),
            message_name: Some(layout.name.clone()),
            signals,
            dtc_codes: Vec::new(),
        })
    }

    /// Pack physical values into a payload of the layout's size.
    ///
    /// Signals not named in `values` are left at zero; names the layout does not
    /// define are ignored.
    pub fn encode(layout: &MessageLayout, values: &[(&str, f64)]) -> Vec<u8> {
        let mut data = vec![0u8; layout.size];
        for (name, physical) in values {
            match layout.signal(name) {
                Some(signal) => {
                    if !MessageDecoder::encode_signal(&mut data, signal, *physical) {
                        log::warn!("Signal '{}' does not fit message '{}'", name, layout.name);
                    }
                }
                None => log::debug!("Message '{}' has no signal '{}'", layout.name, name),
            }
        }
        data
    }
}

/// Iterator that decodes frames lazily
///
/// Wraps any frame source and yields one sample per decodable frame. Frames with
/// unknown identifiers or short payloads are skipped; bus errors are passed
/// through.
pub struct DecodingIterator<'a, I>
where
    I: Iterator<Item = Result<RawFrame, BusError>>,
{
    frame_iter: I,
    signal_db: &'a SignalDatabase,
    skipped: usize,
}

impl<'a, I> DecodingIterator<'a, I>
where
    I: Iterator<Item = Result<RawFrame, BusError>>,
{
    pub fn new(frame_iter: I, signal_db: &'a SignalDatabase) -> Self {
        Self {
            frame_iter,
            signal_db,
            skipped: 0,
        }
    }

    /// Number of frames skipped so far
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl<'a, I> Iterator for DecodingIterator<'a, I>
where
    I: Iterator<Item = Result<RawFrame, BusError>>,
{
    type Item = Result<DecodedSample, BusError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let frame = match self.frame_iter.next()? {
                Ok(frame) => frame,
                Err(e) => return Some(Err(e)),
            };
            match FrameDecoder::decode(&frame, self.signal_db) {
                Ok(sample) => return Some(Ok(sample)),
                Err(_) => self.skipped += 1,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;
    use crate::signals::database::{ByteOrder, SignalDescriptor};
    use crate::types::SignalValue;
    use std::collections::BTreeMap;

    fn demo_db() -> SignalDatabase {
        let rpm = MessageLayout::new(0x0C1, "EngineSpeed", 2).with_signal(
            SignalDescriptor::new("RPM", 7, 16, ByteOrder::BigEndian).with_unit("rpm"),
        );
        let gear_table: BTreeMap<i64, String> = [(0, "Park"), (1, "Reverse"), (2, "Neutral"), (3, "Drive")]
            .into_iter()
            .map(|(k, v)| (k, v.to_string()))
            .collect();
        let trans = MessageLayout::new(0x0C4, "Transmission", 4)
            .with_signal(SignalDescriptor::new("Gear", 0, 4, ByteOrder::LittleEndian).with_value_table(gear_table))
            .with_signal(
                SignalDescriptor::new("OilTemp", 8, 8, ByteOrder::LittleEndian)
                    .with_scaling(1.0, -40.0)
                    .with_unit("degC"),
            )
            .with_signal(
                SignalDescriptor::new("Torque", 16, 16, ByteOrder::LittleEndian)
                    .signed()
                    .with_scaling(0.5, 0.0)
                    .with_unit("Nm"),
            );
        let muxed = MessageLayout::new(0x200, "Muxed", 8)
            .with_signal(SignalDescriptor::new("Mode", 0, 8, ByteOrder::LittleEndian).as_multiplexor())
            .with_signal(SignalDescriptor::new("A", 8, 16, ByteOrder::LittleEndian).multiplexed_on(0))
            .with_signal(
                SignalDescriptor::new("B", 8, 16, ByteOrder::LittleEndian)
                    .multiplexed_on(1)
                    .with_scaling(0.1, 0.0),
            );
        SignalDatabase::from_layouts(Protocol::J1939, vec![rpm, trans, muxed]).unwrap()
    }

    #[test]
    fn test_decode_big_endian_rpm() {
        let db = demo_db();
        let sample = FrameDecoder::decode(&RawFrame::new(0x0C1, vec![0x03, 0xE8]), &db).unwrap();
        assert_eq!(sample.message_name.as_deref(), Some("EngineSpeed"));
        assert_eq!(sample.value("RPM"), Some(1000.0));
        assert_eq!(sample.signal("RPM").unwrap().unit.as_deref(), Some("rpm"));
    }

    #[test]
    fn test_value_table_label_and_signed_scaling() {
        let db = demo_db();
        // Gear=3, OilTemp raw 130 -> 90 degC, Torque raw -200 -> -100 Nm
        let torque = (-200i16).to_le_bytes();
        let frame = RawFrame::new(0x0C4, vec![0x03, 130, torque[0], torque[1]]);
        let sample = FrameDecoder::decode(&frame, &db).unwrap();

        let gear = sample.signal("Gear").unwrap();
        assert_eq!(gear.value, SignalValue::Label("Drive".to_string()));
        assert_eq!(gear.raw_value, 3);
        assert_eq!(sample.value("OilTemp"), Some(90.0));
        assert_eq!(sample.value("Torque"), Some(-100.0));
    }

    #[test]
    fn test_value_outside_table_stays_numeric() {
        let db = demo_db();
        let sample = FrameDecoder::decode(&RawFrame::new(0x0C4, vec![0x09, 0, 0, 0]), &db).unwrap();
        assert_eq!(sample.signal("Gear").unwrap().value, SignalValue::Float(9.0));
    }

    #[test]
    fn test_unknown_identifier() {
        let db = demo_db();
        let err = FrameDecoder::decode(&RawFrame::new(0x7FF, vec![0; 8]), &db).unwrap_err();
        assert_eq!(err, DecodeError::UnknownIdentifier { id: 0x7FF });
    }

    #[test]
    fn test_truncated_payload() {
        let db = demo_db();
        let err = FrameDecoder::decode(&RawFrame::new(0x0C1, vec![0x03]), &db).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Truncated {
                id: 0x0C1,
                signal: "RPM".to_string(),
                required_bytes: 2,
                available_bytes: 1,
            }
        );

        let err = FrameDecoder::decode(&RawFrame::new(0x0C1, vec![]), &db).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { available_bytes: 0, .. }));
    }

    #[test]
    fn test_error_frames_are_rejected() {
        let db = demo_db();
        let mut frame = RawFrame::new(0x0C1, vec![0x03, 0xE8]);
        frame.is_error_frame = true;
        assert_eq!(
            FrameDecoder::decode(&frame, &db).unwrap_err(),
            DecodeError::NotADataFrame { id: 0x0C1 }
        );
    }

    #[test]
    fn test_multiplexed_decoding() {
        let db = demo_db();
        let sample = FrameDecoder::decode(&RawFrame::new(0x200, vec![1, 0xE8, 0x03, 0, 0, 0, 0, 0]), &db).unwrap();
        let names: Vec<&str> = sample.signals.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Mode", "B"]);
        assert!((sample.value("B").unwrap() - 100.0).abs() < 1e-9);

        let sample = FrameDecoder::decode(&RawFrame::new(0x200, vec![7, 0, 0, 0, 0, 0, 0, 0]), &db).unwrap();
        assert_eq!(sample.signals.len(), 1);
    }

    #[test]
    fn test_encode_round_trip() {
        let db = demo_db();
        let layout = db.lookup(0x0C4).unwrap();
        let data = FrameDecoder::encode(layout, &[("Gear", 2.0), ("OilTemp", 25.0), ("Torque", -12.5)]);
        assert_eq!(data.len(), 4);

        let sample = FrameDecoder::decode(&RawFrame::new(0x0C4, data), &db).unwrap();
        assert_eq!(sample.signal("Gear").unwrap().raw_value, 2);
        assert_eq!(sample.value("OilTemp"), Some(25.0));
        assert_eq!(sample.value("Torque"), Some(-12.5));
    }

    #[test]
    fn test_decoding_iterator_skips_bad_frames() {
        let db = demo_db();
        let frames = vec![
            Ok(RawFrame::new(0x0C1, vec![0x00, 0x64])),
            Ok(RawFrame::new(0x555, vec![0x00])),
            Ok(RawFrame::new(0x0C1, vec![0x00])),
            Ok(RawFrame::new(0x0C1, vec![0x01, 0x00])),
        ];
        let mut iter = DecodingIterator::new(frames.into_iter(), &db);
        let values: Vec<f64> = iter
            .by_ref()
            .map(|s| s.unwrap().value("RPM").unwrap())
            .collect();
        assert_eq!(values, vec![100.0, 256.0]);
        assert_eq!(iter.skipped(), 2);
    }
}
