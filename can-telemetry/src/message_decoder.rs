//! Signal extraction engine
//!
//! Maps a signal's DBC start bit, length and byte order onto concrete byte/bit
//! positions in a frame payload. The same span list drives extraction (decode)
//! and packing (encode), so the two are inverses by construction. Spans that fall
//! past the payload are reported instead of read.

use crate::signals::database::{ByteOrder, SignalDescriptor, ValueType};
use crate::types::{DecodedSignal, SignalValue};

/// A 64-bit signal touches at most nine bytes.
const MAX_SPANS: usize = 9;

/// One contiguous run of bits within a single payload byte.
///
/// "Take `num_bits` bits starting at `bit_offset` in `data[byte_index]` and place
/// them at `value_shift` in the raw value."
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BitSpan {
    pub byte_index: usize,
    /// Lowest bit position within the byte (0..=7)
    pub bit_offset: u8,
    /// Number of consecutive bits (1..=8)
    pub num_bits: u8,
    /// LSB-relative position of these bits in the raw value
    pub value_shift: u8,
}

impl BitSpan {
    fn mask(&self) -> u8 {
        ((1u16 << self.num_bits) - 1) as u8
    }
}

/// Precomputed mapping from a signal definition to payload bit positions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitLayout {
    spans: [BitSpan; MAX_SPANS],
    count: usize,
    length: u16,
}

impl BitLayout {
    /// Build the span list for a signal.
    ///
    /// Intel (little-endian): `start_bit` is the LSB; walk upward, then continue at
    /// bit 0 of the next byte. Motorola (big-endian): `start_bit` is the MSB; walk
    /// downward, then continue at bit 7 of the next byte.
    pub fn new(start_bit: u16, length: u16, byte_order: ByteOrder) -> Self {
        let mut spans = [BitSpan::default(); MAX_SPANS];
        let mut count = 0;
        let mut byte_index = (start_bit / 8) as usize;
        let mut bit_index = (start_bit % 8) as u8;
        let mut remaining = length.min(64) as u8;

        match byte_order {
            ByteOrder::BigEndian => {
                while remaining > 0 && count < MAX_SPANS {
                    let num_bits = (bit_index + 1).min(remaining);
                    remaining -= num_bits;
                    spans[count] = BitSpan {
                        byte_index,
                        bit_offset: bit_index + 1 - num_bits,
                        num_bits,
                        value_shift: remaining,
                    };
                    count += 1;
                    byte_index += 1;
                    bit_index = 7;
                }
            }
            ByteOrder::LittleEndian => {
                let mut value_shift = 0u8;
                while remaining > 0 && count < MAX_SPANS {
                    let num_bits = (8 - bit_index).min(remaining);
                    spans[count] = BitSpan {
                        byte_index,
                        bit_offset: bit_index,
                        num_bits,
                        value_shift,
                    };
                    count += 1;
                    value_shift += num_bits;
                    remaining -= num_bits;
                    byte_index += 1;
                    bit_index = 0;
                }
            }
        }

        Self {
            spans,
            count,
            length: length.min(64),
        }
    }

    /// Layout of a database signal
    pub fn for_signal(signal: &SignalDescriptor) -> Self {
        Self::new(signal.start_bit, signal.length, signal.byte_order)
    }

    /// The spans in extraction order
    pub fn spans(&self) -> &[BitSpan] {
        &self.spans[..self.count]
    }

    /// Signal length in bits
    pub fn length(&self) -> u16 {
        self.length
    }

    /// Minimum payload length in bytes needed to hold the signal
    pub fn required_bytes(&self) -> usize {
        self.spans()
            .iter()
            .map(|span| span.byte_index + 1)
            .max()
            .unwrap_or(0)
    }

    /// Absolute bit positions (`byte * 8 + bit`) occupied by the signal
    pub fn occupied_bits(&self) -> impl Iterator<Item = usize> + '_ {
        self.spans().iter().flat_map(|span| {
            let base = span.byte_index * 8 + span.bit_offset as usize;
            base..base + span.num_bits as usize
        })
    }

    /// Extract the raw unsigned value, or `None` if the payload is too short.
    pub fn extract(&self, data: &[u8]) -> Option<u64> {
        if self.required_bytes() > data.len() {
            return None;
        }

        let mut result: u64 = 0;
        for span in self.spans() {
            let bits = (data[span.byte_index] >> span.bit_offset) & span.mask();
            result |= (bits as u64) << span.value_shift;
        }
        Some(result)
    }

    /// Pack a raw unsigned value into the payload.
    ///
    /// Clears the target bits first so several signals can share one frame.
    /// Returns false (leaving `data` untouched) if the payload is too short.
    pub fn pack(&self, data: &mut [u8], raw: u64) -> bool {
        if self.required_bytes() > data.len() {
            return false;
        }

        for span in self.spans() {
            let mask = span.mask();
            let bits = ((raw >> span.value_shift) as u8) & mask;
            data[span.byte_index] &= !(mask << span.bit_offset);
            data[span.byte_index] |= bits << span.bit_offset;
        }
        true
    }
}

/// Per-signal decoding failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ShortPayload {
    pub required_bytes: usize,
}

/// Signal-level decoding - extracts and scales one signal
pub struct MessageDecoder;

impl MessageDecoder {
    /// Extract the raw integer value of a signal, sign-extended if signed
    pub(crate) fn extract_raw(data: &[u8], signal: &SignalDescriptor) -> Result<i64, ShortPayload> {
        let layout = BitLayout::for_signal(signal);
        let raw = layout.extract(data).ok_or(ShortPayload {
            required_bytes: layout.required_bytes(),
        })?;

        Ok(match signal.value_type {
            ValueType::Unsigned => raw as i64,
            ValueType::Signed => Self::sign_extend(raw, layout.length() as usize),
        })
    }

    /// Decode a single signal from frame data
    pub(crate) fn decode_signal(data: &[u8], signal: &SignalDescriptor) -> Result<DecodedSignal, ShortPayload> {
        let raw_value = Self::extract_raw(data, signal)?;

        // Value tables win over numeric scaling
        let value = match signal.value_table.as_ref().and_then(|table| table.get(&raw_value)) {
            Some(label) => SignalValue::Label(label.clone()),
            None => SignalValue::Float(signal.to_physical(raw_value)),
        };

        Ok(DecodedSignal {
            name: signal.name.clone(),
            value,
            unit: signal.unit.clone(),
            raw_value,
        })
    }

    /// Pack a physical value into frame data; false if the payload is too short
    pub(crate) fn encode_signal(data: &mut [u8], signal: &SignalDescriptor, physical: f64) -> bool {
        let layout = BitLayout::for_signal(signal);
        let raw = signal.to_raw(physical);
        layout.pack(data, raw as u64)
    }

    /// Sign-extend a value from N bits to 64 bits
    ///
    /// If the value's MSB is 1, fill the upper bits with 1s.
    pub(crate) fn sign_extend(value: u64, bit_length: usize) -> i64 {
        if bit_length == 0 || bit_length >= 64 {
            return value as i64;
        }

        let sign_bit = 1u64 << (bit_length - 1);
        if (value & sign_bit) != 0 {
            let mask = !0u64 << bit_length;
            (value | mask) as i64
        } else {
            value as i64
        }
    }
}
