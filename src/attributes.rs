//! The bootloader's attribute store: 16 slots of 64 bytes in a fixed flash
//! region, each holding a short (key, value) pair of ASCII strings.

use crate::errors::Error;
use crate::tbf::tlv::parse_int;

/// Number of attribute slots a bootloader maintains.
pub const ATTRIBUTE_SLOTS: u8 = 16;

/// Size of one slot on flash.
pub const ATTRIBUTE_SLOT_SIZE: usize = 64;

/// Flash offset of slot 0, relative to the start of flash.
pub const ATTRIBUTES_OFFSET: u32 = 0x600;

/// Longest permitted key, so common keys stay greppable in a hex dump.
pub const MAX_KEY_LENGTH: usize = 8;

/// One decoded attribute slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attribute {
    pub key: String,
    pub value: String,
}

impl Attribute {
    /// Interpret the value as a number (`appaddr` and friends store hex
    /// strings).
    pub fn value_as_int(&self) -> Option<u64> {
        parse_int(&self.value)
    }
}

/// Decode one 64-byte slot. An unused slot (first byte 0xFF) or garbage
/// yields `None`.
pub fn decode_slot(raw: &[u8]) -> Option<Attribute> {
    if raw.len() != ATTRIBUTE_SLOT_SIZE {
        return None;
    }
    let key_length = raw[0] as usize;
    if key_length == 0xff || key_length == 0 || key_length > MAX_KEY_LENGTH {
        return None;
    }
    let key_end = 1 + key_length;
    let value_length = *raw.get(key_end)? as usize;
    let value_end = key_end + 1 + value_length;
    if value_length == 0 || value_end > ATTRIBUTE_SLOT_SIZE {
        return None;
    }
    let key = std::str::from_utf8(&raw[1..key_end]).ok()?;
    let value = std::str::from_utf8(&raw[key_end + 1..value_end]).ok()?;
    Some(Attribute {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Encode a (key, value) pair as a 64-byte slot, 0xFF padded.
pub fn encode_slot(key: &str, value: &str) -> Result<[u8; ATTRIBUTE_SLOT_SIZE], Error> {
    let key_bytes = key.as_bytes();
    let value_bytes = value.as_bytes();
    if key_bytes.is_empty() || key_bytes.len() > MAX_KEY_LENGTH {
        return Err(Error::Usage(format!(
            "Attribute key must be 1 to {} bytes",
            MAX_KEY_LENGTH
        )));
    }
    let max_value = ATTRIBUTE_SLOT_SIZE - 2 - key_bytes.len();
    if value_bytes.is_empty() || value_bytes.len() > max_value {
        return Err(Error::Usage(format!(
            "Attribute value must be 1 to {} bytes",
            max_value
        )));
    }
    let mut slot = [0xffu8; ATTRIBUTE_SLOT_SIZE];
    slot[0] = key_bytes.len() as u8;
    slot[1..1 + key_bytes.len()].copy_from_slice(key_bytes);
    slot[1 + key_bytes.len()] = value_bytes.len() as u8;
    slot[2 + key_bytes.len()..2 + key_bytes.len() + value_bytes.len()]
        .copy_from_slice(value_bytes);
    Ok(slot)
}

/// An erased slot, for `remove-attribute`.
pub fn empty_slot() -> [u8; ATTRIBUTE_SLOT_SIZE] {
    [0xffu8; ATTRIBUTE_SLOT_SIZE]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let slot = encode_slot("board", "hail").unwrap();
        let attribute = decode_slot(&slot).unwrap();
        assert_eq!(attribute.key, "board");
        assert_eq!(attribute.value, "hail");
    }

    #[test]
    fn unused_slot_decodes_to_none() {
        assert!(decode_slot(&empty_slot()).is_none());
    }

    #[test]
    fn hex_values_parse_as_numbers() {
        let slot = encode_slot("appaddr", "0x30000").unwrap();
        let attribute = decode_slot(&slot).unwrap();
        assert_eq!(attribute.value_as_int(), Some(0x30000));
    }

    #[test]
    fn oversized_keys_are_rejected() {
        assert!(encode_slot("much-too-long-key", "x").is_err());
        assert!(encode_slot("", "x").is_err());
    }

    #[test]
    fn value_fills_remaining_slot_at_most() {
        let value = "v".repeat(ATTRIBUTE_SLOT_SIZE - 2 - 4);
        assert!(encode_slot("arch", &value).is_ok());
        let value = "v".repeat(ATTRIBUTE_SLOT_SIZE - 1 - 4);
        assert!(encode_slot("arch", &value).is_err());
    }

    #[test]
    fn truncated_slot_is_rejected() {
        let slot = encode_slot("arch", "cortex-m4").unwrap();
        assert!(decode_slot(&slot[..32]).is_none());
    }
}
