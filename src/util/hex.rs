//! # Hex Encoding/Decoding Utilities
//!
//! Hex helpers shared by the RN2903 line protocol (`radio tx`/`radio_rx`
//! payloads travel as hex strings) and the event log. Built on the `hex`
//! crate with a dedicated error type so callers can distinguish a malformed
//! payload from a transport fault.

use thiserror::Error;

/// Errors that can occur during hex operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HexError {
    #[error("Odd number of hex characters: {0}")]
    OddLength(usize),

    #[error("Empty hex string")]
    EmptyString,

    #[error("Hex decoding error: {0}")]
    DecodeError(String),
}

/// Encode bytes to lowercase hex string.
///
/// This is the encoding used on the wire towards the RN2903 and in the
/// event log.
pub fn encode_hex(data: &[u8]) -> String {
    hex::encode(data)
}

/// Decode hex string to bytes.
///
/// Accepts both uppercase and lowercase hex characters; the RN2903 reports
/// payloads in uppercase while our own logs use lowercase. Whitespace is
/// stripped before decoding.
pub fn decode_hex(hex_str: &str) -> Result<Vec<u8>, HexError> {
    if hex_str.is_empty() {
        return Err(HexError::EmptyString);
    }

    let cleaned: String = hex_str.chars().filter(|c| !c.is_whitespace()).collect();

    if cleaned.len() % 2 != 0 {
        return Err(HexError::OddLength(cleaned.len()));
    }

    hex::decode(&cleaned).map_err(|e| HexError::DecodeError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let data = vec![0x45, 0x43, 0x48, 0x4f, 0x3a, 0x48, 0x49];
        let encoded = encode_hex(&data);
        let decoded = decode_hex(&encoded).unwrap();
        assert_eq!(data, decoded);
    }

    #[test]
    fn test_decode_case_insensitive() {
        let expected = vec![0xab, 0xcd, 0xef];
        assert_eq!(decode_hex("abcdef").unwrap(), expected);
        assert_eq!(decode_hex("ABCDEF").unwrap(), expected);
        assert_eq!(decode_hex("AbCdEf").unwrap(), expected);
    }

    #[test]
    fn test_decode_strips_whitespace() {
        let expected = vec![0x45, 0x43, 0x48, 0x4f];
        assert_eq!(decode_hex("45 43 48 4f").unwrap(), expected);
    }

    #[test]
    fn test_errors() {
        assert!(decode_hex("").is_err());
        assert!(decode_hex("1").is_err()); // Odd length
        assert!(decode_hex("GG").is_err()); // Invalid character
    }

    proptest! {
        // hex_encode then hex_decode is the identity for any payload,
        // regardless of the case the peer replies in
        #[test]
        fn prop_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            if data.is_empty() {
                prop_assert!(decode_hex(&encode_hex(&data)).is_err());
            } else {
                let lower = encode_hex(&data);
                prop_assert_eq!(decode_hex(&lower).unwrap(), data.clone());
                prop_assert_eq!(decode_hex(&lower.to_uppercase()).unwrap(), data);
            }
        }
    }
}
