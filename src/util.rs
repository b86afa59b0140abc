/// Utility helpers shared by the source clients.
///
/// This module contains:
/// - Time helpers
/// - Panic payload rendering
/// - Hex decoding for JSON-RPC style quantities
/// - Topic to address conversion for event logs
///
/// No source-specific logic lives here.
///
use std::any::Any;

use chrono::{SecondsFormat, Utc};

use crate::error::SourceError;

/// Current UTC time as RFC 3339 with microseconds, e.g.
/// `2024-05-01T12:00:00.123456+00:00`.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

fn strip_hex_prefix(raw: &str) -> &str {
    raw.strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw)
}

/// Decode a `0x`-prefixed quantity (block number, gas, size) into u64.
///
/// `field` only feeds the error message.
pub fn parse_hex_u64(field: &str, raw: &str) -> Result<u64, SourceError> {
    let digits = strip_hex_prefix(raw);
    if digits.is_empty() {
        return Err(SourceError::invalid(field, format!("empty hex quantity '{}'", raw)));
    }
    u64::from_str_radix(digits, 16).map_err(|e| SourceError::invalid(field, e))
}

/// Decode an arbitrary-width hex word (uint256 log data) into a decimal
/// string.
///
/// Works on base 10^9 limbs so values above u128 survive intact.
pub fn hex_to_decimal(field: &str, raw: &str) -> Result<String, SourceError> {
    const BASE: u64 = 1_000_000_000;

    let digits = strip_hex_prefix(raw);
    if digits.is_empty() {
        return Err(SourceError::invalid(field, format!("empty hex quantity '{}'", raw)));
    }

    // little-endian limbs
    let mut limbs: Vec<u64> = vec![0];
    for c in digits.chars() {
        let d = c
            .to_digit(16)
            .ok_or_else(|| SourceError::invalid(field, format!("non-hex character '{}'", c)))?;

        let mut carry = d as u64;
        for limb in limbs.iter_mut() {
            let v = *limb * 16 + carry;
            *limb = v % BASE;
            carry = v / BASE;
        }
        if carry > 0 {
            limbs.push(carry);
        }
    }

    let mut out = String::new();
    let mut iter = limbs.iter().rev();
    if let Some(top) = iter.next() {
        out.push_str(&top.to_string());
    }
    for limb in iter {
        out.push_str(&format!("{:09}", limb));
    }
    Ok(out)
}

/// Convert a 32-byte indexed topic into a `0x` address (last 20 bytes).
pub fn topic_to_address(field: &str, topic: &str) -> Result<String, SourceError> {
    let digits = strip_hex_prefix(topic);
    if digits.len() < 40 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(SourceError::invalid(field, format!("not an address topic '{}'", topic)));
    }
    Ok(format!("0x{}", digits[digits.len() - 40..].to_lowercase()))
}

/// Text of a caught panic payload (`&str` or `String`).
pub fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_render_as_text() {
        let caught = std::panic::catch_unwind(|| panic!("boom {}", 7)).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "boom 7");

        let caught = std::panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "static");
    }

    #[test]
    fn hex_quantities_decode() {
        assert_eq!(parse_hex_u64("number", "0x10d4f").unwrap(), 68943);
        assert_eq!(parse_hex_u64("size", "0x0").unwrap(), 0);
        assert!(parse_hex_u64("number", "0x").is_err());
        assert!(parse_hex_u64("number", "0xzz").is_err());
    }

    #[test]
    fn uint256_values_keep_full_precision() {
        assert_eq!(
            hex_to_decimal("data", "0x0000000000000000000000000000000000000000000000000de0b6b3a7640000")
                .unwrap(),
            "1000000000000000000"
        );
        // 2^128
        assert_eq!(
            hex_to_decimal("data", "0x100000000000000000000000000000000").unwrap(),
            "340282366920938463463374607431768211456"
        );
        assert_eq!(hex_to_decimal("data", "0x00").unwrap(), "0");
        assert!(hex_to_decimal("data", "0xg1").is_err());
    }

    #[test]
    fn topics_become_lowercase_addresses() {
        let topic = "0x000000000000000000000000A0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48";
        assert_eq!(
            topic_to_address("topics[1]", topic).unwrap(),
            "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48"
        );
        assert!(topic_to_address("topics[1]", "0x1234").is_err());
    }

    #[test]
    fn timestamps_are_utc_rfc3339() {
        let ts = now_rfc3339();
        assert!(ts.ends_with("+00:00"));
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
    }
}
