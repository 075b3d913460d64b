// src/kiss.rs
//
// KISS framing for radio command packets sent over the transport.
//
// Command format:
//   [Length-1byte][Command bytes...][CRC16-CCITT-2bytes-BE]
//
// KISS envelope:
//   [FEND][Port/Type-1byte][Escaped command...][FEND]

use crate::checksums::crc16_ccitt_checksum;

// =============================================================================
// KISS Constants
// =============================================================================

pub const FEND: u8 = 0xC0;
pub const FESC: u8 = 0xDB;
pub const TFEND: u8 = 0xDC;
pub const TFESC: u8 = 0xDD;

/// Port 0, data frame
pub const KISS_DATA_FRAME: u8 = 0x00;

/// Largest command body the length byte can describe
pub const MAX_COMMAND_LEN: usize = u8::MAX as usize;

// =============================================================================
// Packet Building
// =============================================================================

/// Build a length-prefixed, CRC-protected command packet.
pub fn build_command(body: &[u8]) -> Result<Vec<u8>, String> {
    if body.len() > MAX_COMMAND_LEN {
        return Err(format!(
            "Command body is {} bytes, limit is {}",
            body.len(),
            MAX_COMMAND_LEN
        ));
    }

    let mut cmd = Vec::with_capacity(body.len() + 3);
    cmd.push(body.len() as u8);
    cmd.extend_from_slice(body);

    let crc = crc16_ccitt_checksum(&cmd);
    cmd.extend_from_slice(&crc.to_be_bytes());
    Ok(cmd)
}

/// Wrap data in a KISS data frame, escaping FEND and FESC.
pub fn encode_frame(data: &[u8]) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(data.len() + 4);
    encoded.push(FEND);
    encoded.push(KISS_DATA_FRAME);

    for &byte in data {
        match byte {
            FEND => {
                encoded.push(FESC);
                encoded.push(TFEND);
            }
            FESC => {
                encoded.push(FESC);
                encoded.push(TFESC);
            }
            _ => {
                encoded.push(byte);
            }
        }
    }

    encoded.push(FEND);
    encoded
}

/// Parse a command-line byte the way C's `strtol(s, NULL, 0)` reads it and
/// stores the result in a char: optional sign, `0x` prefix for hex, a
/// leading `0` for octal, otherwise decimal. Parsing stops at the first
/// character that is not a digit of the radix, and the value wraps to 8 bits
/// (`-1` is `0xFF`, `256` is `0`). Fails only when no digit was read.
pub fn parse_byte(s: &str) -> Result<u8, String> {
    let t = s.trim_start();
    let (negative, t) = match t.as_bytes().first() {
        Some(b'-') => (true, &t[1..]),
        Some(b'+') => (false, &t[1..]),
        _ => (false, t),
    };

    let hex_digits = t
        .strip_prefix("0x")
        .or_else(|| t.strip_prefix("0X"))
        .filter(|rest| rest.starts_with(|c: char| c.is_ascii_hexdigit()));
    let (digits, radix) = match hex_digits {
        Some(rest) => (rest, 16),
        // A bare `0x` reads as the octal zero in front of it
        None if t.starts_with('0') => (t, 8),
        None => (t, 10),
    };

    let mut value: u64 = 0;
    let mut read_any = false;
    for d in digits.chars().map_while(|c| c.to_digit(radix)) {
        value = value.wrapping_mul(radix as u64).wrapping_add(d as u64);
        read_any = true;
    }
    if !read_any {
        return Err(format!("Invalid byte value: {}", s));
    }

    let value = if negative { value.wrapping_neg() } else { value };
    Ok(value as u8)
}
