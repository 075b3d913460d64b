// src/io/serial/utils.rs
//
// Line configuration helpers for the serialport crate: the supported baud
// table and the termios-style control flag string ("CS8 CRTSCTS").

use serialport::{DataBits, FlowControl, Parity as SpParity, StopBits};

// ============================================================================
// Baud Rates
// ============================================================================

/// Whether `baud` is one of the fixed termios rates.
/// 460800 is not a standard rate on Apple platforms.
pub fn is_supported_baud_rate(baud: u32) -> bool {
    match baud {
        50 | 75 | 110 | 134 | 150 | 200 | 300 | 600 | 1200 | 1800 | 2400 | 4800 | 9600
        | 19200 | 38400 | 57600 | 115200 | 230400 => true,
        #[cfg(not(target_vendor = "apple"))]
        460800 => true,
        _ => false,
    }
}

// ============================================================================
// Types
// ============================================================================

/// Parity setting for serial port configuration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Character size and control flags applied to the line
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineFlags {
    pub data_bits: u8,
    pub two_stop_bits: bool,
    pub parity: Parity,
    pub hardware_flow_control: bool,
}

impl Default for LineFlags {
    fn default() -> Self {
        LineFlags {
            data_bits: 8,
            two_stop_bits: false,
            parity: Parity::None,
            hardware_flow_control: false,
        }
    }
}

impl LineFlags {
    /// Parse termios control flag names separated by whitespace, `|` or `,`.
    /// CREAD and CLOCAL are always set by the driver and accepted silently.
    /// Unknown names are logged and ignored.
    pub fn parse(flags: &str) -> Self {
        let mut line = LineFlags::default();
        let mut parity_enabled = false;
        let mut parity_odd = false;

        for name in flags
            .split(|c: char| c.is_whitespace() || c == '|' || c == ',')
            .filter(|s| !s.is_empty())
        {
            match name.to_ascii_uppercase().as_str() {
                "CS5" => line.data_bits = 5,
                "CS6" => line.data_bits = 6,
                "CS7" => line.data_bits = 7,
                "CS8" => line.data_bits = 8,
                "CSTOPB" => line.two_stop_bits = true,
                "PARENB" => parity_enabled = true,
                "PARODD" => parity_odd = true,
                "CRTSCTS" => line.hardware_flow_control = true,
                "CREAD" | "CLOCAL" => {}
                other => tlog!("[serial] Ignoring unknown line flag '{}'", other),
            }
        }

        line.parity = match (parity_enabled, parity_odd) {
            (true, true) => Parity::Odd,
            (true, false) => Parity::Even,
            _ => Parity::None,
        };
        line
    }
}

// ============================================================================
// Conversion Functions
// ============================================================================

/// Convert our Parity enum to serialport crate's Parity type
pub fn to_serialport_parity(p: &Parity) -> SpParity {
    match p {
        Parity::None => SpParity::None,
        Parity::Odd => SpParity::Odd,
        Parity::Even => SpParity::Even,
    }
}

/// Convert data bits count to serialport crate's DataBits type
pub fn to_serialport_data_bits(bits: u8) -> DataBits {
    match bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    }
}

pub fn to_serialport_stop_bits(two: bool) -> StopBits {
    if two {
        StopBits::Two
    } else {
        StopBits::One
    }
}

pub fn to_serialport_flow_control(hardware: bool) -> FlowControl {
    if hardware {
        FlowControl::Hardware
    } else {
        FlowControl::None
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baud_table() {
        for baud in [50, 134, 9600, 115200, 230400] {
            assert!(is_supported_baud_rate(baud), "{}", baud);
        }
        assert!(!is_supported_baud_rate(0));
        assert!(!is_supported_baud_rate(14400));
        assert!(!is_supported_baud_rate(921600));
        #[cfg(not(target_vendor = "apple"))]
        assert!(is_supported_baud_rate(460800));
    }

    #[test]
    fn test_parse_default_cs8() {
        assert_eq!(LineFlags::parse("CS8"), LineFlags::default());
        assert_eq!(LineFlags::parse(""), LineFlags::default());
    }

    #[test]
    fn test_parse_combined_flags() {
        let flags = LineFlags::parse("CS7|PARENB|PARODD, CSTOPB crtscts CREAD CLOCAL");
        assert_eq!(flags.data_bits, 7);
        assert_eq!(flags.parity, Parity::Odd);
        assert!(flags.two_stop_bits);
        assert!(flags.hardware_flow_control);
    }

    #[test]
    fn test_parse_ignores_unknown() {
        let flags = LineFlags::parse("CS6 HUPCL");
        assert_eq!(flags.data_bits, 6);
        assert_eq!(flags.parity, Parity::None);
    }

    #[test]
    fn test_conversions() {
        assert!(matches!(to_serialport_parity(&Parity::Even), SpParity::Even));
        assert!(matches!(to_serialport_data_bits(5), DataBits::Five));
        assert!(matches!(to_serialport_data_bits(9), DataBits::Eight)); // default
        assert!(matches!(to_serialport_stop_bits(true), StopBits::Two));
        assert!(matches!(to_serialport_flow_control(true), FlowControl::Hardware));
        assert!(matches!(to_serialport_flow_control(false), FlowControl::None));
    }
}
