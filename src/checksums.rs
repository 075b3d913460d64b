// src/checksums.rs
//
// CRC-16/CCITT (poly 0x1021, init 0xFFFF, MSB-first, no final XOR) for the
// radio command packets built in `kiss`. Table driven; the table is built at
// compile time.

const CCITT_POLY: u16 = 0x1021;
const CCITT_INIT: u16 = 0xFFFF;

const CCITT_TABLE: [u16; 256] = build_table(CCITT_POLY);

const fn build_table(poly: u16) -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ poly
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Incremental CRC-16/CCITT, for packets assembled piece by piece.
#[derive(Debug, Clone, Copy)]
pub struct Crc16Ccitt {
    crc: u16,
}

impl Default for Crc16Ccitt {
    fn default() -> Self {
        Self { crc: CCITT_INIT }
    }
}

impl Crc16Ccitt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        for &byte in data {
            let idx = ((self.crc >> 8) as u8 ^ byte) as usize;
            self.crc = (self.crc << 8) ^ CCITT_TABLE[idx];
        }
    }

    pub fn finish(&self) -> u16 {
        self.crc
    }
}

/// One-shot CRC-16/CCITT of `data`.
pub fn crc16_ccitt_checksum(data: &[u8]) -> u16 {
    let mut crc = Crc16Ccitt::new();
    crc.update(data);
    crc.finish()
}
