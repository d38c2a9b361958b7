//! Frame integrity codes.
//!
//! Every frame reserves two checksum bytes. Devices in the field send zero there and
//! never look at it, so `NoChecksum` is the default; `Crc16` is a strict mode for
//! links where both ends enforce it.

use serde::{Deserialize, Serialize};

use crate::protocol::Frame;

/// Strategy computing and checking the 16-bit code over (command, payload).
pub trait Checksum {
    fn generate(&self, command: u8, payload: &[u8]) -> u16;

    fn validate(&self, frame: &Frame) -> bool {
        self.generate(frame.command.into(), &frame.payload) == frame.checksum
    }
}

/// Wire-compatible placeholder: sends zero, accepts anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoChecksum;

impl Checksum for NoChecksum {
    fn generate(&self, _command: u8, _payload: &[u8]) -> u16 {
        0
    }

    fn validate(&self, _frame: &Frame) -> bool {
        true
    }
}

/// CRC-16/BUYPASS: poly 0x8005, init 0, no reflection, no final xor.
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc16;

const POLY: u16 = 0x8005;
const CRC_TABLE: [u16; 256] = make_table();

const fn make_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ POLY
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

impl Crc16 {
    pub fn update(crc: u16, bytes: &[u8]) -> u16 {
        bytes.iter().fold(crc, |crc, &b| {
            (crc << 8) ^ CRC_TABLE[(((crc >> 8) as u8) ^ b) as usize]
        })
    }
}

impl Checksum for Crc16 {
    fn generate(&self, command: u8, payload: &[u8]) -> u16 {
        Crc16::update(Crc16::update(0, &[command]), payload)
    }
}

/// Checksum selection as it appears in configuration files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumMode {
    #[default]
    None,
    Crc16,
}

impl ChecksumMode {
    pub fn strategy(self) -> Box<dyn Checksum + Send> {
        match self {
            ChecksumMode::None => Box::new(NoChecksum),
            ChecksumMode::Crc16 => Box::new(Crc16),
        }
    }
}
