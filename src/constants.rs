//! Protocol constants.

/// Maximum payload carried by a single frame, and the size of every memory chunk.
pub const PKG_DATA_MAX: usize = 256;

/// Smallest possible frame: start, command, checksum(2), end.
pub const PKG_MIN_SIZE: usize = 5;

pub const START_MARKER: u8 = commands::STARTXFER;
pub const END_MARKER: u8 = commands::ENDXFER;

pub mod commands {
    pub const NONE: u8 = 0x00;
    pub const INIT: u8 = 0x01;
    pub const PING: u8 = 0x02;
    pub const MEMID: u8 = 0x03;
    pub const STARTXFER: u8 = 0xa5; // frame delimiter
    pub const ENDXFER: u8 = 0x5a; // frame delimiter
    pub const DISCONNECT: u8 = 0x0f;
    pub const OK: u8 = 0x10;
    pub const TXRX_ACK: u8 = 0x11;
    pub const TXRX_DONE: u8 = 0x12;
    pub const ERR: u8 = 0xf0;
    pub const TXRX_ERR: u8 = 0xf1;
    pub const READMEM: u8 = 0x60;
    pub const READNEXT: u8 = 0x61;
    pub const MEMDATA: u8 = 0x70;
    pub const DATA: u8 = 0x71;
    pub const INFO: u8 = 0x72;
    pub const WRITEMEM: u8 = 0x80;
}

pub mod errors {
    pub const NONE: u8 = 0;
    pub const UNKNOWN: u8 = 1;
    pub const MEMID: u8 = 2;
    pub const READMEM: u8 = 3;
    pub const WRITEMEM: u8 = 4;
    pub const COMM: u8 = 5;
    pub const MAX_RETRY: u8 = 6;
    pub const TIMEOUT: u8 = 7;
    pub const MEMIDX: u8 = 8;
}
