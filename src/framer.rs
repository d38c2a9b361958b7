//! Link-layer framing.
//!
//! ```text
//! <STX 0xA5><COMMAND>[<DATA>...]<CHECKSUM hi><CHECKSUM lo><ETX 0x5A>
//! ```
//!
//! The payload length is not on the wire, it comes from `Command::payload_len`.

use anyhow::Result;
use scroll::Pwrite;

use crate::checksum::{Checksum, NoChecksum};
use crate::constants::{END_MARKER, PKG_MIN_SIZE, START_MARKER};
use crate::error::FrameError;
use crate::protocol::{Command, Frame};

/// Serialize a frame, filling in the checksum computed by `checksum`.
pub fn encode_frame(frame: &Frame, checksum: &dyn Checksum) -> Result<Vec<u8>> {
    let expected = frame.command.payload_len();
    if frame.payload.len() != expected {
        return Err(FrameError::PayloadLength {
            command: frame.command,
            expected,
            actual: frame.payload.len(),
        }
        .into());
    }
    let cmd = u8::from(frame.command);

    // STX, CMD, DATA, CRC(2), ETX
    let mut buf = vec![0u8; PKG_MIN_SIZE + frame.payload.len()];
    buf[0] = START_MARKER;
    buf[1] = cmd;
    buf[2..2 + frame.payload.len()].copy_from_slice(&frame.payload);
    let crc_at = 2 + frame.payload.len();
    buf.pwrite_with(checksum.generate(cmd, &frame.payload), crc_at, scroll::BE)?;
    buf[crc_at + 2] = END_MARKER;
    Ok(buf)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    SeekStart,
    ReadCommand,
    ReadData,
    ReadChecksum,
    ReadEnd,
}

/// Resumable byte-at-a-time frame decoder.
///
/// Bytes may arrive in any split; the decoder keeps its position between calls.
#[derive(Debug)]
pub struct Decoder {
    state: DecodeState,
    command: Command,
    payload: Vec<u8>,
    checksum: [u8; 2],
    checksum_len: usize,
    dropped: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Decoder {
            state: DecodeState::SeekStart,
            command: Command::None,
            payload: Vec::new(),
            checksum: [0; 2],
            checksum_len: 0,
            dropped: 0,
        }
    }

    /// Advance by one byte, returning a frame once its end marker is seen.
    pub fn push(&mut self, byte: u8) -> Option<Frame> {
        match self.state {
            DecodeState::SeekStart => {
                if byte == START_MARKER {
                    self.state = DecodeState::ReadCommand;
                } else {
                    self.dropped += 1;
                }
                None
            }
            DecodeState::ReadCommand => {
                self.command = Command::from(byte);
                self.payload.clear();
                self.checksum_len = 0;
                self.state = if self.command.payload_len() == 0 {
                    DecodeState::ReadChecksum
                } else {
                    DecodeState::ReadData
                };
                None
            }
            DecodeState::ReadData => {
                self.payload.push(byte);
                if self.payload.len() == self.command.payload_len() {
                    self.state = DecodeState::ReadChecksum;
                }
                None
            }
            DecodeState::ReadChecksum => {
                self.checksum[self.checksum_len] = byte;
                self.checksum_len += 1;
                if self.checksum_len == self.checksum.len() {
                    self.state = DecodeState::ReadEnd;
                }
                None
            }
            DecodeState::ReadEnd => {
                if byte == END_MARKER {
                    self.state = DecodeState::SeekStart;
                    return Some(Frame {
                        command: self.command,
                        payload: std::mem::take(&mut self.payload),
                        checksum: u16::from_be_bytes(self.checksum),
                    });
                }
                log::warn!(
                    "dropping {} frame: expected end marker, got 0x{:02x}",
                    self.command,
                    byte
                );
                self.dropped += 1;
                // a start marker here most likely begins the next frame
                self.state = if byte == START_MARKER {
                    DecodeState::ReadCommand
                } else {
                    DecodeState::SeekStart
                };
                None
            }
        }
    }

    /// Feed every available byte, collecting the frames completed on the way.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Frame> {
        bytes.iter().filter_map(|&b| self.push(b)).collect()
    }

    /// Forget any partially decoded frame.
    pub fn reset(&mut self) {
        self.state = DecodeState::SeekStart;
        self.command = Command::None;
        self.payload.clear();
        self.checksum_len = 0;
    }

    /// True when no frame is partially decoded.
    pub fn is_idle(&self) -> bool {
        self.state == DecodeState::SeekStart
    }

    /// Bytes discarded while looking for frames.
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

/// Encoder and decoder sharing one checksum strategy.
pub struct Framer {
    checksum: Box<dyn Checksum + Send>,
    decoder: Decoder,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new(Box::new(NoChecksum))
    }
}

impl Framer {
    pub fn new(checksum: Box<dyn Checksum + Send>) -> Self {
        Framer {
            checksum,
            decoder: Decoder::new(),
        }
    }

    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>> {
        encode_frame(frame, &*self.checksum)
    }

    pub fn decode(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.decoder.feed(bytes)
    }

    pub fn validate(&self, frame: &Frame) -> bool {
        self.checksum.validate(frame)
    }

    pub fn clear(&mut self) {
        self.decoder.reset();
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }
}
