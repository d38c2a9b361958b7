//! Command vocabulary and frame model of the programmer link.

use std::fmt;

use crate::constants::{PKG_DATA_MAX, commands, errors};
use crate::error::FrameError;

/// Link command opcode.
///
/// Host and device must agree on these bit-for-bit. Bytes outside the vocabulary
/// decode to `Unknown` instead of failing, so a corrupted command byte never aborts
/// the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Command {
    None,
    /// Connection request; echoed back by the device.
    Init,
    /// Liveness check, answered with `TxRxAck`.
    Ping,
    /// Memory identification, carries the `MemoryType` id.
    MemId,
    /// Frame start delimiter, not a logical command.
    StartXfer,
    /// Frame end delimiter, not a logical command.
    EndXfer,
    Disconnect,
    Ok,
    TxRxAck,
    TxRxDone,
    /// General error followed by an `ErrorCode` byte.
    Err,
    /// Mid-transfer error, asks the peer to resend the current chunk.
    TxRxErr,
    /// Start reading the memory; carries the `MemoryType` id.
    ReadMem,
    /// Request the next chunk of a read.
    ReadNext,
    /// One chunk of memory content.
    MemData,
    Data,
    Info,
    /// Start writing the memory; carries the `MemoryType` id.
    WriteMem,
    Unknown(u8),
}

impl Command {
    /// Payload length implied by the command. The length is never sent on the wire.
    pub const fn payload_len(self) -> usize {
        match self {
            Command::MemId | Command::Err | Command::ReadMem | Command::WriteMem | Command::Data => 1,
            Command::MemData | Command::Info => PKG_DATA_MAX,
            _ => 0,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Command::None => "NONE",
            Command::Init => "INIT",
            Command::Ping => "PING",
            Command::MemId => "MEMID",
            Command::StartXfer => "STARTXFER",
            Command::EndXfer => "ENDXFER",
            Command::Disconnect => "DISCONNECT",
            Command::Ok => "OK",
            Command::TxRxAck => "TXRX_ACK",
            Command::TxRxDone => "TXRX_DONE",
            Command::Err => "ERR",
            Command::TxRxErr => "TXRX_ERR",
            Command::ReadMem => "READMEM",
            Command::ReadNext => "READNEXT",
            Command::MemData => "MEMDATA",
            Command::Data => "DATA",
            Command::Info => "INFO",
            Command::WriteMem => "WRITEMEM",
            Command::Unknown(_) => "UNKNOWN",
        }
    }
}

impl From<u8> for Command {
    fn from(raw: u8) -> Self {
        match raw {
            commands::NONE => Command::None,
            commands::INIT => Command::Init,
            commands::PING => Command::Ping,
            commands::MEMID => Command::MemId,
            commands::STARTXFER => Command::StartXfer,
            commands::ENDXFER => Command::EndXfer,
            commands::DISCONNECT => Command::Disconnect,
            commands::OK => Command::Ok,
            commands::TXRX_ACK => Command::TxRxAck,
            commands::TXRX_DONE => Command::TxRxDone,
            commands::ERR => Command::Err,
            commands::TXRX_ERR => Command::TxRxErr,
            commands::READMEM => Command::ReadMem,
            commands::READNEXT => Command::ReadNext,
            commands::MEMDATA => Command::MemData,
            commands::DATA => Command::Data,
            commands::INFO => Command::Info,
            commands::WRITEMEM => Command::WriteMem,
            other => Command::Unknown(other),
        }
    }
}

impl From<Command> for u8 {
    fn from(cmd: Command) -> u8 {
        match cmd {
            Command::None => commands::NONE,
            Command::Init => commands::INIT,
            Command::Ping => commands::PING,
            Command::MemId => commands::MEMID,
            Command::StartXfer => commands::STARTXFER,
            Command::EndXfer => commands::ENDXFER,
            Command::Disconnect => commands::DISCONNECT,
            Command::Ok => commands::OK,
            Command::TxRxAck => commands::TXRX_ACK,
            Command::TxRxDone => commands::TXRX_DONE,
            Command::Err => commands::ERR,
            Command::TxRxErr => commands::TXRX_ERR,
            Command::ReadMem => commands::READMEM,
            Command::ReadNext => commands::READNEXT,
            Command::MemData => commands::MEMDATA,
            Command::Data => commands::DATA,
            Command::Info => commands::INFO,
            Command::WriteMem => commands::WRITEMEM,
            Command::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Unknown(raw) => write!(f, "UNKNOWN(0x{:02x})", raw),
            _ => f.write_str(self.name()),
        }
    }
}

/// Error code carried as the single payload byte of an `ERR` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    None,
    Unknown,
    MemId,
    ReadMem,
    WriteMem,
    Comm,
    MaxRetry,
    Timeout,
    MemIdx,
}

impl ErrorCode {
    /// Codes after which the device has reset itself to disconnected.
    pub const fn ends_session(self) -> bool {
        matches!(self, ErrorCode::MaxRetry | ErrorCode::Comm | ErrorCode::Timeout)
    }

    pub const fn message(self) -> &'static str {
        match self {
            ErrorCode::None => "no error",
            ErrorCode::Unknown => "unknown error",
            ErrorCode::MemId => "bad or unsupported memory id",
            ErrorCode::ReadMem => "failed to read the memory",
            ErrorCode::WriteMem => "failed to write the memory",
            ErrorCode::Comm => "communication error",
            ErrorCode::MaxRetry => "too many retries",
            ErrorCode::Timeout => "timed out",
            ErrorCode::MemIdx => "memory index out of range",
        }
    }
}

impl From<u8> for ErrorCode {
    fn from(raw: u8) -> Self {
        match raw {
            errors::NONE => ErrorCode::None,
            errors::MEMID => ErrorCode::MemId,
            errors::READMEM => ErrorCode::ReadMem,
            errors::WRITEMEM => ErrorCode::WriteMem,
            errors::COMM => ErrorCode::Comm,
            errors::MAX_RETRY => ErrorCode::MaxRetry,
            errors::TIMEOUT => ErrorCode::Timeout,
            errors::MEMIDX => ErrorCode::MemIdx,
            _ => ErrorCode::Unknown,
        }
    }
}

impl From<ErrorCode> for u8 {
    fn from(code: ErrorCode) -> u8 {
        match code {
            ErrorCode::None => errors::NONE,
            ErrorCode::Unknown => errors::UNKNOWN,
            ErrorCode::MemId => errors::MEMID,
            ErrorCode::ReadMem => errors::READMEM,
            ErrorCode::WriteMem => errors::WRITEMEM,
            ErrorCode::Comm => errors::COMM,
            ErrorCode::MaxRetry => errors::MAX_RETRY,
            ErrorCode::Timeout => errors::TIMEOUT,
            ErrorCode::MemIdx => errors::MEMIDX,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// One decoded or to-be-encoded protocol message.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub payload: Vec<u8>,
    /// Checksum as received. Zero on frames built locally; the framer computes the
    /// outgoing value.
    pub checksum: u16,
}

impl Frame {
    /// Build a frame, checking the payload against the command's length table entry.
    pub fn new(command: Command, payload: Vec<u8>) -> Result<Self, FrameError> {
        let expected = command.payload_len();
        if payload.len() != expected {
            return Err(FrameError::PayloadLength {
                command,
                expected,
                actual: payload.len(),
            });
        }
        Ok(Frame {
            command,
            payload,
            checksum: 0,
        })
    }

    /// Frame for a command without payload.
    pub fn bare(command: Command) -> Result<Self, FrameError> {
        Self::new(command, Vec::new())
    }

    pub fn with_byte(command: Command, value: u8) -> Result<Self, FrameError> {
        Self::new(command, vec![value])
    }

    pub fn error(code: ErrorCode) -> Self {
        Frame {
            command: Command::Err,
            payload: vec![code.into()],
            checksum: 0,
        }
    }

    /// The error code of an `ERR` frame.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match (self.command, self.payload.first()) {
            (Command::Err, Some(&raw)) => Some(ErrorCode::from(raw)),
            _ => None,
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.payload.is_empty() {
            write!(f, "{}", self.command)
        } else {
            write!(f, "{}[{}]", self.command, hex::encode(&self.payload))
        }
    }
}
