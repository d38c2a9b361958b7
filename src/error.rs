//! Error taxonomy of the link.

use std::fmt;

use crate::memory::MemoryType;
use crate::protocol::{Command, ErrorCode};

/// Programming errors when building a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    PayloadLength {
        command: Command,
        expected: usize,
        actual: usize,
    },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::PayloadLength {
                command,
                expected,
                actual,
            } => write!(
                f,
                "{} takes a {} byte payload, got {} bytes",
                command, expected, actual
            ),
        }
    }
}

impl std::error::Error for FrameError {}

/// Why an operation or the whole session failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The device answered with an `ERR` frame.
    Remote(ErrorCode),
    /// No reply arrived in time for the given command.
    Timeout(Command),
    /// A chunk kept failing past the retry ceiling.
    MaxRetry,
    UnexpectedCommand {
        state: &'static str,
        command: Command,
    },
    Checksum,
    SizeMismatch {
        expected: usize,
        actual: usize,
    },
    /// The device refused the requested memory type.
    MemoryRejected(MemoryType),
    HandshakeFailed {
        attempts: u32,
    },
    Disconnected,
    /// Stopped by Ctrl+C or a termination signal.
    Interrupted,
}

impl LinkError {
    /// Errors after which both ends have to start over from the handshake.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LinkError::Timeout(_)
                | LinkError::MaxRetry
                | LinkError::UnexpectedCommand { .. }
                | LinkError::Checksum
                | LinkError::HandshakeFailed { .. }
                | LinkError::MemoryRejected(_)
                | LinkError::Disconnected
                | LinkError::Interrupted
        ) || matches!(self, LinkError::Remote(code) if code.ends_session())
    }
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::Remote(code) => write!(f, "uC error: {}", code),
            LinkError::Timeout(cmd) => write!(f, "timed out waiting for a reply to {}", cmd),
            LinkError::MaxRetry => write!(f, "transfer aborted after too many retries"),
            LinkError::UnexpectedCommand { state, command } => {
                write!(f, "unexpected {} while in state {}", command, state)
            }
            LinkError::Checksum => write!(f, "checksum mismatch"),
            LinkError::SizeMismatch { expected, actual } => write!(
                f,
                "file size doesn't match: memory holds {} bytes, file has {}",
                expected, actual
            ),
            LinkError::MemoryRejected(memory) => {
                write!(f, "device rejected memory type {}", memory)
            }
            LinkError::HandshakeFailed { attempts } => write!(
                f,
                "couldn't establish connection with uC after {} attempts",
                attempts
            ),
            LinkError::Disconnected => write!(f, "link disconnected"),
            LinkError::Interrupted => write!(f, "interrupted"),
        }
    }
}

impl std::error::Error for LinkError {}
