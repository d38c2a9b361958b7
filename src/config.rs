//! Tunable protocol parameters.
//!
//! Timeouts and retry ceilings are not part of the wire contract; they only have to
//! be generous enough for the slowest EEPROM page-write cycle.
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::checksum::ChecksumMode;
use crate::protocol::Command;
use crate::timer::TimerAction;

/// Reply timeouts, keyed by the category of the command just sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub init_ms: u64,
    pub ping_ms: u64,
    pub memid_ms: u64,
    /// READNEXT, TXRX_ACK, TXRX_ERR and MEMDATA
    pub chunk_ms: u64,
    /// READMEM and WRITEMEM
    pub transfer_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            init_ms: 2000,
            ping_ms: 500,
            memid_ms: 500,
            chunk_ms: 1500,
            transfer_ms: 7000,
        }
    }
}

impl Timeouts {
    /// What the reply timer does once `cmd` has been sent.
    pub fn for_command(&self, cmd: Command) -> TimerAction {
        let ms = match cmd {
            Command::Init => self.init_ms,
            Command::Ping => self.ping_ms,
            Command::MemId => self.memid_ms,
            Command::TxRxAck | Command::TxRxErr | Command::ReadNext | Command::MemData => {
                self.chunk_ms
            }
            Command::ReadMem | Command::WriteMem => self.transfer_ms,
            Command::Disconnect | Command::Ok | Command::Err | Command::TxRxDone => {
                return TimerAction::Cancel;
            }
            _ => return TimerAction::Keep,
        };
        TimerAction::Arm(Duration::from_millis(ms))
    }
}

/// Host side of the link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub timeouts: Timeouts,
    /// Corrupted chunks re-requested per read before giving up
    pub read_retries: u32,
    /// Resends of a rejected chunk per write before giving up
    pub write_retries: u32,
    /// Handshake attempts before the session is declared dead
    pub reconnect_attempts: u32,
    pub ping_interval_ms: u64,
    pub checksum: ChecksumMode,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            timeouts: Timeouts::default(),
            read_retries: 10,
            write_retries: 20,
            reconnect_attempts: 10,
            ping_interval_ms: 500,
            checksum: ChecksumMode::None,
        }
    }
}

impl LinkConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }
}

/// Device side of the link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub retries: u32,
    /// Silence after which the device considers the host gone
    pub idle_timeout_ms: u64,
    pub checksum: ChecksumMode,
}

impl Default for TargetConfig {
    fn default() -> Self {
        TargetConfig {
            retries: 10,
            idle_timeout_ms: 5000,
            checksum: ChecksumMode::None,
        }
    }
}

impl TargetConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub link: LinkConfig,
    pub target: TargetConfig,
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                let config = Self::from_yaml(&content)?;
                log::debug!("Loaded config from {}", path.display());
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Force the same checksum mode on both ends.
    pub fn with_checksum(mut self, mode: ChecksumMode) -> Self {
        self.link.checksum = mode;
        self.target.checksum = mode;
        self
    }
}
