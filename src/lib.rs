//! Serial link to an I2C EEPROM programmer board.

pub mod checksum;
pub mod config;
pub mod constants;
pub mod eeprom;
pub mod error;
pub mod framer;
pub mod host;
pub mod image;
pub mod memory;
pub mod programmer;
pub mod protocol;
pub mod target;
pub mod timer;
pub mod transport;

pub use self::config::Config;
pub use self::error::LinkError;
pub use self::host::{CommManager, Event, Operation};
pub use self::memory::MemoryType;
pub use self::programmer::Programmer;
pub use self::protocol::{Command, Frame};
pub use self::transport::Transport;
