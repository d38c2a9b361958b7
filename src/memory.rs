//! Supported serial EEPROMs, with their wire ids and page geometry.
use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::constants::PKG_DATA_MAX;

/// Memory type negotiated during the handshake. Fixed for the whole session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryType {
    #[default]
    None,
    Lc16,
    Lc64,
    X24645,
    Lc256,
}

impl MemoryType {
    pub const ALL: [MemoryType; 4] = [
        MemoryType::Lc16,
        MemoryType::Lc64,
        MemoryType::X24645,
        MemoryType::Lc256,
    ];

    /// Id sent as payload of MEMID, READMEM and WRITEMEM.
    pub const fn id(self) -> u8 {
        match self {
            MemoryType::None => 0,
            MemoryType::Lc16 => 1,
            MemoryType::Lc64 => 2,
            MemoryType::X24645 => 3,
            MemoryType::Lc256 => 4,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.id() == id)
    }

    /// Capacity in bytes
    pub const fn capacity(self) -> usize {
        match self {
            MemoryType::None => 0,
            MemoryType::Lc16 => 0x800,
            MemoryType::Lc64 | MemoryType::X24645 => 0x2000,
            MemoryType::Lc256 => 0x8000,
        }
    }

    /// Number of `MEMDATA` chunks making up a full image.
    pub const fn chunks(self) -> usize {
        self.capacity().div_ceil(PKG_DATA_MAX)
    }

    pub const fn name(self) -> &'static str {
        match self {
            MemoryType::None => "NONE",
            MemoryType::Lc16 => "24LC16",
            MemoryType::Lc64 => "24LC64",
            MemoryType::X24645 => "X24645",
            MemoryType::Lc256 => "24LC256",
        }
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}B)", self.name(), self.capacity())
    }
}

impl FromStr for MemoryType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_uppercase();
        Self::ALL
            .into_iter()
            .find(|m| m.name() == wanted)
            .ok_or_else(|| {
                anyhow::format_err!(
                    "invalid memory type {:?}, expected one of 24LC16, X24645, 24LC64, 24LC256",
                    s
                )
            })
    }
}

/// Physical layout of one EEPROM part
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Geometry {
    pub name: String,
    pub id: u8,
    #[serde(deserialize_with = "parse_size")]
    pub size: usize,
    pub page_size: usize,
    /// 7-bit I2C address
    #[serde(deserialize_with = "parse_address")]
    pub address: u8,
    pub address_bytes: u8,
    /// High word-address bits carried in the device address instead
    #[serde(default)]
    pub block_bits: u8,
}

impl Geometry {
    pub fn memory_type(&self) -> Option<MemoryType> {
        MemoryType::from_id(self.id)
    }

    /// 8-bit bus address selecting the block that holds `offset`.
    pub fn device_address(&self, offset: usize) -> u8 {
        let mask = (1u16 << self.block_bits) - 1;
        let block = ((offset >> 8) as u16 & mask) as u8;
        (self.address | block) << 1
    }

    /// Page-aligned pieces of a write starting at `offset`.
    pub fn pages(&self, offset: usize, len: usize) -> Vec<(usize, usize)> {
        let mut pieces = Vec::new();
        let end = offset + len;
        let mut at = offset;
        while at < end {
            let page_end = (at / self.page_size + 1) * self.page_size;
            let piece_end = page_end.min(end);
            pieces.push((at, piece_end - at));
            at = piece_end;
        }
        pieces
    }
}

#[derive(Debug, Deserialize)]
pub struct MemoryDb {
    memories: Vec<Geometry>,
}

impl MemoryDb {
    pub fn load() -> Result<Self> {
        let db: MemoryDb = serde_yaml::from_str(include_str!("../devices/eeproms.yaml"))?;
        for geometry in &db.memories {
            let memory = geometry.memory_type().ok_or_else(|| {
                anyhow::format_err!("{}: unknown memory id {}", geometry.name, geometry.id)
            })?;
            anyhow::ensure!(
                memory.capacity() == geometry.size,
                "{}: size 0x{:x} doesn't match capacity 0x{:x}",
                geometry.name,
                geometry.size,
                memory.capacity()
            );
            anyhow::ensure!(
                geometry.page_size > 0 && geometry.size % geometry.page_size == 0,
                "{}: bad page size {}",
                geometry.name,
                geometry.page_size
            );
        }
        Ok(db)
    }

    pub fn find(memory: MemoryType) -> Result<Geometry> {
        let db = MemoryDb::load()?;
        let geometry = db
            .memories
            .into_iter()
            .find(|g| g.id == memory.id())
            .ok_or_else(|| anyhow::format_err!("No geometry for memory {}", memory))?;
        log::debug!(
            "{}: {} byte pages, i2c address 0x{:02x}",
            geometry.name,
            geometry.page_size,
            geometry.address
        );
        Ok(geometry)
    }
}

fn parse_address<'de, D>(deserializer: D) -> std::result::Result<u8, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = serde::Deserialize::deserialize(deserializer)?;
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| serde::de::Error::custom(format!("error while parsing {:?}: {}", s, e)))
}

fn parse_size<'de, D>(deserializer: D) -> std::result::Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = serde::Deserialize::deserialize(deserializer)?;
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        usize::from_str_radix(hex, 16)
    } else if let Some(kib) = s
        .strip_suffix("KiB")
        .or_else(|| s.strip_suffix("KB"))
        .or_else(|| s.strip_suffix("K"))
    {
        kib.parse::<usize>().map(|k| k * 1024)
    } else {
        // parse pure digits here
        s.parse()
    };
    parsed.map_err(|e| serde::de::Error::custom(format!("error while parsing {:?}: {}", s, e)))
}
