//! In-memory model of an I2C EEPROM, for emulation and tests.
use std::collections::BTreeMap;

use anyhow::Result;

use crate::memory::{Geometry, MemoryDb, MemoryType};
use crate::target::MemoryBackend;

/// RAM-backed EEPROM with page-write semantics.
///
/// Writes are split at page boundaries exactly like the part requires. Cells can
/// be marked stuck to model worn-out memory that fails verification.
#[derive(Debug, Clone)]
pub struct PagedEeprom {
    memory: MemoryType,
    geometry: Geometry,
    cells: Vec<u8>,
    stuck: BTreeMap<usize, u8>,
    selected: bool,
    page_writes: usize,
}

impl PagedEeprom {
    /// A blank part, erased to 0xFF.
    pub fn new(memory: MemoryType) -> Result<Self> {
        let geometry = MemoryDb::find(memory)?;
        Ok(PagedEeprom {
            memory,
            cells: vec![0xff; geometry.size],
            geometry,
            stuck: BTreeMap::new(),
            selected: false,
            page_writes: 0,
        })
    }

    pub fn with_contents(memory: MemoryType, contents: &[u8]) -> Result<Self> {
        let mut eeprom = Self::new(memory)?;
        anyhow::ensure!(
            contents.len() == eeprom.cells.len(),
            "{} holds {} bytes, got {}",
            memory,
            eeprom.cells.len(),
            contents.len()
        );
        eeprom.cells.copy_from_slice(contents);
        Ok(eeprom)
    }

    /// Pin the cell at `offset` to `value`; later writes don't change it.
    pub fn stick(&mut self, offset: usize, value: u8) {
        self.stuck.insert(offset, value);
        if let Some(cell) = self.cells.get_mut(offset) {
            *cell = value;
        }
    }

    pub fn contents(&self) -> &[u8] {
        &self.cells
    }

    pub fn memory(&self) -> MemoryType {
        self.memory
    }

    /// Page write cycles since creation.
    pub fn page_writes(&self) -> usize {
        self.page_writes
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        anyhow::ensure!(self.selected, "{} not selected", self.memory);
        anyhow::ensure!(
            offset + len <= self.cells.len(),
            "range 0x{:04x}+{} out of {}",
            offset,
            len,
            self.memory
        );
        Ok(())
    }

    fn write_page(&mut self, at: usize, data: &[u8]) {
        log::trace!(
            "page write 0x{:04x}+{} @ 0x{:02x}",
            at,
            data.len(),
            self.geometry.device_address(at)
        );
        for (i, &byte) in data.iter().enumerate() {
            let offset = at + i;
            if !self.stuck.contains_key(&offset) {
                self.cells[offset] = byte;
            }
        }
        self.page_writes += 1;
    }
}

impl MemoryBackend for PagedEeprom {
    fn select(&mut self, memory: MemoryType) -> Result<()> {
        anyhow::ensure!(
            memory == self.memory,
            "{} requested but {} is fitted",
            memory,
            self.memory
        );
        self.selected = true;
        Ok(())
    }

    fn read_block(&mut self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;
        buf.copy_from_slice(&self.cells[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_block(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        for (at, len) in self.geometry.pages(offset, data.len()) {
            let start = at - offset;
            self.write_page(at, &data[start..start + len]);
        }
        Ok(())
    }
}
