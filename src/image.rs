//! Memory image file formats
use std::path::Path;
use std::str;

use anyhow::Result;

/// Value of an erased EEPROM cell, used to fill gaps in sparse images.
pub const ERASED: u8 = 0xff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    PlainHex,
    IntelHex,
    Binary,
}

/// Load an image meant for a memory of `capacity` bytes.
///
/// Sparse formats are placed by address, so a record beyond `capacity` is an error.
pub fn read_image_from_file<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Vec<u8>> {
    let p = path.as_ref();
    let raw = std::fs::read(p)
        .map_err(|e| anyhow::format_err!("couldn't open file {}: {}", p.display(), e))?;

    let format = guess_format(p, &raw);
    log::info!("Read {} as {:?} format", p.display(), format);
    match format {
        ImageFormat::PlainHex => read_hex(str::from_utf8(&raw)?),
        ImageFormat::IntelHex => read_ihex(str::from_utf8(&raw)?, capacity),
        ImageFormat::Binary => Ok(raw),
    }
}

/// Memory dumps are always written raw.
pub fn write_image_to_file<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<()> {
    let p = path.as_ref();
    std::fs::write(p, data)
        .map_err(|e| anyhow::format_err!("couldn't write file {}: {}", p.display(), e))?;
    log::info!("Wrote {} bytes to {}", data.len(), p.display());
    Ok(())
}

pub fn guess_format(path: &Path, raw: &[u8]) -> ImageFormat {
    let ext = path
        .extension()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
        .to_lowercase();
    if ["ihex", "ihe", "h86", "hex"].contains(&&*ext) {
        return ImageFormat::IntelHex;
    }
    if ext == "bin" || raw.is_empty() {
        return ImageFormat::Binary;
    }

    let is_text = |extra: &[u8]| {
        raw.iter()
            .all(|&c| c.is_ascii_hexdigit() || c == b'\n' || c == b'\r' || extra.contains(&c))
    };
    if raw[0] == b':' && is_text(b":") {
        ImageFormat::IntelHex
    } else if is_text(b"") {
        ImageFormat::PlainHex
    } else {
        ImageFormat::Binary
    }
}

pub fn read_hex(data: &str) -> Result<Vec<u8>> {
    let digits: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    Ok(hex::decode(digits)?)
}

/// Place Intel HEX data records at their absolute address, starting from 0.
pub fn read_ihex(data: &str, capacity: usize) -> Result<Vec<u8>> {
    use ihex::Record;

    let mut base_address = 0u32;
    let mut image = Vec::new();
    for record in ihex::Reader::new(data) {
        match record? {
            Record::Data { offset, value } => {
                let start = (base_address + offset as u32) as usize;
                let end = start + value.len();
                anyhow::ensure!(
                    end <= capacity,
                    "Intel HEX record at 0x{:08x} lies beyond the {} byte memory",
                    start,
                    capacity
                );
                if image.len() < end {
                    image.resize(end, ERASED);
                }
                image[start..end].copy_from_slice(&value);
            }
            Record::ExtendedSegmentAddress(address) => base_address = (address as u32) * 16,
            Record::ExtendedLinearAddress(address) => base_address = (address as u32) << 16,
            Record::EndOfFile
            | Record::StartSegmentAddress { .. }
            | Record::StartLinearAddress(_) => (),
        }
    }
    anyhow::ensure!(!image.is_empty(), "no data records in Intel HEX file");
    Ok(image)
}
