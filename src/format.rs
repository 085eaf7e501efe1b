//! Memory image file formats
use std::path::Path;

use crate::error::{Error, Result};
use crate::memory::{self, Memory, MemoryImage};

/// Bytes per Intel HEX data record when writing.
const HEX_RECORD_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileFormat {
    IntelHex,
    Binary,
}

impl FileFormat {
    /// Guess the format from the file extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .map(|s| s.to_string_lossy())
            .unwrap_or_default()
            .to_lowercase();
        match &*ext {
            "hex" => Ok(FileFormat::IntelHex),
            "bin" => Ok(FileFormat::Binary),
            _ => Err(Error::InvalidArgument(format!(
                "{}: file must end in .hex or .bin",
                path.display()
            ))),
        }
    }
}

pub fn read_image<P: AsRef<Path>>(path: P) -> Result<MemoryImage> {
    let p = path.as_ref();
    let format = FileFormat::from_path(p)?;
    let raw = std::fs::read(p)?;
    log::info!("Read {} as {:?} format", p.display(), format);

    let in_file = |msg: String| Error::InvalidArgument(format!("{}: {}", p.display(), msg));
    let image = match format {
        FileFormat::Binary => MemoryImage::from_bytes(0, &raw),
        FileFormat::IntelHex => {
            let text =
                String::from_utf8(raw).map_err(|_| in_file("not a text file".into()))?;
            read_ihex(&text)
        }
    };
    image.map_err(|e| match e {
        Error::InvalidArgument(msg) => in_file(msg),
        e => e,
    })
}

/// Parse Intel HEX text. Malformed records and data beyond the 32-bit
/// address space are argument errors.
pub fn read_ihex(data: &str) -> Result<MemoryImage> {
    use ihex::Record;

    let mut base_address = 0;
    let mut image = MemoryImage::new();
    for record in ihex::Reader::new(data) {
        use Record::*;
        match record.map_err(|e| Error::InvalidArgument(e.to_string()))? {
            Data { offset, value } => {
                image.extend_from_slice(base_address + offset as u32, &value)?;
            }
            EndOfFile => break,
            ExtendedSegmentAddress(address) => {
                base_address = (address as u32) * 16;
            }
            StartSegmentAddress { .. } => (),
            ExtendedLinearAddress(address) => {
                base_address = (address as u32) << 16;
            }
            StartLinearAddress(_) => (),
        };
    }
    Ok(image)
}

/// Save a memory dump read from address 0.
///
/// Binary flash dumps lose their erased tail; HEX flash dumps leave out every
/// erased word. EEPROM dumps are written as they are.
pub fn write_image<P: AsRef<Path>>(path: P, memory: Memory, dump: &[u8]) -> Result<()> {
    let p = path.as_ref();
    let format = FileFormat::from_path(p)?;
    let contents = match (format, memory) {
        (FileFormat::Binary, Memory::Flash) => {
            let mut buf = dump.to_vec();
            memory::trim_flash_tail(&mut buf);
            buf
        }
        (FileFormat::Binary, Memory::Eeprom) => dump.to_vec(),
        (FileFormat::IntelHex, Memory::Flash) => {
            let mut image = MemoryImage::new();
            for (word, pair) in dump.chunks(2).enumerate() {
                if pair.iter().any(|&b| b != 0xff) {
                    image.extend_from_slice(word as u32 * 2, pair)?;
                }
            }
            write_ihex(&image)?.into_bytes()
        }
        (FileFormat::IntelHex, Memory::Eeprom) => {
            write_ihex(&MemoryImage::from_bytes(0, dump)?)?.into_bytes()
        }
    };
    std::fs::write(p, contents)?;
    log::info!("Saved {} to {}", memory, p.display());
    Ok(())
}

/// Save raw bytes, e.g. a fuse value, without any shaping.
pub fn write_bytes<P: AsRef<Path>>(path: P, bytes: &[u8]) -> Result<()> {
    let p = path.as_ref();
    let contents = match FileFormat::from_path(p)? {
        FileFormat::Binary => bytes.to_vec(),
        FileFormat::IntelHex => write_ihex(&MemoryImage::from_bytes(0, bytes)?)?.into_bytes(),
    };
    std::fs::write(p, contents)?;
    Ok(())
}

pub fn write_ihex(image: &MemoryImage) -> Result<String> {
    use ihex::Record;

    let mut records = Vec::new();
    let mut segment = 0u16;
    // (start address, bytes) of the record being filled
    let mut current: Option<(u32, Vec<u8>)> = None;

    let flush = |records: &mut Vec<Record>, segment: &mut u16, rec: (u32, Vec<u8>)| {
        let (start, value) = rec;
        let upper = (start >> 16) as u16;
        if upper != *segment {
            records.push(Record::ExtendedLinearAddress(upper));
            *segment = upper;
        }
        records.push(Record::Data {
            offset: (start & 0xffff) as u16,
            value,
        });
    };

    for (address, value) in image.iter() {
        current = match current.take() {
            Some((start, mut bytes))
                if start + bytes.len() as u32 == address
                    && bytes.len() < HEX_RECORD_LEN
                    && address & 0xffff != 0 =>
            {
                bytes.push(value);
                Some((start, bytes))
            }
            Some(rec) => {
                flush(&mut records, &mut segment, rec);
                Some((address, vec![value]))
            }
            None => Some((address, vec![value])),
        };
    }
    if let Some(rec) = current {
        flush(&mut records, &mut segment, rec);
    }
    records.push(Record::EndOfFile);

    ihex::create_object_file_representation(&records)
        .map_err(|e| Error::InternalError(format!("cannot encode Intel HEX: {}", e)))
}
