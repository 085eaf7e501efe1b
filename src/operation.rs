//! `memory:op:target` memory operations from the command line.
use std::path::PathBuf;
use std::str::FromStr;

use crate::device::FuseKind;
use crate::error::{Error, Result};
use crate::format::FileFormat;
use crate::memory::Memory;

/// What one `-U` argument asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryOp {
    WriteMemory { memory: Memory, path: PathBuf },
    ReadMemory { memory: Memory, path: PathBuf },
    WriteFuse { fuse: FuseKind, value: u8 },
    /// Without a path the value is only reported.
    ReadFuse { fuse: FuseKind, path: Option<PathBuf> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Memory(Memory),
    Fuse(FuseKind),
}

fn parse_target(s: &str) -> Result<Target> {
    let target = match s {
        "flash" => Target::Memory(Memory::Flash),
        "eeprom" => Target::Memory(Memory::Eeprom),
        "lfuse" => Target::Fuse(FuseKind::Low),
        "hfuse" => Target::Fuse(FuseKind::High),
        "efuse" => Target::Fuse(FuseKind::Extended),
        "lock" => Target::Fuse(FuseKind::Lock),
        _ => {
            return Err(Error::InvalidArgument(format!(
                "wrong memory {:?}, could be flash, eeprom, lfuse, hfuse, efuse or lock",
                s
            )));
        }
    };
    Ok(target)
}

fn parse_file(s: &str) -> Result<PathBuf> {
    let path = PathBuf::from(s);
    FileFormat::from_path(&path)?;
    Ok(path)
}

/// A `0x00`..`0xFF` literal.
fn parse_fuse_value(s: &str) -> Result<u8> {
    let invalid =
        || Error::InvalidArgument(format!("fuse value {:?} must be a hex byte 0x00..0xFF", s));
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .ok_or_else(invalid)?;
    if !(1..=2).contains(&digits.len()) || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(invalid());
    }
    u8::from_str_radix(digits, 16).map_err(|_| invalid())
}

impl MemoryOp {
    pub fn memory_name(&self) -> String {
        match self {
            MemoryOp::WriteMemory { memory, .. } | MemoryOp::ReadMemory { memory, .. } => {
                memory.to_string()
            }
            MemoryOp::WriteFuse { fuse, .. } | MemoryOp::ReadFuse { fuse, .. } => {
                fuse.to_string()
            }
        }
    }

    pub fn is_flash_write(&self) -> bool {
        matches!(
            self,
            MemoryOp::WriteMemory {
                memory: Memory::Flash,
                ..
            }
        )
    }
}

impl FromStr for MemoryOp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.splitn(3, ':').collect();
        let [memory, op, target] = parts[..] else {
            return Err(Error::InvalidArgument(format!(
                "{:?} is not of the form memory:op:target",
                s
            )));
        };

        match (parse_target(memory)?, op) {
            (Target::Memory(memory), "w") => Ok(MemoryOp::WriteMemory {
                memory,
                path: parse_file(target)?,
            }),
            (Target::Memory(memory), "r") => Ok(MemoryOp::ReadMemory {
                memory,
                path: parse_file(target)?,
            }),
            (Target::Fuse(fuse), "w") => Ok(MemoryOp::WriteFuse {
                fuse,
                value: parse_fuse_value(target)?,
            }),
            (Target::Fuse(fuse), "r") => Ok(MemoryOp::ReadFuse {
                fuse,
                path: match target {
                    "" | "-" => None,
                    t => Some(parse_file(t)?),
                },
            }),
            (_, op) => Err(Error::InvalidArgument(format!(
                "wrong memory operation {:?}, could be either w or r",
                op
            ))),
        }
    }
}
