//! MCU chip descriptors, loaded from the embedded chip database.
use serde::{Deserialize, Serialize};

use crate::constants::patterns;
use crate::error::{Error, Result};
use crate::pattern::Pattern;

/// MCU family, one YAML file each
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Family {
    pub name: String,
    pub description: String,
    pub variants: Vec<Chip>,
}

/// Represents an MCU chip
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chip {
    pub name: String,
    /// Short part id used on the command line, e.g. `m328p`
    pub id: String,
    #[serde(deserialize_with = "parse_signature")]
    pub signature: [u8; 3],

    pub pgm_enable: Pattern,
    #[serde(default = "default_chip_erase")]
    pub chip_erase: Pattern,
    #[serde(default = "default_read_signature")]
    pub read_signature: Pattern,

    pub flash: Flash,
    pub eeprom: Eeprom,

    #[serde(default)]
    pub lfuse: Option<Fuse>,
    #[serde(default)]
    pub hfuse: Option<Fuse>,
    #[serde(default)]
    pub efuse: Option<Fuse>,
    #[serde(default)]
    pub lock: Option<Fuse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawFlash")]
pub struct Flash {
    /// Size in bytes
    pub size: u32,
    pub read_lo: Pattern,
    pub read_hi: Pattern,
    pub layout: FlashLayout,
}

/// How flash cells get written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FlashLayout {
    /// Words are latched into a page buffer, then committed by `write_page`.
    Paged {
        /// Page size in bytes
        page_size: u32,
        num_pages: u32,
        load_lo: Pattern,
        load_hi: Pattern,
        write_page: Pattern,
    },
    /// Every word is written on its own and settles for `write_delay_ms`.
    Unpaged {
        write_delay_ms: u8,
        write_lo: Pattern,
        write_hi: Pattern,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Eeprom {
    #[serde(deserialize_with = "parse_size")]
    pub size: u32,
    /// Microseconds
    pub min_write_delay: u32,
    pub read: Pattern,
    pub write: Pattern,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fuse {
    pub read: Pattern,
    pub write: Pattern,
}

/// Single configuration bytes with their own read/write instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FuseKind {
    Low,
    High,
    Extended,
    Lock,
}

impl FuseKind {
    pub const fn name(self) -> &'static str {
        match self {
            FuseKind::Low => "lfuse",
            FuseKind::High => "hfuse",
            FuseKind::Extended => "efuse",
            FuseKind::Lock => "lock",
        }
    }
}

impl ::std::fmt::Display for FuseKind {
    fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Flash section as written in the YAML files.
#[derive(Deserialize)]
struct RawFlash {
    #[serde(deserialize_with = "parse_size")]
    size: u32,
    #[serde(default)]
    paged: bool,
    #[serde(default, deserialize_with = "parse_optional_size")]
    page_size: Option<u32>,
    #[serde(default)]
    num_pages: Option<u32>,
    #[serde(default)]
    min_write_delay: Option<u32>,
    read_lo: Pattern,
    read_hi: Pattern,
    #[serde(default)]
    loadpage_lo: Option<Pattern>,
    #[serde(default)]
    loadpage_hi: Option<Pattern>,
    #[serde(default)]
    writepage: Option<Pattern>,
    #[serde(default)]
    write_lo: Option<Pattern>,
    #[serde(default)]
    write_hi: Option<Pattern>,
}

impl TryFrom<RawFlash> for Flash {
    type Error = String;

    fn try_from(raw: RawFlash) -> std::result::Result<Self, String> {
        fn required<T>(v: Option<T>, field: &str) -> std::result::Result<T, String> {
            v.ok_or_else(|| format!("flash: missing `{}`", field))
        }

        let layout = if raw.paged {
            let page_size = required(raw.page_size, "page_size")?;
            if page_size == 0 || page_size % 2 != 0 {
                return Err(format!("flash: page_size {} must be even", page_size));
            }
            let num_pages = required(raw.num_pages, "num_pages")?;
            if page_size * num_pages != raw.size {
                return Err(format!(
                    "flash: {} pages of {} bytes do not add up to {} bytes",
                    num_pages, page_size, raw.size
                ));
            }
            FlashLayout::Paged {
                page_size,
                num_pages,
                load_lo: required(raw.loadpage_lo, "loadpage_lo")?,
                load_hi: required(raw.loadpage_hi, "loadpage_hi")?,
                write_page: required(raw.writepage, "writepage")?,
            }
        } else {
            FlashLayout::Unpaged {
                write_delay_ms: delay_to_ms(required(raw.min_write_delay, "min_write_delay")?),
                write_lo: required(raw.write_lo, "write_lo")?,
                write_hi: required(raw.write_hi, "write_hi")?,
            }
        };

        Ok(Flash {
            size: raw.size,
            read_lo: raw.read_lo,
            read_hi: raw.read_hi,
            layout,
        })
    }
}

impl ::std::fmt::Display for Chip {
    fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
        write!(
            f,
            "{}({}, 0x{:02x}{:02x}{:02x})",
            self.name, self.id, self.signature[0], self.signature[1], self.signature[2],
        )
    }
}

/// The programmer firmware ticks every 1 ms, so delays are rounded up to it.
pub fn delay_to_ms(us: u32) -> u8 {
    (us / 1000 + 1).min(u8::MAX as u32) as u8
}

pub struct ChipDB {
    families: Vec<Family>,
}

impl ChipDB {
    pub fn load() -> Result<Self> {
        Ok(ChipDB {
            families: vec![
                serde_yaml::from_str(include_str!("../devices/atmega.yaml"))?,
                serde_yaml::from_str(include_str!("../devices/attiny.yaml"))?,
                serde_yaml::from_str(include_str!("../devices/at90s.yaml"))?,
            ],
        })
    }

    pub fn parts(&self) -> impl Iterator<Item = &Chip> {
        self.families.iter().flat_map(|f| f.variants.iter())
    }

    /// Look a part up by id or name, ignoring case.
    pub fn find_chip(&self, part: &str) -> Result<Chip> {
        let chip = self
            .parts()
            .find(|c| c.id.eq_ignore_ascii_case(part) || c.name.eq_ignore_ascii_case(part))
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("Unknown part {:?}", part)))?;
        log::debug!("Find chip: {}", chip);
        Ok(chip)
    }
}

impl Chip {
    pub fn is_paged(&self) -> bool {
        matches!(self.flash.layout, FlashLayout::Paged { .. })
    }

    pub fn eeprom_write_delay_ms(&self) -> u8 {
        delay_to_ms(self.eeprom.min_write_delay)
    }

    pub fn fuse(&self, kind: FuseKind) -> Option<&Fuse> {
        match kind {
            FuseKind::Low => self.lfuse.as_ref(),
            FuseKind::High => self.hfuse.as_ref(),
            FuseKind::Extended => self.efuse.as_ref(),
            FuseKind::Lock => self.lock.as_ref(),
        }
    }
}

fn default_chip_erase() -> Pattern {
    Pattern::builtin(patterns::CHIP_ERASE)
}

fn default_read_signature() -> Pattern {
    Pattern::builtin(patterns::READ_SIGNATURE)
}

fn parse_number(s: &str) -> std::result::Result<u32, String> {
    let s = s.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else if let Some(k) = s
        .strip_suffix("KiB")
        .or_else(|| s.strip_suffix("KB"))
        .or_else(|| s.strip_suffix("K"))
    {
        k.trim().parse::<u32>().ok().and_then(|v| v.checked_mul(1024))
    } else {
        s.parse().ok()
    };
    parsed.ok_or_else(|| format!("error while parsing {:?}", s))
}

/// Accept both YAML integers and strings such as `"0x400"` or `"32K"`.
#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(u32),
    Text(String),
}

fn parse_size<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(n),
        NumberOrString::Text(s) => parse_number(&s).map_err(serde::de::Error::custom),
    }
}

fn parse_optional_size<'de, D>(deserializer: D) -> std::result::Result<Option<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    parse_size(deserializer).map(Some)
}

fn parse_signature<'de, D>(deserializer: D) -> std::result::Result<[u8; 3], D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = serde::Deserialize::deserialize(deserializer)?;
    let bytes = s
        .split_whitespace()
        .map(|b| {
            let v = parse_number(b)?;
            u8::try_from(v).map_err(|_| format!("signature byte {:?} out of range", b))
        })
        .collect::<std::result::Result<Vec<u8>, String>>()
        .map_err(serde::de::Error::custom)?;
    <[u8; 3]>::try_from(bytes.as_slice())
        .map_err(|_| serde::de::Error::custom(format!("signature {:?} must have 3 bytes", s)))
}
