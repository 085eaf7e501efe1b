//! ISP instruction patterns.
//!
//! A pattern describes the 32 bits of one instruction, most significant bit
//! of the first byte first:
//!
//! - `1` / `0`: literal bit
//! - `x`: don't care, left cleared
//! - `a<k>`: bit `k` of the address
//! - `i`: input data bit, filled by [`compile_with_data`]
//! - `o`: output bit, produced by the device in its reply
//!
//! Whitespace separates symbols and is otherwise ignored. The programmer
//! firmware receives patterns without whitespace, so an address bit may not
//! be followed by a literal bit: `a1 0` would reach it as `a10`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const INSTRUCTION_BITS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Symbol {
    One,
    Zero,
    DontCare,
    Address(u32),
    Input,
    Output,
}

fn parse(pattern: &str) -> Result<Vec<Symbol>> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut symbols = Vec::with_capacity(INSTRUCTION_BITS);

    let mut i = 0;
    while i < chars.len() {
        let symbol = match chars[i] {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '1' => Symbol::One,
            '0' => Symbol::Zero,
            'x' => Symbol::DontCare,
            'i' => Symbol::Input,
            'o' => Symbol::Output,
            'a' => {
                let digits: String = chars[i + 1..]
                    .iter()
                    .take_while(|c| c.is_ascii_digit())
                    .collect();
                if digits.is_empty() {
                    return Err(Error::InvalidPattern(format!(
                        "address bit without shift in {:?}",
                        pattern
                    )));
                }
                i += digits.len();
                let shift: u32 = digits.parse().map_err(|_| {
                    Error::InvalidPattern(format!("bad address shift {:?}", digits))
                })?;
                if shift >= u32::BITS {
                    return Err(Error::InvalidPattern(format!(
                        "address shift {} out of range",
                        shift
                    )));
                }
                if let Some(next) = chars[i + 1..].iter().find(|c| !c.is_whitespace()) {
                    if next.is_ascii_digit() {
                        return Err(Error::InvalidPattern(format!(
                            "a{} followed by literal {:?} is ambiguous in {:?}",
                            shift, next, pattern
                        )));
                    }
                }
                Symbol::Address(shift)
            }
            c => {
                return Err(Error::InvalidPattern(format!(
                    "unknown symbol {:?} in {:?}",
                    c, pattern
                )));
            }
        };
        symbols.push(symbol);
        i += 1;
    }

    if symbols.len() != INSTRUCTION_BITS {
        return Err(Error::InvalidPattern(format!(
            "{:?} describes {} bits, expected {}",
            pattern,
            symbols.len(),
            INSTRUCTION_BITS
        )));
    }
    Ok(symbols)
}

/// Compile `pattern` for `address`. Data bits are left cleared.
pub fn compile(pattern: &str, address: u32) -> Result<[u8; 4]> {
    compile_with_data(pattern, address, 0)
}

/// Compile `pattern` for `address`, filling the `i` bits from `data`.
///
/// With `n` input bits, the first one takes bit `n - 1` of `data` and the
/// last one bit 0.
pub fn compile_with_data(pattern: &str, address: u32, data: u8) -> Result<[u8; 4]> {
    let symbols = parse(pattern)?;
    let inputs = symbols.iter().filter(|s| **s == Symbol::Input).count();
    if inputs > 8 {
        return Err(Error::InvalidPattern(format!(
            "{:?} has {} data bits, at most 8 allowed",
            pattern, inputs
        )));
    }

    let mut cmd = [0u8; 4];
    let mut data_bit = inputs;
    for (n, symbol) in symbols.into_iter().enumerate() {
        let byte = n / 8;
        let bit = 7 - (n % 8);
        let value = match symbol {
            Symbol::One => 1,
            Symbol::Zero | Symbol::DontCare | Symbol::Output => 0,
            Symbol::Address(shift) => ((address >> shift) & 1) as u8,
            Symbol::Input => {
                data_bit -= 1;
                (data >> data_bit) & 1
            }
        };
        cmd[byte] |= value << bit;
    }
    Ok(cmd)
}

/// A validated instruction pattern as stored in the chip database.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Pattern(String);

impl Pattern {
    pub fn new(pattern: &str) -> Result<Self> {
        parse(pattern)?;
        Ok(Pattern(pattern.split_whitespace().collect::<Vec<_>>().join(" ")))
    }

    /// Built-in patterns; covered by the tests below.
    pub(crate) fn builtin(pattern: &'static str) -> Self {
        Pattern(pattern.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Pattern text without separators, as the programmer firmware expects it.
    pub fn compact(&self) -> String {
        self.0.split_whitespace().collect()
    }

    pub fn compile(&self, address: u32) -> Result<[u8; 4]> {
        compile(&self.0, address)
    }

    pub fn compile_with_data(&self, address: u32, data: u8) -> Result<[u8; 4]> {
        compile_with_data(&self.0, address, data)
    }
}

impl TryFrom<String> for Pattern {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Pattern::new(&s)
    }
}

impl From<Pattern> for String {
    fn from(p: Pattern) -> String {
        p.0
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pattern({})", self.0)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
