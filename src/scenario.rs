//! Scenario descriptors: which RAM variables a game exposes, how reward is
//! derived from them and when an episode is over.
//!
//! A descriptor is a JSON file:
//!
//! ```json
//! {
//!   "info": {
//!     "lives": { "address": 1882, "type": "|i1" },
//!     "score": { "address": 2013, "type": ">n6" }
//!   },
//!   "reward": { "variables": { "score": { "reward": 0.01 } } },
//!   "done": { "variables": { "lives": { "op": "equal", "reference": -1 } } }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use crate::env::Info;
use crate::error::{Error, Result};

/// Byte-addressable console memory.
pub trait Memory {
    fn peek(&self, addr: u16) -> u8;
}

impl Memory for [u8] {
    fn peek(&self, addr: u16) -> u8 {
        self.get(addr as usize).copied().unwrap_or(0)
    }
}

// =============================================================================
// Variable Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
    /// Single byte, order irrelevant.
    Native,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Unsigned,
    Signed,
    /// Two packed BCD digits per byte.
    Bcd,
    /// One decimal digit per byte, stored in the low nibble.
    Digits,
}

/// Parsed form of type strings such as `>u2`, `|i1` or `>n6`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarType {
    pub endian: Endian,
    pub encoding: Encoding,
    pub bytes: usize,
}

impl FromStr for VarType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut chars = s.chars();
        let endian = match chars.next() {
            Some('<') => Endian::Little,
            Some('>') => Endian::Big,
            Some('|') | Some('=') => Endian::Native,
            _ => return Err(Error::Scenario(format!("bad endianness in type {s:?}"))),
        };
        let encoding = match chars.next() {
            Some('u') => Encoding::Unsigned,
            Some('i') => Encoding::Signed,
            Some('d') => Encoding::Bcd,
            Some('n') => Encoding::Digits,
            _ => return Err(Error::Scenario(format!("bad encoding in type {s:?}"))),
        };
        let bytes: usize = chars
            .as_str()
            .parse()
            .map_err(|_| Error::Scenario(format!("bad width in type {s:?}")))?;
        if !(1..=8).contains(&bytes) {
            return Err(Error::Scenario(format!(
                "width must be 1..=8 bytes in type {s:?}"
            )));
        }
        if endian == Endian::Native && bytes != 1 {
            return Err(Error::Scenario(format!(
                "'|' is only valid for single bytes in type {s:?}"
            )));
        }
        Ok(Self {
            endian,
            encoding,
            bytes,
        })
    }
}

impl<'de> Deserialize<'de> for VarType {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl VarType {
    /// Decodes `raw`, which holds the bytes in address order.
    pub fn decode(&self, raw: &[u8]) -> i64 {
        // Most significant byte first.
        let ordered: Vec<u8> = match self.endian {
            Endian::Little => raw.iter().rev().copied().collect(),
            Endian::Big | Endian::Native => raw.to_vec(),
        };
        match self.encoding {
            Encoding::Unsigned => ordered
                .iter()
                .fold(0u64, |acc, &b| (acc << 8) | b as u64) as i64,
            Encoding::Signed => {
                let unsigned = ordered.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64);
                let shift = 64 - 8 * self.bytes as u32;
                ((unsigned << shift) as i64) >> shift
            }
            Encoding::Bcd => ordered.iter().fold(0i64, |acc, &b| {
                acc * 100 + ((b >> 4) & 0x0F) as i64 * 10 + (b & 0x0F) as i64
            }),
            Encoding::Digits => ordered
                .iter()
                .fold(0i64, |acc, &b| acc * 10 + (b & 0x0F) as i64),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Variable {
    pub address: u16,
    #[serde(rename = "type")]
    pub ty: VarType,
}

impl Variable {
    pub fn read<M: Memory + ?Sized>(&self, mem: &M) -> i64 {
        let raw: Vec<u8> = (0..self.ty.bytes)
            .map(|i| mem.peek(self.address.wrapping_add(i as u16)))
            .collect();
        self.ty.decode(&raw)
    }
}

// =============================================================================
// Reward & Done
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RewardTerm {
    /// Multiplier applied to increases of the variable.
    pub reward: f32,
    /// Multiplier applied to decreases of the variable.
    pub penalty: f32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RewardSpec {
    pub variables: BTreeMap<String, RewardTerm>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Op {
    Equal,
    NotEqual,
    LessThan,
    GreaterThan,
    LessOrEqual,
    GreaterOrEqual,
    Zero,
    Nonzero,
    Positive,
    Negative,
}

impl Op {
    pub fn holds(self, value: i64, reference: i64) -> bool {
        match self {
            Op::Equal => value == reference,
            Op::NotEqual => value != reference,
            Op::LessThan => value < reference,
            Op::GreaterThan => value > reference,
            Op::LessOrEqual => value <= reference,
            Op::GreaterOrEqual => value >= reference,
            Op::Zero => value == 0,
            Op::Nonzero => value != 0,
            Op::Positive => value > 0,
            Op::Negative => value < 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Measurement {
    #[default]
    Absolute,
    Delta,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DoneCondition {
    pub op: Op,
    #[serde(default)]
    pub reference: i64,
    #[serde(default)]
    pub measurement: Measurement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Combine {
    #[default]
    Any,
    All,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DoneSpec {
    pub condition: Combine,
    pub variables: BTreeMap<String, DoneCondition>,
}

/// Frames to run after a power-on reset when no save-state is loaded.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Boot {
    pub wait_frames: u32,
    pub start_presses: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Scenario {
    pub info: BTreeMap<String, Variable>,
    pub reward: RewardSpec,
    pub done: DoneSpec,
    pub boot: Boot,
}

impl Scenario {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Scenario(format!("cannot read {}: {e}", path.display())))?;
        let scenario: Scenario = serde_json::from_str(&text)
            .map_err(|e| Error::Scenario(format!("cannot parse {}: {e}", path.display())))?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Every reward and done term must name a declared variable.
    pub fn validate(&self) -> Result<()> {
        let referenced = self
            .reward
            .variables
            .keys()
            .chain(self.done.variables.keys());
        for name in referenced {
            if !self.info.contains_key(name) {
                return Err(Error::Scenario(format!("unknown variable {name:?}")));
            }
        }
        Ok(())
    }

    pub fn read_info<M: Memory + ?Sized>(&self, mem: &M) -> Info {
        self.info
            .iter()
            .map(|(name, var)| (name.clone(), var.read(mem)))
            .collect()
    }

    pub fn reward(&self, prev: &Info, cur: &Info) -> f32 {
        self.reward
            .variables
            .iter()
            .map(|(name, term)| {
                let delta = delta(prev, cur, name);
                if delta > 0 {
                    term.reward * delta as f32
                } else {
                    term.penalty * delta as f32
                }
            })
            .sum()
    }

    pub fn is_done(&self, prev: &Info, cur: &Info) -> bool {
        if self.done.variables.is_empty() {
            return false;
        }
        let mut results = self.done.variables.iter().map(|(name, cond)| {
            let value = match cond.measurement {
                Measurement::Absolute => cur.get(name).copied().unwrap_or(0),
                Measurement::Delta => delta(prev, cur, name),
            };
            cond.op.holds(value, cond.reference)
        });
        match self.done.condition {
            Combine::Any => results.any(|r| r),
            Combine::All => results.all(|r| r),
        }
    }
}

fn delta(prev: &Info, cur: &Info, name: &str) -> i64 {
    let before = prev.get(name).copied().unwrap_or(0);
    let after = cur.get(name).copied().unwrap_or(0);
    after.wrapping_sub(before)
}
