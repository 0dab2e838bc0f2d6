//! Compact 64-bit identifiers for accounts, tests and tables.
//!
//! A name holds up to 13 characters. The first 12 come from
//! `.12345abcdefghijklmnopqrstuvwxyz` and take 5 bits each, most significant
//! first; an optional 13th takes the low 4 bits and is limited to
//! `.12345abcdefghij`. Trailing dots carry no information, so `"a."` and `"a"`
//! are the same name. Names sort by their raw value, which is what the
//! `users` and `testid` indexes order on.

use std::fmt;
use std::str::FromStr;

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

use crate::error::{LedgerError, Result};

const CHARMAP: &[u8; 32] = b".12345abcdefghijklmnopqrstuvwxyz";
const MAX_LEN: usize = 13;

#[derive(Archive, RkyvDeserialize, RkyvSerialize, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[archive(check_bytes)]
pub struct Name(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Invalid {
    TooLong,
    BadChar(usize),
    BadLastChar,
}

const fn symbol(c: u8) -> Option<u64> {
    match c {
        b'a'..=b'z' => Some((c - b'a') as u64 + 6),
        b'1'..=b'5' => Some((c - b'1') as u64 + 1),
        b'.' => Some(0),
        _ => None,
    }
}

const fn encode(bytes: &[u8]) -> std::result::Result<u64, Invalid> {
    if bytes.len() > MAX_LEN {
        return Err(Invalid::TooLong);
    }
    let mut value = 0u64;
    let mut i = 0;
    while i < bytes.len() {
        let sym = match symbol(bytes[i]) {
            Some(s) => s,
            None => return Err(Invalid::BadChar(i)),
        };
        if i < 12 {
            value |= sym << (64 - 5 * (i + 1));
        } else {
            if sym > 0x0f {
                return Err(Invalid::BadLastChar);
            }
            value |= sym;
        }
        i += 1;
    }
    Ok(value)
}

impl Name {
    /// Parses a name, rejecting characters outside the alphabet.
    pub fn new(s: &str) -> Result<Self> {
        match encode(s.as_bytes()) {
            Ok(value) => Ok(Name(value)),
            Err(Invalid::TooLong) => Err(LedgerError::InvalidName(format!(
                "'{}' is longer than {} characters",
                s, MAX_LEN
            ))),
            Err(Invalid::BadChar(pos)) => Err(LedgerError::InvalidName(format!(
                "'{}' has an invalid character at position {}",
                s, pos
            ))),
            Err(Invalid::BadLastChar) => Err(LedgerError::InvalidName(format!(
                "'{}': the 13th character must be one of .12345abcdefghij",
                s
            ))),
        }
    }

    /// Compile-time constructor for well-known names.
    pub const fn constant(s: &str) -> Self {
        match encode(s.as_bytes()) {
            Ok(value) => Name(value),
            Err(_) => panic!("invalid name constant"),
        }
    }

    pub const fn from_value(value: u64) -> Self {
        Name(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = [b'.'; MAX_LEN];
        let mut tmp = self.0;
        for i in 0..MAX_LEN {
            let (mask, shift) = if i == 0 { (0x0f, 4) } else { (0x1f, 5) };
            buf[MAX_LEN - 1 - i] = CHARMAP[(tmp & mask) as usize];
            tmp >>= shift;
        }
        let end = buf.iter().rposition(|&c| c != b'.').map_or(0, |p| p + 1);
        // CHARMAP is pure ASCII
        f.write_str(std::str::from_utf8(&buf[..end]).map_err(|_| fmt::Error)?)
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({})", self)
    }
}

impl FromStr for Name {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        Name::new(s)
    }
}

impl serde::Serialize for Name {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Name {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        Name::new(&s).map_err(serde::de::Error::custom)
    }
}
