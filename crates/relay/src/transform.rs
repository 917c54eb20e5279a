//! Transform codes and the byte filters behind them.
//!
//! Every filter is a pure function over bytes: ASCII letters are mapped, every
//! other byte passes through unchanged. Workers call [`TransformCode::apply`];
//! nothing here touches the network.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

const CAESAR_SHIFT: u8 = 13;
const ALPHABET_LEN: u8 = 26;

/// One step of a pipeline, selected on the wire by the bytes `'1'..='6'`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformCode {
    Identity,
    Reverse,
    Upper,
    Lower,
    Caesar,
    /// The "yours" filter. Upper-cases ASCII letters, so `"26"` and `"23"`
    /// agree.
    #[serde(rename = "yours")]
    Custom,
}

impl TransformCode {
    pub const ALL: [TransformCode; 6] = [
        TransformCode::Identity,
        TransformCode::Reverse,
        TransformCode::Upper,
        TransformCode::Lower,
        TransformCode::Caesar,
        TransformCode::Custom,
    ];

    /// Decode a wire byte. Anything outside `'1'..='6'` is `None`.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'1' => Some(Self::Identity),
            b'2' => Some(Self::Reverse),
            b'3' => Some(Self::Upper),
            b'4' => Some(Self::Lower),
            b'5' => Some(Self::Caesar),
            b'6' => Some(Self::Custom),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        b'1' + self.index() as u8
    }

    /// Position in [`TransformCode::ALL`]; also the worker's port offset.
    pub fn index(self) -> usize {
        match self {
            Self::Identity => 0,
            Self::Reverse => 1,
            Self::Upper => 2,
            Self::Lower => 3,
            Self::Caesar => 4,
            Self::Custom => 5,
        }
    }

    /// Worker name, as passed to the `relay-worker` binary.
    pub fn name(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Reverse => "reverse",
            Self::Upper => "upper",
            Self::Lower => "lower",
            Self::Caesar => "caesar",
            Self::Custom => "yours",
        }
    }

    pub fn apply(self, input: &[u8]) -> Vec<u8> {
        let mut out = input.to_vec();
        match self {
            Self::Identity => {}
            Self::Reverse => reverse_in_place(&mut out),
            Self::Upper => out.make_ascii_uppercase(),
            Self::Lower => out.make_ascii_lowercase(),
            Self::Caesar => out.iter_mut().for_each(|b| *b = rot13(*b)),
            Self::Custom => out.make_ascii_uppercase(),
        }
        out
    }
}

impl fmt::Display for TransformCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown transform '{0}', expected one of identity, reverse, upper, lower, caesar, yours")]
pub struct UnknownTransform(pub String);

/// Accepts worker names (`"caesar"`) as well as wire digits (`"5"`).
impl FromStr for TransformCode {
    type Err = UnknownTransform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let [byte] = s.as_bytes()
            && let Some(code) = Self::from_byte(*byte)
        {
            return Ok(code);
        }
        Self::ALL
            .into_iter()
            .find(|code| code.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownTransform(s.to_string()))
    }
}

fn reverse_in_place(buf: &mut [u8]) {
    if buf.is_empty() {
        return;
    }
    let (mut lo, mut hi) = (0, buf.len() - 1);
    while lo < hi {
        buf.swap(lo, hi);
        lo += 1;
        hi -= 1;
    }
}

fn rot13(byte: u8) -> u8 {
    let base = match byte {
        b'A'..=b'Z' => b'A',
        b'a'..=b'z' => b'a',
        _ => return byte,
    };
    (byte - base + CAESAR_SHIFT) % ALPHABET_LEN + base
}
