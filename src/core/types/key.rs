//! Graph symbol keys.
//!
//! A key is a 64-bit symbol: one ASCII prefix character (robot or landmark
//! class) in the top byte plus a 56-bit index. Robot odometry keyframes use
//! one lowercase prefix per robot; artifact landmarks use uppercase letters;
//! UWB anchors use their own prefix.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SlamError;

const INDEX_BITS: u32 = 56;
const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;

/// A 64-bit graph symbol: prefix character + index.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(u64);

impl Key {
    /// Create a key from a prefix character and index.
    ///
    /// The index is truncated to 56 bits.
    #[inline]
    pub fn new(prefix: char, index: u64) -> Self {
        debug_assert!(prefix.is_ascii(), "key prefix must be ASCII");
        Self(((prefix as u64) << INDEX_BITS) | (index & INDEX_MASK))
    }

    /// Prefix character (robot or landmark class).
    #[inline]
    pub fn prefix(&self) -> char {
        ((self.0 >> INDEX_BITS) as u8) as char
    }

    /// Index within the prefix.
    #[inline]
    pub fn index(&self) -> u64 {
        self.0 & INDEX_MASK
    }

    /// The next key in the same prefix.
    #[inline]
    pub fn next(&self) -> Key {
        Key::new(self.prefix(), self.index() + 1)
    }

    /// The previous key in the same prefix, if any.
    #[inline]
    pub fn prev(&self) -> Option<Key> {
        let idx = self.index();
        (idx > 0).then(|| Key::new(self.prefix(), idx - 1))
    }

    /// Raw 64-bit encoding (used in g2o dumps and scan file names).
    #[inline]
    pub fn encode(&self) -> u64 {
        self.0
    }

    /// Decode from a raw 64-bit encoding.
    #[inline]
    pub fn decode(raw: u64) -> Self {
        Self(raw)
    }

    /// Whether two keys share a prefix (same robot or landmark class).
    #[inline]
    pub fn same_prefix(&self, other: &Key) -> bool {
        self.prefix() == other.prefix()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.prefix(), self.index())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({}{})", self.prefix(), self.index())
    }
}

impl FromStr for Key {
    type Err = SlamError;

    /// Parse the display form, e.g. `a123`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        let prefix = chars
            .next()
            .filter(|c| c.is_ascii_alphabetic())
            .ok_or_else(|| SlamError::InvalidKey(s.to_string()))?;
        let index = chars
            .as_str()
            .parse::<u64>()
            .map_err(|_| SlamError::InvalidKey(s.to_string()))?;
        Ok(Key::new(prefix, index))
    }
}
