use std::ops::{
    Deref,
    DerefMut,
};

/// An opaque, totally ordered primary-key byte string. The set of byte
/// strings has two properties the rest of this crate leans on: there is a
/// minimum element (the empty string), and every key has a successor (the
/// smallest key strictly greater than it and everything it prefixes) unless
/// it's all `0xff` bytes.
#[derive(Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
pub struct Key(Vec<u8>);

impl Key {
    pub const fn min() -> Self {
        Self(Vec::new())
    }

    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// The minimum key `t` such that every key this key is a prefix of
    /// satisfies `t` greater than it. Returns `None` if `self` is composed
    /// entirely of `0xff` bytes (no finite successor exists, so the caller
    /// should treat the range as extending to the unbounded end instead).
    pub fn increment(&self) -> Option<Self> {
        let mut incremented = self.0.clone();
        while let Some(byte) = incremented.last_mut() {
            if *byte < 0xff {
                *byte += 1;
                return Some(Self(incremented));
            }
            incremented.pop();
        }
        None
    }
}

impl From<Vec<u8>> for Key {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<Key> for Vec<u8> {
    fn from(key: Key) -> Self {
        key.0
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl Deref for Key {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl DerefMut for Key {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}
