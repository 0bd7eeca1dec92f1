use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;

/// A SHA-256 digest of a protocol object or of a batch's contents.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    pub const ZERO: Digest = Digest([0; 32]);

    /// First four bytes in hex, enough to tell digests apart in logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.short())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Values with a canonical digest.
///
/// Implementors feed their fields into the hasher in a fixed order, so two
/// structurally equal values always hash the same regardless of how they were
/// built. Collections are length-prefixed.
pub trait Digestible {
    fn feed(&self, hasher: &mut Sha256);

    fn digest(&self) -> Digest {
        let mut hasher = Sha256::new();
        self.feed(&mut hasher);
        Digest(hasher.finalize().into())
    }
}

impl Digestible for u64 {
    fn feed(&self, hasher: &mut Sha256) {
        hasher.update(self.to_le_bytes());
    }
}

impl Digestible for Digest {
    fn feed(&self, hasher: &mut Sha256) {
        hasher.update(self.0);
    }
}

/// Feeds a length prefix followed by every item.
pub(crate) fn feed_all<'a, T, I>(hasher: &mut Sha256, items: I)
where
    T: Digestible + 'a,
    I: ExactSizeIterator<Item = &'a T>,
{
    (items.len() as u64).feed(hasher);
    for item in items {
        item.feed(hasher);
    }
}
