use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;

use crate::crypto::{Digest, Digestible};

/// A unique identifier for a replica
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct Identity(pub u64);

/// A view number. View 0 is the initial view.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize,
)]
pub struct ViewNum(pub u64);

impl ViewNum {
    pub fn incr(self) -> ViewNum {
        ViewNum(self.0 + 1)
    }
}

impl Digestible for ViewNum {
    fn feed(&self, hasher: &mut Sha256) {
        self.0.feed(hasher);
    }
}

/// Identifies a proposed batch of requests.
///
/// Within a view `pp_seq_no` only grows. Two ids with the same `pp_seq_no` and
/// different digests can never both gather a prepared quorum, which is what the
/// new-view builder checks for.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BatchId {
    pub view_no: ViewNum,
    pub pp_seq_no: u64,
    pub digest: Digest,
}

impl BatchId {
    pub fn new(view_no: ViewNum, pp_seq_no: u64, digest: Digest) -> Self {
        Self {
            view_no,
            pp_seq_no,
            digest,
        }
    }
}

impl fmt::Debug for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Batch(v{}, {}, {:?})",
            self.view_no.0, self.pp_seq_no, self.digest
        )
    }
}

impl Digestible for BatchId {
    fn feed(&self, hasher: &mut Sha256) {
        self.view_no.feed(hasher);
        self.pp_seq_no.feed(hasher);
        self.digest.feed(hasher);
    }
}

/// Evidence that the log up to `seq_no_end` has the given state digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Checkpoint {
    pub seq_no_end: u64,
    pub digest: Digest,
}

impl Checkpoint {
    pub fn new(seq_no_end: u64, digest: Digest) -> Self {
        Self { seq_no_end, digest }
    }

    /// The checkpoint every replica starts from.
    pub fn genesis() -> Self {
        Self::new(0, Digest::ZERO)
    }
}

impl fmt::Debug for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checkpoint({}, {:?})", self.seq_no_end, self.digest)
    }
}

impl Digestible for Checkpoint {
    fn feed(&self, hasher: &mut Sha256) {
        self.seq_no_end.feed(hasher);
        self.digest.feed(hasher);
    }
}
