//! Quorum thresholds for a pool of `n` replicas tolerating `f` Byzantine faults.

use serde::{Deserialize, Serialize};

use crate::error::ViewChangeError;

/// A vote-count threshold.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Quorum(usize);

impl Quorum {
    pub fn new(value: usize) -> Self {
        Quorum(value)
    }

    pub fn value(&self) -> usize {
        self.0
    }

    pub fn is_reached(&self, count: usize) -> bool {
        count >= self.0
    }
}

/// `f = (n - 1) / 3`, `weak = f + 1`, `strong = n - f`.
///
/// A weak quorum always contains an honest replica. Any two strong quorums
/// share at least one honest replica.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Quorums {
    pub n: usize,
    pub f: usize,
    pub weak: Quorum,
    pub strong: Quorum,
}

impl Quorums {
    pub fn new(n: usize) -> Result<Self, ViewChangeError> {
        if n < 1 {
            return Err(ViewChangeError::InvalidConfiguration {
                replicas: n,
                reason: "a pool needs at least one replica",
            });
        }
        let f = (n - 1) / 3;
        let weak = f + 1;
        let strong = n - f;
        if strong <= weak {
            return Err(ViewChangeError::InvalidConfiguration {
                replicas: n,
                reason: "strong quorum does not exceed weak quorum",
            });
        }
        Ok(Self {
            n,
            f,
            weak: Quorum(weak),
            strong: Quorum(strong),
        })
    }
}

