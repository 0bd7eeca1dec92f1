use std::fmt;

use crate::types::{BatchId, Identity, ViewNum};

/// Errors raised by quorum arithmetic, the new-view builder and the view changer.
///
/// Message handlers never hand these back to the driver. They log them through
/// `tracing_setup::protocol_error` and report the message as not useful.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewChangeError {
    /// The pool cannot tolerate any fault with these numbers.
    InvalidConfiguration {
        replicas: usize,
        reason: &'static str,
    },
    InsufficientVotes {
        received: usize,
        required: usize,
    },
    NoCheckpointQuorum {
        votes: usize,
    },
    /// Two different batches both passed the quorum rules at one position.
    ConflictingBatches {
        pp_seq_no: u64,
        first: BatchId,
        second: BatchId,
    },
    CertificateMismatch {
        view_no: ViewNum,
        field: &'static str,
    },
    NotPrimary {
        view_no: ViewNum,
        sender: Identity,
        primary: Identity,
    },
    MalformedVote {
        sender: Identity,
        reason: &'static str,
    },
    StaleView {
        view_no: ViewNum,
        current: ViewNum,
    },
    /// Too far ahead of this replica to be worth holding.
    BeyondHorizon {
        view_no: ViewNum,
        horizon: ViewNum,
    },
}

impl fmt::Display for ViewChangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfiguration { replicas, reason } => {
                write!(f, "Invalid pool of {} replicas: {}", replicas, reason)
            }

            Self::InsufficientVotes { received, required } => write!(
                f,
                "Got {} view change votes, need at least {}",
                received, required
            ),

            Self::NoCheckpointQuorum { votes } => write!(
                f,
                "No checkpoint is stable and proven by a quorum of {} votes",
                votes
            ),

            Self::ConflictingBatches {
                pp_seq_no,
                first,
                second,
            } => write!(
                f,
                "Conflicting batches at pp_seq_no {}: {:?} and {:?}",
                pp_seq_no, first, second
            ),

            Self::CertificateMismatch { view_no, field } => write!(
                f,
                "NewView for view {} does not match recomputed {}",
                view_no.0, field
            ),

            Self::NotPrimary {
                view_no,
                sender,
                primary,
            } => write!(
                f,
                "NewView for view {} sent by p{}, primary is p{}",
                view_no.0, sender.0, primary.0
            ),

            Self::MalformedVote { sender, reason } => {
                write!(f, "Malformed view change from p{}: {}", sender.0, reason)
            }

            Self::StaleView { view_no, current } => write!(
                f,
                "Message for view {} is stale, current view is {}",
                view_no.0, current.0
            ),

            Self::BeyondHorizon { view_no, horizon } => write!(
                f,
                "Message for view {} is beyond the accepted horizon {}",
                view_no.0, horizon.0
            ),
        }
    }
}

impl std::error::Error for ViewChangeError {}
