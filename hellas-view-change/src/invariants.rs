use std::fmt;

use crate::types::*;
use crate::view_changer::{Phase, ViewChanger};

/// Represents a violation of an internal state invariant
///
/// This has a nice-ish `Display` impl.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    // Phase consistency
    WaitingFlagMismatch {
        waiting: bool,
        phase: Phase,
    },
    TargetNotAhead {
        target: ViewNum,
        view_no: ViewNum,
    },
    OwnVoteMissing {
        target: ViewNum,
    },

    // Time consistency
    AttemptStartedAfterCurrentTime {
        attempt_started: u64,
        current_time: u64,
    },

    // Replica state
    PrimaryMismatch {
        view_no: ViewNum,
        recorded: Identity,
        expected: Identity,
    },
    PrepreparedNotIncreasing {
        previous: BatchId,
        next: BatchId,
    },
    StableCheckpointUnproven {
        stable_checkpoint: u64,
    },

    // Pruning
    StaleVotesRetained {
        view: ViewNum,
    },
    StaleAcksRetained {
        view: ViewNum,
    },
    StaleNewViewRetained {
        view: ViewNum,
    },
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WaitingFlagMismatch { waiting, phase } => write!(
                f,
                "waiting_for_new_view is {} in phase {:?}",
                waiting, phase
            ),

            Self::TargetNotAhead { target, view_no } => write!(
                f,
                "View change target {} is not above current view {}",
                target.0, view_no.0
            ),

            Self::OwnVoteMissing { target } => {
                write!(f, "Changing to view {} without an own vote", target.0)
            }

            Self::AttemptStartedAfterCurrentTime {
                attempt_started,
                current_time,
            } => write!(
                f,
                "Attempt start time {} is after current time {}",
                attempt_started, current_time
            ),

            Self::PrimaryMismatch {
                view_no,
                recorded,
                expected,
            } => write!(
                f,
                "Primary of view {} recorded as p{}, rotation gives p{}",
                view_no.0, recorded.0, expected.0
            ),

            Self::PrepreparedNotIncreasing { previous, next } => write!(
                f,
                "Preprepared log goes from {:?} to {:?}",
                previous, next
            ),

            Self::StableCheckpointUnproven { stable_checkpoint } => write!(
                f,
                "Stable checkpoint {} has no checkpoint proof",
                stable_checkpoint
            ),

            Self::StaleVotesRetained { view } => {
                write!(f, "Votes for applied view {} were not pruned", view.0)
            }

            Self::StaleAcksRetained { view } => {
                write!(f, "Acks for applied view {} were not pruned", view.0)
            }

            Self::StaleNewViewRetained { view } => {
                write!(f, "NewView for applied view {} was not pruned", view.0)
            }
        }
    }
}

impl ViewChanger {
    /// Checks the replica's internal consistency.
    ///
    /// Debug builds assert this is empty after every event that changed state.
    pub fn check_invariants(&self) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();
        let data = &self.data;

        if data.waiting_for_new_view != (self.phase != Phase::Normal) {
            violations.push(InvariantViolation::WaitingFlagMismatch {
                waiting: data.waiting_for_new_view,
                phase: self.phase,
            });
        }

        if let Some(target) = self.phase.target() {
            if target <= data.view_no {
                violations.push(InvariantViolation::TargetNotAhead {
                    target,
                    view_no: data.view_no,
                });
            }
            if self.votes.get_from(target, &data.name).is_none() {
                violations.push(InvariantViolation::OwnVoteMissing { target });
            }
        }

        if self.attempt_started > self.current_time {
            violations.push(InvariantViolation::AttemptStartedAfterCurrentTime {
                attempt_started: self.attempt_started,
                current_time: self.current_time,
            });
        }

        let expected = data.primary_for(data.view_no);
        if data.primary_name != expected {
            violations.push(InvariantViolation::PrimaryMismatch {
                view_no: data.view_no,
                recorded: data.primary_name,
                expected,
            });
        }

        for pair in data.preprepared.windows(2) {
            if pair[0].pp_seq_no >= pair[1].pp_seq_no {
                violations.push(InvariantViolation::PrepreparedNotIncreasing {
                    previous: pair[0],
                    next: pair[1],
                });
            }
        }

        if !data
            .checkpoints
            .iter()
            .any(|cp| cp.seq_no_end == data.stable_checkpoint)
        {
            violations.push(InvariantViolation::StableCheckpointUnproven {
                stable_checkpoint: data.stable_checkpoint,
            });
        }

        for view in self.votes.views().filter(|v| *v <= data.view_no) {
            violations.push(InvariantViolation::StaleVotesRetained { view });
        }
        for view in self.acks.views().filter(|v| *v <= data.view_no) {
            violations.push(InvariantViolation::StaleAcksRetained { view });
        }
        for view in self.new_views.keys().filter(|v| **v <= data.view_no) {
            violations.push(InvariantViolation::StaleNewViewRetained { view: *view });
        }

        violations
    }
}
