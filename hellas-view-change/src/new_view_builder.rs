//! Reconciles a quorum of `ViewChange` votes into one `NewView` certificate.
//!
//! Every function here is pure and depends only on the *set* of votes it is
//! given, so the primary and every validating replica compute the same result
//! from the same input regardless of arrival order.

use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet};

use crate::crypto::Digestible;
use crate::error::ViewChangeError;
use crate::quorums::Quorums;
use crate::types::{BatchId, Checkpoint, Identity, NewView, ViewChange, ViewNum};

#[derive(Clone, Copy, Debug)]
pub struct NewViewBuilder {
    quorums: Quorums,
}

impl NewViewBuilder {
    pub fn new(quorums: Quorums) -> Self {
        Self { quorums }
    }

    fn ensure_quorum(&self, received: usize) -> Result<(), ViewChangeError> {
        if self.quorums.strong.is_reached(received) {
            Ok(())
        } else {
            Err(ViewChangeError::InsufficientVotes {
                received,
                required: self.quorums.strong.value(),
            })
        }
    }

    /// Picks the highest checkpoint that a strong quorum both has stabilized
    /// (stable checkpoint at or above it) and holds an identical proof for.
    pub fn calc_checkpoint<V: Borrow<ViewChange>>(
        &self,
        votes: &[V],
    ) -> Result<Checkpoint, ViewChangeError> {
        let votes: Vec<&ViewChange> = votes.iter().map(Borrow::<ViewChange>::borrow).collect();
        self.ensure_quorum(votes.len())?;

        let candidates: BTreeSet<&Checkpoint> =
            votes.iter().flat_map(|vc| vc.checkpoints.iter()).collect();

        candidates
            .into_iter()
            .rev()
            .find(|cp| {
                let stabilized = votes
                    .iter()
                    .filter(|vc| vc.stable_checkpoint >= cp.seq_no_end)
                    .count();
                let proven = votes.iter().filter(|vc| vc.holds_checkpoint(cp)).count();
                self.quorums.strong.is_reached(stabilized) && self.quorums.strong.is_reached(proven)
            })
            .copied()
            .ok_or(ViewChangeError::NoCheckpointQuorum { votes: votes.len() })
    }

    /// Continues the log above `checkpoint` for as long as exactly one batch
    /// per position was preprepared by a weak quorum and prepared by a strong one.
    pub fn calc_batches<V: Borrow<ViewChange>>(
        &self,
        checkpoint: u64,
        votes: &[V],
    ) -> Result<Vec<BatchId>, ViewChangeError> {
        let votes: Vec<&ViewChange> = votes.iter().map(Borrow::<ViewChange>::borrow).collect();
        self.ensure_quorum(votes.len())?;

        let mut batches = Vec::new();
        let mut pp_seq_no = checkpoint + 1;
        while let Some(batch) = self.resolve_batch(pp_seq_no, &votes)? {
            batches.push(batch);
            pp_seq_no += 1;
        }
        Ok(batches)
    }

    fn resolve_batch(
        &self,
        pp_seq_no: u64,
        votes: &[&ViewChange],
    ) -> Result<Option<BatchId>, ViewChangeError> {
        let mut preprepared: BTreeMap<&BatchId, usize> = BTreeMap::new();
        for vc in votes {
            if let Some(batch) = vc.preprepared_at(pp_seq_no) {
                *preprepared.entry(batch).or_default() += 1;
            }
        }

        let mut accepted = preprepared
            .into_iter()
            .filter(|(_, count)| self.quorums.weak.is_reached(*count))
            .map(|(batch, _)| batch)
            .filter(|batch| {
                let prepared = votes.iter().filter(|vc| vc.has_prepared(batch)).count();
                self.quorums.strong.is_reached(prepared)
            });

        match (accepted.next(), accepted.next()) {
            (Some(first), Some(second)) => Err(ViewChangeError::ConflictingBatches {
                pp_seq_no,
                first: *first,
                second: *second,
            }),
            (first, _) => Ok(first.copied()),
        }
    }

    /// Builds the certificate for `view_no` from votes keyed by sender.
    pub fn build<V: Borrow<ViewChange>>(
        &self,
        view_no: ViewNum,
        votes: &BTreeMap<Identity, V>,
    ) -> Result<NewView, ViewChangeError> {
        let list: Vec<&ViewChange> = votes.values().map(Borrow::<ViewChange>::borrow).collect();
        let checkpoint = self.calc_checkpoint(&list)?;
        let batches = self.calc_batches(checkpoint.seq_no_end, &list)?;
        Ok(NewView {
            view_no,
            view_changes: votes
                .iter()
                .map(|(sender, vc)| (*sender, Borrow::<ViewChange>::borrow(vc).digest()))
                .collect(),
            checkpoint,
            batches,
        })
    }

    /// Recomputes `new_view` from the votes it references.
    ///
    /// The caller resolves the references; this only checks that the result
    /// matches what the primary put in the certificate.
    pub fn verify<V: Borrow<ViewChange>>(
        &self,
        new_view: &NewView,
        votes: &BTreeMap<Identity, V>,
    ) -> Result<(), ViewChangeError> {
        let mismatch = |field| ViewChangeError::CertificateMismatch {
            view_no: new_view.view_no,
            field,
        };
        if votes.keys().ne(new_view.view_changes.keys()) {
            return Err(mismatch("vote set"));
        }
        let list: Vec<&ViewChange> = votes.values().map(Borrow::<ViewChange>::borrow).collect();
        let checkpoint = self.calc_checkpoint(&list)?;
        if checkpoint != new_view.checkpoint {
            return Err(mismatch("checkpoint"));
        }
        let batches = self.calc_batches(checkpoint.seq_no_end, &list)?;
        if batches != new_view.batches {
            return Err(mismatch("batches"));
        }
        Ok(())
    }
}
