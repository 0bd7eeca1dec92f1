use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::ViewChangeError;
use crate::quorums::Quorums;
use crate::types::{BatchId, Checkpoint, Identity, NewView, ViewChange, ViewNum};

/// The view-related state of one replica.
///
/// Owned by the `ViewChanger`. The ordering component reads it through
/// `OrderingSnapshot` and only writes the log while no view change is running.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicaViewState {
    pub name: Identity,
    /// Ordered membership; the primary of view `v` is `validators[v % n]`.
    pub validators: Vec<Identity>,
    pub quorums: Quorums,

    pub view_no: ViewNum,
    pub primary_name: Identity,
    pub waiting_for_new_view: bool,

    pub stable_checkpoint: u64,
    pub checkpoints: BTreeSet<Checkpoint>,
    pub preprepared: Vec<BatchId>,
    pub prepared: BTreeSet<BatchId>,
}

/// What the ordering component may see of the replica.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderingSnapshot {
    pub view_no: ViewNum,
    pub primary_name: Identity,
    pub stable_checkpoint: u64,
    pub preprepared: Vec<BatchId>,
}

fn check_membership(name: &Identity, validators: &[Identity]) -> Result<Quorums, ViewChangeError> {
    let quorums = Quorums::new(validators.len())?;
    let distinct: BTreeSet<&Identity> = validators.iter().collect();
    if distinct.len() != validators.len() {
        return Err(ViewChangeError::InvalidConfiguration {
            replicas: validators.len(),
            reason: "validators must be distinct",
        });
    }
    if !distinct.contains(name) {
        return Err(ViewChangeError::InvalidConfiguration {
            replicas: validators.len(),
            reason: "replica is not a member of the pool",
        });
    }
    Ok(quorums)
}

impl ReplicaViewState {
    pub fn new(name: Identity, validators: Vec<Identity>) -> Result<Self, ViewChangeError> {
        let quorums = check_membership(&name, &validators)?;
        let mut state = Self {
            name,
            primary_name: name,
            validators,
            quorums,
            view_no: ViewNum(0),
            waiting_for_new_view: false,
            stable_checkpoint: 0,
            checkpoints: BTreeSet::from([Checkpoint::genesis()]),
            preprepared: Vec::new(),
            prepared: BTreeSet::new(),
        };
        state.primary_name = state.primary_for(state.view_no);
        Ok(state)
    }

    /// Round-robin primary selection.
    pub fn primary_for(&self, view: ViewNum) -> Identity {
        self.validators[(view.0 % self.validators.len() as u64) as usize]
    }

    pub fn is_primary_for(&self, view: ViewNum) -> bool {
        self.primary_for(view) == self.name
    }

    pub fn is_validator(&self, id: &Identity) -> bool {
        self.validators.contains(id)
    }

    pub fn set_validators(&mut self, validators: Vec<Identity>) -> Result<(), ViewChangeError> {
        self.quorums = check_membership(&self.name, &validators)?;
        self.validators = validators;
        self.primary_name = self.primary_for(self.view_no);
        Ok(())
    }

    /// Replaces the ordering log, as the ordering component does between view changes.
    pub fn load_log(
        &mut self,
        stable_checkpoint: u64,
        checkpoints: BTreeSet<Checkpoint>,
        preprepared: Vec<BatchId>,
        prepared: BTreeSet<BatchId>,
    ) {
        self.stable_checkpoint = stable_checkpoint;
        self.checkpoints = checkpoints;
        self.preprepared = preprepared;
        self.prepared = prepared;
    }

    pub fn snapshot(&self) -> Option<OrderingSnapshot> {
        if self.waiting_for_new_view {
            return None;
        }
        Some(OrderingSnapshot {
            view_no: self.view_no,
            primary_name: self.primary_name,
            stable_checkpoint: self.stable_checkpoint,
            preprepared: self.preprepared.clone(),
        })
    }

    /// This replica's vote for moving to `view_no`.
    pub fn view_change_vote(&self, view_no: ViewNum) -> ViewChange {
        ViewChange {
            view_no,
            stable_checkpoint: self.stable_checkpoint,
            preprepared: self.preprepared.clone(),
            prepared: self.prepared.clone(),
            checkpoints: self.checkpoints.clone(),
        }
    }

    /// Adopts a finalized certificate.
    pub(crate) fn apply_new_view(&mut self, new_view: &NewView) {
        let checkpoint = new_view.checkpoint;
        self.stable_checkpoint = checkpoint.seq_no_end;
        self.checkpoints
            .retain(|cp| cp.seq_no_end > checkpoint.seq_no_end);
        self.checkpoints.insert(checkpoint);
        self.preprepared = new_view.batches.clone();
        self.prepared = new_view.batches.iter().copied().collect();
        self.view_no = new_view.view_no;
        self.primary_name = self.primary_for(new_view.view_no);
        self.waiting_for_new_view = false;
    }
}
