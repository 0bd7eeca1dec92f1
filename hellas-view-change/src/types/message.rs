use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::crypto::{Digest, Digestible, feed_all};
use crate::types::{BatchId, Checkpoint, Identity, ViewNum};

/// A replica's vote to move to `view_no`, carrying its view of the log.
///
/// A vote is built once from the replica's state when it decides to change
/// views and is never modified afterwards. The sender travels beside the
/// message, not inside it.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewChange {
    pub view_no: ViewNum,
    pub stable_checkpoint: u64,
    /// Strictly increasing by `pp_seq_no`; gaps are allowed.
    pub preprepared: Vec<BatchId>,
    pub prepared: BTreeSet<BatchId>,
    /// Checkpoint proofs held by the sender.
    pub checkpoints: BTreeSet<Checkpoint>,
}

impl ViewChange {
    /// The batch this vote preprepared at `pp_seq_no`, if any.
    pub fn preprepared_at(&self, pp_seq_no: u64) -> Option<&BatchId> {
        self.preprepared.iter().find(|b| b.pp_seq_no == pp_seq_no)
    }

    pub fn has_prepared(&self, batch: &BatchId) -> bool {
        self.prepared.contains(batch)
    }

    pub fn holds_checkpoint(&self, checkpoint: &Checkpoint) -> bool {
        self.checkpoints.contains(checkpoint)
    }

    /// Structural checks a vote must pass before it is counted.
    pub fn check_well_formed(&self) -> Result<(), &'static str> {
        if self
            .preprepared
            .windows(2)
            .any(|pair| pair[0].pp_seq_no >= pair[1].pp_seq_no)
        {
            return Err("preprepared is not strictly increasing");
        }
        if !self
            .checkpoints
            .iter()
            .any(|cp| cp.seq_no_end == self.stable_checkpoint)
        {
            return Err("stable checkpoint has no proof");
        }
        Ok(())
    }
}

impl fmt::Debug for ViewChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ViewChange(v{}, stable {}, {} preprepared, {} prepared, {} checkpoints)",
            self.view_no.0,
            self.stable_checkpoint,
            self.preprepared.len(),
            self.prepared.len(),
            self.checkpoints.len()
        )
    }
}

impl Digestible for ViewChange {
    fn feed(&self, hasher: &mut Sha256) {
        hasher.update(b"ViewChange");
        self.view_no.feed(hasher);
        self.stable_checkpoint.feed(hasher);
        feed_all(hasher, self.preprepared.iter());
        feed_all(hasher, self.prepared.iter());
        feed_all(hasher, self.checkpoints.iter());
    }
}

/// The certificate a new primary broadcasts to start its view.
///
/// `view_changes` names the votes it was built from by digest, so every other
/// replica can recompute `checkpoint` and `batches` from the same input.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NewView {
    pub view_no: ViewNum,
    pub view_changes: BTreeMap<Identity, Digest>,
    pub checkpoint: Checkpoint,
    /// Contiguous from `checkpoint.seq_no_end + 1`.
    pub batches: Vec<BatchId>,
}

impl fmt::Debug for NewView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NewView(v{}, {} votes, {:?}, {} batches)",
            self.view_no.0,
            self.view_changes.len(),
            self.checkpoint,
            self.batches.len()
        )
    }
}

impl Digestible for NewView {
    fn feed(&self, hasher: &mut Sha256) {
        hasher.update(b"NewView");
        self.view_no.feed(hasher);
        (self.view_changes.len() as u64).feed(hasher);
        for (sender, digest) in &self.view_changes {
            sender.0.feed(hasher);
            digest.feed(hasher);
        }
        self.checkpoint.feed(hasher);
        feed_all(hasher, self.batches.iter());
    }
}

/// Acknowledges a validated `NewView` by its digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct ViewChangeAck {
    pub view_no: ViewNum,
    pub digest: Digest,
}

/// Messages exchanged by the view-change sub-protocol.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum Message {
    ViewChange(Arc<ViewChange>),
    NewView(Arc<NewView>),
    ViewChangeAck(ViewChangeAck),
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub enum MessageKind {
    ViewChange,
    NewView,
    ViewChangeAck,
}

impl Message {
    pub fn view_no(&self) -> ViewNum {
        match self {
            Message::ViewChange(vc) => vc.view_no,
            Message::NewView(nv) => nv.view_no,
            Message::ViewChangeAck(ack) => ack.view_no,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::ViewChange(_) => MessageKind::ViewChange,
            Message::NewView(_) => MessageKind::NewView,
            Message::ViewChangeAck(_) => MessageKind::ViewChangeAck,
        }
    }
}

/// Local signal that the current primary should be replaced.
///
/// Without a view the replica moves to the view after its current one. An
/// explicit view lets the signal name the view it was raised for, so a replica
/// that has already caught up past it ignores the signal.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct NeedViewChange {
    pub view_no: Option<ViewNum>,
}
