use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{Identity, ViewNum};

/// Tracks one entry per sender per view.
///
/// Used for both view change votes and acks. Entries for a view are only ever
/// added until the view is pruned, and the first entry from a sender wins.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteTrack<T> {
    pub votes: BTreeMap<ViewNum, BTreeMap<Identity, T>>,
}

/// Error when a sender already has an entry for the view
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Duplicate {
    /// The same entry was delivered again.
    Same,
    /// The sender produced two different entries for one view.
    Conflicting,
}

impl<T> Default for VoteTrack<T> {
    fn default() -> Self {
        Self {
            votes: BTreeMap::new(),
        }
    }
}

impl<T: PartialEq> VoteTrack<T> {
    /// Records an entry and returns how many senders have one for this view.
    pub fn record(&mut self, view: ViewNum, sender: Identity, entry: T) -> Result<usize, Duplicate> {
        let votes_now = self.votes.entry(view).or_default();
        if let Some(existing) = votes_now.get(&sender) {
            return Err(if *existing == entry {
                Duplicate::Same
            } else {
                Duplicate::Conflicting
            });
        }
        votes_now.insert(sender, entry);
        Ok(votes_now.len())
    }

    pub fn get(&self, view: ViewNum) -> Option<&BTreeMap<Identity, T>> {
        self.votes.get(&view)
    }

    pub fn get_from(&self, view: ViewNum, sender: &Identity) -> Option<&T> {
        self.votes.get(&view).and_then(|votes| votes.get(sender))
    }

    pub fn count(&self, view: ViewNum) -> usize {
        self.votes.get(&view).map_or(0, BTreeMap::len)
    }

    /// Number of senders whose entry for `view` equals `entry`.
    pub fn matching(&self, view: ViewNum, entry: &T) -> usize {
        self.votes
            .get(&view)
            .map_or(0, |votes| votes.values().filter(|e| *e == entry).count())
    }

    /// Drops every view at or below `view`.
    pub fn prune_up_to(&mut self, view: ViewNum) {
        self.votes = self.votes.split_off(&view.incr());
    }

    pub fn views(&self) -> impl Iterator<Item = ViewNum> + '_ {
        self.votes.keys().copied()
    }
}
