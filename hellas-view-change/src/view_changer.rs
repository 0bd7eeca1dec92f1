use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::ViewChangeConfig;
use crate::crypto::{Digest, Digestible};
use crate::error::ViewChangeError;
use crate::format::{format_message, format_new_view};
use crate::new_view_builder::NewViewBuilder;
use crate::replica_state::{OrderingSnapshot, ReplicaViewState};
use crate::tracing_setup;
use crate::types::*;
use crate::voting::{Duplicate, VoteTrack};

/// Where a replica is in the view change cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Ordering runs in `view_no`.
    Normal,
    /// Own vote sent, collecting votes for `target`.
    ViewChanging { target: ViewNum },
    /// A strong quorum voted for `target`; waiting for its certificate to finalize.
    WaitingNewView { target: ViewNum },
}

impl Phase {
    pub fn target(&self) -> Option<ViewNum> {
        match self {
            Phase::Normal => None,
            Phase::ViewChanging { target } | Phase::WaitingNewView { target } => Some(*target),
        }
    }
}

/// A certificate received (or built) for a view above ours.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PendingNewView {
    pub new_view: Arc<NewView>,
    pub digest: Digest,
    /// Recomputed from the referenced votes and found equal.
    pub validated: bool,
}

/// The per-replica view change state machine.
///
/// Driven entirely by the caller: messages go in through `process_message`,
/// local suspicion through `process_need_view_change`, and time through
/// `set_now` plus `check_timeouts`. Everything it wants to send is pushed onto
/// the caller's outbox, with `None` as destination meaning broadcast.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ViewChanger {
    pub(crate) data: ReplicaViewState,
    pub(crate) config: ViewChangeConfig,
    pub(crate) phase: Phase,

    /// View change votes per target view, own vote included.
    pub(crate) votes: VoteTrack<Arc<ViewChange>>,
    /// NewView digests acknowledged per view, own ack included.
    pub(crate) acks: VoteTrack<Digest>,
    pub(crate) new_views: BTreeMap<ViewNum, PendingNewView>,

    pub(crate) current_time: u64,
    /// When the current phase was entered. Each phase gets the full timeout.
    pub(crate) attempt_started: u64,
    /// Attempts abandoned by timeout since the last completed view change.
    pub(crate) escalations: u32,
}

impl ViewChanger {
    pub fn new(
        name: Identity,
        validators: Vec<Identity>,
        config: ViewChangeConfig,
    ) -> Result<Self, ViewChangeError> {
        let data = ReplicaViewState::new(name, validators)?;
        Ok(Self::with_state(data, config))
    }

    pub fn with_state(data: ReplicaViewState, config: ViewChangeConfig) -> Self {
        tracing_setup::register_replica(&data.name, data.quorums.n, data.quorums.f);
        Self {
            data,
            config,
            phase: Phase::Normal,
            votes: VoteTrack::default(),
            acks: VoteTrack::default(),
            new_views: BTreeMap::new(),
            current_time: 0,
            attempt_started: 0,
            escalations: 0,
        }
    }

    pub fn name(&self) -> Identity {
        self.data.name
    }

    pub fn state(&self) -> &ReplicaViewState {
        &self.data
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn escalations(&self) -> u32 {
        self.escalations
    }

    /// Votes held for `view`, keyed by sender.
    pub fn votes_for(&self, view: ViewNum) -> Option<&BTreeMap<Identity, Arc<ViewChange>>> {
        self.votes.get(view)
    }

    pub fn pending_new_view(&self, view: ViewNum) -> Option<&PendingNewView> {
        self.new_views.get(&view)
    }

    /// Number of acks for `view` that match `digest`.
    pub fn acks_for(&self, view: ViewNum, digest: &Digest) -> usize {
        self.acks.matching(view, digest)
    }

    /// Read-only view for the ordering component, `None` while a view change runs.
    pub fn ordering_snapshot(&self) -> Option<OrderingSnapshot> {
        self.data.snapshot()
    }

    /// Write access to the ordering log, refused while a view change runs.
    pub fn replica_state_mut(&mut self) -> Option<&mut ReplicaViewState> {
        if self.data.waiting_for_new_view {
            None
        } else {
            Some(&mut self.data)
        }
    }

    /// Replaces the membership and recomputes the quorums.
    pub fn set_validators(&mut self, validators: Vec<Identity>) -> Result<(), ViewChangeError> {
        self.data.set_validators(validators)?;
        tracing_setup::register_replica(&self.data.name, self.data.quorums.n, self.data.quorums.f);
        Ok(())
    }

    pub fn set_now(&mut self, now: u64) {
        self.current_time = now;
    }

    /// Timeout of the current attempt, with exponential backoff.
    pub fn current_timeout(&self) -> u64 {
        self.config.backoff_timeout(self.escalations)
    }

    /// When `check_timeouts` next has something to do.
    pub fn next_deadline(&self) -> Option<u64> {
        self.phase
            .target()
            .map(|_| self.attempt_started.saturating_add(self.current_timeout()))
    }

    /// Highest view a message may carry and still be held.
    ///
    /// Anything above it could only come from a faulty sender or a replica far
    /// ahead, and holding it would let one sender grow the tables without bound.
    pub fn view_horizon(&self) -> ViewNum {
        let base = self.phase.target().map_or(self.data.view_no, |t| t.max(self.data.view_no));
        ViewNum(base.0.saturating_add(self.config.max_view_lookahead))
    }

    pub fn check_timeouts(&mut self, to_send: &mut Vec<(Message, Option<Identity>)>) {
        let Some(target) = self.phase.target() else {
            return;
        };
        if self.current_time.saturating_sub(self.attempt_started) < self.current_timeout() {
            return;
        }
        self.escalations += 1;
        tracing_setup::protocol_transition(
            &self.data.name,
            "view_change_timeout",
            target,
            target.incr(),
            Some("no finalized NewView in time"),
        );
        self.start_view_change(target.incr(), to_send);
        self.assert_invariants();
    }

    /// Handles local suspicion of the primary.
    ///
    /// Returns false if the signal had no effect.
    pub fn process_need_view_change(
        &mut self,
        need: NeedViewChange,
        to_send: &mut Vec<(Message, Option<Identity>)>,
    ) -> bool {
        let current_target = self.phase.target();
        let target = match (need.view_no, current_target) {
            (Some(view), _) => view,
            (None, Some(_)) => {
                tracing::debug!(target: "need_view_change", "already changing views");
                return false;
            }
            (None, None) => self.data.view_no.incr(),
        };
        if target <= self.data.view_no || current_target.is_some_and(|t| target <= t) {
            tracing::debug!(
                target: "need_view_change",
                requested = ?target,
                view_no = ?self.data.view_no,
                current_target = ?current_target,
                "ignoring view change request"
            );
            return false;
        }
        self.start_view_change(target, to_send);
        self.assert_invariants();
        true
    }

    /// Processes a message from `sender`.
    ///
    /// Returns false if the message was rejected or carried nothing new.
    #[tracing::instrument(skip(self, message, to_send), fields(replica = ?self.data.name))]
    pub fn process_message(
        &mut self,
        message: Message,
        sender: Identity,
        to_send: &mut Vec<(Message, Option<Identity>)>,
    ) -> bool {
        tracing::debug!(message = format_message(&message, false), "received a message");

        let view_no = message.view_no();
        if view_no <= self.data.view_no {
            let stale = ViewChangeError::StaleView {
                view_no,
                current: self.data.view_no,
            };
            tracing::debug!(target: "stale_message", %stale);
            return false;
        }
        let horizon = self.view_horizon();
        if view_no > horizon {
            let err = ViewChangeError::BeyondHorizon { view_no, horizon };
            tracing_setup::protocol_error(&self.data.name, "beyond_horizon", (sender, err));
            return false;
        }
        if !self.data.is_validator(&sender) {
            tracing_setup::protocol_error(&self.data.name, "unknown_sender", sender);
            return false;
        }

        let result = match message {
            Message::ViewChange(vc) => self.handle_view_change(vc, sender, to_send),
            Message::NewView(nv) => self.handle_new_view(nv, sender, to_send),
            Message::ViewChangeAck(ack) => self.handle_ack(ack, sender, to_send),
        };

        if result {
            self.assert_invariants();
        }
        result
    }

    fn handle_view_change(
        &mut self,
        vc: Arc<ViewChange>,
        sender: Identity,
        to_send: &mut Vec<(Message, Option<Identity>)>,
    ) -> bool {
        if let Err(reason) = vc.check_well_formed() {
            let err = ViewChangeError::MalformedVote { sender, reason };
            tracing_setup::protocol_error(&self.data.name, "malformed_vote", err);
            return false;
        }
        match self.votes.record(vc.view_no, sender, vc.clone()) {
            Ok(count) => {
                tracing::debug!(target: "record_vote", view = ?vc.view_no, sender = ?sender, count);
            }
            Err(Duplicate::Same) => return false,
            Err(Duplicate::Conflicting) => {
                tracing_setup::protocol_error(
                    &self.data.name,
                    "equivocating_vote",
                    (sender, vc.view_no),
                );
                return false;
            }
        }
        self.try_progress(to_send);
        true
    }

    fn handle_new_view(
        &mut self,
        nv: Arc<NewView>,
        sender: Identity,
        to_send: &mut Vec<(Message, Option<Identity>)>,
    ) -> bool {
        let primary = self.data.primary_for(nv.view_no);
        if sender != primary {
            let err = ViewChangeError::NotPrimary {
                view_no: nv.view_no,
                sender,
                primary,
            };
            tracing_setup::protocol_error(&self.data.name, "not_primary", err);
            return false;
        }
        if !self.data.quorums.strong.is_reached(nv.view_changes.len()) {
            let err = ViewChangeError::InsufficientVotes {
                received: nv.view_changes.len(),
                required: self.data.quorums.strong.value(),
            };
            tracing_setup::protocol_error(&self.data.name, "new_view_quorum", err);
            return false;
        }
        if self.new_views.contains_key(&nv.view_no) {
            tracing::debug!(target: "new_view", view = ?nv.view_no, "already holding a NewView");
            return false;
        }
        let digest = nv.digest();
        self.new_views.insert(
            nv.view_no,
            PendingNewView {
                new_view: nv,
                digest,
                validated: false,
            },
        );
        self.try_progress(to_send);
        true
    }

    fn handle_ack(
        &mut self,
        ack: ViewChangeAck,
        sender: Identity,
        to_send: &mut Vec<(Message, Option<Identity>)>,
    ) -> bool {
        match self.acks.record(ack.view_no, sender, ack.digest) {
            Ok(_) => {}
            Err(Duplicate::Same) => return false,
            Err(Duplicate::Conflicting) => {
                tracing_setup::protocol_error(
                    &self.data.name,
                    "equivocating_ack",
                    (sender, ack.view_no),
                );
                return false;
            }
        }
        self.try_progress(to_send);
        true
    }

    /// Enters (or re-enters with a higher target) the view change phase.
    fn start_view_change(&mut self, target: ViewNum, to_send: &mut Vec<(Message, Option<Identity>)>) {
        tracing_setup::protocol_transition(
            &self.data.name,
            "view_change_started",
            self.phase,
            Phase::ViewChanging { target },
            None,
        );
        self.phase = Phase::ViewChanging { target };
        self.data.waiting_for_new_view = true;
        self.attempt_started = self.current_time;

        // a vote is immutable once made; an earlier attempt at this view resends it
        let existing = self.votes.get_from(target, &self.data.name).cloned();
        let vote = match existing {
            Some(vote) => vote,
            None => {
                let vote = Arc::new(self.data.view_change_vote(target));
                if self.votes.record(target, self.data.name, vote.clone()).is_err() {
                    tracing_setup::protocol_error(&self.data.name, "own_vote_rejected", target);
                }
                vote
            }
        };
        self.send_msg(to_send, Message::ViewChange(vote), None);
        self.try_progress(to_send);
    }

    /// Advances as far as the messages held allow.
    fn try_progress(&mut self, to_send: &mut Vec<(Message, Option<Identity>)>) {
        if let Phase::ViewChanging { target } = self.phase {
            if self.data.quorums.strong.is_reached(self.votes.count(target)) {
                tracing_setup::protocol_transition(
                    &self.data.name,
                    "view_change_quorum",
                    self.phase,
                    Phase::WaitingNewView { target },
                    None,
                );
                self.phase = Phase::WaitingNewView { target };
                self.attempt_started = self.current_time;
            }
        }

        if let Phase::WaitingNewView { target } = self.phase {
            if self.data.is_primary_for(target) && !self.new_views.contains_key(&target) {
                self.try_build_new_view(target, to_send);
            }
        }

        let unvalidated: Vec<ViewNum> = self
            .new_views
            .iter()
            .filter(|(_, pending)| !pending.validated)
            .map(|(view, _)| *view)
            .collect();
        for view in unvalidated {
            self.try_validate(view, to_send);
        }

        self.try_finish();
    }

    fn try_build_new_view(&mut self, target: ViewNum, to_send: &mut Vec<(Message, Option<Identity>)>) {
        let Some(votes) = self.votes.get(target) else {
            return;
        };
        let built = NewViewBuilder::new(self.data.quorums).build(target, votes);
        match built {
            Ok(nv) => {
                tracing_setup::new_view_built(&self.data.name, format_new_view(&nv, false));
                let nv = Arc::new(nv);
                let digest = nv.digest();
                self.new_views.insert(
                    target,
                    PendingNewView {
                        new_view: nv.clone(),
                        digest,
                        validated: true,
                    },
                );
                self.send_msg(to_send, Message::NewView(nv), None);
                self.acknowledge(target, digest, to_send);
            }
            // more votes may still fix this, so the next one retries
            Err(err) => {
                tracing::warn!(target: "new_view_builder", view = ?target, %err, "cannot build NewView yet");
            }
        }
    }

    /// Recomputes a held certificate once every vote it references is here.
    fn try_validate(&mut self, view: ViewNum, to_send: &mut Vec<(Message, Option<Identity>)>) {
        let Some(pending) = self.new_views.get(&view) else {
            return;
        };
        let new_view = pending.new_view.clone();
        let digest = pending.digest;

        let mut referenced: BTreeMap<Identity, Arc<ViewChange>> = BTreeMap::new();
        for (sender, vote_digest) in &new_view.view_changes {
            match self.votes.get_from(view, sender) {
                Some(vc) if vc.digest() == *vote_digest => {
                    referenced.insert(*sender, vc.clone());
                }
                Some(_) => {
                    // we hold another vote from this sender; it equivocated
                    tracing::warn!(target: "new_view", view = ?view, sender = ?sender, "referenced vote differs from the one held");
                    return;
                }
                None => return,
            }
        }

        match NewViewBuilder::new(self.data.quorums).verify(&new_view, &referenced) {
            Ok(()) => {
                if let Some(pending) = self.new_views.get_mut(&view) {
                    pending.validated = true;
                }
                tracing::debug!(target: "new_view", view = ?view, "NewView validated");
                self.acknowledge(view, digest, to_send);
            }
            Err(err) => {
                tracing_setup::protocol_error(&self.data.name, "certificate_rejected", err);
                self.new_views.remove(&view);
            }
        }
    }

    fn acknowledge(&mut self, view: ViewNum, digest: Digest, to_send: &mut Vec<(Message, Option<Identity>)>) {
        if self.acks.record(view, self.data.name, digest).is_ok() {
            self.send_msg(
                to_send,
                Message::ViewChangeAck(ViewChangeAck {
                    view_no: view,
                    digest,
                }),
                None,
            );
        }
    }

    /// Applies the highest certificate that is validated and acknowledged by a strong quorum.
    fn try_finish(&mut self) {
        let strong = self.data.quorums.strong;
        let ready = self
            .new_views
            .iter()
            .rev()
            .find(|(view, pending)| {
                pending.validated && strong.is_reached(self.acks.matching(**view, &pending.digest))
            })
            .map(|(view, _)| *view);
        if let Some(view) = ready {
            self.apply_new_view(view);
        }
    }

    fn apply_new_view(&mut self, view: ViewNum) {
        let Some(pending) = self.new_views.remove(&view) else {
            return;
        };
        let from = self.data.view_no;
        self.data.apply_new_view(&pending.new_view);
        self.phase = Phase::Normal;
        self.escalations = 0;

        self.votes.prune_up_to(view);
        self.acks.prune_up_to(view);
        self.new_views = self.new_views.split_off(&view.incr());

        tracing_setup::protocol_transition(&self.data.name, "view_change_completed", from, view, None);
        tracing_setup::view_change_completed(
            &self.data.name,
            view,
            self.data.stable_checkpoint,
            self.data.preprepared.len(),
        );
    }

    fn send_msg(
        &mut self,
        to_send: &mut Vec<(Message, Option<Identity>)>,
        message: Message,
        target: Option<Identity>,
    ) {
        tracing_setup::message_sent(
            &self.data.name,
            target.as_ref(),
            &format!("{:?}", message.kind()),
            format_message(&message, false),
        );
        to_send.push((message, target));
    }

    fn assert_invariants(&self) {
        if cfg!(debug_assertions) {
            let violations = self.check_invariants();
            assert!(
                violations.is_empty(),
                "Replica {:?} has invariant violations: {:?}",
                self.data.name,
                violations
            );
        }
    }
}
