use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use hellas_view_change::{
    BatchId, Checkpoint, Digest, Digestible, Identity, InvariantViolation, Message, NeedViewChange,
    NewView, NewViewBuilder, Phase, Quorums, ReplicaViewState, ViewChange, ViewChangeAck,
    ViewChangeConfig, ViewChangeError, ViewChanger, ViewNum,
};

fn validators(n: u64) -> Vec<Identity> {
    (1..=n).map(Identity).collect()
}

fn log(len: u64) -> Vec<BatchId> {
    (1..=len)
        .map(|n| BatchId::new(ViewNum(0), n, Digest([n as u8; 32])))
        .collect()
}

fn load(state: &mut ReplicaViewState, batches: &[BatchId]) {
    state.load_log(
        0,
        BTreeSet::from([Checkpoint::genesis()]),
        batches.to_vec(),
        batches.iter().copied().collect(),
    );
}

fn changer(id: u64, n: u64) -> ViewChanger {
    ViewChanger::new(Identity(id), validators(n), ViewChangeConfig::default()).unwrap()
}

/// A vote for `view` from replica `id` holding `batches`.
fn vote_from(id: u64, n: u64, view: ViewNum, batches: &[BatchId]) -> Arc<ViewChange> {
    let mut state = ReplicaViewState::new(Identity(id), validators(n)).unwrap();
    load(&mut state, batches);
    Arc::new(state.view_change_vote(view))
}

fn trigger(node: &mut ViewChanger) -> Vec<(Message, Option<Identity>)> {
    let mut to_send = Vec::new();
    node.process_need_view_change(NeedViewChange::default(), &mut to_send);
    to_send
}

fn acks_in(to_send: &[(Message, Option<Identity>)]) -> Vec<ViewChangeAck> {
    to_send
        .iter()
        .filter_map(|(m, _)| match m {
            Message::ViewChangeAck(ack) => Some(*ack),
            _ => None,
        })
        .collect()
}

/// Replicas connected by an instant, in-order network.
struct Cluster {
    nodes: BTreeMap<Identity, ViewChanger>,
    pending: VecDeque<(Identity, Message, Option<Identity>)>,
}

impl Cluster {
    fn new(n: u64, batches: &[BatchId]) -> Self {
        let nodes = (1..=n)
            .map(|id| {
                let mut node = changer(id, n);
                load(node.replica_state_mut().unwrap(), batches);
                (Identity(id), node)
            })
            .collect();
        Cluster {
            nodes,
            pending: VecDeque::new(),
        }
    }

    fn node(&self, id: u64) -> &ViewChanger {
        self.nodes.get(&Identity(id)).unwrap()
    }

    fn trigger(&mut self, id: u64) -> bool {
        let mut to_send = Vec::new();
        let node = self.nodes.get_mut(&Identity(id)).unwrap();
        let accepted = node.process_need_view_change(NeedViewChange::default(), &mut to_send);
        self.pending
            .extend(to_send.into_iter().map(|(m, d)| (Identity(id), m, d)));
        accepted
    }

    fn deliver_all(&mut self) {
        while let Some((from, message, dest)) = self.pending.pop_front() {
            for (id, node) in self.nodes.iter_mut() {
                if *id == from || dest.is_some_and(|d| d != *id) {
                    continue;
                }
                let mut to_send = Vec::new();
                node.process_message(message.clone(), from, &mut to_send);
                self.pending
                    .extend(to_send.into_iter().map(|(m, d)| (*id, m, d)));
            }
        }
    }
}

#[test_log::test]
fn test_trigger_broadcasts_vote_and_blocks_ordering() {
    let mut node = changer(1, 4);
    assert!(node.ordering_snapshot().is_some());

    let to_send = trigger(&mut node);
    assert_eq!(to_send.len(), 1);
    match &to_send[0] {
        (Message::ViewChange(vc), None) => assert_eq!(vc.view_no, ViewNum(1)),
        other => panic!("expected a broadcast ViewChange, got {:?}", other),
    }

    assert_eq!(node.phase(), Phase::ViewChanging { target: ViewNum(1) });
    assert!(node.state().waiting_for_new_view);
    assert!(node.ordering_snapshot().is_none());
    assert!(node.replica_state_mut().is_none());
    assert!(node.votes_for(ViewNum(1)).unwrap().contains_key(&Identity(1)));
}

#[test_log::test]
fn test_trigger_is_idempotent_while_changing() {
    let mut node = changer(1, 4);
    assert_eq!(trigger(&mut node).len(), 1);
    assert!(trigger(&mut node).is_empty());

    let mut to_send = Vec::new();
    let same = NeedViewChange {
        view_no: Some(ViewNum(1)),
    };
    assert!(!node.process_need_view_change(same, &mut to_send));
    assert!(to_send.is_empty());

    let higher = NeedViewChange {
        view_no: Some(ViewNum(3)),
    };
    assert!(node.process_need_view_change(higher, &mut to_send));
    assert_eq!(node.phase(), Phase::ViewChanging { target: ViewNum(3) });
    assert_eq!(to_send.len(), 1);
}

#[test_log::test]
fn test_trigger_for_past_view_is_ignored() {
    let mut node = changer(1, 4);
    let mut to_send = Vec::new();
    let stale = NeedViewChange {
        view_no: Some(ViewNum(0)),
    };
    assert!(!node.process_need_view_change(stale, &mut to_send));
    assert!(to_send.is_empty());
    assert_eq!(node.phase(), Phase::Normal);
}

#[test_log::test]
fn test_stale_messages_are_discarded() {
    let mut node = changer(1, 4);
    let mut to_send = Vec::new();
    let stale = vote_from(2, 4, ViewNum(0), &[]);
    assert!(!node.process_message(Message::ViewChange(stale), Identity(2), &mut to_send));
    assert!(node.votes_for(ViewNum(0)).is_none());

    let ack = ViewChangeAck {
        view_no: ViewNum(0),
        digest: Digest::ZERO,
    };
    assert!(!node.process_message(Message::ViewChangeAck(ack), Identity(2), &mut to_send));
    assert!(to_send.is_empty());
}

#[test_log::test]
fn test_unknown_sender_is_rejected() {
    let mut node = changer(1, 4);
    let mut to_send = Vec::new();
    let vote = vote_from(2, 4, ViewNum(1), &[]);
    assert!(!node.process_message(Message::ViewChange(vote), Identity(9), &mut to_send));
    assert!(node.votes_for(ViewNum(1)).is_none());
}

#[test_log::test]
fn test_malformed_vote_is_rejected() {
    let mut node = changer(1, 4);
    let mut to_send = Vec::new();

    let batches = log(3);
    let mut vote = (*vote_from(2, 4, ViewNum(1), &batches)).clone();
    vote.preprepared.swap(0, 2);
    assert!(vote.check_well_formed().is_err());
    assert!(!node.process_message(Message::ViewChange(Arc::new(vote)), Identity(2), &mut to_send));

    let mut unproven = (*vote_from(3, 4, ViewNum(1), &batches)).clone();
    unproven.stable_checkpoint = 10;
    assert!(!node.process_message(
        Message::ViewChange(Arc::new(unproven)),
        Identity(3),
        &mut to_send
    ));
    assert!(node.votes_for(ViewNum(1)).is_none());
}

#[test_log::test]
fn test_first_vote_from_a_sender_wins() {
    let mut node = changer(1, 4);
    let mut to_send = Vec::new();
    let first = vote_from(2, 4, ViewNum(1), &log(2));
    let second = vote_from(2, 4, ViewNum(1), &log(3));

    assert!(node.process_message(Message::ViewChange(first.clone()), Identity(2), &mut to_send));
    assert!(!node.process_message(Message::ViewChange(first.clone()), Identity(2), &mut to_send));
    assert!(!node.process_message(Message::ViewChange(second), Identity(2), &mut to_send));

    let held = node.votes_for(ViewNum(1)).unwrap().get(&Identity(2)).unwrap();
    assert_eq!(held.digest(), first.digest());
}

#[test_log::test]
fn test_full_view_change_with_instant_delivery() {
    let batches = log(5);
    let mut cluster = Cluster::new(4, &batches);
    for id in 1..=4 {
        assert!(cluster.trigger(id));
    }
    cluster.deliver_all();

    for id in 1..=4 {
        let node = cluster.node(id);
        assert_eq!(node.phase(), Phase::Normal);
        assert_eq!(node.escalations(), 0);
        assert!(node.check_invariants().is_empty());

        let snapshot = node.ordering_snapshot().unwrap();
        assert_eq!(snapshot.view_no, ViewNum(1));
        assert_eq!(snapshot.primary_name, Identity(2));
        assert_eq!(snapshot.stable_checkpoint, 0);
        assert_eq!(snapshot.preprepared, batches);
        assert_eq!(node.state().prepared, batches.iter().copied().collect());
    }
}

#[test_log::test]
fn test_normal_replica_catches_up_to_finalized_view() {
    let batches = log(3);
    let mut cluster = Cluster::new(4, &batches);
    for id in 1..=3 {
        cluster.trigger(id);
    }
    cluster.deliver_all();

    let lagging = cluster.node(4);
    assert_eq!(lagging.phase(), Phase::Normal);
    assert_eq!(lagging.state().view_no, ViewNum(1));
    assert_eq!(lagging.state().preprepared, batches);

    // its own signal for view 1 is now stale
    let mut to_send = Vec::new();
    let late = NeedViewChange {
        view_no: Some(ViewNum(1)),
    };
    let node = cluster.nodes.get_mut(&Identity(4)).unwrap();
    assert!(!node.process_need_view_change(late, &mut to_send));
    assert!(to_send.is_empty());
}

#[test_log::test]
fn test_view_change_stalls_without_quorum() {
    let mut cluster = Cluster::new(4, &log(2));
    cluster.trigger(1);
    cluster.trigger(3);
    cluster.deliver_all();

    assert_eq!(cluster.node(1).phase(), Phase::ViewChanging { target: ViewNum(1) });
    assert_eq!(cluster.node(2).phase(), Phase::Normal);
    assert!(cluster.node(2).pending_new_view(ViewNum(1)).is_none());
    assert_eq!(cluster.node(2).votes_for(ViewNum(1)).unwrap().len(), 2);
}

/// Replica p1 holding votes for view 1 from p1, p2 and p3.
fn replica_with_votes(batches: &[BatchId]) -> (ViewChanger, BTreeMap<Identity, Arc<ViewChange>>) {
    let mut node = changer(1, 4);
    load(node.replica_state_mut().unwrap(), batches);
    trigger(&mut node);

    let mut to_send = Vec::new();
    for id in 2..=3 {
        let vote = vote_from(id, 4, ViewNum(1), batches);
        assert!(node.process_message(Message::ViewChange(vote), Identity(id), &mut to_send));
    }
    assert_eq!(node.phase(), Phase::WaitingNewView { target: ViewNum(1) });
    let votes = node.votes_for(ViewNum(1)).unwrap().clone();
    (node, votes)
}

#[test_log::test]
fn test_new_view_from_non_primary_is_rejected() {
    let batches = log(3);
    let (mut node, votes) = replica_with_votes(&batches);
    let nv = NewViewBuilder::new(Quorums::new(4).unwrap())
        .build(ViewNum(1), &votes)
        .unwrap();

    let mut to_send = Vec::new();
    assert!(!node.process_message(Message::NewView(Arc::new(nv)), Identity(3), &mut to_send));
    assert!(node.pending_new_view(ViewNum(1)).is_none());
    assert!(to_send.is_empty());
}

#[test_log::test]
fn test_new_view_with_too_few_votes_is_rejected() {
    let batches = log(3);
    let (mut node, votes) = replica_with_votes(&batches);
    let mut nv = NewViewBuilder::new(Quorums::new(4).unwrap())
        .build(ViewNum(1), &votes)
        .unwrap();
    nv.view_changes.remove(&Identity(3));

    let mut to_send = Vec::new();
    assert!(!node.process_message(Message::NewView(Arc::new(nv)), Identity(2), &mut to_send));
    assert!(node.pending_new_view(ViewNum(1)).is_none());
}

#[test_log::test]
fn test_mismatching_new_view_is_never_acked() {
    let batches = log(3);
    let (mut node, votes) = replica_with_votes(&batches);
    let honest = NewViewBuilder::new(Quorums::new(4).unwrap())
        .build(ViewNum(1), &votes)
        .unwrap();
    let tampered = NewView {
        batches: batches[..1].to_vec(),
        ..honest
    };

    let mut to_send = Vec::new();
    node.process_message(Message::NewView(Arc::new(tampered)), Identity(2), &mut to_send);
    assert!(acks_in(&to_send).is_empty());
    assert!(node.pending_new_view(ViewNum(1)).is_none());
    assert_eq!(node.phase(), Phase::WaitingNewView { target: ViewNum(1) });
}

#[test_log::test]
fn test_valid_new_view_needs_strong_ack_quorum() {
    let batches = log(3);
    let (mut node, votes) = replica_with_votes(&batches);
    let nv = NewViewBuilder::new(Quorums::new(4).unwrap())
        .build(ViewNum(1), &votes)
        .unwrap();
    let digest = nv.digest();

    let mut to_send = Vec::new();
    assert!(node.process_message(Message::NewView(Arc::new(nv)), Identity(2), &mut to_send));
    assert_eq!(
        acks_in(&to_send),
        vec![ViewChangeAck {
            view_no: ViewNum(1),
            digest
        }]
    );
    assert!(node.pending_new_view(ViewNum(1)).unwrap().validated);
    assert_eq!(node.acks_for(ViewNum(1), &digest), 1);

    let ack = ViewChangeAck {
        view_no: ViewNum(1),
        digest,
    };
    // an ack for some other certificate does not count
    let other = ViewChangeAck {
        view_no: ViewNum(1),
        digest: Digest([7; 32]),
    };
    node.process_message(Message::ViewChangeAck(other), Identity(4), &mut to_send);
    node.process_message(Message::ViewChangeAck(ack), Identity(2), &mut to_send);
    assert_eq!(node.phase(), Phase::WaitingNewView { target: ViewNum(1) });

    node.process_message(Message::ViewChangeAck(ack), Identity(3), &mut to_send);
    assert_eq!(node.phase(), Phase::Normal);
    assert_eq!(node.state().view_no, ViewNum(1));
    assert_eq!(node.state().primary_name, Identity(2));
    assert_eq!(node.state().preprepared, batches);
    assert!(node.votes_for(ViewNum(1)).is_none());
    assert!(node.pending_new_view(ViewNum(1)).is_none());
}

#[test_log::test]
fn test_new_view_waits_for_referenced_votes() {
    let batches = log(2);
    let mut node = changer(1, 4);
    load(node.replica_state_mut().unwrap(), &batches);

    let votes: BTreeMap<Identity, Arc<ViewChange>> = (2..=4)
        .map(|id| (Identity(id), vote_from(id, 4, ViewNum(1), &batches)))
        .collect();
    let nv = NewViewBuilder::new(Quorums::new(4).unwrap())
        .build(ViewNum(1), &votes)
        .unwrap();

    let mut to_send = Vec::new();
    assert!(node.process_message(Message::NewView(Arc::new(nv)), Identity(2), &mut to_send));
    assert!(!node.pending_new_view(ViewNum(1)).unwrap().validated);

    for (id, vote) in &votes {
        node.process_message(Message::ViewChange(vote.clone()), *id, &mut to_send);
    }
    assert!(node.pending_new_view(ViewNum(1)).unwrap().validated);
    assert_eq!(acks_in(&to_send).len(), 1);
}

#[test_log::test]
fn test_primary_builds_and_acks_its_new_view() {
    let batches = log(4);
    let mut primary = changer(2, 4);
    load(primary.replica_state_mut().unwrap(), &batches);
    trigger(&mut primary);

    let mut to_send = Vec::new();
    for id in [1, 3] {
        let vote = vote_from(id, 4, ViewNum(1), &batches);
        primary.process_message(Message::ViewChange(vote), Identity(id), &mut to_send);
    }

    let nv = to_send
        .iter()
        .find_map(|(m, _)| match m {
            Message::NewView(nv) => Some(nv.clone()),
            _ => None,
        })
        .expect("primary should broadcast a NewView");
    assert_eq!(nv.view_no, ViewNum(1));
    assert_eq!(nv.batches, batches);
    assert_eq!(
        nv.view_changes.keys().copied().collect::<Vec<_>>(),
        vec![Identity(1), Identity(2), Identity(3)]
    );
    assert_eq!(acks_in(&to_send).len(), 1);
    assert_eq!(primary.acks_for(ViewNum(1), &nv.digest()), 1);
}

#[test_log::test]
fn test_timeout_escalates_with_backoff() {
    let config = ViewChangeConfig {
        new_view_timeout: 100,
        max_backoff_exponent: 2,
        ..ViewChangeConfig::default()
    };
    let mut node = ViewChanger::new(Identity(1), validators(4), config).unwrap();
    assert_eq!(node.next_deadline(), None);

    trigger(&mut node);
    assert_eq!(node.next_deadline(), Some(100));

    let mut to_send = Vec::new();
    node.set_now(99);
    node.check_timeouts(&mut to_send);
    assert!(to_send.is_empty());

    node.set_now(100);
    node.check_timeouts(&mut to_send);
    assert_eq!(node.phase(), Phase::ViewChanging { target: ViewNum(2) });
    assert_eq!(node.escalations(), 1);
    assert_eq!(node.current_timeout(), 200);
    assert_eq!(node.next_deadline(), Some(300));
    assert!(matches!(&to_send[..], [(Message::ViewChange(vc), None)] if vc.view_no == ViewNum(2)));

    node.set_now(300);
    node.check_timeouts(&mut to_send);
    assert_eq!(node.current_timeout(), 400);

    node.set_now(700);
    node.check_timeouts(&mut to_send);
    assert_eq!(node.phase(), Phase::ViewChanging { target: ViewNum(4) });
    // capped at 2^2
    assert_eq!(node.current_timeout(), 400);
    assert!(node.check_invariants().is_empty());
}

#[test_log::test]
fn test_escalation_keeps_votes_for_abandoned_views() {
    let batches = log(2);
    let mut cluster = Cluster::new(4, &batches);
    cluster.trigger(1);
    let node = cluster.nodes.get_mut(&Identity(1)).unwrap();
    let first = node.votes_for(ViewNum(1)).unwrap()[&Identity(1)].clone();

    // nothing happens in view 1; p1 moves on to view 2
    let mut to_send = Vec::new();
    node.set_now(node.next_deadline().unwrap());
    node.check_timeouts(&mut to_send);
    assert_eq!(node.phase(), Phase::ViewChanging { target: ViewNum(2) });
    assert_eq!(node.votes_for(ViewNum(1)).unwrap()[&Identity(1)], first);
}

#[test_log::test]
fn test_set_validators_recomputes_quorums() {
    let mut node = changer(1, 4);
    assert_eq!(node.state().quorums.strong.value(), 3);

    node.set_validators(validators(7)).unwrap();
    assert_eq!(node.state().quorums.f, 2);
    assert_eq!(node.state().quorums.strong.value(), 5);
    assert_eq!(node.state().primary_name, Identity(1));

    let without_me: Vec<Identity> = (2..=5).map(Identity).collect();
    assert!(matches!(
        node.set_validators(without_me),
        Err(ViewChangeError::InvalidConfiguration { .. })
    ));
    assert!(matches!(
        node.set_validators(vec![Identity(1)]),
        Err(ViewChangeError::InvalidConfiguration { replicas: 1, .. })
    ));
    assert_eq!(node.state().validators, validators(7));
}

#[test_log::test]
fn test_primary_rotates_with_view() {
    let state = ReplicaViewState::new(Identity(1), validators(4)).unwrap();
    assert_eq!(state.primary_for(ViewNum(0)), Identity(1));
    assert_eq!(state.primary_for(ViewNum(1)), Identity(2));
    assert_eq!(state.primary_for(ViewNum(4)), Identity(1));
    assert_eq!(state.primary_for(ViewNum(7)), Identity(4));
}

#[test_log::test]
fn test_invariant_violation_display() {
    let violation = InvariantViolation::TargetNotAhead {
        target: ViewNum(2),
        view_no: ViewNum(3),
    };
    assert_eq!(
        violation.to_string(),
        "View change target 2 is not above current view 3"
    );
}

#[test_log::test]
fn test_far_future_views_are_not_held() {
    let mut node = changer(1, 4);
    let lookahead = ViewChangeConfig::default().max_view_lookahead;
    assert_eq!(node.view_horizon(), ViewNum(lookahead));

    let mut to_send = Vec::new();
    let mut accepted = 0;
    for view in 1..=2000 {
        let vote = vote_from(4, 4, ViewNum(view), &[]);
        let ack = ViewChangeAck {
            view_no: ViewNum(view),
            digest: Digest::ZERO,
        };
        accepted += node.process_message(Message::ViewChange(vote), Identity(4), &mut to_send) as u64;
        node.process_message(Message::ViewChangeAck(ack), Identity(4), &mut to_send);
    }
    assert_eq!(accepted, lookahead);

    let held_votes = (1..=2000)
        .filter(|v| node.votes_for(ViewNum(*v)).is_some())
        .count() as u64;
    let held_acks = (1..=2000)
        .filter(|v| node.acks_for(ViewNum(*v), &Digest::ZERO) > 0)
        .count() as u64;
    assert_eq!(held_votes, lookahead);
    assert_eq!(held_acks, lookahead);
    assert!(node.votes_for(ViewNum(lookahead + 1)).is_none());
    assert_eq!(node.phase(), Phase::Normal);
    assert!(to_send.is_empty());
}

#[test_log::test]
fn test_horizon_follows_the_view_change_target() {
    let mut node = changer(1, 4);
    let lookahead = ViewChangeConfig::default().max_view_lookahead;

    let mut to_send = Vec::new();
    let far = NeedViewChange {
        view_no: Some(ViewNum(100)),
    };
    assert!(node.process_need_view_change(far, &mut to_send));
    assert_eq!(node.view_horizon(), ViewNum(100 + lookahead));

    let inside = vote_from(3, 4, ViewNum(100 + lookahead), &[]);
    assert!(node.process_message(Message::ViewChange(inside), Identity(3), &mut to_send));
    let outside = vote_from(3, 4, ViewNum(101 + lookahead), &[]);
    assert!(!node.process_message(Message::ViewChange(outside), Identity(3), &mut to_send));
}

#[test_log::test]
fn test_waiting_for_new_view_gets_its_own_timeout() {
    let batches = log(2);
    let mut node = changer(1, 4);
    load(node.replica_state_mut().unwrap(), &batches);
    trigger(&mut node);
    assert_eq!(node.next_deadline(), Some(30_000));

    let mut to_send = Vec::new();
    node.set_now(20_000);
    for id in 2..=3 {
        let vote = vote_from(id, 4, ViewNum(1), &batches);
        node.process_message(Message::ViewChange(vote), Identity(id), &mut to_send);
    }
    assert_eq!(node.phase(), Phase::WaitingNewView { target: ViewNum(1) });
    assert_eq!(node.next_deadline(), Some(50_000));

    node.set_now(30_000);
    node.check_timeouts(&mut to_send);
    assert_eq!(node.phase(), Phase::WaitingNewView { target: ViewNum(1) });

    node.set_now(50_000);
    node.check_timeouts(&mut to_send);
    assert_eq!(node.phase(), Phase::ViewChanging { target: ViewNum(2) });
}
