//! Discrete-event simulation of a pool of view changers.
//!
//! Time is "logical", nothing actually waits. Events sit in a queue ordered by
//! (time, insertion order); each step pops the earliest one, sets the
//! replica's clock and runs the event to completion. Whatever the replica sends
//! is scheduled after a latency drawn from the network, or dropped by its
//! filters.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::ViewChangeConfig;
use crate::error::ViewChangeError;
use crate::sim::{SimNetwork, SimRandom};
use crate::types::*;
use crate::view_changer::ViewChanger;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SimEvent {
    NeedViewChange {
        node: Identity,
        need: NeedViewChange,
    },
    Deliver {
        to: Identity,
        from: Identity,
        message: Message,
    },
    Timer {
        node: Identity,
    },
}

/// What happened at one replica, as recorded in the trace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum TraceEvent {
    Triggered {
        view_no: Option<ViewNum>,
        accepted: bool,
    },
    Delivered {
        from: Identity,
        kind: MessageKind,
        view_no: ViewNum,
        useful: bool,
    },
    Dropped {
        to: Identity,
        kind: MessageKind,
    },
    TimerFired,
    ViewChanged {
        view_no: ViewNum,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TraceEntry {
    pub time: u64,
    pub node: Identity,
    pub event: TraceEvent,
}

pub struct SimPool {
    pub network: SimNetwork,
    random: SimRandom,
    nodes: BTreeMap<Identity, ViewChanger>,

    queue: BTreeMap<(u64, u64), SimEvent>,
    sequence: u64,
    now: u64,
    /// Latest timer scheduled per replica.
    timers: BTreeMap<Identity, u64>,

    trace: Vec<TraceEntry>,
}

impl SimPool {
    /// Creates `size` replicas named `p1..=p{size}`, all in view 0.
    pub fn new(
        size: usize,
        random: SimRandom,
        config: ViewChangeConfig,
    ) -> Result<Self, ViewChangeError> {
        let validators: Vec<Identity> = (1..=size as u64).map(Identity).collect();
        let nodes = validators
            .iter()
            .map(|id| Ok((*id, ViewChanger::new(*id, validators.clone(), config.clone())?)))
            .collect::<Result<BTreeMap<_, _>, ViewChangeError>>()?;

        Ok(Self {
            network: SimNetwork::default(),
            random,
            nodes,
            queue: BTreeMap::new(),
            sequence: 0,
            now: 0,
            timers: BTreeMap::new(),
            trace: Vec::new(),
        })
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn validators(&self) -> Vec<Identity> {
        self.nodes.keys().copied().collect()
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn node(&self, id: &Identity) -> Option<&ViewChanger> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &Identity) -> Option<&mut ViewChanger> {
        self.nodes.get_mut(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ViewChanger> {
        self.nodes.values()
    }

    pub fn random(&mut self) -> &mut SimRandom {
        &mut self.random
    }

    pub fn trace(&self) -> &[TraceEntry] {
        &self.trace
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    fn schedule_at(&mut self, time: u64, event: SimEvent) {
        let key = (time.max(self.now), self.sequence);
        self.sequence += 1;
        self.queue.insert(key, event);
    }

    pub fn schedule(&mut self, delay: u64, event: SimEvent) {
        self.schedule_at(self.now.saturating_add(delay), event);
    }

    /// Raises the local view change signal at `node` after `delay`.
    ///
    /// The signal names the view after the one `node` is in now, like a
    /// monitor that has just given up on the current primary.
    pub fn schedule_need_view_change(&mut self, delay: u64, node: Identity) {
        let view_no = self.nodes.get(&node).map(|n| n.state().view_no.incr());
        self.schedule(
            delay,
            SimEvent::NeedViewChange {
                node,
                need: NeedViewChange { view_no },
            },
        );
    }

    /// Processes the earliest event. Returns false if there was none.
    pub fn step(&mut self) -> bool {
        let Some(((time, _), event)) = self.queue.pop_first() else {
            return false;
        };
        self.now = time;

        match event {
            SimEvent::NeedViewChange { node, need } => self.dispatch(node, |replica, to_send| {
                let accepted = replica.process_need_view_change(need, to_send);
                TraceEvent::Triggered {
                    view_no: need.view_no,
                    accepted,
                }
            }),
            SimEvent::Deliver { to, from, message } => {
                let kind = message.kind();
                let view_no = message.view_no();
                self.dispatch(to, |replica, to_send| {
                    let useful = replica.process_message(message, from, to_send);
                    TraceEvent::Delivered {
                        from,
                        kind,
                        view_no,
                        useful,
                    }
                })
            }
            SimEvent::Timer { node } => {
                if self.timers.get(&node) == Some(&time) {
                    self.timers.remove(&node);
                }
                self.dispatch(node, |replica, to_send| {
                    replica.check_timeouts(to_send);
                    TraceEvent::TimerFired
                })
            }
        }
        true
    }

    fn dispatch(
        &mut self,
        id: Identity,
        handler: impl FnOnce(&mut ViewChanger, &mut Vec<(Message, Option<Identity>)>) -> TraceEvent,
    ) {
        let now = self.now;
        let Some(replica) = self.nodes.get_mut(&id) else {
            return;
        };
        replica.set_now(now);
        let view_before = replica.state().view_no;
        let mut to_send = Vec::new();
        let event = handler(replica, &mut to_send);
        let view_after = replica.state().view_no;
        let deadline = replica.next_deadline();

        self.record(id, event);
        if view_after != view_before {
            self.record(id, TraceEvent::ViewChanged { view_no: view_after });
        }
        for (message, dest) in to_send {
            self.send(id, message, dest);
        }
        if let Some(deadline) = deadline {
            if self.timers.get(&id) != Some(&deadline) {
                self.timers.insert(id, deadline);
                self.schedule_at(deadline, SimEvent::Timer { node: id });
            }
        }
    }

    fn send(&mut self, from: Identity, message: Message, dest: Option<Identity>) {
        let targets: Vec<Identity> = match dest {
            Some(to) => vec![to],
            None => self.nodes.keys().copied().collect(),
        };
        let kind = message.kind();
        for to in targets.into_iter().filter(|to| *to != from) {
            match self.network.route(&from, kind, &mut self.random) {
                Some(latency) => self.schedule(
                    latency,
                    SimEvent::Deliver {
                        to,
                        from,
                        message: message.clone(),
                    },
                ),
                None => self.record(from, TraceEvent::Dropped { to, kind }),
            }
        }
    }

    fn record(&mut self, node: Identity, event: TraceEvent) {
        self.trace.push(TraceEntry {
            time: self.now,
            node,
            event,
        });
    }

    /// Steps until `predicate` holds or the next event lies past `time_limit`.
    pub fn run_until(&mut self, predicate: impl Fn(&SimPool) -> bool, time_limit: u64) -> bool {
        loop {
            if predicate(self) {
                return true;
            }
            match self.queue.first_key_value() {
                Some(((time, _), _)) if *time <= time_limit => {
                    self.step();
                }
                _ => return false,
            }
        }
    }

    /// Drains the queue. Returns false if events remain past `time_limit`.
    pub fn run_until_idle(&mut self, time_limit: u64) -> bool {
        self.run_until(SimPool::is_idle, time_limit)
    }
}
