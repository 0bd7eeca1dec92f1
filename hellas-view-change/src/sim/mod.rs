//! Deterministic simulation of a pool running a view change.
//!
//! Everything random is drawn from one seeded `SimRandom`, so a seed fully
//! determines the run and a failing seed can be replayed.
//!
//! - `random.rs`: seeded random source
//! - `network.rs`: latency and message filters
//! - `pool.rs`: event queue driving the replicas
//! - `history.rs`: random pre-view-change logs (`some_pool`)

mod history;
mod network;
mod pool;
mod random;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

pub use history::*;
pub use network::*;
pub use pool::*;
pub use random::*;

use crate::config::ViewChangeConfig;
use crate::error::ViewChangeError;
use crate::replica_state::ReplicaViewState;
use crate::types::{BatchId, Identity, MessageKind, ViewNum};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimConfig {
    /// Random 4 to 8 when unset.
    pub pool_size: Option<usize>,
    pub min_latency: u64,
    pub max_latency: u64,
    /// Replicas raise the view change signal at a random time in `[0, trigger_window)`.
    pub trigger_window: u64,
    pub time_limit: u64,
    /// Drop every `ViewChange` the last replica sends.
    pub drop_view_changes_from_last: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            pool_size: None,
            min_latency: 0,
            max_latency: 18_000,
            trigger_window: 10_000,
            time_limit: 50_000_000,
            drop_view_changes_from_last: false,
        }
    }
}

impl SimConfig {
    /// Latency as fractions of the base new view timeout.
    pub fn with_latency_factors(mut self, config: &ViewChangeConfig, min: f64, max: f64) -> Self {
        self.min_latency = (config.new_view_timeout as f64 * min) as u64;
        self.max_latency = (config.new_view_timeout as f64 * max) as u64;
        self
    }
}

/// The agreed outcome of a view change across a set of replicas.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Convergence {
    pub view_no: ViewNum,
    pub primary: Identity,
    pub stable_checkpoint: u64,
    /// Replicas on `stable_checkpoint`.
    pub support: usize,
    pub batches: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum ConvergenceFailure {
    NoReplicas,
    Incomplete {
        replica: Identity,
        view_no: ViewNum,
        waiting: bool,
    },
    ViewsDiffer {
        first: (Identity, ViewNum),
        other: (Identity, ViewNum),
    },
    PrimariesDiffer {
        first: (Identity, Identity),
        other: (Identity, Identity),
    },
    CheckpointSupport {
        stable_checkpoint: u64,
        support: usize,
        required: usize,
    },
    LogsDiffer {
        distinct: usize,
    },
}

impl fmt::Display for ConvergenceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoReplicas => write!(f, "No replicas to check"),
            Self::Incomplete {
                replica,
                view_no,
                waiting,
            } => write!(
                f,
                "p{} has not finished a view change (view {}, waiting {})",
                replica.0, view_no.0, waiting
            ),
            Self::ViewsDiffer { first, other } => write!(
                f,
                "p{} is in view {} but p{} is in view {}",
                first.0.0, first.1.0, other.0.0, other.1.0
            ),
            Self::PrimariesDiffer { first, other } => write!(
                f,
                "p{} follows primary p{} but p{} follows p{}",
                first.0.0, first.1.0, other.0.0, other.1.0
            ),
            Self::CheckpointSupport {
                stable_checkpoint,
                support,
                required,
            } => write!(
                f,
                "Stable checkpoint {} is held by {} replicas, need {}",
                stable_checkpoint, support, required
            ),
            Self::LogsDiffer { distinct } => {
                write!(f, "{} different preprepared logs above the stable checkpoint", distinct)
            }
        }
    }
}

/// Checks that `replicas` finished a view change and agree on its result.
///
/// The most common stable checkpoint must be held by at least `n - f`
/// replicas, and every replica at or above it must have the same log.
pub fn check_convergence(
    pool: &SimPool,
    replicas: &[Identity],
) -> Result<Convergence, ConvergenceFailure> {
    let states: Vec<&ReplicaViewState> = replicas
        .iter()
        .filter_map(|id| pool.node(id))
        .map(|node| node.state())
        .collect();
    let Some(first) = states.first() else {
        return Err(ConvergenceFailure::NoReplicas);
    };

    for state in &states {
        if state.waiting_for_new_view || state.view_no == ViewNum(0) {
            return Err(ConvergenceFailure::Incomplete {
                replica: state.name,
                view_no: state.view_no,
                waiting: state.waiting_for_new_view,
            });
        }
        if state.view_no != first.view_no {
            return Err(ConvergenceFailure::ViewsDiffer {
                first: (first.name, first.view_no),
                other: (state.name, state.view_no),
            });
        }
        if state.primary_name != first.primary_name {
            return Err(ConvergenceFailure::PrimariesDiffer {
                first: (first.name, first.primary_name),
                other: (state.name, state.primary_name),
            });
        }
    }

    let mut counts: BTreeMap<u64, usize> = BTreeMap::new();
    for state in &states {
        *counts.entry(state.stable_checkpoint).or_default() += 1;
    }
    let (stable_checkpoint, support) = counts
        .into_iter()
        .max_by_key(|(checkpoint, count)| (*count, *checkpoint))
        .ok_or(ConvergenceFailure::NoReplicas)?;
    let required = first.quorums.strong.value();
    if support < required {
        return Err(ConvergenceFailure::CheckpointSupport {
            stable_checkpoint,
            support,
            required,
        });
    }

    let logs: BTreeSet<&Vec<BatchId>> = states
        .iter()
        .filter(|state| state.stable_checkpoint >= stable_checkpoint)
        .map(|state| &state.preprepared)
        .collect();
    if logs.len() != 1 {
        return Err(ConvergenceFailure::LogsDiffer {
            distinct: logs.len(),
        });
    }

    Ok(Convergence {
        view_no: first.view_no,
        primary: first.primary_name,
        stable_checkpoint,
        support,
        batches: logs.iter().next().map_or(0, |log| log.len()),
    })
}

#[derive(Clone, Debug, Serialize)]
pub struct ScenarioOutcome {
    pub seed: u64,
    pub pool_size: usize,
    /// Every checked replica left view 0 and stopped waiting before the time limit.
    pub completed: bool,
    pub finished_at: u64,
    /// The queue emptied afterwards.
    pub drained: bool,
    pub network: NetworkStats,
    pub committed: usize,
    pub convergence: Result<Convergence, ConvergenceFailure>,
}

impl ScenarioOutcome {
    pub fn converged(&self) -> bool {
        self.completed && self.convergence.is_ok()
    }
}

/// Runs one full view change from a random history.
///
/// Every replica raises the signal at a random time in the trigger window.
/// The run stops once the checked replicas (all of them, or all but the last
/// when its votes are dropped) have finished, then drains remaining traffic
/// before checking agreement.
pub fn run_view_change(
    seed: u64,
    sim: &SimConfig,
    config: &ViewChangeConfig,
) -> Result<(SimPool, ScenarioOutcome), ViewChangeError> {
    let (mut pool, committed) = some_pool(SimRandom::new(seed), sim.pool_size, config.clone())?;
    pool.network.set_latency(sim.min_latency, sim.max_latency);

    let validators = pool.validators();
    let mut checked = validators.clone();
    if sim.drop_view_changes_from_last {
        if let Some(last) = checked.pop() {
            pool.network.drop_messages([last], [MessageKind::ViewChange]);
        }
    }

    for node in &validators {
        let delay = pool.random().integer(0, sim.trigger_window.saturating_sub(1));
        pool.schedule_need_view_change(delay, *node);
    }

    let completed = pool.run_until(
        |pool| {
            checked.iter().filter_map(|id| pool.node(id)).all(|node| {
                let state = node.state();
                !state.waiting_for_new_view && state.view_no > ViewNum(0)
            })
        },
        sim.time_limit,
    );
    let finished_at = pool.now();
    let drained = pool.run_until_idle(sim.time_limit);

    let outcome = ScenarioOutcome {
        seed,
        pool_size: pool.size(),
        completed,
        finished_at,
        drained,
        network: pool.network.stats(),
        committed: committed.len(),
        convergence: check_convergence(&pool, &checked),
    };
    Ok((pool, outcome))
}
