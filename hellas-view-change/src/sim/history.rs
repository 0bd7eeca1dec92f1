//! Random but internally consistent pre-view-change histories.

use std::collections::BTreeSet;

use crate::config::ViewChangeConfig;
use crate::error::ViewChangeError;
use crate::sim::{SimPool, SimRandom};
use crate::types::{BatchId, Checkpoint, ViewNum};

/// Batches 1..MAX_BATCHES exist in the history.
pub const MAX_BATCHES: u64 = 50;
pub const SEQ_NO_PER_CHECKPOINT: u64 = 10;

/// Builds a pool of `size` replicas (4 to 8 if `None`) whose logs are
/// prefixes of one shared batch history.
///
/// At least `n - f` replicas have preprepared up to the `(f+1)`-th smallest
/// preprepared count, prepared never exceeds preprepared, and stable
/// checkpoints never exceed what was prepared. Returns the pool and the
/// batches prepared by at least `n - f` replicas, which is everything a
/// correct view change must not lose above its checkpoint.
pub fn some_pool(
    mut random: SimRandom,
    size: Option<usize>,
    config: ViewChangeConfig,
) -> Result<(SimPool, Vec<BatchId>), ViewChangeError> {
    let size = size.unwrap_or_else(|| random.integer(4, 8) as usize);
    let mut pool = SimPool::new(size, random, config)?;
    let faulty = (size - 1) / 3;
    let view_no = ViewNum(0);

    let random = pool.random();
    let batches: Vec<BatchId> = (1..MAX_BATCHES)
        .map(|n| BatchId::new(view_no, n, random.digest()))
        .collect();
    let checkpoints: Vec<Checkpoint> = (0..MAX_BATCHES)
        .step_by(SEQ_NO_PER_CHECKPOINT as usize)
        .map(|n| {
            if n == 0 {
                Checkpoint::genesis()
            } else {
                Checkpoint::new(n, random.digest())
            }
        })
        .collect();

    let pp_count: Vec<u64> = (0..size)
        .map(|_| random.integer(0, batches.len() as u64))
        .collect();
    let max_pp = nth_smallest(&pp_count, faulty);

    let p_count: Vec<u64> = pp_count
        .iter()
        .map(|pp| random.integer(0, max_pp.min(*pp)))
        .collect();
    let max_p = nth_smallest(&p_count, faulty);

    let cp_count: Vec<u64> = p_count
        .iter()
        .map(|p| 1 + random.integer(0, max_p.min(*p)) / SEQ_NO_PER_CHECKPOINT)
        .collect();
    let max_stable_cp = nth_smallest(&cp_count, faulty);

    let stable_cp: Vec<u64> = cp_count
        .iter()
        .map(|cp| {
            let index = random.integer(0, max_stable_cp.min(*cp) - 1) as usize;
            checkpoints[index].seq_no_end
        })
        .collect();

    for (i, id) in pool.validators().into_iter().enumerate() {
        let held = checkpoints[..cp_count[i] as usize]
            .iter()
            .copied()
            .collect::<BTreeSet<_>>();
        let preprepared = batches[..pp_count[i] as usize].to_vec();
        let prepared = batches[..p_count[i] as usize].iter().copied().collect();
        if let Some(state) = pool.node_mut(&id).and_then(|node| node.replica_state_mut()) {
            state.load_log(stable_cp[i], held, preprepared, prepared);
        }
    }

    let committed = batches
        .iter()
        .filter(|batch| {
            let prepared_by = p_count.iter().filter(|p| batch.pp_seq_no <= **p).count();
            prepared_by >= size - faulty
        })
        .copied()
        .collect();

    Ok((pool, committed))
}

fn nth_smallest(values: &[u64], n: usize) -> u64 {
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    sorted[n]
}
