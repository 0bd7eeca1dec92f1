//! Properties of the new-view builder over random but consistent pool histories.

use std::collections::BTreeMap;

use hellas_view_change::sim::{SimRandom, some_pool};
use hellas_view_change::{
    BatchId, Identity, NewViewBuilder, Quorums, ViewChange, ViewChangeConfig, ViewNum,
};
use proptest::prelude::*;

/// Every replica's vote for view 1, keyed by sender.
fn pool_votes(seed: u64) -> (Quorums, BTreeMap<Identity, ViewChange>) {
    let (pool, _) = some_pool(SimRandom::new(seed), None, ViewChangeConfig::default()).unwrap();
    let quorums = pool.nodes().next().unwrap().state().quorums;
    let votes = pool
        .nodes()
        .map(|node| (node.name(), node.state().view_change_vote(ViewNum(1))))
        .collect();
    (quorums, votes)
}

fn sample(random: &mut SimRandom, votes: &BTreeMap<Identity, ViewChange>, count: usize) -> Vec<ViewChange> {
    let all: Vec<ViewChange> = votes.values().cloned().collect();
    random.sample(&all, count)
}

/// Batches in every vote's preprepared and prepared, from 1 up to the first miss.
fn prepared_by_all(votes: &[ViewChange]) -> Vec<BatchId> {
    let mut committed = Vec::new();
    for pp_seq_no in 1.. {
        let Some(candidate) = votes[0].preprepared_at(pp_seq_no) else {
            break;
        };
        let everywhere = votes.iter().all(|vc| {
            vc.preprepared_at(pp_seq_no) == Some(candidate) && vc.has_prepared(candidate)
        });
        if !everywhere {
            break;
        }
        committed.push(*candidate);
    }
    committed
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

    /// Adding votes to a quorum never lowers the chosen checkpoint, and the
    /// chosen checkpoint is always held by a strong quorum of the input.
    #[test]
    fn checkpoint_is_monotonic_in_the_vote_set(seed in any::<u64>()) {
        let (quorums, votes) = pool_votes(seed);
        let builder = NewViewBuilder::new(quorums);
        let mut random = SimRandom::new(seed ^ 0x5eed);

        let strong = quorums.strong.value();
        let extra = random.integer(0, (quorums.n - strong) as u64) as usize;
        let superset = sample(&mut random, &votes, strong + extra);
        let subset = &superset[..strong];

        let small = builder.calc_checkpoint(subset).unwrap();
        let large = builder.calc_checkpoint(&superset).unwrap();
        prop_assert!(large >= small);

        let holders = superset.iter().filter(|vc| vc.holds_checkpoint(&large)).count();
        prop_assert!(quorums.strong.is_reached(holders));
    }

    /// The batch run is contiguous from the checkpoint and keeps every batch
    /// that all sampled votes prepared above it.
    #[test]
    fn batches_are_gap_free_and_keep_prepared(seed in any::<u64>()) {
        let (quorums, votes) = pool_votes(seed);
        let builder = NewViewBuilder::new(quorums);
        let mut random = SimRandom::new(seed.wrapping_add(1));

        for _ in 0..10 {
            let sampled = sample(&mut random, &votes, quorums.strong.value());
            let checkpoint = builder.calc_checkpoint(&sampled).unwrap();
            let batches = builder.calc_batches(checkpoint.seq_no_end, &sampled).unwrap();

            for (i, batch) in batches.iter().enumerate() {
                prop_assert_eq!(batch.pp_seq_no, checkpoint.seq_no_end + 1 + i as u64);
            }

            let committed: Vec<BatchId> = prepared_by_all(&sampled)
                .into_iter()
                .filter(|b| b.pp_seq_no > checkpoint.seq_no_end)
                .collect();
            prop_assert!(committed.len() <= batches.len());
            prop_assert_eq!(&committed[..], &batches[..committed.len()]);
        }
    }

    /// Vote order never changes the result.
    #[test]
    fn build_ignores_vote_order(seed in any::<u64>()) {
        let (quorums, votes) = pool_votes(seed);
        let builder = NewViewBuilder::new(quorums);
        let mut random = SimRandom::new(seed.wrapping_mul(3));

        let mut sampled = sample(&mut random, &votes, quorums.strong.value());
        let checkpoint = builder.calc_checkpoint(&sampled).unwrap();
        let batches = builder.calc_batches(checkpoint.seq_no_end, &sampled).unwrap();

        for _ in 0..5 {
            random.shuffle(&mut sampled);
            prop_assert_eq!(builder.calc_checkpoint(&sampled).unwrap(), checkpoint);
            prop_assert_eq!(
                builder.calc_batches(checkpoint.seq_no_end, &sampled).unwrap(),
                batches.clone()
            );
        }

        let nv = builder.build(ViewNum(1), &votes).unwrap();
        prop_assert_eq!(builder.verify(&nv, &votes), Ok(()));
    }
}
