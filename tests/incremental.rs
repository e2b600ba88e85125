//! End-to-end incremental checkpointing: the interval controller decides
//! base vs delta, the update log chains the records, and restores replay the
//! chain back into the live state.

use std::sync::Arc;

use itertools::Itertools;
use weir::checkpoint::{CheckpointFactory, IncrVecDeque, MemoryStore, StateStore};
use weir::config::CheckpointConfig;

fn factory(interval: u32, size_ratio: f64) -> CheckpointFactory {
    let store = Arc::new(MemoryStore::new()) as Arc<dyn StateStore>;
    CheckpointFactory::new(
        store,
        &CheckpointConfig {
            incremental_interval: interval,
            size_ratio,
        },
    )
}

fn checkpoint(factory: &mut CheckpointFactory, queue: &mut IncrVecDeque<String>, seq: i64) {
    let mut ckpt = factory.create(seq);
    queue.checkpoint(&mut ckpt).unwrap();
    factory.commit(ckpt).unwrap();
}

fn restore(factory: &CheckpointFactory, seq: i64) -> Vec<String> {
    let mut queue = IncrVecDeque::new();
    let mut ckpt = factory.open(seq).unwrap();
    queue.reset(&mut ckpt).unwrap();
    queue.iter().cloned().collect_vec()
}

fn live(queue: &IncrVecDeque<String>) -> Vec<String> {
    queue.iter().cloned().collect_vec()
}

#[test]
fn every_checkpoint_restores_to_its_own_state() {
    let mut factory = factory(3, 1.0);
    let mut queue = IncrVecDeque::new();
    let mut snapshots = Vec::new();

    for seq in 1i64..=9 {
        queue.push_back(format!("event-{seq}"));
        if seq % 2 == 0 {
            queue.pop_front();
        }
        checkpoint(&mut factory, &mut queue, seq);
        snapshots.push((seq, live(&queue)));
        // only checkpoints since the current base survive pruning
        let (latest, expected) = snapshots.last().unwrap();
        assert_eq!(&restore(&factory, *latest), expected, "seq {latest}");
    }
}

#[test]
fn restore_works_after_process_loss() {
    // the store is all that survives: a fresh factory and a fresh queue must
    // rebuild the state from the chain alone
    let store = Arc::new(MemoryStore::new());
    let config = CheckpointConfig {
        incremental_interval: 4,
        size_ratio: 1.0,
    };
    let mut factory =
        CheckpointFactory::new(store.clone() as Arc<dyn StateStore>, &config);
    let mut queue = IncrVecDeque::new();
    for seq in 1i64..=4 {
        queue.push_back(format!("item-{seq}"));
        checkpoint(&mut factory, &mut queue, seq);
    }
    let expected = live(&queue);
    drop(factory);
    drop(queue);

    let recovered = CheckpointFactory::new(store as Arc<dyn StateStore>, &config);
    assert_eq!(restore(&recovered, 4), expected);
}

#[test]
fn disabled_incremental_checkpointing_stays_all_base() {
    // size_ratio 0 disables incremental checkpointing entirely
    let mut factory = factory(8, 0.0);
    let mut queue = IncrVecDeque::new();
    for seq in 1i64..=6 {
        queue.push_back(format!("x{seq}"));
        let ckpt = {
            let mut ckpt = factory.create(seq);
            assert!(ckpt.is_base(), "seq {seq} must be a base");
            assert!(!ckpt.should_enable_logging());
            queue.checkpoint(&mut ckpt).unwrap();
            ckpt
        };
        factory.commit(ckpt).unwrap();
    }
    assert_eq!(restore(&factory, 6), live(&queue));
}

#[test]
fn growing_interval_keeps_chains_replayable() {
    // small deltas let the controller double the interval; chains stay
    // bounded by the current interval and replay correctly throughout
    let mut factory = factory(2, 1.0);
    let mut queue = IncrVecDeque::new();
    for filler in 0..64 {
        queue.push_back(format!("filler-{filler:04}"));
    }
    for seq in 1i64..=40 {
        queue.push_back(format!("delta-{seq}"));
        checkpoint(&mut factory, &mut queue, seq);
        assert_eq!(restore(&factory, seq), live(&queue), "seq {seq}");
    }
    assert!(factory.controller().interval() > 2);
}
