//! A consistent region end to end: two operators with windowed state drain,
//! checkpoint through the worker pool, keep processing, then roll back to
//! the committed checkpoint after a simulated failure.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use weir::checkpoint::{CheckpointFactory, MemoryStore, StateHandler, StateStore};
use weir::config::RuntimeConfig;
use weir::region::{OperatorContext, RegionNotifier, RegionService};
use weir::window::TumblingWindow;
use weir::{RegionIndex, SequenceId};

struct Ctx {
    region: RegionIndex,
    operator: u32,
}

impl OperatorContext for Ctx {
    fn region_index(&self) -> RegionIndex {
        self.region
    }

    fn operator_index(&self) -> u32 {
        self.operator
    }
}

#[derive(Default)]
struct Coordinator {
    drains: AtomicUsize,
    blocking: AtomicUsize,
    durable: AtomicI64,
    resets: AtomicUsize,
}

impl RegionNotifier for Coordinator {
    fn drain_completed(&self, _seq_id: SequenceId, _region: RegionIndex) {
        self.drains.fetch_add(1, Ordering::SeqCst);
    }

    fn blocking_checkpoint_completed(&self, _seq_id: SequenceId, _region: RegionIndex) {
        self.blocking.fetch_add(1, Ordering::SeqCst);
    }

    fn checkpoint_completed(&self, seq_id: SequenceId, _region: RegionIndex) {
        self.durable.store(seq_id, Ordering::SeqCst);
    }

    fn reset_completed(&self, _seq_id: SequenceId, _region: RegionIndex, _attempt: i32) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

/// One operator of the region: a count-tumbling window plus its checkpoint
/// factory.
struct Operator {
    window: weir::window::TumblingWindowManager<u32, String, weir::window::Discard<String>>,
    factory: CheckpointFactory,
}

impl Operator {
    fn new(store: Arc<dyn StateStore>, config: &RuntimeConfig) -> Self {
        Self {
            window: TumblingWindow::count(100).retain::<u32>().unwrap(),
            factory: CheckpointFactory::new(store, &config.checkpoint),
        }
    }

    fn checkpoint(&mut self, seq: SequenceId) -> Result<(), weir::CheckpointError> {
        let mut ckpt = self.factory.create(seq);
        self.window.checkpoint(&mut ckpt)?;
        self.factory.commit(ckpt)
    }

    fn reset(&mut self, seq: SequenceId) -> Result<(), weir::CheckpointError> {
        let mut ckpt = self.factory.open(seq)?;
        self.window.reset(&mut ckpt)
    }
}

fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("condition not met within the timeout");
}

#[test]
fn drain_checkpoint_reset_cycle() {
    let _ = tracing_subscriber::fmt::try_init();
    let config = RuntimeConfig::default();
    let coordinator = Arc::new(Coordinator::default());
    let service = Arc::new(RegionService::new(coordinator.clone(), &config.region));

    let region = 5;
    let operators: Vec<Arc<Mutex<Operator>>> = (0..2)
        .map(|op| {
            service.register_operator(&Ctx {
                region,
                operator: op,
            });
            let store = Arc::new(MemoryStore::new()) as Arc<dyn StateStore>;
            Arc::new(Mutex::new(Operator::new(store, &config)))
        })
        .collect();

    // tuples arrive at both operators
    for (i, operator) in operators.iter().enumerate() {
        let mut operator = operator.lock();
        for t in 0..5 {
            operator.window.insert(&(t % 2), format!("op{i}-tuple{t}"));
        }
    }

    // drain phase: both operators finish in-flight work
    let seq = 100;
    for (op, operator) in operators.iter().enumerate() {
        operator.lock().window.drain();
        service.drain_completed(region, seq, op as u32).unwrap();
    }
    assert_eq!(coordinator.drains.load(Ordering::SeqCst), 1);

    // checkpoint phase runs on the worker pool
    for (op, operator) in operators.iter().enumerate() {
        let operator = operator.clone();
        service
            .enqueue_checkpoint(region, seq, op as u32, move |seq| {
                operator.lock().checkpoint(seq)
            })
            .unwrap();
    }
    wait_until(|| coordinator.durable.load(Ordering::SeqCst) == seq);
    assert_eq!(coordinator.blocking.load(Ordering::SeqCst), 1);

    // post-checkpoint traffic that the rollback must undo
    let diverged: Vec<u64> = operators
        .iter()
        .map(|operator| {
            let mut operator = operator.lock();
            operator.window.insert(&9, "post-checkpoint".to_string());
            assert_eq!(operator.window.tuple_count(&9), 1);
            operator.window.state_hash()
        })
        .collect();

    // a failure triggers a reset back to sequence 100
    for (op, operator) in operators.iter().enumerate() {
        let operator = operator.clone();
        service
            .enqueue_reset(region, seq, 0, op as u32, move |seq, _attempt| {
                operator.lock().reset(seq)
            })
            .unwrap();
    }
    wait_until(|| coordinator.resets.load(Ordering::SeqCst) == 1);

    for (operator, before) in operators.iter().zip(diverged) {
        let operator = operator.lock();
        assert_eq!(operator.window.tuple_count(&9), 0, "rollback dropped key 9");
        assert_eq!(operator.window.tuple_count(&0), 3);
        assert_eq!(operator.window.tuple_count(&1), 2);
        assert_ne!(operator.window.state_hash(), before);
    }
}

#[test]
fn non_blocking_operator_unblocks_submission_early() {
    let config = RuntimeConfig::default();
    let coordinator = Arc::new(Coordinator::default());
    let service = Arc::new(RegionService::new(coordinator.clone(), &config.region));

    let region = 1;
    for op in 0..3 {
        service.register_operator(&Ctx {
            region,
            operator: op,
        });
    }
    service
        .enable_non_blocking_checkpoint(&Ctx {
            region,
            operator: 2,
        })
        .unwrap();

    let seq = 7;
    service.checkpoint_completed(region, seq, 0).unwrap();
    service.checkpoint_completed(region, seq, 1).unwrap();
    // blocking set done: submission resumes before operator 2 lands
    assert_eq!(coordinator.blocking.load(Ordering::SeqCst), 1);
    assert_eq!(coordinator.durable.load(Ordering::SeqCst), 0);
    service.checkpoint_completed(region, seq, 2).unwrap();
    assert_eq!(coordinator.durable.load(Ordering::SeqCst), seq);
}
