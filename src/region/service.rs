//! The per-PE consistent-region service.
//!
//! Operator threads report drain/checkpoint/reset completions here; the
//! service aggregates them per region and notifies the job coordinator when a
//! phase completes. Checkpoint and reset work items are executed on the
//! bounded [`WorkerPool`] so completion notifications never block the
//! operator thread that triggered them.

use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::Mutex;

use super::info::RegionInfo;
use super::{RegionError, WorkerPool};
use crate::checkpoint::CheckpointError;
use crate::config::RegionConfig;
use crate::{OperatorIndex, RegionIndex, SequenceId};

/// What a registering operator exposes to the service.
pub trait OperatorContext {
    /// Index of the consistent region the operator participates in.
    fn region_index(&self) -> RegionIndex;
    /// Index of the operator within its PE.
    fn operator_index(&self) -> OperatorIndex;
}

/// Outbound notification contract towards the job coordinator.
///
/// Each method mirrors a named remote invocation with a fixed positional
/// argument schema; implementations are expected to be cheap or to hand off
/// to their own transport.
pub trait RegionNotifier: Send + Sync + 'static {
    /// Every operator of the region drained `seq_id`: tuple submission may
    /// resume and the checkpoint phase is unblocked.
    fn drain_completed(&self, seq_id: SequenceId, region: RegionIndex);
    /// All blocking operators checkpointed `seq_id`; non-blocking
    /// checkpoints may still be in flight.
    fn blocking_checkpoint_completed(&self, seq_id: SequenceId, region: RegionIndex);
    /// Every operator checkpointed `seq_id`: the sequence is durable.
    fn checkpoint_completed(&self, seq_id: SequenceId, region: RegionIndex);
    /// Every operator finished reset attempt `attempt` of `seq_id`.
    fn reset_completed(&self, seq_id: SequenceId, region: RegionIndex, attempt: i32);
    /// A queued checkpoint work item failed.
    fn checkpoint_failed(&self, _seq_id: SequenceId, _region: RegionIndex, _error: &CheckpointError) {
    }
    /// A queued reset work item failed; the coordinator decides whether to
    /// retry with a higher attempt.
    fn reset_failed(
        &self,
        _seq_id: SequenceId,
        _region: RegionIndex,
        _attempt: i32,
        _error: &CheckpointError,
    ) {
    }
}

pub struct RegionService {
    /// Region index -> bookkeeping; entries are created lazily on first
    /// registration and never removed until PE shutdown.
    regions: Mutex<FxHashMap<RegionIndex, Arc<Mutex<RegionInfo>>>>,
    notifier: Arc<dyn RegionNotifier>,
    pool: WorkerPool,
}

impl RegionService {
    pub fn new(notifier: Arc<dyn RegionNotifier>, config: &RegionConfig) -> Self {
        Self {
            regions: Mutex::new(FxHashMap::default()),
            notifier,
            pool: WorkerPool::new(config.workers, config.queue_capacity),
        }
    }

    /// Register an operator as a participant of its consistent region,
    /// creating the region bookkeeping on first use.
    pub fn register_operator(&self, ctx: &dyn OperatorContext) {
        let region = ctx.region_index();
        let info = self
            .regions
            .lock()
            .entry(region)
            .or_insert_with(|| Arc::new(Mutex::new(RegionInfo::new())))
            .clone();
        let mut info = info.lock();
        info.register(ctx.operator_index());
        tracing::debug!(
            region,
            operator = ctx.operator_index(),
            participants = info.num_operators(),
            "registered consistent operator"
        );
    }

    /// Mark an operator as checkpointing non-blockingly: tuple submission
    /// resumes once all *blocking* operators completed.
    pub fn enable_non_blocking_checkpoint(
        &self,
        ctx: &dyn OperatorContext,
    ) -> Result<(), RegionError> {
        let info = self.region(ctx.region_index())?;
        let mut info = info.lock();
        if !info.is_registered(ctx.operator_index()) {
            return Err(RegionError::UnknownOperator {
                region: ctx.region_index(),
                operator: ctx.operator_index(),
            });
        }
        info.enable_non_blocking(ctx.operator_index());
        Ok(())
    }

    fn region(&self, region: RegionIndex) -> Result<Arc<Mutex<RegionInfo>>, RegionError> {
        self.regions
            .lock()
            .get(&region)
            .cloned()
            .ok_or(RegionError::UnknownRegion(region))
    }

    /// An operator finished draining `seq_id`.
    pub fn drain_completed(
        &self,
        region: RegionIndex,
        seq_id: SequenceId,
        operator: OperatorIndex,
    ) -> Result<(), RegionError> {
        let info = self.region(region)?;
        let completed = info.lock().drain_completed(seq_id, operator);
        if completed {
            tracing::debug!(region, seq_id, "drain completed");
            self.notifier.drain_completed(seq_id, region);
        }
        Ok(())
    }

    /// An operator finished checkpointing `seq_id`.
    pub fn checkpoint_completed(
        &self,
        region: RegionIndex,
        seq_id: SequenceId,
        operator: OperatorIndex,
    ) -> Result<(), RegionError> {
        let info = self.region(region)?;
        let progress = info.lock().checkpoint_completed(seq_id, operator);
        if progress.blocking_just_completed {
            tracing::debug!(region, seq_id, "blocking checkpoints completed");
            self.notifier.blocking_checkpoint_completed(seq_id, region);
        }
        if progress.all_just_completed {
            tracing::debug!(region, seq_id, "checkpoint completed");
            self.notifier.checkpoint_completed(seq_id, region);
        }
        Ok(())
    }

    /// An operator finished reset attempt `attempt` of `seq_id`.
    pub fn reset_completed(
        &self,
        region: RegionIndex,
        seq_id: SequenceId,
        attempt: i32,
        operator: OperatorIndex,
    ) -> Result<(), RegionError> {
        let info = self.region(region)?;
        let completed = info.lock().reset_completed(seq_id, attempt, operator);
        if completed {
            tracing::debug!(region, seq_id, attempt, "reset completed");
            self.notifier.reset_completed(seq_id, region, attempt);
        }
        Ok(())
    }

    /// Gate for queued checkpoint work: false when a newer sequence id or a
    /// pending reset made `seq_id` stale. Checked and acted on atomically
    /// with the tallies by running under the same region lock.
    pub fn should_proceed_with_checkpoint(&self, region: RegionIndex, seq_id: SequenceId) -> bool {
        match self.region(region) {
            Ok(info) => info.lock().should_proceed_with_checkpoint(seq_id),
            Err(_) => false,
        }
    }

    /// Gate for queued reset work, keyed by `(seq_id, attempt)`.
    pub fn should_proceed_with_reset(
        &self,
        region: RegionIndex,
        seq_id: SequenceId,
        attempt: i32,
    ) -> bool {
        match self.region(region) {
            Ok(info) => info.lock().should_proceed_with_reset(seq_id, attempt),
            Err(_) => false,
        }
    }

    /// Begin a reset cycle, superseding queued checkpoints and older
    /// attempts.
    pub fn begin_reset(
        &self,
        region: RegionIndex,
        seq_id: SequenceId,
        attempt: i32,
    ) -> Result<(), RegionError> {
        let info = self.region(region)?;
        info.lock().begin_reset(seq_id, attempt);
        Ok(())
    }

    /// Run an operator's checkpoint on the worker pool. The work item
    /// re-checks the stale gate right before running, then reports its own
    /// completion; a stale item is skipped silently.
    pub fn enqueue_checkpoint<F>(
        self: &Arc<Self>,
        region: RegionIndex,
        seq_id: SequenceId,
        operator: OperatorIndex,
        work: F,
    ) -> Result<(), RegionError>
    where
        F: FnOnce(SequenceId) -> Result<(), CheckpointError> + Send + 'static,
    {
        // fail fast on an unknown region instead of from the worker
        self.region(region)?;
        let service = self.clone();
        self.pool.execute(move || {
            if !service.should_proceed_with_checkpoint(region, seq_id) {
                tracing::debug!(region, seq_id, "checkpoint stage skipped");
                return;
            }
            match work(seq_id) {
                Ok(()) => {
                    let _ = service.checkpoint_completed(region, seq_id, operator);
                }
                Err(error) => {
                    tracing::error!(region, seq_id, %error, "checkpoint stage failed");
                    service.notifier.checkpoint_failed(seq_id, region, &error);
                }
            }
        })
    }

    /// Run an operator's reset on the worker pool, keyed by
    /// `(seq_id, attempt)`.
    pub fn enqueue_reset<F>(
        self: &Arc<Self>,
        region: RegionIndex,
        seq_id: SequenceId,
        attempt: i32,
        operator: OperatorIndex,
        work: F,
    ) -> Result<(), RegionError>
    where
        F: FnOnce(SequenceId, i32) -> Result<(), CheckpointError> + Send + 'static,
    {
        self.begin_reset(region, seq_id, attempt)?;
        let service = self.clone();
        self.pool.execute(move || {
            if !service.should_proceed_with_reset(region, seq_id, attempt) {
                tracing::debug!(region, seq_id, attempt, "reset stage skipped");
                return;
            }
            match work(seq_id, attempt) {
                Ok(()) => {
                    let _ = service.reset_completed(region, seq_id, attempt, operator);
                }
                Err(error) => {
                    tracing::error!(region, seq_id, attempt, %error, "reset stage failed");
                    service.notifier.reset_failed(seq_id, region, attempt, &error);
                }
            }
        })
    }

    /// Latest fully completed checkpoint sequence of a region.
    pub fn last_completed_checkpoint(&self, region: RegionIndex) -> Result<SequenceId, RegionError> {
        Ok(self.region(region)?.lock().last_completed_checkpoint())
    }

    /// Stop the worker pool, draining queued work.
    pub fn shutdown(&mut self) {
        self.pool.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    struct Ctx(RegionIndex, OperatorIndex);

    impl OperatorContext for Ctx {
        fn region_index(&self) -> RegionIndex {
            self.0
        }

        fn operator_index(&self) -> OperatorIndex {
            self.1
        }
    }

    #[derive(Default)]
    struct CountingNotifier {
        drains: AtomicUsize,
        blocking: AtomicUsize,
        checkpoints: AtomicUsize,
        resets: AtomicUsize,
        failures: AtomicUsize,
    }

    impl RegionNotifier for CountingNotifier {
        fn drain_completed(&self, _seq_id: SequenceId, _region: RegionIndex) {
            self.drains.fetch_add(1, Ordering::SeqCst);
        }

        fn blocking_checkpoint_completed(&self, _seq_id: SequenceId, _region: RegionIndex) {
            self.blocking.fetch_add(1, Ordering::SeqCst);
        }

        fn checkpoint_completed(&self, _seq_id: SequenceId, _region: RegionIndex) {
            self.checkpoints.fetch_add(1, Ordering::SeqCst);
        }

        fn reset_completed(&self, _seq_id: SequenceId, _region: RegionIndex, _attempt: i32) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }

        fn checkpoint_failed(
            &self,
            _seq_id: SequenceId,
            _region: RegionIndex,
            _error: &CheckpointError,
        ) {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn service() -> (Arc<RegionService>, Arc<CountingNotifier>) {
        let notifier = Arc::new(CountingNotifier::default());
        let service = Arc::new(RegionService::new(
            notifier.clone(),
            &RegionConfig::default(),
        ));
        (service, notifier)
    }

    #[test]
    fn three_operators_drain_signals_once() {
        let (service, notifier) = service();
        for op in 0..3 {
            service.register_operator(&Ctx(5, op));
        }
        for op in 0..3 {
            service.drain_completed(5, 100, op).unwrap();
        }
        assert_eq!(notifier.drains.load(Ordering::SeqCst), 1);
        // repeated completions change nothing
        service.drain_completed(5, 100, 2).unwrap();
        assert_eq!(notifier.drains.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn blocking_then_full_completion() {
        let (service, notifier) = service();
        for op in 0..3 {
            service.register_operator(&Ctx(1, op));
        }
        service.enable_non_blocking_checkpoint(&Ctx(1, 2)).unwrap();

        service.checkpoint_completed(1, 9, 0).unwrap();
        assert_eq!(notifier.blocking.load(Ordering::SeqCst), 0);
        service.checkpoint_completed(1, 9, 1).unwrap();
        // submission may resume while the non-blocking checkpoint runs
        assert_eq!(notifier.blocking.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.checkpoints.load(Ordering::SeqCst), 0);
        service.checkpoint_completed(1, 9, 2).unwrap();
        assert_eq!(notifier.checkpoints.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_region_is_an_error() {
        let (service, _) = service();
        assert_eq!(
            service.drain_completed(42, 1, 0),
            Err(RegionError::UnknownRegion(42))
        );
        assert!(!service.should_proceed_with_checkpoint(42, 1));
    }

    #[test]
    fn unregistered_operator_cannot_go_non_blocking() {
        let (service, _) = service();
        service.register_operator(&Ctx(1, 0));
        assert_eq!(
            service.enable_non_blocking_checkpoint(&Ctx(1, 7)),
            Err(RegionError::UnknownOperator {
                region: 1,
                operator: 7
            })
        );
    }

    #[test]
    fn enqueued_checkpoints_run_and_complete() {
        let (service, notifier) = service();
        service.register_operator(&Ctx(3, 0));
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        service
            .enqueue_checkpoint(3, 11, 0, move |seq| {
                assert_eq!(seq, 11);
                ran2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        wait_until(|| notifier.checkpoints.load(Ordering::SeqCst) == 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stale_enqueued_checkpoint_is_skipped() {
        let (service, notifier) = service();
        service.register_operator(&Ctx(3, 0));
        // sequence 12 completes first, making 11 stale
        service.checkpoint_completed(3, 12, 0).unwrap();
        assert_eq!(notifier.checkpoints.load(Ordering::SeqCst), 1);

        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        service
            .enqueue_checkpoint(3, 11, 0, move |_| {
                ran2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        // give the pool time to dequeue and skip the stale item
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(notifier.checkpoints.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_checkpoint_reports_and_does_not_complete() {
        let (service, notifier) = service();
        service.register_operator(&Ctx(3, 0));
        service
            .enqueue_checkpoint(3, 11, 0, |_| {
                Err(CheckpointError::Store("backend offline".into()))
            })
            .unwrap();
        wait_until(|| notifier.failures.load(Ordering::SeqCst) == 1);
        assert_eq!(notifier.checkpoints.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reset_retry_supersedes_previous_attempt() {
        let (service, notifier) = service();
        service.register_operator(&Ctx(2, 0));
        service.register_operator(&Ctx(2, 1));

        service.begin_reset(2, 5, 0).unwrap();
        service.reset_completed(2, 5, 0, 0).unwrap();
        // the first attempt fails; a retry bumps the attempt counter
        service.begin_reset(2, 5, 1).unwrap();
        service.reset_completed(2, 5, 1, 0).unwrap();
        // stale completion from attempt 0 is silently absorbed
        service.reset_completed(2, 5, 0, 1).unwrap();
        assert_eq!(notifier.resets.load(Ordering::SeqCst), 0);
        service.reset_completed(2, 5, 1, 1).unwrap();
        assert_eq!(notifier.resets.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn enqueued_reset_runs_gated() {
        let (service, notifier) = service();
        service.register_operator(&Ctx(4, 0));
        service
            .enqueue_reset(4, 6, 0, 0, |seq, attempt| {
                assert_eq!((seq, attempt), (6, 0));
                Ok(())
            })
            .unwrap();
        wait_until(|| notifier.resets.load(Ordering::SeqCst) == 1);
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
}
