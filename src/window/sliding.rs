//! Sliding windows: continuous per-partition panes with trigger firing.
//!
//! Unlike tumbling windows there is no discrete per-partition state machine:
//! every insert runs the window's facets in declared order, which evict old
//! tuples from the pane front and decide whether to fire a trigger output.
//! Triggers never clear the pane.
//!
//! A window with a time trigger runs one dedicated thread that periodically
//! fires a trigger for every partition; checkpoint and reset suspend that
//! thread for their whole duration through a scoped guard.

use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::eviction::{EvictionSelector, PartitionEviction, PartitionEvictionPolicy};
use super::facet::{
    CountEviction, CountTrigger, DeltaEviction, DeltaExtractor, DeltaTrigger, Entry, Pane,
    TimeEviction, TimeTrigger, WindowFacet,
};
use super::{
    now_secs, OutputCause, PartitionStorage, WindowData, WindowKey, WindowOutput,
};
use crate::checkpoint::{Checkpoint, CheckpointError, StateHandler};
use crate::config::ConfigurationError;

enum FacetSpec<T> {
    EvictCount(usize),
    EvictTime(u64),
    EvictDelta {
        threshold: f64,
        extract: DeltaExtractor<T>,
    },
    TriggerCount(u64),
    TriggerTime(Duration),
    TriggerDelta {
        threshold: f64,
        extract: DeltaExtractor<T>,
    },
}

/// Description of a sliding window: an ordered list of facets.
///
/// The declared order is the order facets run on every insert and the order
/// they serialize into checkpoints; it must stay stable across versions of an
/// application for checkpoints to remain readable.
pub struct SlidingWindow<T> {
    specs: Vec<FacetSpec<T>>,
    partition_eviction: Option<PartitionEvictionPolicy>,
}

impl<T: WindowData> Default for SlidingWindow<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: WindowData> SlidingWindow<T> {
    pub fn new() -> Self {
        Self {
            specs: Vec::new(),
            partition_eviction: None,
        }
    }

    /// Keep only the last `size` tuples of each pane.
    pub fn evict_count(mut self, size: usize) -> Self {
        self.specs.push(FacetSpec::EvictCount(size));
        self
    }

    /// Keep only the tuples of the last `span`.
    pub fn evict_time(mut self, span: Duration) -> Self {
        self.specs.push(FacetSpec::EvictTime(span.as_secs()));
        self
    }

    /// Keep only tuples whose delta attribute is within `threshold` of the
    /// newest tuple.
    pub fn evict_delta(mut self, threshold: f64, extract: DeltaExtractor<T>) -> Self {
        self.specs
            .push(FacetSpec::EvictDelta { threshold, extract });
        self
    }

    /// Fire every `every` tuples per partition.
    pub fn trigger_count(mut self, every: u64) -> Self {
        self.specs.push(FacetSpec::TriggerCount(every));
        self
    }

    /// Fire for every partition on a timer, from a dedicated thread.
    pub fn trigger_time(mut self, period: Duration) -> Self {
        self.specs.push(FacetSpec::TriggerTime(period));
        self
    }

    /// Fire when the delta attribute moves `threshold` past the last firing.
    pub fn trigger_delta(mut self, threshold: f64, extract: DeltaExtractor<T>) -> Self {
        self.specs
            .push(FacetSpec::TriggerDelta { threshold, extract });
        self
    }

    /// Additionally evict whole partitions under memory pressure.
    pub fn with_partition_eviction(mut self, policy: PartitionEvictionPolicy) -> Self {
        self.partition_eviction = Some(policy);
        self
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.specs.is_empty() {
            return Err(ConfigurationError::PolicyMismatch(
                "a sliding window needs at least one facet".into(),
            ));
        }
        let mut time_triggers = 0;
        for spec in &self.specs {
            match spec {
                FacetSpec::EvictCount(0) => {
                    return Err(ConfigurationError::PolicyMismatch(
                        "count eviction needs a size of at least 1".into(),
                    ))
                }
                FacetSpec::EvictTime(0) => {
                    return Err(ConfigurationError::PolicyMismatch(
                        "time eviction needs a non-zero span".into(),
                    ))
                }
                FacetSpec::TriggerCount(0) => {
                    return Err(ConfigurationError::PolicyMismatch(
                        "count trigger needs a period of at least 1".into(),
                    ))
                }
                FacetSpec::EvictDelta { threshold, .. }
                | FacetSpec::TriggerDelta { threshold, .. }
                    if !threshold.is_finite() || *threshold < 0.0 =>
                {
                    return Err(ConfigurationError::PolicyMismatch(
                        "delta policies need a finite threshold >= 0".into(),
                    ))
                }
                FacetSpec::TriggerTime(period) => {
                    if period.is_zero() {
                        return Err(ConfigurationError::PolicyMismatch(
                            "time trigger needs a non-zero period".into(),
                        ));
                    }
                    time_triggers += 1;
                }
                _ => {}
            }
        }
        if time_triggers > 1 {
            return Err(ConfigurationError::PolicyMismatch(
                "at most one time trigger per window".into(),
            ));
        }
        Ok(())
    }

    /// Build the manager, spawning the trigger thread if a time trigger was
    /// declared.
    pub fn build<G: WindowKey>(&self) -> Result<SlidingWindowManager<G, T>, ConfigurationError> {
        self.validate()?;
        let mut facets: Vec<Box<dyn WindowFacet<G, T>>> = Vec::with_capacity(self.specs.len());
        let mut trigger_period = None;
        for spec in &self.specs {
            facets.push(match spec {
                FacetSpec::EvictCount(size) => Box::new(CountEviction::new(*size)),
                FacetSpec::EvictTime(span) => Box::new(TimeEviction::new(*span)),
                FacetSpec::EvictDelta { threshold, extract } => {
                    Box::new(DeltaEviction::new(*threshold, extract.clone()))
                }
                FacetSpec::TriggerCount(every) => Box::new(CountTrigger::new(*every)),
                FacetSpec::TriggerTime(period) => {
                    trigger_period = Some(*period);
                    Box::new(TimeTrigger::new(*period))
                }
                FacetSpec::TriggerDelta { threshold, extract } => {
                    Box::new(DeltaTrigger::new(*threshold, extract.clone()))
                }
            });
        }
        let inner = Arc::new(Mutex::new(SlidingInner {
            storage: PartitionStorage::new(),
            facets,
            partition_eviction: self.partition_eviction.map(PartitionEviction::new),
            selector: None,
        }));
        let trigger = trigger_period.map(|period| TriggerThread::spawn(period, inner.clone()));
        Ok(SlidingWindowManager { inner, trigger })
    }
}

struct SlidingInner<G: WindowKey, T: WindowData> {
    storage: PartitionStorage<G, Pane<T>>,
    facets: Vec<Box<dyn WindowFacet<G, T>>>,
    partition_eviction: Option<PartitionEviction>,
    selector: Option<EvictionSelector<G>>,
}

impl<G: WindowKey, T: WindowData> SlidingInner<G, T> {
    fn insert(&mut self, partition: &G, tuple: T, now: u64) -> Vec<WindowOutput<G, T>> {
        let mut out = Vec::new();
        let evict_before = self
            .partition_eviction
            .as_ref()
            .map(|pe| pe.evict_before_insertion())
            .unwrap_or(false);
        if evict_before {
            self.maybe_evict_partitions(now, &mut out);
        }

        let pane = self.storage.insert_partition(partition, Pane::new);
        let len_before = pane.len();
        let mut fire_before = false;
        for facet in &mut self.facets {
            fire_before |= facet.before_insert(partition, pane, &tuple, now);
        }
        let evicted = len_before - pane.len();
        if fire_before {
            // pre-insertion triggers see the pane without the incoming tuple
            out.push(WindowOutput::tuples(
                partition.clone(),
                OutputCause::Trigger,
                pane.iter().map(|e| e.tuple.clone()).collect(),
            ));
        }
        pane.push_back(Entry { tuple, at: now });
        let mut fire_after = false;
        for facet in &mut self.facets {
            fire_after |= facet.after_insert(partition, pane, now);
        }
        if fire_after {
            out.push(WindowOutput::tuples(
                partition.clone(),
                OutputCause::Trigger,
                pane.iter().map(|e| e.tuple.clone()).collect(),
            ));
        }
        let len = pane.len() as u64;
        self.storage.set_tuple_count(partition, len);
        if let Some(pe) = &mut self.partition_eviction {
            for _ in 0..evicted {
                pe.tuple_removed();
            }
            pe.tuple_inserted();
        }
        self.storage.touch(partition, now);
        if !evict_before {
            self.maybe_evict_partitions(now, &mut out);
        }
        out
    }

    /// Fire a trigger for every partition, as the trigger thread does on
    /// every tick.
    fn fire_all(&mut self) -> Vec<WindowOutput<G, T>> {
        self.storage
            .partitions()
            .map(|(key, pane)| {
                WindowOutput::tuples(
                    key.clone(),
                    OutputCause::Trigger,
                    pane.iter().map(|e| e.tuple.clone()).collect(),
                )
            })
            .collect()
    }

    fn eviction_needed_now(&self, now: u64) -> bool {
        match &self.partition_eviction {
            Some(pe) => pe.eviction_needed(
                self.storage.len(),
                self.storage.oldest().map(|(_, at)| at),
                now,
            ),
            None => false,
        }
    }

    fn maybe_evict_partitions(&mut self, now: u64, out: &mut Vec<WindowOutput<G, T>>) {
        if self.partition_eviction.is_none() || !self.eviction_needed_now(now) {
            return;
        }
        if self.selector.is_some() {
            let ordered: Vec<(G, u64)> = self
                .storage
                .ordered_by_last_use()
                .map(|(k, at)| (k.clone(), at))
                .collect();
            let victims = (self.selector.as_mut().unwrap())(&ordered);
            for victim in victims {
                self.evict_partition(&victim, out);
            }
        }
        while self.eviction_needed_now(now) {
            let Some((key, _)) = self.storage.oldest() else {
                break;
            };
            let key = key.clone();
            self.evict_partition(&key, out);
        }
    }

    fn evict_partition(&mut self, partition: &G, out: &mut Vec<WindowOutput<G, T>>) {
        let count = self.storage.tuple_count(partition).unwrap_or(0);
        if let Some(pane) = self.storage.remove_partition(partition) {
            if let Some(pe) = &mut self.partition_eviction {
                pe.partition_removed(count);
            }
            for facet in &mut self.facets {
                facet.remove_partition(partition);
            }
            tracing::debug!(tuples = count, "partition evicted");
            out.push(WindowOutput::tuples(
                partition.clone(),
                OutputCause::PartitionEvicted,
                pane.into_iter().map(|e| e.tuple).collect(),
            ));
        }
    }

    fn checkpoint(&mut self, ckpt: &mut Checkpoint) -> Result<(), CheckpointError> {
        ckpt.write_marker("sliding");
        self.storage.checkpoint(ckpt)?;
        ckpt.write_vu64(self.facets.len() as u64);
        for facet in &self.facets {
            facet.checkpoint(ckpt)?;
        }
        match &self.partition_eviction {
            Some(pe) => {
                ckpt.write_bool(true);
                pe.checkpoint(ckpt)?;
            }
            None => ckpt.write_bool(false),
        }
        Ok(())
    }

    fn reset(&mut self, ckpt: &mut Checkpoint) -> Result<(), CheckpointError> {
        ckpt.verify_marker("sliding")?;
        self.storage.reset(ckpt)?;
        let facets = ckpt.read_vu64()? as usize;
        if facets != self.facets.len() {
            return Err(CheckpointError::MarkerMismatch {
                expected: format!("{} facets", self.facets.len()),
                found: format!("{facets} facets"),
            });
        }
        for facet in &mut self.facets {
            facet.reset(ckpt)?;
        }
        if ckpt.read_bool()? {
            if let Some(pe) = &mut self.partition_eviction {
                pe.reset(ckpt)?;
            }
        }
        Ok(())
    }

    fn reset_to_initial_state(&mut self) {
        self.storage.clear();
        for facet in &mut self.facets {
            facet.reset_to_initial_state();
        }
        if let Some(pe) = &mut self.partition_eviction {
            pe.reset_to_initial_state();
        }
    }

    fn state_hash(&self) -> u64 {
        let mut result = 0xcbf29ce484222325u64;
        for (key, pane) in self.storage.partitions() {
            let bytes = bincode::serde::encode_to_vec(
                (key, pane.len() as u64),
                bincode::config::standard(),
            )
            .unwrap_or_default();
            result ^= fxhash::hash64(&bytes);
        }
        for facet in &self.facets {
            result ^= facet.state_hash();
        }
        result
    }
}

#[derive(Debug, Default)]
struct TriggerState {
    suspended: bool,
    firing: bool,
    shutdown: bool,
}

#[derive(Debug, Default)]
struct TriggerShared {
    state: Mutex<TriggerState>,
    cv: Condvar,
}

struct TriggerThread<G: WindowKey, T: WindowData> {
    shared: Arc<TriggerShared>,
    rx: flume::Receiver<WindowOutput<G, T>>,
    handle: Option<JoinHandle<()>>,
}

impl<G: WindowKey, T: WindowData> TriggerThread<G, T> {
    fn spawn(period: Duration, inner: Arc<Mutex<SlidingInner<G, T>>>) -> Self {
        let shared = Arc::new(TriggerShared::default());
        let (tx, rx) = flume::unbounded();
        let thread_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("window-trigger".to_string())
            .spawn(move || {
                tracing::debug!("trigger thread started");
                loop {
                    {
                        let mut state = thread_shared.state.lock();
                        let _ = thread_shared.cv.wait_for(&mut state, period);
                        if state.shutdown {
                            break;
                        }
                        if state.suspended {
                            continue;
                        }
                        state.firing = true;
                    }
                    let outputs = inner.lock().fire_all();
                    for output in outputs {
                        if tx.send(output).is_err() {
                            break;
                        }
                    }
                    let mut state = thread_shared.state.lock();
                    state.firing = false;
                    thread_shared.cv.notify_all();
                }
                tracing::debug!("trigger thread exiting");
            })
            .expect("failed to spawn trigger thread");
        Self {
            shared,
            rx,
            handle: Some(handle),
        }
    }

    fn suspend(&self) -> TriggerSuspension<'_> {
        TriggerSuspension::acquire(&self.shared)
    }
}

impl<G: WindowKey, T: WindowData> Drop for TriggerThread<G, T> {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.shared.cv.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Scoped suspension of a window's trigger thread.
///
/// While alive the thread neither starts nor is in the middle of a firing;
/// dropping the guard resumes it, on every exit path.
pub struct TriggerSuspension<'a> {
    shared: &'a TriggerShared,
}

impl<'a> TriggerSuspension<'a> {
    fn acquire(shared: &'a TriggerShared) -> Self {
        let mut state = shared.state.lock();
        state.suspended = true;
        shared.cv.notify_all();
        // wait out a firing already in flight
        while state.firing {
            shared.cv.wait(&mut state);
        }
        Self { shared }
    }
}

impl Drop for TriggerSuspension<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.suspended = false;
        self.shared.cv.notify_all();
    }
}

/// A sliding window over partitioned tuples.
pub struct SlidingWindowManager<G: WindowKey, T: WindowData> {
    inner: Arc<Mutex<SlidingInner<G, T>>>,
    trigger: Option<TriggerThread<G, T>>,
}

impl<G: WindowKey, T: WindowData> SlidingWindowManager<G, T> {
    /// Route one tuple into its partition's pane, returning trigger and
    /// eviction outputs.
    pub fn insert(&mut self, partition: &G, tuple: T) -> Vec<WindowOutput<G, T>> {
        let now = now_secs();
        self.inner.lock().insert(partition, tuple, now)
    }

    /// Install a callback choosing which partitions to evict.
    pub fn set_eviction_selector(&mut self, selector: EvictionSelector<G>) {
        self.inner.lock().selector = Some(selector);
    }

    /// Outputs fired by the time-trigger thread, if the window has one.
    pub fn trigger_outputs(&self) -> Option<&flume::Receiver<WindowOutput<G, T>>> {
        self.trigger.as_ref().map(|t| &t.rx)
    }

    /// Suspend the trigger thread until the returned guard drops. `None` for
    /// windows without a time trigger.
    pub fn suspend_triggers(&self) -> Option<TriggerSuspension<'_>> {
        self.trigger.as_ref().map(|t| t.suspend())
    }

    pub fn partition_count(&self) -> usize {
        self.inner.lock().storage.len()
    }

    pub fn tuple_count(&self, partition: &G) -> u64 {
        self.inner.lock().storage.tuple_count(partition).unwrap_or(0)
    }

    /// Snapshot of a partition's retained tuples.
    pub fn pane(&self, partition: &G) -> Vec<T> {
        self.inner
            .lock()
            .storage
            .partition_at(partition)
            .map(|pane| pane.iter().map(|e| e.tuple.clone()).collect())
            .unwrap_or_default()
    }

    /// Aggregate tuple count tracked by the partition eviction policy.
    pub fn tracked_tuple_count(&self) -> u64 {
        let inner = self.inner.lock();
        inner
            .partition_eviction
            .as_ref()
            .map(|pe| pe.current_tuple_count())
            .unwrap_or_else(|| inner.storage.total_tuple_count())
    }

    /// Order-independent digest of pane sizes and facet state.
    pub fn state_hash(&self) -> u64 {
        self.inner.lock().state_hash()
    }
}

impl<G: WindowKey, T: WindowData> Display for SlidingWindowManager<G, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        write!(
            f,
            "SlidingWindowManager<({}, {}), [",
            std::any::type_name::<G>(),
            std::any::type_name::<T>(),
        )?;
        for (i, facet) in inner.facets.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", facet.describe())?;
        }
        write!(f, "]>")
    }
}

impl<G: WindowKey, T: WindowData> StateHandler for SlidingWindowManager<G, T> {
    fn checkpoint(&mut self, ckpt: &mut Checkpoint) -> Result<(), CheckpointError> {
        let _suspended = self.suspend_triggers();
        self.inner.lock().checkpoint(ckpt)
    }

    fn reset(&mut self, ckpt: &mut Checkpoint) -> Result<(), CheckpointError> {
        let _suspended = self.suspend_triggers();
        let mut inner = self.inner.lock();
        inner.reset_to_initial_state();
        inner.reset(ckpt)
    }

    fn reset_to_initial_state(&mut self) {
        let _suspended = self.suspend_triggers();
        self.inner.lock().reset_to_initial_state();
    }

    fn drain(&mut self) {
        // nothing buffered outside the panes; suspending the trigger thread
        // for the bracket is the caller's checkpoint/reset guard
    }
}
