//! Tumbling windows: accumulate per partition, flush and clear atomically.
//!
//! Each partition moves through `EMPTY -> ACCUMULATING -> FLUSH -> EMPTY`:
//! a flush zeroes the partition's tuple counter, emits the flush output and
//! removes the partition, so the next tuple for that key starts a fresh
//! window. Summarization mode takes the same transitions on aggregate state
//! instead of a retained tuple sequence.

use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::marker::PhantomData;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::eviction::{EvictionSelector, PartitionEviction, PartitionEvictionPolicy};
use super::facet::DeltaExtractor;
use super::{now_secs, OutputCause, WindowAccumulator, WindowData, WindowKey, WindowOutput};
use crate::checkpoint::{Checkpoint, CheckpointError, StateHandler};
use crate::config::ConfigurationError;

/// When a tumbling partition's accumulated contents are flushed.
#[derive(Derivative)]
#[derivative(Debug)]
pub enum EvictionPolicy<T> {
    /// Flush once the partition holds this many tuples.
    Count(u64),
    /// Flush once the partition's window has been open this long.
    Time(Duration),
    /// Flush when an incoming tuple's delta attribute moves more than
    /// `threshold` past the first tuple of the window.
    Delta {
        threshold: f64,
        #[derivative(Debug = "ignore")]
        extract: DeltaExtractor<T>,
    },
    /// Flush every partition on punctuation.
    Punctuation,
}

impl<T> Clone for EvictionPolicy<T> {
    fn clone(&self) -> Self {
        match self {
            EvictionPolicy::Count(n) => EvictionPolicy::Count(*n),
            EvictionPolicy::Time(d) => EvictionPolicy::Time(*d),
            EvictionPolicy::Delta { threshold, extract } => EvictionPolicy::Delta {
                threshold: *threshold,
                extract: extract.clone(),
            },
            EvictionPolicy::Punctuation => EvictionPolicy::Punctuation,
        }
    }
}

impl<T> EvictionPolicy<T> {
    fn validate(&self) -> Result<(), ConfigurationError> {
        match self {
            EvictionPolicy::Count(0) => Err(ConfigurationError::PolicyMismatch(
                "count eviction needs a size of at least 1".into(),
            )),
            EvictionPolicy::Time(span) if span.is_zero() => Err(
                ConfigurationError::PolicyMismatch("time eviction needs a non-zero span".into()),
            ),
            EvictionPolicy::Delta { threshold, .. }
                if !threshold.is_finite() || *threshold < 0.0 =>
            {
                Err(ConfigurationError::PolicyMismatch(
                    "delta eviction needs a finite threshold >= 0".into(),
                ))
            }
            _ => Ok(()),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            EvictionPolicy::Count(_) => "count",
            EvictionPolicy::Time(_) => "time",
            EvictionPolicy::Delta { .. } => "delta",
            EvictionPolicy::Punctuation => "punctuation",
        }
    }
}

/// [`WindowAccumulator`] used by retaining windows, which keep the raw tuples
/// instead of a summary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Discard<T>(PhantomData<T>);

impl<T> Default for Discard<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T: Clone + Send + 'static> WindowAccumulator for Discard<T> {
    type In = T;
    type Out = ();

    fn process(&mut self, _el: Self::In) {}

    fn output(self) -> Self::Out {}
}

/// One partition's accumulated state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct TumblingPane<T, A> {
    contents: Contents<T, A>,
    /// When the first tuple of this window arrived, seconds.
    opened: u64,
    /// Delta attribute of the first tuple, for delta eviction.
    baseline: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
enum Contents<T, A> {
    Tuples(VecDeque<T>),
    Summary(A),
}

/// Description of a tumbling window, built into a manager per operator.
#[derive(Clone)]
pub struct TumblingWindow<T> {
    eviction: EvictionPolicy<T>,
    partition_eviction: Option<PartitionEvictionPolicy>,
}

impl<T: WindowData> TumblingWindow<T> {
    pub fn count(size: u64) -> Self {
        Self {
            eviction: EvictionPolicy::Count(size),
            partition_eviction: None,
        }
    }

    pub fn time(span: Duration) -> Self {
        Self {
            eviction: EvictionPolicy::Time(span),
            partition_eviction: None,
        }
    }

    pub fn delta(threshold: f64, extract: DeltaExtractor<T>) -> Self {
        Self {
            eviction: EvictionPolicy::Delta { threshold, extract },
            partition_eviction: None,
        }
    }

    pub fn punctuation() -> Self {
        Self {
            eviction: EvictionPolicy::Punctuation,
            partition_eviction: None,
        }
    }

    /// Additionally evict whole partitions under memory pressure.
    pub fn with_partition_eviction(mut self, policy: PartitionEvictionPolicy) -> Self {
        self.partition_eviction = Some(policy);
        self
    }

    /// Build a manager that retains the tuples of each window.
    pub fn retain<G: WindowKey>(
        &self,
    ) -> Result<TumblingWindowManager<G, T, Discard<T>>, ConfigurationError> {
        self.eviction.validate()?;
        Ok(TumblingWindowManager::new(
            self.eviction.clone(),
            None,
            self.partition_eviction,
        ))
    }

    /// Build a manager that keeps only the aggregate of each window.
    pub fn summarize<G: WindowKey, A: WindowAccumulator<In = T>>(
        &self,
        init: A,
    ) -> Result<TumblingWindowManager<G, T, A>, ConfigurationError> {
        self.eviction.validate()?;
        Ok(TumblingWindowManager::new(
            self.eviction.clone(),
            Some(init),
            self.partition_eviction,
        ))
    }
}

pub struct TumblingWindowManager<G: WindowKey, T: WindowData, A: WindowAccumulator<In = T>> {
    eviction: EvictionPolicy<T>,
    /// Template accumulator for new partitions; `None` retains raw tuples.
    summarize: Option<A>,
    storage: super::PartitionStorage<G, TumblingPane<T, A>>,
    partition_eviction: Option<PartitionEviction>,
    selector: Option<EvictionSelector<G>>,
}

impl<G: WindowKey, T: WindowData, A: WindowAccumulator<In = T>> TumblingWindowManager<G, T, A> {
    fn new(
        eviction: EvictionPolicy<T>,
        summarize: Option<A>,
        partition_eviction: Option<PartitionEvictionPolicy>,
    ) -> Self {
        Self {
            eviction,
            summarize,
            storage: super::PartitionStorage::new(),
            partition_eviction: partition_eviction.map(PartitionEviction::new),
            selector: None,
        }
    }

    /// Install a callback choosing which partitions to evict; without one the
    /// least recently used partitions go first.
    pub fn set_eviction_selector(&mut self, selector: EvictionSelector<G>) {
        self.selector = Some(selector);
    }

    pub fn partition_count(&self) -> usize {
        self.storage.len()
    }

    /// Tuples accumulated for a partition; 0 if the partition does not exist.
    pub fn tuple_count(&self, partition: &G) -> u64 {
        self.storage.tuple_count(partition).unwrap_or(0)
    }

    /// Aggregate tuple count tracked by the partition eviction policy.
    pub fn tracked_tuple_count(&self) -> u64 {
        self.partition_eviction
            .as_ref()
            .map(|pe| pe.current_tuple_count())
            .unwrap_or_else(|| self.storage.total_tuple_count())
    }

    /// Route one tuple into its partition's window.
    pub fn insert(&mut self, partition: &G, tuple: T) -> Vec<WindowOutput<G, T, A::Out>> {
        let now = now_secs();
        let mut out = Vec::new();
        let evict_before = self
            .partition_eviction
            .as_ref()
            .map(|pe| pe.evict_before_insertion())
            .unwrap_or(false);
        if evict_before {
            self.maybe_evict_partitions(now, &mut out);
        }

        // delta and time policies close the current window before the
        // incoming tuple, which then opens a fresh one
        let close_first = match &self.eviction {
            EvictionPolicy::Delta { threshold, extract } => self
                .storage
                .partition_at(partition)
                .ok()
                .and_then(|pane| pane.baseline)
                .map(|baseline| extract(&tuple) - baseline > *threshold)
                .unwrap_or(false),
            EvictionPolicy::Time(span) => self
                .storage
                .partition_at(partition)
                .ok()
                .map(|pane| pane.opened + span.as_secs() <= now)
                .unwrap_or(false),
            _ => false,
        };
        if close_first {
            self.flush(partition, &mut out);
        }

        let summarize = self.summarize.clone();
        let pane = self.storage.insert_partition(partition, || TumblingPane {
            contents: match summarize {
                Some(init) => Contents::Summary(init),
                None => Contents::Tuples(VecDeque::new()),
            },
            opened: now,
            baseline: None,
        });
        match &mut pane.contents {
            Contents::Tuples(tuples) => tuples.push_back(tuple.clone()),
            Contents::Summary(acc) => acc.process(tuple.clone()),
        }
        if pane.baseline.is_none() {
            if let EvictionPolicy::Delta { extract, .. } = &self.eviction {
                pane.baseline = Some(extract(&tuple));
            }
        }
        let count = self.storage.increment_tuple_count(partition);
        if let Some(pe) = &mut self.partition_eviction {
            pe.tuple_inserted();
        }
        self.storage.touch(partition, now);
        if !evict_before {
            self.maybe_evict_partitions(now, &mut out);
        }

        if let EvictionPolicy::Count(size) = self.eviction {
            if count >= size {
                self.flush(partition, &mut out);
            }
        }
        out
    }

    /// Handle a punctuation: flushes every partition of a punctuation-based
    /// window, ignored otherwise.
    pub fn insert_punct(&mut self) -> Vec<WindowOutput<G, T, A::Out>> {
        let mut out = Vec::new();
        if !matches!(self.eviction, EvictionPolicy::Punctuation) {
            return out;
        }
        let keys: Vec<G> = self.storage.partitions().map(|(k, _)| k.clone()).collect();
        for key in keys {
            self.flush(&key, &mut out);
        }
        out
    }

    /// Flush the partitions of a time-based window whose span elapsed.
    pub fn advance(&mut self) -> Vec<WindowOutput<G, T, A::Out>> {
        let mut out = Vec::new();
        let EvictionPolicy::Time(span) = self.eviction else {
            return out;
        };
        let now = now_secs();
        let expired: Vec<G> = self
            .storage
            .partitions()
            .filter(|(_, pane)| pane.opened + span.as_secs() <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.flush(&key, &mut out);
        }
        out
    }

    // ACCUMULATING -> FLUSH -> EMPTY, atomic with respect to the eviction
    // policy: the counter is zeroed, the flush emitted and the partition
    // removed before anything else observes the window.
    fn flush(&mut self, partition: &G, out: &mut Vec<WindowOutput<G, T, A::Out>>) {
        if !self.storage.contains(partition) {
            return;
        }
        let count = self.storage.tuple_count(partition).unwrap_or(0);
        self.storage.set_tuple_count(partition, 0);
        if let Some(pe) = &mut self.partition_eviction {
            pe.partition_flushed(count);
        }
        if let Some(pane) = self.storage.remove_partition(partition) {
            out.push(match pane.contents {
                Contents::Tuples(tuples) => WindowOutput::tuples(
                    partition.clone(),
                    OutputCause::Flush,
                    tuples.into_iter().collect(),
                ),
                Contents::Summary(acc) => {
                    WindowOutput::summary(partition.clone(), OutputCause::Flush, acc.output())
                }
            });
        }
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

    fn maybe_evict_partitions(&mut self, now: u64, out: &mut Vec<WindowOutput<G, T, A::Out>>) {
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
        // the selector may not have evicted enough; force strict LRU
        while self.eviction_needed_now(now) {
            let Some((key, _)) = self.storage.oldest() else {
                break;
            };
            let key = key.clone();
            self.evict_partition(&key, out);
        }
    }

    fn evict_partition(&mut self, partition: &G, out: &mut Vec<WindowOutput<G, T, A::Out>>) {
        let count = self.storage.tuple_count(partition).unwrap_or(0);
        if let Some(pane) = self.storage.remove_partition(partition) {
            if let Some(pe) = &mut self.partition_eviction {
                pe.partition_removed(count);
            }
            tracing::debug!(tuples = count, "partition evicted");
            out.push(match pane.contents {
                Contents::Tuples(tuples) => WindowOutput::tuples(
                    partition.clone(),
                    OutputCause::PartitionEvicted,
                    tuples.into_iter().collect(),
                ),
                Contents::Summary(acc) => WindowOutput::summary(
                    partition.clone(),
                    OutputCause::PartitionEvicted,
                    acc.output(),
                ),
            });
        }
    }

    /// Order-independent digest of partition keys and sizes, for consistency
    /// checks across checkpoint and restore. Tuple contents are not hashed.
    pub fn state_hash(&self) -> u64 {
        let mut result = 0xcbf29ce484222325u64;
        for (key, _) in self.storage.partitions() {
            let count = self.storage.tuple_count(key).unwrap_or(0);
            let bytes = bincode::serde::encode_to_vec((key, count), bincode::config::standard())
                .unwrap_or_default();
            result ^= fxhash::hash64(&bytes);
        }
        result
    }
}

impl<G: WindowKey, T: WindowData, A: WindowAccumulator<In = T>> Display
    for TumblingWindowManager<G, T, A>
{
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "TumblingWindowManager<({}, {}), {}>",
            std::any::type_name::<G>(),
            std::any::type_name::<T>(),
            self.eviction.name(),
        )
    }
}

impl<G, T, A> StateHandler for TumblingWindowManager<G, T, A>
where
    G: WindowKey,
    T: WindowData,
    A: WindowAccumulator<In = T> + Serialize + serde::de::DeserializeOwned,
{
    fn checkpoint(&mut self, ckpt: &mut Checkpoint) -> Result<(), CheckpointError> {
        ckpt.write_marker("tumbling");
        self.storage.checkpoint(ckpt)?;
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
        ckpt.verify_marker("tumbling")?;
        self.storage.reset(ckpt)?;
        if ckpt.read_bool()? {
            if let Some(pe) = &mut self.partition_eviction {
                pe.reset(ckpt)?;
            }
        }
        Ok(())
    }

    fn reset_to_initial_state(&mut self) {
        self.storage.clear();
        if let Some(pe) = &mut self.partition_eviction {
            pe.reset_to_initial_state();
        }
    }
}
