//! Sliding-window facets.
//!
//! A sliding window composes an ordered list of facets, each owning one
//! trigger or eviction concern (count, time or delta based). Facets are
//! invoked in their declared order on every insert, and they checkpoint and
//! reset in that same order; the order is part of the checkpoint binary
//! format, so it must never change for a deployed window.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::Arc;

use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};

use super::{WindowData, WindowKey};
use crate::checkpoint::{Checkpoint, CheckpointError};

/// Extracts the ordering attribute a delta policy compares on.
pub type DeltaExtractor<T> = Arc<dyn Fn(&T) -> f64 + Send + Sync>;

/// One tuple retained in a sliding pane, with its insertion time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry<T> {
    pub tuple: T,
    /// Insertion time, seconds.
    pub at: u64,
}

/// The retained contents of one partition of a sliding window.
pub type Pane<T> = VecDeque<Entry<T>>;

/// A single trigger or eviction concern of a sliding window.
///
/// `before_insert` runs for every facet, in declared order, before the
/// incoming tuple is appended to the pane; `after_insert` runs after. Either
/// may report that the window should fire a trigger output.
pub trait WindowFacet<G: WindowKey, T: WindowData>: Send {
    fn name(&self) -> &'static str;

    /// Evict old tuples and evaluate pre-insertion triggers.
    fn before_insert(&mut self, _key: &G, _pane: &mut Pane<T>, _incoming: &T, _now: u64) -> bool {
        false
    }

    /// Evaluate post-insertion triggers.
    fn after_insert(&mut self, _key: &G, _pane: &Pane<T>, _now: u64) -> bool {
        false
    }

    /// Drop any per-partition state for an evicted partition.
    fn remove_partition(&mut self, _key: &G) {}

    /// Save facet state. Facets serialize in declared order; every facet
    /// writes its own marker so a misaligned restore fails fast.
    fn checkpoint(&self, ckpt: &mut Checkpoint) -> Result<(), CheckpointError>;

    fn reset(&mut self, ckpt: &mut Checkpoint) -> Result<(), CheckpointError>;

    fn reset_to_initial_state(&mut self);

    /// Order-independent digest of the facet state, for consistency checks.
    fn state_hash(&self) -> u64;

    fn describe(&self) -> String;
}

fn hash_entry<K: Serialize, V: Serialize>(key: &K, value: &V) -> u64 {
    let bytes =
        bincode::serde::encode_to_vec((key, value), bincode::config::standard()).unwrap_or_default();
    fxhash::hash64(&bytes)
}

/// Keeps the pane bounded to the last `size` tuples.
#[derive(Debug, Clone)]
pub struct CountEviction {
    size: usize,
}

impl CountEviction {
    pub fn new(size: usize) -> Self {
        Self { size }
    }
}

impl<G: WindowKey, T: WindowData> WindowFacet<G, T> for CountEviction {
    fn name(&self) -> &'static str {
        "evict-count"
    }

    fn before_insert(&mut self, _key: &G, pane: &mut Pane<T>, _incoming: &T, _now: u64) -> bool {
        while pane.len() >= self.size {
            pane.pop_front();
        }
        false
    }

    fn checkpoint(&self, ckpt: &mut Checkpoint) -> Result<(), CheckpointError> {
        ckpt.write_marker(WindowFacet::<G, T>::name(self));
        Ok(())
    }

    fn reset(&mut self, ckpt: &mut Checkpoint) -> Result<(), CheckpointError> {
        ckpt.verify_marker("evict-count")
    }

    fn reset_to_initial_state(&mut self) {}

    fn state_hash(&self) -> u64 {
        fxhash::hash64(&(WindowFacet::<G, T>::name(self), self.size as u64))
    }

    fn describe(&self) -> String {
        format!("CountEviction(size={})", self.size)
    }
}

/// Keeps the pane bounded to the tuples of the last `span_secs` seconds.
#[derive(Debug, Clone)]
pub struct TimeEviction {
    span_secs: u64,
}

impl TimeEviction {
    pub fn new(span_secs: u64) -> Self {
        Self { span_secs }
    }
}

impl<G: WindowKey, T: WindowData> WindowFacet<G, T> for TimeEviction {
    fn name(&self) -> &'static str {
        "evict-time"
    }

    fn before_insert(&mut self, _key: &G, pane: &mut Pane<T>, _incoming: &T, now: u64) -> bool {
        while pane
            .front()
            .map(|entry| entry.at + self.span_secs < now)
            .unwrap_or(false)
        {
            pane.pop_front();
        }
        false
    }

    fn checkpoint(&self, ckpt: &mut Checkpoint) -> Result<(), CheckpointError> {
        ckpt.write_marker(WindowFacet::<G, T>::name(self));
        Ok(())
    }

    fn reset(&mut self, ckpt: &mut Checkpoint) -> Result<(), CheckpointError> {
        ckpt.verify_marker("evict-time")
    }

    fn reset_to_initial_state(&mut self) {}

    fn state_hash(&self) -> u64 {
        fxhash::hash64(&(WindowFacet::<G, T>::name(self), self.span_secs))
    }

    fn describe(&self) -> String {
        format!("TimeEviction(span={}s)", self.span_secs)
    }
}

/// Keeps the pane bounded to tuples whose delta attribute is within
/// `threshold` of the incoming tuple's.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct DeltaEviction<T> {
    threshold: f64,
    #[derivative(Debug = "ignore")]
    extract: DeltaExtractor<T>,
}

impl<T> DeltaEviction<T> {
    pub fn new(threshold: f64, extract: DeltaExtractor<T>) -> Self {
        Self { threshold, extract }
    }
}

impl<G: WindowKey, T: WindowData> WindowFacet<G, T> for DeltaEviction<T> {
    fn name(&self) -> &'static str {
        "evict-delta"
    }

    fn before_insert(&mut self, _key: &G, pane: &mut Pane<T>, incoming: &T, _now: u64) -> bool {
        let bound = (self.extract)(incoming) - self.threshold;
        while pane
            .front()
            .map(|entry| (self.extract)(&entry.tuple) < bound)
            .unwrap_or(false)
        {
            pane.pop_front();
        }
        false
    }

    fn checkpoint(&self, ckpt: &mut Checkpoint) -> Result<(), CheckpointError> {
        ckpt.write_marker(WindowFacet::<G, T>::name(self));
        Ok(())
    }

    fn reset(&mut self, ckpt: &mut Checkpoint) -> Result<(), CheckpointError> {
        ckpt.verify_marker("evict-delta")
    }

    fn reset_to_initial_state(&mut self) {}

    fn state_hash(&self) -> u64 {
        fxhash::hash64(&(WindowFacet::<G, T>::name(self), self.threshold.to_bits()))
    }

    fn describe(&self) -> String {
        format!("DeltaEviction(threshold={})", self.threshold)
    }
}

/// Fires a trigger every `every` tuples inserted into a partition.
#[derive(Debug, Clone)]
pub struct CountTrigger<G> {
    every: u64,
    counts: FxHashMap<G, u64>,
}

impl<G> CountTrigger<G> {
    pub fn new(every: u64) -> Self {
        Self {
            every,
            counts: FxHashMap::default(),
        }
    }
}

impl<G: WindowKey, T: WindowData> WindowFacet<G, T> for CountTrigger<G> {
    fn name(&self) -> &'static str {
        "trigger-count"
    }

    fn after_insert(&mut self, key: &G, _pane: &Pane<T>, _now: u64) -> bool {
        let count = self.counts.entry(key.clone()).or_insert(0);
        *count += 1;
        *count % self.every == 0
    }

    fn remove_partition(&mut self, key: &G) {
        self.counts.remove(key);
    }

    fn checkpoint(&self, ckpt: &mut Checkpoint) -> Result<(), CheckpointError> {
        ckpt.write_marker(WindowFacet::<G, T>::name(self));
        ckpt.write_value(&self.counts)?;
        Ok(())
    }

    fn reset(&mut self, ckpt: &mut Checkpoint) -> Result<(), CheckpointError> {
        ckpt.verify_marker("trigger-count")?;
        self.counts = ckpt.read_value()?;
        Ok(())
    }

    fn reset_to_initial_state(&mut self) {
        self.counts.clear();
    }

    fn state_hash(&self) -> u64 {
        self.counts
            .iter()
            .fold(fxhash::hash64(&self.every), |acc, (k, v)| {
                acc ^ hash_entry(k, v)
            })
    }

    fn describe(&self) -> String {
        format!("CountTrigger(every={})", self.every)
    }
}

/// Fires a trigger whenever the incoming tuple's delta attribute moved more
/// than `threshold` past the last trigger point of its partition.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct DeltaTrigger<G, T> {
    threshold: f64,
    #[derivative(Debug = "ignore")]
    extract: DeltaExtractor<T>,
    last: FxHashMap<G, f64>,
}

impl<G, T> DeltaTrigger<G, T> {
    pub fn new(threshold: f64, extract: DeltaExtractor<T>) -> Self {
        Self {
            threshold,
            extract,
            last: FxHashMap::default(),
        }
    }
}

impl<G: WindowKey, T: WindowData> WindowFacet<G, T> for DeltaTrigger<G, T> {
    fn name(&self) -> &'static str {
        "trigger-delta"
    }

    fn before_insert(&mut self, key: &G, _pane: &mut Pane<T>, incoming: &T, _now: u64) -> bool {
        let value = (self.extract)(incoming);
        match self.last.get_mut(key) {
            None => {
                self.last.insert(key.clone(), value);
                false
            }
            Some(last) if value - *last > self.threshold => {
                *last = value;
                true
            }
            Some(_) => false,
        }
    }

    fn remove_partition(&mut self, key: &G) {
        self.last.remove(key);
    }

    fn checkpoint(&self, ckpt: &mut Checkpoint) -> Result<(), CheckpointError> {
        ckpt.write_marker(self.name());
        ckpt.write_value(&self.last)?;
        Ok(())
    }

    fn reset(&mut self, ckpt: &mut Checkpoint) -> Result<(), CheckpointError> {
        ckpt.verify_marker("trigger-delta")?;
        self.last = ckpt.read_value()?;
        Ok(())
    }

    fn reset_to_initial_state(&mut self) {
        self.last.clear();
    }

    fn state_hash(&self) -> u64 {
        self.last
            .iter()
            .fold(fxhash::hash64(&self.threshold.to_bits()), |acc, (k, v)| {
                acc ^ hash_entry(k, &v.to_bits())
            })
    }

    fn describe(&self) -> String {
        format!("DeltaTrigger(threshold={})", self.threshold)
    }
}

/// Periodic trigger driven by the window's dedicated trigger thread; the
/// facet itself carries no insert-time behavior.
#[derive(Debug, Clone)]
pub struct TimeTrigger {
    period: std::time::Duration,
}

impl TimeTrigger {
    pub fn new(period: std::time::Duration) -> Self {
        Self { period }
    }

    pub fn period(&self) -> std::time::Duration {
        self.period
    }
}

impl<G: WindowKey, T: WindowData> WindowFacet<G, T> for TimeTrigger {
    fn name(&self) -> &'static str {
        "trigger-time"
    }

    fn checkpoint(&self, ckpt: &mut Checkpoint) -> Result<(), CheckpointError> {
        ckpt.write_marker(WindowFacet::<G, T>::name(self));
        Ok(())
    }

    fn reset(&mut self, ckpt: &mut Checkpoint) -> Result<(), CheckpointError> {
        ckpt.verify_marker("trigger-time")
    }

    fn reset_to_initial_state(&mut self) {}

    fn state_hash(&self) -> u64 {
        fxhash::hash64(&(WindowFacet::<G, T>::name(self), self.period.as_millis() as u64))
    }

    fn describe(&self) -> String {
        let mut s = String::new();
        let _ = write!(s, "TimeTrigger(period={:?})", self.period);
        s
    }
}
