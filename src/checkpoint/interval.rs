//! Adaptive control of the base/delta checkpoint interval.
//!
//! The controller tracks how large delta checkpoints are compared to the base
//! they depend on and adjusts how many deltas are taken between two bases.
//! When incremental checkpointing is not paying off the interval shrinks down
//! to 1 (all bases); a probing mode periodically re-enables it to check
//! whether deltas have become worthwhile again.

use crate::config::CheckpointConfig;

/// Consecutive base checkpoints to observe before re-probing incremental
/// checkpointing.
pub(crate) const PROBE_LIMIT: u32 = 10;

/// Serialized bookkeeping adds roughly this factor on top of raw delta bytes.
const LOGGING_OVERHEAD: f64 = 1.1;

#[derive(Debug, Clone)]
pub struct IntervalController {
    /// Checkpoints between two bases; 1 disables incremental checkpointing.
    interval: u32,
    /// Aggregated delta size may reach `size_ratio * base_size` before the
    /// interval shrinks. 0 disables incremental checkpointing permanently.
    size_ratio: f64,
    /// Ordinal of the next checkpoint within the current interval; 0 is the
    /// base.
    pos: u32,
    /// Consecutive bases seen while `interval == 1`.
    probe_count: u32,
    base_size: f64,
    sum_delta: f64,
    weighted_sum_delta: f64,
    weight_total: f64,
    delta_count: u32,
}

impl IntervalController {
    pub fn new(config: &CheckpointConfig) -> Self {
        let interval = if config.size_ratio == 0.0 {
            1
        } else {
            config.incremental_interval.max(1)
        };
        Self {
            interval,
            size_ratio: config.size_ratio,
            pos: 0,
            probe_count: 0,
            base_size: 0.0,
            sum_delta: 0.0,
            weighted_sum_delta: 0.0,
            weight_total: 0.0,
            delta_count: 0,
        }
    }

    pub fn interval(&self) -> u32 {
        self.interval
    }

    /// Whether the checkpoint about to be taken is an interval boundary.
    pub fn is_base_checkpoint(&self) -> bool {
        self.interval == 1 || self.pos == 0
    }

    /// Lookahead: whether update logging should be active once the current
    /// checkpoint completes, i.e. whether the *next* checkpoint will be a
    /// delta. Avoids paying for log records that the next base would discard.
    pub fn should_enable_logging(&self) -> bool {
        if self.size_ratio == 0.0 || self.interval == 1 {
            return false;
        }
        (self.pos + 1) % self.interval != 0
    }

    /// Record a completed base checkpoint of the given size.
    pub fn base_completed(&mut self, size: u64) {
        self.base_size = size as f64;
        self.determine_interval();
        self.sum_delta = 0.0;
        self.weighted_sum_delta = 0.0;
        self.weight_total = 0.0;
        self.delta_count = 0;
        self.advance();
    }

    /// Record a completed delta checkpoint of the given size.
    pub fn delta_completed(&mut self, size: u64) {
        self.sum_delta += size as f64;
        // recency-weighted running sum: older deltas fade with factor 1/2
        self.weighted_sum_delta = self.weighted_sum_delta * 0.5 + size as f64;
        self.weight_total = self.weight_total * 0.5 + 1.0;
        self.delta_count += 1;
        self.advance();
    }

    /// Force the next checkpoint to be a base, discarding the rest of the
    /// current interval. Used when update logging failed mid-interval.
    pub fn force_base(&mut self) {
        self.pos = 0;
    }

    /// Re-evaluate the interval at a base boundary.
    pub fn determine_interval(&mut self) {
        if self.size_ratio == 0.0 {
            return;
        }
        if self.interval == 1 {
            self.probe_count += 1;
            if self.probe_count >= PROBE_LIMIT {
                tracing::debug!(
                    probe_count = self.probe_count,
                    "re-probing incremental checkpointing"
                );
                self.interval = 2;
                self.probe_count = 0;
            }
            return;
        }
        self.probe_count = 0;
        if self.delta_count == 0 {
            return;
        }
        let budget = self.base_size * self.size_ratio;
        if self.sum_delta > budget {
            self.interval = (self.interval / 2).max(1);
            tracing::debug!(
                sum_delta = self.sum_delta,
                budget,
                interval = self.interval,
                "deltas too large, shrinking interval"
            );
        } else {
            let avg_delta = self.weighted_sum_delta / self.weight_total;
            // the interval at which expected delta bytes (with logging
            // overhead) would reach the budget
            let max_interval = if avg_delta > 0.0 {
                ((budget / (avg_delta * LOGGING_OVERHEAD)) as u32).max(2)
            } else {
                u32::MAX
            };
            self.interval = (self.interval * 2).min(max_interval).max(self.interval);
            tracing::debug!(
                avg_delta,
                max_interval,
                interval = self.interval,
                "deltas paying off, growing interval"
            );
        }
    }

    fn advance(&mut self) {
        if self.interval <= 1 {
            self.pos = 0;
        } else {
            self.pos = (self.pos + 1) % self.interval;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(interval: u32, size_ratio: f64) -> IntervalController {
        IntervalController::new(&CheckpointConfig {
            incremental_interval: interval,
            size_ratio,
        })
    }

    #[test]
    fn interval_doubles_when_deltas_small() {
        // sizeRatio=1.0, base 1000, three deltas of 200 (sum 600 < 1000)
        let mut ctrl = controller(2, 1.0);
        ctrl.base_completed(1000);
        ctrl.delta_completed(200);
        ctrl.delta_completed(200);
        ctrl.delta_completed(200);
        ctrl.determine_interval();
        assert_eq!(ctrl.interval(), 4);
    }

    #[test]
    fn probing_reenables_after_limit() {
        let mut ctrl = controller(1, 1.0);
        for i in 1..=9 {
            ctrl.base_completed(100);
            assert_eq!(ctrl.interval(), 1, "still disabled after base {i}");
        }
        ctrl.base_completed(100);
        assert_eq!(ctrl.interval(), 2);
    }

    #[test]
    fn size_ratio_zero_never_probes() {
        let mut ctrl = controller(4, 0.0);
        assert_eq!(ctrl.interval(), 1);
        for _ in 0..50 {
            ctrl.base_completed(100);
        }
        assert_eq!(ctrl.interval(), 1);
        assert!(!ctrl.should_enable_logging());
    }

    #[test]
    fn oversized_deltas_never_grow_interval() {
        let mut ctrl = controller(8, 1.0);
        let mut last = ctrl.interval();
        // deltas consistently larger than the base
        while ctrl.interval() > 1 {
            ctrl.base_completed(100);
            for _ in 1..last {
                ctrl.delta_completed(500);
            }
            ctrl.determine_interval();
            assert!(ctrl.interval() <= last);
            last = ctrl.interval();
        }
        assert_eq!(ctrl.interval(), 1);
    }

    #[test]
    fn small_deltas_never_shrink_interval() {
        let mut ctrl = controller(2, 1.0);
        let mut last = ctrl.interval();
        for _ in 0..6 {
            ctrl.base_completed(10_000);
            for _ in 1..ctrl.interval() {
                ctrl.delta_completed(10);
            }
            ctrl.determine_interval();
            assert!(ctrl.interval() >= last);
            last = ctrl.interval();
        }
    }

    #[test]
    fn base_delta_schedule() {
        let mut ctrl = controller(3, 1.0);
        assert!(ctrl.is_base_checkpoint());
        // after the base two deltas follow
        assert!(ctrl.should_enable_logging());
        ctrl.base_completed(100);
        assert!(!ctrl.is_base_checkpoint());
        assert!(ctrl.should_enable_logging());
        ctrl.delta_completed(10);
        assert!(!ctrl.is_base_checkpoint());
        // the next checkpoint closes the interval, no point logging for it
        assert!(!ctrl.should_enable_logging());
        ctrl.delta_completed(10);
        assert!(ctrl.is_base_checkpoint());
    }

    #[test]
    fn force_base_restarts_interval() {
        let mut ctrl = controller(4, 1.0);
        ctrl.base_completed(100);
        ctrl.delta_completed(10);
        assert!(!ctrl.is_base_checkpoint());
        ctrl.force_base();
        assert!(ctrl.is_base_checkpoint());
    }
}
