use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use tracing::trace;

use crate::snapshot::GpuUtilizationSample;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackerError {
    #[error(
        "GPU set changed from {established:?} to {observed:?}, \
         the tracked GPUs are fixed once established"
    )]
    TopologyChanged {
        established: Vec<u32>,
        observed: Vec<u32>,
    },
    #[error("GPU {0} is not tracked")]
    UnknownGpu(u32),
}

// Idle counters of a single GPU, all values in seconds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpuIdleState {
    // Time spent at 0% utilization since the last non-zero reading
    pub idle_seconds_accumulated: f64,
    // Time since the last dispatched alert, infinite before the first one
    pub seconds_since_last_alert: f64,
}

impl Default for GpuIdleState {
    fn default() -> Self {
        Self {
            idle_seconds_accumulated: 0.,
            seconds_since_last_alert: f64::INFINITY,
        }
    }
}

impl GpuIdleState {
    pub fn is_busy(&self) -> bool {
        self.idle_seconds_accumulated == 0.
    }
}

// Decide, tick after tick, which GPUs have been idle long enough to be
// reported and are out of their alert cool-down.
//
// A GPU becomes eligible once `warn_after` seconds of uninterrupted 0%
// readings are accumulated. A single non-zero reading zeroes the idle
// counter. The cool-down counter grows every tick regardless of the
// utilization and is only reset by `record_alert`.
#[derive(Debug, Clone)]
pub struct IdleTracker {
    check_period: f64,
    warn_after: f64,
    warning_interval: f64,

    // Keyed by GPU index, empty until the first observation
    states: BTreeMap<u32, GpuIdleState>,
}

impl IdleTracker {
    pub fn new(
        check_period_seconds: u64,
        warn_after_seconds: u64,
        warning_interval_seconds: u64,
    ) -> Self {
        Self {
            check_period: check_period_seconds as f64,
            warn_after: warn_after_seconds as f64,
            warning_interval: warning_interval_seconds as f64,

            states: BTreeMap::new(),
        }
    }

    // Apply one tick worth of samples and return the GPUs that must be
    // reported this tick, in sample order.
    pub fn observe(
        &mut self,
        samples: &[GpuUtilizationSample],
    ) -> Result<Vec<u32>, TrackerError> {
        if self.states.is_empty() {
            for sample in samples {
                self.states.insert(sample.gpu_id, GpuIdleState::default());
            }
        } else {
            self.check_topology(samples)?;
        }

        let mut eligible = Vec::new();

        for sample in samples {
            let state = self
                .states
                .get_mut(&sample.gpu_id)
                .ok_or(TrackerError::UnknownGpu(sample.gpu_id))?;

            if sample.utilization_percent == 0 {
                state.idle_seconds_accumulated += self.check_period;
            } else {
                state.idle_seconds_accumulated = 0.;
            }

            state.seconds_since_last_alert += self.check_period;

            trace!(
                "GPU {}: utilization {}%, idle {}s, last alert {}s ago",
                sample.gpu_id,
                sample.utilization_percent,
                state.idle_seconds_accumulated,
                state.seconds_since_last_alert
            );

            if state.idle_seconds_accumulated >= self.warn_after
                && state.seconds_since_last_alert >= self.warning_interval
            {
                eligible.push(sample.gpu_id);
            }
        }

        Ok(eligible)
    }

    // Start the cool-down of a GPU, called once an alert was dispatched
    pub fn record_alert(&mut self, gpu_id: u32) -> Result<(), TrackerError> {
        let state = self
            .states
            .get_mut(&gpu_id)
            .ok_or(TrackerError::UnknownGpu(gpu_id))?;

        state.seconds_since_last_alert = 0.;

        Ok(())
    }

    // Force a GPU to accumulate idle time from scratch. The cool-down
    // is left untouched.
    pub fn reset_idle(&mut self, gpu_id: u32) -> Result<(), TrackerError> {
        let state = self
            .states
            .get_mut(&gpu_id)
            .ok_or(TrackerError::UnknownGpu(gpu_id))?;

        state.idle_seconds_accumulated = 0.;

        Ok(())
    }

    pub fn state(&self, gpu_id: u32) -> Option<GpuIdleState> {
        self.states.get(&gpu_id).copied()
    }

    pub fn tracked_gpus(&self) -> Vec<u32> {
        self.states.keys().copied().collect()
    }

    fn check_topology(
        &self,
        samples: &[GpuUtilizationSample],
    ) -> Result<(), TrackerError> {
        let observed: BTreeSet<u32> =
            samples.iter().map(|sample| sample.gpu_id).collect();

        if observed.len() != self.states.len()
            || !observed.iter().all(|id| self.states.contains_key(id))
        {
            return Err(TrackerError::TopologyChanged {
                established: self.tracked_gpus(),
                observed: observed.into_iter().collect(),
            });
        }

        Ok(())
    }
}
