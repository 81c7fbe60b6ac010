//! Concurrency planning for the worker pool
//!
//! Derives the process-wide task budget from configuration and CPU core count.

use crate::config::Config;

/// Upper bound applied when the budget is derived automatically.
const MAX_DERIVED_TASKS: u32 = 8;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Maximum number of tasks executing at once across all batches
    pub max_concurrent_tasks: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration
    ///
    /// An explicit non-zero `worker.max_concurrent_tasks` is used unchanged.
    /// Otherwise the budget is half the logical cores, clamped to `[1, 8]`.
    pub fn derive(cfg: &Config) -> Self {
        Self::derive_with_cores(cfg, num_cpus::get() as u32)
    }

    /// Same as [`ConcurrencyPlan::derive`] with an explicit core count.
    pub fn derive_with_cores(cfg: &Config, total_cores: u32) -> Self {
        let max_concurrent_tasks = if cfg.worker.max_concurrent_tasks > 0 {
            cfg.worker.max_concurrent_tasks
        } else {
            derive_max_tasks(total_cores)
        };

        Self {
            total_cores,
            max_concurrent_tasks,
        }
    }

    /// Budget as a `usize`, never zero.
    pub fn budget(&self) -> usize {
        self.max_concurrent_tasks.max(1) as usize
    }
}

fn derive_max_tasks(cores: u32) -> u32 {
    (cores / 2).clamp(1, MAX_DERIVED_TASKS)
}

/// Public function to derive a concurrency plan from configuration
pub fn derive_plan(cfg: &Config) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}
