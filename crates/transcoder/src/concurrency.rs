//! Worker pool sizing
//!
//! Derives the number of concurrent encode workers from the CPU core count
//! and configuration.

use crate::config::Config;

/// Upper bound for a derived worker count.
const MAX_DERIVED_WORKERS: u32 = 4;

/// Worker plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Number of encode workers, each running one job at a time
    pub workers: u32,
}

impl WorkerPlan {
    /// Derive a worker plan from configuration
    ///
    /// Uses the following rules:
    /// - Detects CPU cores via num_cpus
    /// - Uses `workers.count` unchanged when non-zero
    /// - Otherwise derives `cores / 4`, clamped to [1, 4]
    pub fn derive(cfg: &Config) -> Self {
        Self::derive_with_cores(cfg, num_cpus::get() as u32)
    }

    pub fn derive_with_cores(cfg: &Config, total_cores: u32) -> Self {
        let workers = if cfg.workers.count > 0 {
            cfg.workers.count
        } else {
            derive_workers(total_cores)
        };

        Self {
            total_cores,
            workers,
        }
    }
}

/// One worker per four cores, at least one and at most four.
fn derive_workers(cores: u32) -> u32 {
    (cores / 4).clamp(1, MAX_DERIVED_WORKERS)
}

/// Public function to derive a worker plan from configuration
pub fn derive_plan(cfg: &Config) -> WorkerPlan {
    WorkerPlan::derive(cfg)
}
