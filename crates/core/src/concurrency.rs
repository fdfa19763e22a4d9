//! Concurrency planning module
//!
//! Derives the number of parallel conversions from the configuration and the
//! machine's core count.

use handforge_config::Config;

/// Upper bound for the derived parallelism; encoders are multi-threaded themselves
const MAX_DERIVED_PARALLEL: u32 = 8;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Logical CPU cores available
    pub total_cores: u32,
    /// Maximum number of simultaneously running workers, always at least 1
    pub max_parallel: u32,
}

impl ConcurrencyPlan {
    /// Derive a plan from configuration
    ///
    /// An explicit non-zero `queue.max_parallel` is used unchanged; zero means
    /// half the logical cores, clamped to [1, 8].
    pub fn derive(cfg: &Config) -> Self {
        Self::for_cores(cfg, num_cpus::get() as u32)
    }

    /// Same as [`ConcurrencyPlan::derive`] with a known core count
    pub fn for_cores(cfg: &Config, total_cores: u32) -> Self {
        let max_parallel = if cfg.queue.max_parallel > 0 {
            cfg.queue.max_parallel
        } else {
            derive_parallel(total_cores)
        };

        Self {
            total_cores,
            max_parallel,
        }
    }
}

fn derive_parallel(cores: u32) -> u32 {
    (cores / 2).clamp(1, MAX_DERIVED_PARALLEL)
}

/// Public function to derive a concurrency plan from configuration
pub fn derive_plan(cfg: &Config) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}
