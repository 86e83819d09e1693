//! Session configuration.

use graphforge_autoschedule::Policy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Every tunable of a session. Timeouts are in seconds; log files are
/// optional append-mode paths (the matching component stays silent when
/// unset).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    pub report_profile: bool,
    pub report_iteration: bool,
    pub report_iteration_period: usize,

    pub autoschedule_trial_ratio: f64,
    pub autoschedule_topk: usize,
    pub autoschedule_new_trial: usize,
    pub autoschedule_policy: Policy,
    pub autoschedule_parallel: usize,
    pub autoschedule_timeout: f64,
    pub autoschedule_log_file: Option<PathBuf>,

    pub profile_parallel: usize,
    pub profile_timeout: f64,

    pub build_parallel: usize,
    pub build_timeout: f64,
    pub build_log_file: Option<PathBuf>,

    pub evaluate_log_file: Option<PathBuf>,
    pub execution_log_file: Option<PathBuf>,

    /// Bernoulli probability of re-entering the exploration (first)
    /// stage after the task is fully cached.
    pub execution_explore_probability: f64,
    pub execution_parallel: usize,
    pub execution_timeout: f64,
    pub synchronize_subgraph: bool,

    /// Fixes session RNGs for reproducible tuning runs.
    pub rng_seed: Option<u64>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            report_profile: false,
            report_iteration: false,
            report_iteration_period: 1,
            autoschedule_trial_ratio: 1.0,
            autoschedule_topk: 20,
            autoschedule_new_trial: 20,
            autoschedule_policy: Policy::Profile,
            autoschedule_parallel: 2,
            autoschedule_timeout: 10.0,
            autoschedule_log_file: None,
            profile_parallel: 2,
            profile_timeout: 10.0,
            build_parallel: 2,
            build_timeout: 10.0,
            build_log_file: None,
            evaluate_log_file: None,
            execution_log_file: None,
            execution_explore_probability: 0.1,
            execution_parallel: 1,
            execution_timeout: 10.0,
            synchronize_subgraph: false,
            rng_seed: None,
        }
    }
}

impl SessionOptions {
    pub fn autoschedule_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.autoschedule_timeout.max(0.0))
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.build_timeout.max(0.0))
    }

    /// The profile feedback log lives next to the autoschedule log as
    /// `<stem>_profile.txt`.
    pub fn profile_log_file(&self) -> Option<PathBuf> {
        let path = self.autoschedule_log_file.as_ref()?;
        let stem = path.file_stem()?.to_string_lossy().into_owned();
        Some(path.with_file_name(format!("{stem}_profile.txt")))
    }
}
