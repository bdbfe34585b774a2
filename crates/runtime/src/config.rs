//! Scheduler configuration

use serde::{Deserialize, Serialize};

use crate::path::Path;

/// Upper bound on step passes per tick before giving up on a fixpoint.
pub const DEFAULT_MAX_STEP_PASSES: u32 = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Step passes allowed per tick.
    pub max_step_passes: u32,
    /// Compute process updates that are due together on the rayon pool.
    /// Deltas are applied in the same order either way.
    pub parallel_processes: bool,
    pub emit: EmitterConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_step_passes: DEFAULT_MAX_STEP_PASSES,
            parallel_processes: false,
            emit: EmitterConfig::default(),
        }
    }
}

/// What the emitter captures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmitterConfig {
    /// Paths to capture each emit; empty means the whole tree.
    pub paths: Vec<Path>,
    /// Capture every `stride` ticks.
    pub stride: u64,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            stride: 1,
        }
    }
}
