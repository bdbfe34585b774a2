//! Integration test harness for multisim.
//!
//! This crate provides utilities for end-to-end testing of the full
//! pipeline: Composite literal → Build → Run → Verify.

use multisim_runtime::{
    CompositeDefinition, Path, Result, RunReport, Scheduler, SchedulerConfig, Time, TypeRegistry,
    UnitRegistry, Value,
};
use tracing_subscriber::EnvFilter;

/// Install a test subscriber once. Controlled by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Test harness for running multisim composites built from JSON literals.
pub struct TestHarness {
    scheduler: Scheduler,
}

impl TestHarness {
    /// Build a composite from a state literal with the reference adapters.
    ///
    /// # Panics
    ///
    /// Panics if the composite fails to build.
    pub fn from_json(state: serde_json::Value) -> Self {
        Self::with_config(state, SchedulerConfig::default())
    }

    /// # Panics
    ///
    /// Panics if the composite fails to build.
    pub fn with_config(state: serde_json::Value, config: SchedulerConfig) -> Self {
        match Self::try_build(state, config, multisim_processes::registry()) {
            Ok(harness) => harness,
            Err(err) => panic!("composite failed to build: {err}"),
        }
    }

    /// Build with an explicit unit registry, surfacing build errors.
    pub fn try_build(state: serde_json::Value, config: SchedulerConfig, units: UnitRegistry) -> Result<Self> {
        init_tracing();
        let definition = CompositeDefinition::new(Value::from(state)).with_config(config);
        let scheduler = Scheduler::build(definition, TypeRegistry::new(), units)?;
        Ok(Self { scheduler })
    }

    /// Run until `end_time`.
    ///
    /// # Panics
    ///
    /// Panics if the run fails.
    pub fn run(&mut self, end_time: Time) -> RunReport {
        match self.scheduler.run(end_time) {
            Ok(report) => report,
            Err(err) => panic!("run failed: {err}"),
        }
    }

    /// Current value at `path` (`a/b/c`), if present.
    pub fn get(&self, path: &str) -> Option<Value> {
        self.scheduler.get(&Path::parse(path)).ok()
    }

    /// Current scalar at `path`.
    pub fn get_scalar(&self, path: &str) -> Option<f64> {
        self.get(path).and_then(|v| v.as_float())
    }

    /// Child keys of the map at `path`.
    pub fn keys(&self, path: &str) -> Vec<String> {
        self.get(path)
            .and_then(|v| v.as_map().map(|m| m.keys().cloned().collect()))
            .unwrap_or_default()
    }

    /// Emitted time series of `path`.
    pub fn series(&self, path: &str) -> Vec<(Time, Value)> {
        self.scheduler.query(&Path::parse(path))
    }

    pub fn current_time(&self) -> Time {
        self.scheduler.current_time()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }
}
