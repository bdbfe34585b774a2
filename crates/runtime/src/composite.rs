//! Composite definitions

use serde::{Deserialize, Serialize};

use crate::config::SchedulerConfig;
use crate::types::Value;

/// Everything needed to build a scheduler: the initial tree literal (with
/// embedded unit declarations) and the scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeDefinition {
    pub state: Value,
    #[serde(default)]
    pub config: SchedulerConfig,
}

impl CompositeDefinition {
    pub fn new(state: impl Into<Value>) -> Self {
        Self {
            state: state.into(),
            config: SchedulerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json() {
        let definition = CompositeDefinition::from_json(
            r#"{
                "state": {"cells": {"0": {"delta": 1.0}}},
                "config": {"max_step_passes": 8}
            }"#,
        )
        .unwrap();
        assert_eq!(definition.config.max_step_passes, 8);
        assert_eq!(
            definition.state.get_path(&["cells", "0", "delta"]),
            Some(&Value::Float(1.0))
        );
    }
}
