//! Scripted neighbor tables
//!
//! Replays a time-indexed schedule of contact tables, standing in for a
//! multicellular simulator whose population changes over time. The table in
//! force at time `t` is the last entry with `time <= t`; it is published only
//! when it differs from the one published before.

use multisim_runtime::{
    AdapterError, Delta, NeighborTable, Port, Ports, Process, State, Time, Unit, UnitRegistry,
    Update, Value,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::planar_sheet::{NEIGHBORHOODS, TABLE_TYPE};

pub const SCRIPTED_NEIGHBORS: &str = "local:scripted_neighbors";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTable {
    pub time: Time,
    pub table: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptedNeighborsConfig {
    pub schedule: Vec<ScheduledTable>,
}

#[derive(Debug, Clone)]
pub struct ScriptedNeighbors {
    schedule: Vec<(Time, Value)>,
    clock: Time,
    published: Option<usize>,
}

impl ScriptedNeighbors {
    pub fn new(config: ScriptedNeighborsConfig) -> Result<Self, AdapterError> {
        let mut schedule = Vec::with_capacity(config.schedule.len());
        for entry in config.schedule {
            if !entry.time.is_finite() {
                return Err(AdapterError::new(format!("invalid schedule time {}", entry.time)));
            }
            // normalizes weights and rejects malformed tables up front
            let table = NeighborTable::from_value(&entry.table)?;
            schedule.push((entry.time, table.to_value()));
        }
        schedule.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(Self {
            schedule,
            clock: 0.0,
            published: None,
        })
    }

    pub fn from_config(config: &Value) -> Result<Self, AdapterError> {
        Self::new(config.deserialize_into()?)
    }

    pub fn register(units: &mut UnitRegistry) {
        units.register_process(SCRIPTED_NEIGHBORS, Self::from_config);
    }

    /// Index of the table in force at `time`.
    fn active(&self, time: Time) -> Option<usize> {
        self.schedule.iter().rposition(|(at, _)| *at <= time)
    }
}

impl Unit for ScriptedNeighbors {
    fn inputs(&self) -> Ports {
        Ports::new()
    }

    fn outputs(&self) -> Ports {
        Ports::from([(NEIGHBORHOODS.to_string(), Port::wired(TABLE_TYPE, &[NEIGHBORHOODS]))])
    }

    fn initial_state(&mut self) -> Result<State, AdapterError> {
        self.published = self.active(self.clock);
        let table = match self.published {
            Some(index) => self.schedule[index].1.clone(),
            None => Value::map(),
        };
        Ok(State::from([(NEIGHBORHOODS.to_string(), table)]))
    }
}

impl Process for ScriptedNeighbors {
    fn update(&mut self, _state: &State, interval: Time) -> Result<Update, AdapterError> {
        self.clock += interval;
        let active = self.active(self.clock);
        if active == self.published {
            return Ok(Update::new());
        }
        self.published = active;
        let Some(index) = active else {
            return Ok(Update::new());
        };
        debug!(clock = self.clock, entry = index, "publishing scheduled table");
        Ok(Update::from([(
            NEIGHBORHOODS.to_string(),
            Delta::merge(self.schedule[index].1.clone()),
        )]))
    }
}
