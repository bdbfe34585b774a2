//! Neighbor coupling step
//!
//! Reconciles an entity population against a neighbor table and computes,
//! for every entity, the contact-weighted sum of its neighbors' scalar.
//!
//! The table's key set is authoritative:
//! - entities missing from the table are removed;
//! - table keys missing from the population are added, seeded with a scalar
//!   drawn from `initial_values` and merged over `entity_template`;
//! - every other entity gets its weighted sum, written only when it changed.
//!
//! Sums are computed over the population as it will be after reconciliation:
//! newly added neighbors contribute their sampled scalar and ids outside the
//! table contribute nothing.

use indexmap::{IndexMap, IndexSet};
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::delta::Delta;
use crate::error::AdapterError;
use crate::types::{Value, ValueMap};
use crate::unit::{HasNeighborQuery, Port, Ports, State, Step, Unit, UnitRegistry, Update};

/// Registry address of [`NeighborCoupling`].
pub const NEIGHBOR_COUPLING: &str = "local:neighbor_coupling";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NeighborCouplingConfig {
    /// Entity field holding the coupled scalar.
    pub read_field: String,
    /// Entity field receiving the weighted neighbor sum.
    pub sum_field: String,
    /// Values sampled for newly added entities.
    pub initial_values: Vec<f64>,
    pub seed: u64,
    /// Literal merged into every added entity.
    pub entity_template: Value,
}

impl Default for NeighborCouplingConfig {
    fn default() -> Self {
        Self {
            read_field: "delta".to_string(),
            sum_field: "delta_neighbors".to_string(),
            initial_values: vec![0.0, 1.0],
            seed: 0,
            entity_template: Value::map(),
        }
    }
}

/// Entity id to neighbor id to contact weight.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NeighborTable {
    entries: IndexMap<String, IndexMap<String, f64>>,
}

impl NeighborTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>, neighbors: IndexMap<String, f64>) {
        self.entries.insert(id.into(), neighbors);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Read a table from a `map[map[float]]` value. Weights must be finite
    /// and non-negative.
    pub fn from_value(value: &Value) -> Result<Self, AdapterError> {
        let mut table = NeighborTable::new();
        let Some(entries) = value.as_map() else {
            if value.is_null() {
                return Ok(table);
            }
            return Err(AdapterError::new(format!(
                "neighbor table must be a map, found {}",
                value.kind_name()
            )));
        };
        for (id, neighbors) in entries {
            let neighbors = neighbors.as_map().ok_or_else(|| {
                AdapterError::new(format!("neighbors of `{id}` must be a map"))
            })?;
            let mut weights = IndexMap::with_capacity(neighbors.len());
            for (neighbor, weight) in neighbors {
                let weight = weight
                    .as_float()
                    .filter(|w| w.is_finite() && *w >= 0.0)
                    .ok_or_else(|| {
                        AdapterError::new(format!("invalid contact weight {id} -> {neighbor}: {weight}"))
                    })?;
                weights.insert(neighbor.clone(), weight);
            }
            table.insert(id.clone(), weights);
        }
        Ok(table)
    }

    pub fn to_value(&self) -> Value {
        Value::Map(
            self.entries
                .iter()
                .map(|(id, neighbors)| {
                    let neighbors: ValueMap = neighbors
                        .iter()
                        .map(|(n, w)| (n.clone(), Value::Float(*w)))
                        .collect();
                    (id.clone(), Value::Map(neighbors))
                })
                .collect(),
        )
    }
}

impl HasNeighborQuery for NeighborTable {
    fn vertices(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    fn neighbor_weights(&self, id: &str) -> IndexMap<String, f64> {
        self.entries.get(id).cloned().unwrap_or_default()
    }
}

/// Step keeping a population and its neighbor sums in line with a table.
#[derive(Debug, Clone)]
pub struct NeighborCoupling {
    config: NeighborCouplingConfig,
    rng: ChaCha8Rng,
}

impl NeighborCoupling {
    pub fn new(config: NeighborCouplingConfig) -> Result<Self, AdapterError> {
        if config.initial_values.is_empty() {
            return Err(AdapterError::new("initial_values must not be empty"));
        }
        if config.read_field == config.sum_field {
            return Err(AdapterError::new("read_field and sum_field must differ"));
        }
        if !matches!(config.entity_template, Value::Map(_)) {
            return Err(AdapterError::new("entity_template must be a map"));
        }
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Ok(Self { config, rng })
    }

    pub fn from_config(config: &Value) -> Result<Self, AdapterError> {
        Self::new(config.deserialize_into()?)
    }

    /// Register under [`NEIGHBOR_COUPLING`].
    pub fn register(units: &mut UnitRegistry) {
        units.register_step(NEIGHBOR_COUPLING, NeighborCoupling::from_config);
    }

    pub fn config(&self) -> &NeighborCouplingConfig {
        &self.config
    }

    fn cells_type(&self) -> String {
        format!(
            "map[{}:float|{}:overwrite[float]]",
            self.config.read_field, self.config.sum_field
        )
    }

    fn sample(&mut self) -> f64 {
        self.config
            .initial_values
            .choose(&mut self.rng)
            .copied()
            .unwrap_or_default()
    }

    fn entity(&self, scalar: f64, sum: f64) -> Value {
        let mut entity = self.config.entity_template.as_map().cloned().unwrap_or_default();
        entity.insert(self.config.read_field.clone(), Value::Float(scalar));
        entity.insert(self.config.sum_field.clone(), Value::Float(sum));
        Value::Map(entity)
    }

    /// The reconciliation delta for one `(table, cells)` pair.
    pub fn reconcile(&mut self, table: &impl HasNeighborQuery, cells: &ValueMap) -> Delta {
        let vertices: IndexSet<String> = table.vertices().into_iter().collect();
        let read = self.config.read_field.clone();

        let removed: Vec<String> = cells
            .keys()
            .filter(|id| !vertices.contains(id.as_str()))
            .cloned()
            .collect();

        // post-reconciliation scalars, sampling in table order
        let mut scalars: IndexMap<String, f64> = IndexMap::with_capacity(vertices.len());
        let mut added = IndexSet::new();
        for id in &vertices {
            let scalar = match cells.get(id) {
                Some(entity) => entity.get(&read).and_then(Value::as_float).unwrap_or_default(),
                None => {
                    added.insert(id.clone());
                    self.sample()
                }
            };
            scalars.insert(id.clone(), scalar);
        }

        let mut delta = Delta::branch().remove(removed.iter().cloned());
        for id in &vertices {
            let sum: f64 = table
                .neighbor_weights(id)
                .iter()
                .filter_map(|(neighbor, weight)| scalars.get(neighbor).map(|s| weight * s))
                .sum();

            if added.contains(id) {
                delta = delta.add(id.clone(), self.entity(scalars[id], sum));
                continue;
            }
            let stored = cells
                .get(id)
                .and_then(|entity| entity.get(&self.config.sum_field))
                .and_then(Value::as_float);
            if stored != Some(sum) {
                let mut fields = ValueMap::new();
                fields.insert(self.config.sum_field.clone(), Value::Float(sum));
                delta = delta.child(id.clone(), Delta::merge(Value::Map(fields)));
            }
        }

        if !removed.is_empty() || !added.is_empty() {
            debug!(removed = removed.len(), added = added.len(), "population reconciled");
        }
        delta
    }
}

impl Unit for NeighborCoupling {
    fn inputs(&self) -> Ports {
        Ports::from([
            (
                "connections".to_string(),
                Port::wired("map[map[float]]", &["connections"]),
            ),
            ("cells".to_string(), Port::wired(self.cells_type(), &["cells"])),
        ])
    }

    fn outputs(&self) -> Ports {
        Ports::from([("cells".to_string(), Port::wired(self.cells_type(), &["cells"]))])
    }
}

impl Step for NeighborCoupling {
    fn update(&mut self, state: &State) -> Result<Update, AdapterError> {
        let table = NeighborTable::from_value(state.get("connections").unwrap_or(&Value::Null))?;
        let empty = ValueMap::new();
        let cells = match state.get("cells") {
            Some(Value::Map(cells)) => cells,
            Some(Value::Null) | None => &empty,
            Some(other) => {
                return Err(AdapterError::new(format!(
                    "cells must be a map, found {}",
                    other.kind_name()
                )));
            }
        };

        let delta = self.reconcile(&table, cells);
        if delta.is_empty() {
            return Ok(Update::new());
        }
        Ok(Update::from([("cells".to_string(), delta)]))
    }
}
