//! Planar sheet
//!
//! Stand-in multicellular model: a fixed rectangular sheet of square cells.
//! Every update publishes the contact table, where two cells sharing an edge
//! touch over `2 * cell_radius`.

use indexmap::IndexMap;
use multisim_runtime::{
    AdapterError, Delta, HasNeighborQuery, NeighborTable, Port, Ports, Process, State, Time, Unit,
    UnitRegistry, Update, Value,
};
use serde::{Deserialize, Serialize};

pub const PLANAR_SHEET: &str = "local:planar_sheet";

/// Port and default wire of the published contact table.
pub const NEIGHBORHOODS: &str = "neighborhood_surface_areas";

pub(crate) const TABLE_TYPE: &str = "overwrite[map[map[float]]]";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanarSheetConfig {
    pub num_cells_x: usize,
    pub num_cells_y: usize,
    pub cell_radius: f64,
}

impl Default for PlanarSheetConfig {
    fn default() -> Self {
        Self {
            num_cells_x: 3,
            num_cells_y: 3,
            cell_radius: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlanarSheet {
    config: PlanarSheetConfig,
    table: NeighborTable,
}

impl PlanarSheet {
    pub fn new(config: PlanarSheetConfig) -> Result<Self, AdapterError> {
        if !(config.cell_radius.is_finite() && config.cell_radius > 0.0) {
            return Err(AdapterError::new("cell_radius must be positive"));
        }
        let table = lattice(&config);
        Ok(Self { config, table })
    }

    pub fn from_config(config: &Value) -> Result<Self, AdapterError> {
        Self::new(config.deserialize_into()?)
    }

    pub fn register(units: &mut UnitRegistry) {
        units.register_process(PLANAR_SHEET, Self::from_config);
    }

    pub fn config(&self) -> &PlanarSheetConfig {
        &self.config
    }

    pub fn table(&self) -> &NeighborTable {
        &self.table
    }
}

/// Cell ids are row-major indices.
fn lattice(config: &PlanarSheetConfig) -> NeighborTable {
    let (nx, ny) = (config.num_cells_x, config.num_cells_y);
    let contact = 2.0 * config.cell_radius;
    let mut table = NeighborTable::new();
    for y in 0..ny {
        for x in 0..nx {
            let mut neighbors = IndexMap::new();
            let mut touch = |cx: usize, cy: usize| {
                neighbors.insert((cy * nx + cx).to_string(), contact);
            };
            if y > 0 {
                touch(x, y - 1);
            }
            if x > 0 {
                touch(x - 1, y);
            }
            if x + 1 < nx {
                touch(x + 1, y);
            }
            if y + 1 < ny {
                touch(x, y + 1);
            }
            table.insert((y * nx + x).to_string(), neighbors);
        }
    }
    table
}

impl HasNeighborQuery for PlanarSheet {
    fn vertices(&self) -> Vec<String> {
        self.table.vertices()
    }

    fn neighbor_weights(&self, id: &str) -> IndexMap<String, f64> {
        self.table.neighbor_weights(id)
    }
}

impl Unit for PlanarSheet {
    fn inputs(&self) -> Ports {
        Ports::new()
    }

    fn outputs(&self) -> Ports {
        Ports::from([(NEIGHBORHOODS.to_string(), Port::wired(TABLE_TYPE, &[NEIGHBORHOODS]))])
    }

    fn initial_state(&mut self) -> Result<State, AdapterError> {
        Ok(State::from([(NEIGHBORHOODS.to_string(), self.table.to_value())]))
    }
}

impl Process for PlanarSheet {
    fn update(&mut self, _state: &State, _interval: Time) -> Result<Update, AdapterError> {
        Ok(Update::from([(
            NEIGHBORHOODS.to_string(),
            Delta::merge(self.table.to_value()),
        )]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lattice_contacts() {
        let sheet = PlanarSheet::new(PlanarSheetConfig {
            num_cells_x: 3,
            num_cells_y: 2,
            cell_radius: 0.5,
        })
        .unwrap();
        assert_eq!(sheet.vertices().len(), 6);
        // corner
        assert_eq!(
            sheet.neighbor_weights("0"),
            IndexMap::from([("1".to_string(), 1.0), ("3".to_string(), 1.0)])
        );
        // middle of the bottom row
        assert_eq!(
            sheet.neighbor_weights("4").keys().collect::<Vec<_>>(),
            vec!["1", "3", "5"]
        );
    }

    #[test]
    fn test_update_publishes_table() {
        let mut sheet =
            PlanarSheet::from_config(&Value::from(json!({"num_cells_x": 2, "num_cells_y": 1}))).unwrap();
        let update = sheet.update(&State::new(), 1.0).unwrap();
        assert_eq!(
            update[NEIGHBORHOODS],
            Delta::merge(Value::from(json!({"0": {"1": 2.0}, "1": {"0": 2.0}})))
        );
    }

    #[test]
    fn test_invalid_radius() {
        assert!(PlanarSheet::from_config(&Value::from(json!({"cell_radius": 0.0}))).is_err());
    }
}
