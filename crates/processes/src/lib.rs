//! Multisim Processes.
//!
//! Reference adapters for the multisim runtime:
//!
//! - [`planar_sheet`] - lattice contact tables from a stand-in multicellular model
//! - [`scripted_neighbors`] - contact tables replayed from a schedule
//! - [`delta_notch`] - per-cell Collier delta-notch model
//! - [`grow_divide`] - per-cell growth with division reactions
//! - [`operators`] - explicit integrators shared by the models
//!
//! [`register_processes`] makes all of them, and the runtime's neighbor
//! coupling step, available under their `local:` addresses.

pub mod delta_notch;
pub mod grow_divide;
pub mod operators;
pub mod planar_sheet;
pub mod scripted_neighbors;

use multisim_runtime::{NeighborCoupling, UnitRegistry};

pub use delta_notch::{CollierConfig, CollierModel, CollierParameters, DELTA_NOTCH, DeltaNotchProcess};
pub use grow_divide::{GROW_DIVIDE, GrowDivide, GrowDivideConfig};
pub use multisim_runtime::coupling::NEIGHBOR_COUPLING;
pub use operators::IntegrationMethod;
pub use planar_sheet::{NEIGHBORHOODS, PLANAR_SHEET, PlanarSheet, PlanarSheetConfig};
pub use scripted_neighbors::{SCRIPTED_NEIGHBORS, ScheduledTable, ScriptedNeighbors, ScriptedNeighborsConfig};

/// Register every reference adapter.
pub fn register_processes(units: &mut UnitRegistry) {
    PlanarSheet::register(units);
    ScriptedNeighbors::register(units);
    DeltaNotchProcess::<CollierModel>::register(units);
    GrowDivide::register(units);
    NeighborCoupling::register(units);
}

/// A registry holding every reference adapter.
pub fn registry() -> UnitRegistry {
    let mut units = UnitRegistry::new();
    register_processes(&mut units);
    units
}
