//! Multisim Runtime.
//!
//! Composition and scheduling engine for multiscale simulations. A
//! simulation is a single hierarchical state tree; processes and steps are
//! declared inside it and wired to tree paths through typed ports.
//!
//! # Architecture
//!
//! - [`types`] - Core types: [`Value`], [`Time`], [`UnitKind`]
//! - [`path`] - Tree addresses and relative wire resolution
//! - [`schema`] / [`registry`] - Type expressions, merge and validation rules
//! - [`tree`] - The [`StateTree`] with embedded unit declarations
//! - [`delta`] - Update deltas and transactional application
//! - [`unit`] - The [`Process`] / [`Step`] contract and adapter capabilities
//! - [`wiring`] - Port-to-path binding
//! - [`dag`] - Step dependency ordering
//! - [`scheduler`] - The main [`Scheduler`] type
//! - [`coupling`] - Neighbor coupling step for entity populations
//! - [`emitter`] - Snapshot collection and sinks
//! - [`error`] - Error types
//!
//! # Execution Model
//!
//! Each tick proceeds in three stages:
//!
//! 1. **Settle** - Steps run to a fixpoint in dependency order
//! 2. **Advance** - Due processes fire against one snapshot; deltas commit in order
//! 3. **Emit** - Configured paths are captured
//!
//! # Example
//!
//! ```ignore
//! use multisim_runtime::{CompositeDefinition, Scheduler, TypeRegistry, UnitRegistry};
//!
//! let definition = CompositeDefinition::from_json(text)?;
//! let mut scheduler = Scheduler::build(definition, TypeRegistry::new(), units)?;
//! let report = scheduler.run(100.0)?;
//! ```

pub mod composite;
pub mod config;
pub mod coupling;
pub mod dag;
pub mod delta;
pub mod emitter;
pub mod error;
pub mod path;
pub mod registry;
pub mod scheduler;
pub mod schema;
pub mod stable_hash;
pub mod tree;
pub mod types;
pub mod unit;
pub mod wiring;

pub use composite::CompositeDefinition;
pub use config::{EmitterConfig, SchedulerConfig};
pub use coupling::{NeighborCoupling, NeighborTable};
pub use delta::{Applied, Delta, Reaction};
pub use emitter::{EmitSink, Emitter, JsonLinesSink, NullSink};
pub use error::{AdapterError, Error, Result, SinkError};
pub use path::Path;
pub use registry::TypeRegistry;
pub use scheduler::{RunReport, Scheduler, UnitFault};
pub use schema::Schema;
pub use tree::StateTree;
pub use types::*;
pub use unit::{
    HasNeighborQuery, HasScalarState, Port, Ports, Process, State, Step, Steppable, Unit,
    UnitImpl, UnitRegistry, Update, ports,
};
pub use wiring::{UnitDeclaration, Wire};
