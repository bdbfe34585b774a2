//! Unit contract
//!
//! Processes and steps are the two kinds of computation unit. Both declare
//! typed input and output ports, receive copies of their input values and
//! answer with one [`Delta`] per output port. They never touch the tree.
//!
//! External simulators are wrapped behind the capability traits
//! [`Steppable`], [`HasNeighborQuery`] and [`HasScalarState`]; an adapter
//! implements exactly the capabilities it has.

use std::fmt;

use indexmap::IndexMap;
use tracing::warn;

use crate::delta::Delta;
use crate::error::{AdapterError, Error, Result};
use crate::path::Path;
use crate::types::{Time, UnitKind, Value};

/// Declared port: a type expression and an optional default wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Port {
    pub type_expr: String,
    pub default_wire: Option<Vec<String>>,
}

impl Port {
    pub fn new(type_expr: impl Into<String>) -> Self {
        Self {
            type_expr: type_expr.into(),
            default_wire: None,
        }
    }

    /// A port that connects to `wire` when the declaration does not wire it.
    pub fn wired(type_expr: impl Into<String>, wire: &[&str]) -> Self {
        Self {
            type_expr: type_expr.into(),
            default_wire: Some(wire.iter().map(|s| s.to_string()).collect()),
        }
    }
}

/// Port name to port declaration, in declaration order.
pub type Ports = IndexMap<String, Port>;

/// Port name to a copy of the port's current value.
pub type State = IndexMap<String, Value>;

/// Port name to the delta the unit wants applied there.
pub type Update = IndexMap<String, Delta>;

/// Build a [`Ports`] table from `(name, type)` pairs.
pub fn ports(entries: &[(&str, &str)]) -> Ports {
    entries
        .iter()
        .map(|(name, ty)| (name.to_string(), Port::new(*ty)))
        .collect()
}

/// Behaviour shared by processes and steps.
pub trait Unit: Send {
    fn inputs(&self) -> Ports;

    fn outputs(&self) -> Ports;

    /// Values used to seed port paths that are missing from the tree.
    fn initial_state(&mut self) -> std::result::Result<State, AdapterError> {
        Ok(State::new())
    }
}

/// A unit that advances over a time interval.
pub trait Process: Unit {
    fn update(&mut self, state: &State, interval: Time) -> std::result::Result<Update, AdapterError>;
}

/// A unit that reacts instantaneously to input changes.
///
/// Updates must be idempotent: identical inputs produce an equivalent delta
/// and a second call on its own output produces an empty one.
pub trait Step: Unit {
    fn update(&mut self, state: &State) -> std::result::Result<Update, AdapterError>;
}

/// Advance a wrapped simulator.
pub trait Steppable {
    fn step(&mut self, dt: Time) -> std::result::Result<(), AdapterError>;
}

/// Adjacency information for an entity population.
pub trait HasNeighborQuery {
    /// Entity ids in the adjacency, in stable order.
    fn vertices(&self) -> Vec<String>;

    /// Neighbor id to contact weight for `id`.
    fn neighbor_weights(&self, id: &str) -> IndexMap<String, f64>;
}

/// Named scalar state of a wrapped simulator.
pub trait HasScalarState {
    fn scalar(&self, name: &str) -> Option<f64>;

    fn set_scalar(&mut self, name: &str, value: f64) -> std::result::Result<(), AdapterError>;
}

/// A constructed unit.
pub enum UnitImpl {
    Process(Box<dyn Process>),
    Step(Box<dyn Step>),
}

impl UnitImpl {
    pub fn kind(&self) -> UnitKind {
        match self {
            UnitImpl::Process(_) => UnitKind::Process,
            UnitImpl::Step(_) => UnitKind::Step,
        }
    }

    pub fn inputs(&self) -> Ports {
        match self {
            UnitImpl::Process(p) => p.inputs(),
            UnitImpl::Step(s) => s.inputs(),
        }
    }

    pub fn outputs(&self) -> Ports {
        match self {
            UnitImpl::Process(p) => p.outputs(),
            UnitImpl::Step(s) => s.outputs(),
        }
    }

    pub fn initial_state(&mut self) -> std::result::Result<State, AdapterError> {
        match self {
            UnitImpl::Process(p) => p.initial_state(),
            UnitImpl::Step(s) => s.initial_state(),
        }
    }
}

impl fmt::Debug for UnitImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UnitImpl::{}", self.kind())
    }
}

type Constructor = Box<dyn Fn(&Value) -> std::result::Result<UnitImpl, AdapterError> + Send + Sync>;

/// Maps unit addresses (`local:<name>`) to constructors.
#[derive(Default)]
pub struct UnitRegistry {
    constructors: IndexMap<String, (UnitKind, Constructor)>,
}

impl fmt::Debug for UnitRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitRegistry")
            .field("addresses", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a process constructor under `address`.
    pub fn register_process<P, F>(&mut self, address: &str, build: F)
    where
        P: Process + 'static,
        F: Fn(&Value) -> std::result::Result<P, AdapterError> + Send + Sync + 'static,
    {
        let constructor: Constructor =
            Box::new(move |config| build(config).map(|p| UnitImpl::Process(Box::new(p))));
        self.insert(address, UnitKind::Process, constructor);
    }

    /// Register a step constructor under `address`.
    pub fn register_step<S, F>(&mut self, address: &str, build: F)
    where
        S: Step + 'static,
        F: Fn(&Value) -> std::result::Result<S, AdapterError> + Send + Sync + 'static,
    {
        let constructor: Constructor =
            Box::new(move |config| build(config).map(|s| UnitImpl::Step(Box::new(s))));
        self.insert(address, UnitKind::Step, constructor);
    }

    fn insert(&mut self, address: &str, kind: UnitKind, constructor: Constructor) {
        if self
            .constructors
            .insert(address.to_string(), (kind, constructor))
            .is_some()
        {
            warn!(address, "replacing registered unit");
        }
    }

    pub fn contains(&self, address: &str) -> bool {
        self.constructors.contains_key(address)
    }

    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    /// Construct the unit declared at `unit`.
    ///
    /// The declared kind must match the registered kind.
    pub fn construct(&self, unit: &Path, kind: UnitKind, address: &str, config: &Value) -> Result<UnitImpl> {
        let (registered, constructor) =
            self.constructors
                .get(address)
                .ok_or_else(|| Error::UnknownAddress {
                    unit: unit.clone(),
                    address: address.to_string(),
                })?;
        if *registered != kind {
            return Err(Error::InvalidDeclaration {
                path: unit.clone(),
                message: format!("`{address}` is a {registered}, declared as a {kind}"),
            });
        }
        constructor(config).map_err(|source| Error::Adapter {
            unit: unit.clone(),
            source,
        })
    }
}
