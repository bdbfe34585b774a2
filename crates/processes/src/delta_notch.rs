//! Delta-Notch lateral inhibition
//!
//! [`DeltaNotchProcess`] wraps any subcellular model that can be stepped and
//! exposes its scalars by name. Each update it loads the cell's current
//! `delta`, `notch` and `delta_neighbors` into the model, advances it by the
//! interval and reports the change of `delta` and `notch` as additive deltas.
//!
//! [`CollierModel`] is the two-species model of Collier et al. (1996):
//!
//! ```text
//! dN/dt = D̄^k / (a + D̄^k) - N
//! dD/dt = v * (1 / (1 + b * N^h) - D)
//! ```
//!
//! where `D̄` is the contact-weighted neighbor delta.

use multisim_runtime::{
    AdapterError, Delta, HasScalarState, Port, Ports, Process, State, Steppable, Time, Unit,
    UnitRegistry, Update, Value,
};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::operators::{IntegrationMethod, integrate_system, substeps};

pub const DELTA_NOTCH: &str = "local:delta_notch";

const DELTA: &str = "delta";
const NOTCH: &str = "notch";
const DELTA_NEIGHBORS: &str = "delta_neighbors";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollierParameters {
    pub k: f64,
    pub a: f64,
    pub v: f64,
    pub b: f64,
    pub h: f64,
}

impl Default for CollierParameters {
    fn default() -> Self {
        Self {
            k: 2.0,
            a: 0.01,
            v: 1.0,
            b: 100.0,
            h: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollierConfig {
    pub parameters: CollierParameters,
    pub initial_delta: f64,
    pub initial_notch: f64,
    pub method: IntegrationMethod,
    /// Longest internal step; longer intervals are split.
    pub max_dt: f64,
}

impl Default for CollierConfig {
    fn default() -> Self {
        Self {
            parameters: CollierParameters::default(),
            initial_delta: 0.5,
            initial_notch: 0.5,
            method: IntegrationMethod::Rk4,
            max_dt: 0.1,
        }
    }
}

/// Two-species lateral inhibition model.
#[derive(Debug, Clone, PartialEq)]
pub struct CollierModel {
    parameters: CollierParameters,
    method: IntegrationMethod,
    max_dt: f64,
    delta: f64,
    notch: f64,
    delta_neighbors: f64,
}

impl CollierModel {
    pub fn new(config: &CollierConfig) -> Self {
        Self {
            parameters: config.parameters,
            method: config.method,
            max_dt: config.max_dt,
            delta: config.initial_delta,
            notch: config.initial_notch,
            delta_neighbors: 0.0,
        }
    }

    fn rates(&self, &[delta, notch]: &[f64; 2]) -> [f64; 2] {
        let CollierParameters { k, a, v, b, h } = self.parameters;
        let signal = self.delta_neighbors.max(0.0).powf(k);
        let d_notch = signal / (a + signal) - notch;
        let d_delta = v * (1.0 / (1.0 + b * notch.max(0.0).powf(h)) - delta);
        [d_delta, d_notch]
    }
}

impl Steppable for CollierModel {
    fn step(&mut self, dt: Time) -> Result<(), AdapterError> {
        let (count, h) = substeps(dt, self.max_dt);
        let mut state = [self.delta, self.notch];
        for _ in 0..count {
            state = integrate_system(state, |s| self.rates(s), h, self.method);
        }
        if state.iter().any(|x| !x.is_finite()) {
            return Err(AdapterError::new(format!("delta-notch state diverged: {state:?}")));
        }
        [self.delta, self.notch] = state;
        Ok(())
    }
}

impl HasScalarState for CollierModel {
    fn scalar(&self, name: &str) -> Option<f64> {
        match name {
            DELTA => Some(self.delta),
            NOTCH => Some(self.notch),
            DELTA_NEIGHBORS => Some(self.delta_neighbors),
            _ => None,
        }
    }

    fn set_scalar(&mut self, name: &str, value: f64) -> Result<(), AdapterError> {
        match name {
            DELTA => self.delta = value,
            NOTCH => self.notch = value,
            DELTA_NEIGHBORS => self.delta_neighbors = value,
            _ => return Err(AdapterError::new(format!("unknown scalar `{name}`"))),
        }
        Ok(())
    }
}

/// Process advancing one cell's delta-notch model.
#[derive(Debug, Clone)]
pub struct DeltaNotchProcess<M> {
    model: M,
}

impl<M> DeltaNotchProcess<M>
where
    M: Steppable + HasScalarState + Send + 'static,
{
    pub fn new(model: M) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    fn read(&self, name: &str) -> Result<f64, AdapterError> {
        self.model
            .scalar(name)
            .ok_or_else(|| AdapterError::new(format!("model has no scalar `{name}`")))
    }
}

impl DeltaNotchProcess<CollierModel> {
    pub fn from_config(config: &Value) -> Result<Self, AdapterError> {
        let config: CollierConfig = config.deserialize_into()?;
        Ok(Self::new(CollierModel::new(&config)))
    }

    /// Register the Collier model under [`DELTA_NOTCH`].
    pub fn register(units: &mut UnitRegistry) {
        units.register_process(DELTA_NOTCH, Self::from_config);
    }
}

impl<M> Unit for DeltaNotchProcess<M>
where
    M: Steppable + HasScalarState + Send + 'static,
{
    fn inputs(&self) -> Ports {
        Ports::from([
            (DELTA.to_string(), Port::wired("float", &[DELTA])),
            (NOTCH.to_string(), Port::wired("float", &[NOTCH])),
            (DELTA_NEIGHBORS.to_string(), Port::wired("float", &[DELTA_NEIGHBORS])),
        ])
    }

    fn outputs(&self) -> Ports {
        Ports::from([
            (DELTA.to_string(), Port::wired("float", &[DELTA])),
            (NOTCH.to_string(), Port::wired("float", &[NOTCH])),
        ])
    }

    fn initial_state(&mut self) -> Result<State, AdapterError> {
        Ok(State::from([
            (DELTA.to_string(), Value::Float(self.read(DELTA)?)),
            (NOTCH.to_string(), Value::Float(self.read(NOTCH)?)),
        ]))
    }
}

impl<M> Process for DeltaNotchProcess<M>
where
    M: Steppable + HasScalarState + Send + 'static,
{
    fn update(&mut self, state: &State, interval: Time) -> Result<Update, AdapterError> {
        for name in [DELTA, NOTCH, DELTA_NEIGHBORS] {
            let value = state
                .get(name)
                .and_then(Value::as_float)
                .ok_or_else(|| AdapterError::new(format!("input `{name}` is not a number")))?;
            self.model.set_scalar(name, value)?;
        }
        let (delta, notch) = (self.read(DELTA)?, self.read(NOTCH)?);

        self.model.step(interval)?;

        let (next_delta, next_notch) = (self.read(DELTA)?, self.read(NOTCH)?);
        trace!(interval, delta = next_delta, notch = next_notch, "delta-notch step");
        Ok(Update::from([
            (DELTA.to_string(), Delta::merge(next_delta - delta)),
            (NOTCH.to_string(), Delta::merge(next_notch - notch)),
        ]))
    }
}
