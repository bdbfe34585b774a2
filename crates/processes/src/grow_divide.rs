//! Grow and divide
//!
//! A per-cell process that accumulates mass and, once the mass reaches a
//! threshold, replaces its cell by daughters in one reaction. Each daughter
//! is a copy of the mother carrying an equal share of the mass; unit
//! declarations inside the copy (including this process) are re-instantiated
//! by the scheduler, and the grow-divide declaration is renamed to the
//! daughter's id.

use multisim_runtime::{
    AdapterError, Delta, Port, Ports, Process, Reaction, State, Time, Unit, UnitDeclaration,
    UnitRegistry, Update, Value,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::operators::integrate;

pub const GROW_DIVIDE: &str = "local:grow_divide";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrowDivideConfig {
    /// Key of the cell this process lives in.
    pub id: String,
    pub growth_rate: f64,
    pub threshold: f64,
    pub divisions: usize,
    pub initial_mass: f64,
}

impl Default for GrowDivideConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            growth_rate: 0.1,
            threshold: 2.0,
            divisions: 2,
            initial_mass: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GrowDivide {
    config: GrowDivideConfig,
}

impl GrowDivide {
    pub fn new(config: GrowDivideConfig) -> Result<Self, AdapterError> {
        if config.id.is_empty() {
            return Err(AdapterError::new("grow_divide needs the id of its cell"));
        }
        if config.divisions < 2 {
            return Err(AdapterError::new("divisions must be at least 2"));
        }
        if config.threshold.is_nan() || config.threshold <= 0.0 {
            return Err(AdapterError::new("threshold must be positive"));
        }
        Ok(Self { config })
    }

    pub fn from_config(config: &Value) -> Result<Self, AdapterError> {
        Self::new(config.deserialize_into()?)
    }

    pub fn register(units: &mut UnitRegistry) {
        units.register_process(GROW_DIVIDE, Self::from_config);
    }

    /// Daughter literal `index` of a mother cell holding `mass`.
    fn daughter(&self, mother: &Value, mass: f64, index: usize) -> Result<(String, Value), AdapterError> {
        let id = format!("{}_{index}", self.config.id);
        let Some(fields) = mother.as_map() else {
            return Err(AdapterError::new(format!(
                "cell `{}` must be a map, found {}",
                self.config.id,
                mother.kind_name()
            )));
        };
        let mut fields = fields.clone();
        fields.insert("mass".to_string(), Value::Float(mass));
        for value in fields.values_mut() {
            self.rename_declaration(value, &id);
        }
        Ok((id, Value::Map(fields)))
    }

    fn rename_declaration(&self, value: &mut Value, id: &str) {
        if !UnitDeclaration::is_declaration(value) {
            return;
        }
        let Value::Map(decl) = value else {
            return;
        };
        let ours = decl.get("address").and_then(Value::as_str) == Some(GROW_DIVIDE)
            && decl
                .get("config")
                .and_then(|c| c.get("id"))
                .and_then(Value::as_str)
                == Some(self.config.id.as_str());
        if ours && let Some(Value::Map(config)) = decl.get_mut("config") {
            config.insert("id".to_string(), Value::String(id.to_string()));
        }
    }
}

impl Unit for GrowDivide {
    fn inputs(&self) -> Ports {
        Ports::from([
            ("mass".to_string(), Port::wired("float", &["mass"])),
            ("activator".to_string(), Port::wired("float", &["activator"])),
            ("cell".to_string(), Port::wired("any", &["."])),
        ])
    }

    fn outputs(&self) -> Ports {
        Ports::from([
            ("mass".to_string(), Port::wired("float", &["mass"])),
            ("population".to_string(), Port::wired("any", &[".."])),
        ])
    }

    fn initial_state(&mut self) -> Result<State, AdapterError> {
        Ok(State::from([
            ("mass".to_string(), Value::Float(self.config.initial_mass)),
            ("activator".to_string(), Value::Float(1.0)),
        ]))
    }
}

impl Process for GrowDivide {
    fn update(&mut self, state: &State, interval: Time) -> Result<Update, AdapterError> {
        let number = |port: &str| {
            state
                .get(port)
                .and_then(Value::as_float)
                .ok_or_else(|| AdapterError::new(format!("input `{port}` is not a number")))
        };
        let mass = number("mass")?;
        let activator = number("activator")?;
        let grown = integrate(mass, self.config.growth_rate * activator, interval);

        if grown < self.config.threshold {
            return Ok(Update::from([("mass".to_string(), Delta::merge(grown - mass))]));
        }

        let mother = state.get("cell").unwrap_or(&Value::Null);
        let share = grown / self.config.divisions as f64;
        let daughters = (0..self.config.divisions)
            .map(|i| self.daughter(mother, share, i))
            .collect::<Result<_, _>>()?;
        debug!(cell = %self.config.id, mass = grown, divisions = self.config.divisions, "dividing");

        Ok(Update::from([(
            "population".to_string(),
            Delta::branch().react(Reaction::Divide {
                mother: self.config.id.clone(),
                daughters,
            }),
        )]))
    }
}
