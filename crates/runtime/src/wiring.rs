//! Unit declarations and wire resolution
//!
//! A unit lives in the tree as a declaration node:
//!
//! ```json
//! {
//!   "_type": "process",
//!   "address": "local:grow_divide",
//!   "config": {"threshold": 2.0},
//!   "inputs": {"mass": ["mass"]},
//!   "outputs": {"environment": [".."]},
//!   "interval": 1.0
//! }
//! ```
//!
//! Wires are relative to the node that contains the unit; `..` climbs one
//! level. Resolution turns every declared port into absolute tree paths.

use indexmap::IndexMap;
use tracing::warn;

use crate::error::{Error, Result};
use crate::path::Path;
use crate::registry::TypeRegistry;
use crate::schema::Schema;
use crate::types::{Time, UnitKind, Value, ValueMap};
use crate::unit::Ports;

/// Interval used for processes that do not declare one.
pub const DEFAULT_INTERVAL: Time = 1.0;

/// A relative wire: a path, or a tree of wires for structured ports.
#[derive(Debug, Clone, PartialEq)]
pub enum Wire {
    Path(Vec<String>),
    Tree(IndexMap<String, Wire>),
}

impl Wire {
    pub fn path<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Wire::Path(segments.into_iter().map(Into::into).collect())
    }

    /// Parse `"a/b"`, `["a", "b"]` or `{"field": <wire>, ...}`.
    pub fn from_value(value: &Value) -> Option<Wire> {
        match value {
            Value::String(s) => Some(Wire::Path(
                s.split('/')
                    .filter(|seg| !seg.is_empty())
                    .map(str::to_string)
                    .collect(),
            )),
            Value::List(items) => items
                .iter()
                .map(|item| item.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
                .map(Wire::Path),
            Value::Map(fields) => fields
                .iter()
                .map(|(k, v)| Wire::from_value(v).map(|w| (k.clone(), w)))
                .collect::<Option<IndexMap<_, _>>>()
                .map(Wire::Tree),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Wire::Path(segments) => {
                Value::List(segments.iter().map(|s| Value::String(s.clone())).collect())
            }
            Wire::Tree(fields) => Value::Map(
                fields
                    .iter()
                    .map(|(k, w)| (k.clone(), w.to_value()))
                    .collect(),
            ),
        }
    }
}

/// A unit as declared in the state tree.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitDeclaration {
    pub kind: UnitKind,
    pub address: String,
    pub config: Value,
    pub inputs: IndexMap<String, Wire>,
    pub outputs: IndexMap<String, Wire>,
    pub interval: Option<Time>,
}

impl UnitDeclaration {
    pub fn new(kind: UnitKind, address: impl Into<String>) -> Self {
        Self {
            kind,
            address: address.into(),
            config: Value::map(),
            inputs: IndexMap::new(),
            outputs: IndexMap::new(),
            interval: None,
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_input(mut self, port: &str, wire: Wire) -> Self {
        self.inputs.insert(port.to_string(), wire);
        self
    }

    pub fn with_output(mut self, port: &str, wire: Wire) -> Self {
        self.outputs.insert(port.to_string(), wire);
        self
    }

    pub fn with_interval(mut self, interval: Time) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Whether a tree literal is a unit declaration.
    pub fn is_declaration(value: &Value) -> bool {
        matches!(
            value.get("_type").and_then(Value::as_str),
            Some("process" | "step")
        )
    }

    pub fn from_value(value: &Value, path: &Path) -> Result<Self> {
        let invalid = |message: String| Error::InvalidDeclaration {
            path: path.clone(),
            message,
        };

        let kind = match value.get("_type").and_then(Value::as_str) {
            Some("process") => UnitKind::Process,
            Some("step") => UnitKind::Step,
            other => return Err(invalid(format!("unknown unit kind {other:?}"))),
        };
        let address = value
            .get("address")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("missing `address`".to_string()))?
            .to_string();
        let config = value.get("config").cloned().unwrap_or_else(Value::map);
        if !matches!(config, Value::Map(_)) {
            return Err(invalid("`config` must be a map".to_string()));
        }

        let parse_wires = |key: &str| -> Result<IndexMap<String, Wire>> {
            let Some(entries) = value.get(key) else {
                return Ok(IndexMap::new());
            };
            let entries = entries
                .as_map()
                .ok_or_else(|| invalid(format!("`{key}` must be a map of wires")))?;
            entries
                .iter()
                .map(|(port, wire)| {
                    Wire::from_value(wire)
                        .map(|w| (port.clone(), w))
                        .ok_or_else(|| invalid(format!("malformed wire for port `{port}`")))
                })
                .collect()
        };
        let inputs = parse_wires("inputs")?;
        let outputs = parse_wires("outputs")?;

        let interval = match value.get("interval") {
            None | Some(Value::Null) => None,
            Some(v) => match v.as_float() {
                Some(dt) if dt > 0.0 && dt.is_finite() => Some(dt),
                _ => return Err(invalid(format!("interval must be a positive number, got {v}"))),
            },
        };
        if kind == UnitKind::Step && interval.is_some() {
            warn!(unit = %path, "ignoring interval on step");
        }

        Ok(Self {
            kind,
            address,
            config,
            inputs,
            outputs,
            interval: if kind == UnitKind::Process { interval } else { None },
        })
    }

    pub fn to_value(&self) -> Value {
        let wires = |entries: &IndexMap<String, Wire>| -> Value {
            Value::Map(
                entries
                    .iter()
                    .map(|(port, wire)| (port.clone(), wire.to_value()))
                    .collect(),
            )
        };
        let mut map = ValueMap::new();
        map.insert("_type".to_string(), Value::String(self.kind.to_string()));
        map.insert("address".to_string(), Value::String(self.address.clone()));
        map.insert("config".to_string(), self.config.clone());
        map.insert("inputs".to_string(), wires(&self.inputs));
        map.insert("outputs".to_string(), wires(&self.outputs));
        if let Some(interval) = self.interval {
            map.insert("interval".to_string(), Value::Float(interval));
        }
        Value::Map(map)
    }
}

/// Where a port's data lives in the tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    Path(Path),
    Fields(IndexMap<String, ResolvedPort>),
}

/// A port with its resolved schema and binding.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPort {
    pub schema: Schema,
    pub binding: Binding,
}

impl ResolvedPort {
    /// Every `(path, schema)` pair the port touches.
    pub fn leaves(&self) -> Vec<(&Path, &Schema)> {
        match &self.binding {
            Binding::Path(path) => vec![(path, &self.schema)],
            Binding::Fields(fields) => fields.values().flat_map(ResolvedPort::leaves).collect(),
        }
    }
}

/// Resolved ports of one unit instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Wiring {
    pub inputs: IndexMap<String, ResolvedPort>,
    pub outputs: IndexMap<String, ResolvedPort>,
}

impl Wiring {
    /// Resolve the declared wires of the unit at `unit` against its ports.
    ///
    /// Ports without a wire fall back to the port's default wire; ports with
    /// neither are an [`Error::UnresolvedWire`].
    pub fn resolve(
        unit: &Path,
        decl: &UnitDeclaration,
        inputs: &Ports,
        outputs: &Ports,
        types: &TypeRegistry,
    ) -> Result<Wiring> {
        let scope = unit.parent().unwrap_or_default();
        let resolve_side = |ports: &Ports, wires: &IndexMap<String, Wire>| {
            for port in wires.keys() {
                if !ports.contains_key(port) {
                    warn!(unit = %unit, port = %port, "wire for undeclared port ignored");
                }
            }
            ports
                .iter()
                .map(|(name, port)| -> Result<(String, ResolvedPort)> {
                    let schema = types.resolve(&port.type_expr)?;
                    let wire = wires
                        .get(name)
                        .cloned()
                        .or_else(|| port.default_wire.clone().map(Wire::Path))
                        .ok_or_else(|| Error::UnresolvedWire {
                            unit: unit.clone(),
                            port: name.clone(),
                        })?;
                    let resolved = bind(unit, name, &scope, &wire, schema)?;
                    Ok((name.clone(), resolved))
                })
                .collect::<Result<IndexMap<_, _>>>()
        };

        Ok(Wiring {
            inputs: resolve_side(inputs, &decl.inputs)?,
            outputs: resolve_side(outputs, &decl.outputs)?,
        })
    }

    pub fn read_paths(&self) -> Vec<Path> {
        collect_paths(&self.inputs)
    }

    pub fn write_paths(&self) -> Vec<Path> {
        collect_paths(&self.outputs)
    }
}

fn collect_paths(ports: &IndexMap<String, ResolvedPort>) -> Vec<Path> {
    ports
        .values()
        .flat_map(|port| port.leaves().into_iter().map(|(path, _)| path.clone()))
        .collect()
}

fn bind(unit: &Path, port: &str, scope: &Path, wire: &Wire, schema: Schema) -> Result<ResolvedPort> {
    let unresolved = || Error::UnresolvedWire {
        unit: unit.clone(),
        port: port.to_string(),
    };
    match wire {
        Wire::Path(segments) => {
            let path = scope.resolve(segments).ok_or_else(unresolved)?;
            Ok(ResolvedPort {
                schema,
                binding: Binding::Path(path),
            })
        }
        Wire::Tree(fields) => {
            let mut bound = IndexMap::with_capacity(fields.len());
            for (field, sub) in fields {
                let field_schema = schema.child(field).cloned().unwrap_or(Schema::Opaque);
                bound.insert(field.clone(), bind(unit, port, scope, sub, field_schema)?);
            }
            Ok(ResolvedPort {
                schema,
                binding: Binding::Fields(bound),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::Port;
    use serde_json::json;

    fn decl(json: serde_json::Value) -> UnitDeclaration {
        UnitDeclaration::from_value(&Value::from(json), &Path::parse("env/0/grow")).unwrap()
    }

    #[test]
    fn test_parse_declaration() {
        let d = decl(json!({
            "_type": "process",
            "address": "local:grow",
            "config": {"rate": 0.1},
            "inputs": {"mass": ["mass"], "time": "../../time"},
            "outputs": {"env": [".."]},
            "interval": 2.0
        }));
        assert_eq!(d.kind, UnitKind::Process);
        assert_eq!(d.address, "local:grow");
        assert_eq!(d.interval, Some(2.0));
        assert_eq!(d.inputs["time"], Wire::path(["..", "..", "time"]));
        assert_eq!(UnitDeclaration::from_value(&d.to_value(), &Path::root()).unwrap(), d);
    }

    #[test]
    fn test_invalid_declarations() {
        let path = Path::parse("u");
        let cases = [
            json!({"_type": "process"}),
            json!({"_type": "process", "address": "local:x", "interval": 0.0}),
            json!({"_type": "process", "address": "local:x", "inputs": {"a": 3}}),
            json!({"_type": "process", "address": "local:x", "config": [1]}),
        ];
        for case in cases {
            let err = UnitDeclaration::from_value(&Value::from(case), &path).unwrap_err();
            assert!(matches!(err, Error::InvalidDeclaration { .. }));
        }
    }

    #[test]
    fn test_resolve_relative_wires() {
        let types = TypeRegistry::new();
        let d = decl(json!({
            "_type": "process",
            "address": "local:grow",
            "inputs": {"mass": ["mass"]},
            "outputs": {"env": [".."]}
        }));
        let inputs = Ports::from([("mass".to_string(), Port::new("float"))]);
        let outputs = Ports::from([("env".to_string(), Port::new("map[any]"))]);
        let wiring = Wiring::resolve(&Path::parse("env/0/grow"), &d, &inputs, &outputs, &types).unwrap();
        assert_eq!(wiring.read_paths(), vec![Path::parse("env/0/mass")]);
        assert_eq!(wiring.write_paths(), vec![Path::parse("env")]);
    }

    #[test]
    fn test_default_wire_and_unresolved() {
        let types = TypeRegistry::new();
        let d = decl(json!({"_type": "step", "address": "local:s"}));
        let with_default = Ports::from([("table".to_string(), Port::wired("any", &["..", "..", "table"]))]);
        let wiring =
            Wiring::resolve(&Path::parse("env/0/grow"), &d, &with_default, &Ports::new(), &types).unwrap();
        assert_eq!(wiring.read_paths(), vec![Path::parse("table")]);

        let without = Ports::from([("mass".to_string(), Port::new("float"))]);
        let err = Wiring::resolve(&Path::parse("env/0/grow"), &d, &without, &Ports::new(), &types).unwrap_err();
        assert!(matches!(err, Error::UnresolvedWire { port, .. } if port == "mass"));
    }

    #[test]
    fn test_wire_above_root_is_unresolved() {
        let types = TypeRegistry::new();
        let d = decl(json!({
            "_type": "step",
            "address": "local:s",
            "inputs": {"x": ["..", "..", "..", "x"]}
        }));
        let inputs = Ports::from([("x".to_string(), Port::new("float"))]);
        let err = Wiring::resolve(&Path::parse("env/0/grow"), &d, &inputs, &Ports::new(), &types).unwrap_err();
        assert!(matches!(err, Error::UnresolvedWire { .. }));
    }

    #[test]
    fn test_tree_wire() {
        let types = TypeRegistry::new();
        let d = decl(json!({
            "_type": "step",
            "address": "local:s",
            "inputs": {"pair": {"a": ["x"], "b": ["..", "y"]}}
        }));
        let inputs = Ports::from([("pair".to_string(), Port::new("a:float|b:float"))]);
        let wiring = Wiring::resolve(&Path::parse("env/0/s"), &d, &inputs, &Ports::new(), &types).unwrap();
        assert_eq!(
            wiring.read_paths(),
            vec![Path::parse("env/0/x"), Path::parse("env/y")]
        );
        let leaves = wiring.inputs["pair"].leaves();
        assert_eq!(leaves[0].1, &Schema::Float);
    }
}
