//! Type registry
//!
//! Resolves type expressions into [`Schema`]s and owns the per-type merge,
//! validation and default rules. Built-in types are handled directly; custom
//! types are registered at runtime with their own functions.
//!
//! Merge rules:
//! - a `Null` delta is the identity for every type
//! - `float` and `integer` accumulate
//! - `boolean` and `string` replace
//! - `list` appends
//! - maps and records merge per key
//! - `overwrite[T]`, `wires` and `opaque` replace

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::warn;

use crate::error::{Error, Result};
use crate::path::Path;
use crate::schema::{Schema, TypeExpr};
use crate::types::{Value, ValueMap};

/// Combine an existing value with a delta.
pub type MergeFn = Arc<dyn Fn(&Value, &Value) -> Value + Send + Sync>;
/// Check that a value has the shape the type expects.
pub type ValidateFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
/// Produce the value used to seed missing state.
pub type DefaultFn = Arc<dyn Fn() -> Value + Send + Sync>;

/// A runtime-registered type.
#[derive(Clone)]
pub struct TypeDef {
    pub name: String,
    pub merge: MergeFn,
    pub validate: ValidateFn,
    pub default: DefaultFn,
}

impl fmt::Debug for TypeDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDef").field("name", &self.name).finish()
    }
}

const BUILTIN_NAMES: &[&str] = &[
    "float", "integer", "int", "boolean", "bool", "string", "str", "list", "map", "overwrite",
    "tree", "wires", "any", "opaque", "quote",
];

/// Registry of known types.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    custom: IndexMap<String, TypeDef>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a custom type.
    ///
    /// Built-in names are reserved. Registering an existing custom name
    /// replaces the previous definition.
    pub fn register<M, V, D>(&mut self, name: &str, merge: M, validate: V, default: D) -> Result<()>
    where
        M: Fn(&Value, &Value) -> Value + Send + Sync + 'static,
        V: Fn(&Value) -> bool + Send + Sync + 'static,
        D: Fn() -> Value + Send + Sync + 'static,
    {
        if BUILTIN_NAMES.contains(&name) {
            return Err(Error::InvalidTypeExpression {
                expr: name.to_string(),
                message: "name is reserved for a built-in type".to_string(),
            });
        }
        let def = TypeDef {
            name: name.to_string(),
            merge: Arc::new(merge),
            validate: Arc::new(validate),
            default: Arc::new(default),
        };
        if self.custom.insert(name.to_string(), def).is_some() {
            warn!(type_name = name, "replacing registered type");
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        BUILTIN_NAMES.contains(&name) || self.custom.contains_key(name)
    }

    /// Resolve a type expression such as `map[overwrite[float]]`.
    pub fn resolve(&self, expr: &str) -> Result<Schema> {
        let parsed = TypeExpr::parse(expr)?;
        self.resolve_expr(expr, &parsed)
    }

    fn resolve_expr(&self, source: &str, expr: &TypeExpr) -> Result<Schema> {
        let invalid = |message: String| Error::InvalidTypeExpression {
            expr: source.to_string(),
            message,
        };

        let (name, param) = match expr {
            TypeExpr::Record(fields) => {
                let mut resolved = IndexMap::with_capacity(fields.len());
                for (field, ty) in fields {
                    resolved.insert(field.clone(), self.resolve_expr(source, ty)?);
                }
                return Ok(Schema::Record(resolved));
            }
            TypeExpr::Named { name, param } => (name.as_str(), param.as_deref()),
        };

        let schema = match (name, param) {
            ("float", None) => Schema::Float,
            ("integer" | "int", None) => Schema::Integer,
            ("boolean" | "bool", None) => Schema::Boolean,
            ("string" | "str", None) => Schema::String,
            ("wires", None) => Schema::Wires,
            ("any", None) => Schema::Any,
            ("opaque" | "quote", None) => Schema::Opaque,
            ("list", Some(p)) => Schema::List(Box::new(self.resolve_expr(source, p)?)),
            ("map", Some(p)) => Schema::Map(Box::new(self.resolve_expr(source, p)?)),
            ("overwrite", Some(p)) => Schema::Overwrite(Box::new(self.resolve_expr(source, p)?)),
            ("tree", Some(p)) => match self.resolve_expr(source, p)? {
                Schema::Wires => Schema::Wires,
                _ => Schema::Any,
            },
            ("list" | "map" | "overwrite" | "tree", None) => {
                return Err(invalid(format!("`{name}` requires a type parameter")));
            }
            (_, Some(_)) if BUILTIN_NAMES.contains(&name) => {
                return Err(invalid(format!("`{name}` takes no type parameter")));
            }
            (custom, None) if self.custom.contains_key(custom) => Schema::Custom(custom.to_string()),
            (unknown, _) => {
                return Err(Error::UnknownType {
                    name: unknown.to_string(),
                });
            }
        };
        Ok(schema)
    }

    /// Check that `value` conforms to `schema`.
    pub fn validate(&self, value: &Value, schema: &Schema, path: &Path) -> Result<()> {
        let ok = match (schema, value) {
            (Schema::Opaque, _) => true,
            (Schema::Float, Value::Float(_) | Value::Integer(_)) => true,
            (Schema::Integer, Value::Integer(_)) => true,
            (Schema::Boolean, Value::Boolean(_)) => true,
            (Schema::String, Value::String(_)) => true,
            (Schema::Wires, Value::Map(_) | Value::List(_) | Value::String(_)) => true,
            (Schema::Any, Value::Map(_)) => true,
            (Schema::Overwrite(inner), v) => return self.validate(v, inner, path),
            (Schema::List(item), Value::List(items)) => {
                for (i, v) in items.iter().enumerate() {
                    self.validate(v, item, &path.child(i.to_string()))?;
                }
                true
            }
            (Schema::Map(element), Value::Map(entries)) => {
                for (k, v) in entries {
                    self.validate(v, element, &path.child(k.as_str()))?;
                }
                true
            }
            (Schema::Record(fields), Value::Map(entries)) => {
                for (k, v) in entries {
                    if let Some(field) = fields.get(k) {
                        self.validate(v, field, &path.child(k.as_str()))?;
                    }
                }
                true
            }
            (Schema::Custom(name), v) => match self.custom.get(name) {
                Some(def) => (def.validate)(v),
                None => {
                    return Err(Error::UnknownType { name: name.clone() });
                }
            },
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::mismatch(path, schema, value.kind_name()))
        }
    }

    /// Merge `delta` into `old` according to `schema`.
    pub fn merge(&self, old: &Value, delta: &Value, schema: &Schema, path: &Path) -> Result<Value> {
        if delta.is_null() {
            return Ok(old.clone());
        }
        match schema {
            Schema::Float => match (old.as_float(), delta.as_float()) {
                (Some(a), Some(b)) => Ok(Value::Float(a + b)),
                (None, Some(b)) if old.is_null() => Ok(Value::Float(b)),
                _ => Err(Error::mismatch(path, schema, delta.kind_name())),
            },
            Schema::Integer => match (old, delta) {
                (Value::Integer(a), Value::Integer(b)) => Ok(Value::Integer(a.wrapping_add(*b))),
                (Value::Null, Value::Integer(b)) => Ok(Value::Integer(*b)),
                _ => Err(Error::mismatch(path, schema, delta.kind_name())),
            },
            Schema::Boolean | Schema::String | Schema::Wires => {
                self.validate(delta, schema, path)?;
                Ok(delta.clone())
            }
            Schema::Opaque => Ok(delta.clone()),
            Schema::Overwrite(inner) => {
                self.validate(delta, inner, path)?;
                Ok(delta.clone())
            }
            Schema::List(_) => {
                self.validate(delta, schema, path)?;
                let (Value::List(existing), Value::List(added)) = (old, delta) else {
                    return Err(Error::mismatch(path, schema, old.kind_name()));
                };
                let mut items = existing.clone();
                items.extend(added.iter().cloned());
                Ok(Value::List(items))
            }
            Schema::Map(_) | Schema::Record(_) | Schema::Any => {
                let Value::Map(updates) = delta else {
                    return Err(Error::mismatch(path, schema, delta.kind_name()));
                };
                let mut merged = match old {
                    Value::Map(m) => m.clone(),
                    Value::Null => ValueMap::new(),
                    other => return Err(Error::mismatch(path, schema, other.kind_name())),
                };
                for (key, update) in updates {
                    let child_path = path.child(key.as_str());
                    let next = match (merged.get(key), schema.child(key)) {
                        (Some(existing), Some(child)) => self.merge(existing, update, child, &child_path)?,
                        (Some(existing), None) => {
                            self.merge(existing, update, &Schema::infer(existing), &child_path)?
                        }
                        (None, Some(child)) => {
                            self.validate(update, child, &child_path)?;
                            update.clone()
                        }
                        (None, None) => update.clone(),
                    };
                    merged.insert(key.clone(), next);
                }
                Ok(Value::Map(merged))
            }
            Schema::Custom(name) => {
                let def = self
                    .custom
                    .get(name)
                    .ok_or_else(|| Error::UnknownType { name: name.clone() })?;
                if !(def.validate)(delta) {
                    return Err(Error::mismatch(path, schema, delta.kind_name()));
                }
                Ok((def.merge)(old, delta))
            }
        }
    }

    /// The delta that leaves every value of `schema` unchanged.
    pub fn identity(&self, _schema: &Schema) -> Value {
        Value::Null
    }

    /// Value used to seed missing state of type `schema`.
    pub fn default_value(&self, schema: &Schema) -> Value {
        match schema {
            Schema::Float => Value::Float(0.0),
            Schema::Integer => Value::Integer(0),
            Schema::Boolean => Value::Boolean(false),
            Schema::String => Value::String(String::new()),
            Schema::List(_) => Value::List(Vec::new()),
            Schema::Map(_) | Schema::Any | Schema::Wires => Value::map(),
            Schema::Record(fields) => Value::Map(
                fields
                    .iter()
                    .map(|(k, s)| (k.clone(), self.default_value(s)))
                    .collect(),
            ),
            Schema::Overwrite(inner) => self.default_value(inner),
            Schema::Opaque => Value::Null,
            Schema::Custom(name) => self
                .custom
                .get(name)
                .map(|def| (def.default)())
                .unwrap_or(Value::Null),
        }
    }
}
