//! Schemas and type expressions
//!
//! Port and node types are written as short expressions (`float`,
//! `map[float]`, `overwrite[map[map[float]]]`, `delta:float|notch:float`) and
//! resolved by the [`TypeRegistry`](crate::registry::TypeRegistry) into a
//! closed [`Schema`] sum type. Engine code matches on `Schema` exhaustively;
//! anything the engine must carry without interpreting is [`Schema::Opaque`].

use std::fmt;

use chumsky::prelude::*;
use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::types::Value;

/// Resolved type of a tree node or port.
#[derive(Debug, Clone, PartialEq)]
pub enum Schema {
    Float,
    Integer,
    Boolean,
    String,
    /// Ordered list; merging appends.
    List(Box<Schema>),
    /// Homogeneous map: every child shares the element schema.
    Map(Box<Schema>),
    /// Named fields with their own schemas. Undeclared fields are inferred.
    Record(IndexMap<String, Schema>),
    /// Set-merge wrapper: a delta replaces the value instead of combining.
    Overwrite(Box<Schema>),
    /// A tree of wires.
    Wires,
    /// Untyped branch; children are inferred from their values.
    Any,
    /// Carried by the engine but never interpreted.
    Opaque,
    /// A type registered at runtime.
    Custom(String),
}

impl Schema {
    /// Best-effort schema for an undeclared literal.
    pub fn infer(value: &Value) -> Schema {
        match value {
            Value::Null => Schema::Opaque,
            Value::Boolean(_) => Schema::Boolean,
            Value::Integer(_) => Schema::Integer,
            Value::Float(_) => Schema::Float,
            Value::String(_) => Schema::String,
            Value::List(_) => Schema::List(Box::new(Schema::Opaque)),
            Value::Map(_) => Schema::Any,
        }
    }

    /// Whether nodes of this schema are branches with child nodes.
    pub fn is_branch(&self) -> bool {
        matches!(self, Schema::Map(_) | Schema::Record(_) | Schema::Any)
    }

    /// Declared schema of the child `key`, if the schema pins one.
    pub fn child(&self, key: &str) -> Option<&Schema> {
        match self {
            Schema::Map(element) => Some(element),
            Schema::Record(fields) => fields.get(key),
            _ => None,
        }
    }

    /// Reconcile two declarations of the same node.
    ///
    /// `any` and `opaque` yield to the other side and `overwrite[T]` wins over
    /// `T`. Containers unify element-wise. Returns `None` on conflict.
    pub fn unify(&self, other: &Schema) -> Option<Schema> {
        use Schema::*;
        match (self, other) {
            (a, b) if a == b => Some(a.clone()),
            (Opaque, x) | (x, Opaque) => Some(x.clone()),
            (Any, x) | (x, Any) if x.is_branch() => Some(x.clone()),
            (Overwrite(a), Overwrite(b)) => a.unify(b).map(|s| Overwrite(Box::new(s))),
            (Overwrite(a), b) | (b, Overwrite(a)) => a.unify(b).map(|s| Overwrite(Box::new(s))),
            (List(a), List(b)) => a.unify(b).map(|s| List(Box::new(s))),
            (Map(a), Map(b)) => a.unify(b).map(|s| Map(Box::new(s))),
            (Record(a), Record(b)) => {
                let mut fields = a.clone();
                for (name, schema) in b {
                    let merged = match fields.get(name) {
                        Some(existing) => existing.unify(schema)?,
                        None => schema.clone(),
                    };
                    fields.insert(name.clone(), merged);
                }
                Some(Record(fields))
            }
            _ => None,
        }
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schema::Float => write!(f, "float"),
            Schema::Integer => write!(f, "integer"),
            Schema::Boolean => write!(f, "boolean"),
            Schema::String => write!(f, "string"),
            Schema::List(t) => write!(f, "list[{}]", t),
            Schema::Map(t) => write!(f, "map[{}]", t),
            Schema::Record(fields) => {
                for (i, (name, schema)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, "|")?;
                    }
                    write!(f, "{}:{}", name, schema)?;
                }
                Ok(())
            }
            Schema::Overwrite(t) => write!(f, "overwrite[{}]", t),
            Schema::Wires => write!(f, "wires"),
            Schema::Any => write!(f, "any"),
            Schema::Opaque => write!(f, "opaque"),
            Schema::Custom(name) => write!(f, "{}", name),
        }
    }
}

/// Parsed, unresolved type expression.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeExpr {
    Named {
        name: String,
        param: Option<Box<TypeExpr>>,
    },
    Record(IndexMap<String, TypeExpr>),
}

/// Parse error type
pub type ParseError<'src> = Rich<'src, char>;

impl TypeExpr {
    pub fn parse(expr: &str) -> Result<TypeExpr> {
        type_expr()
            .then_ignore(end())
            .parse(expr)
            .into_result()
            .map_err(|errors| Error::InvalidTypeExpression {
                expr: expr.to_string(),
                message: if errors.is_empty() {
                    "empty type".to_string()
                } else {
                    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
                },
            })
    }
}

/// Type and field names: `max_float`, `local.mass`, `x-axis`.
fn name<'src>() -> impl Parser<'src, &'src str, String, extra::Err<ParseError<'src>>> + Clone {
    any()
        .filter(|c: &char| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        .repeated()
        .at_least(1)
        .to_slice()
        .map(|s: &str| s.to_string())
        .padded()
}

/// Parse: `name`, `name[T]`, or a record `field:T|field:T`.
///
/// Record fields bind tighter than `|`, so a field type containing a record
/// must be bracketed: `map[a:float|b:map[x:float|y:float]]`.
fn type_expr<'src>() -> impl Parser<'src, &'src str, TypeExpr, extra::Err<ParseError<'src>>> + Clone {
    recursive(|expr| {
        let named = name()
            .then(
                expr.delimited_by(just('[').padded(), just(']').padded())
                    .or_not(),
            )
            .map(|(name, param): (String, Option<TypeExpr>)| TypeExpr::Named {
                name,
                param: param.map(Box::new),
            });

        let field = name().then_ignore(just(':').padded()).then(named.clone());

        let record = field
            .separated_by(just('|').padded())
            .at_least(1)
            .collect::<Vec<_>>()
            .try_map(|fields, span| {
                let mut record = IndexMap::with_capacity(fields.len());
                for (field, ty) in fields {
                    if record.contains_key(&field) {
                        return Err(Rich::custom(span, format!("duplicate field `{field}`")));
                    }
                    record.insert(field, ty);
                }
                Ok(TypeExpr::Record(record))
            });

        choice((record, named))
    })
}
