//! Deltas and structural mutation
//!
//! A unit's update is a set of [`Delta`]s, one per output port. A delta is
//! either an ordinary merge of a value or a branch delta that combines
//! per-child deltas with structural operations (remove, add, reactions).
//!
//! Applying a branch delta always runs in three phases:
//! 1. removes (idempotent; reactions contribute their removed keys)
//! 2. per-child merges, skipping children removed in phase 1
//! 3. adds (upsert; reactions contribute their added keys)
//!
//! Application is transactional per target path: the subtree is rewritten on
//! a scratch copy and only swapped in when every phase succeeded.

use indexmap::{IndexMap, IndexSet};
use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::path::Path;
use crate::registry::TypeRegistry;
use crate::tree::{Node, NodeKind, StateTree};
use crate::types::{Value, ValueMap};

/// A change to one tree location.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    /// Schema-aware merge of a value into the node.
    Merge(Value),
    /// Child deltas and structural operations on a branch.
    Branch(BranchDelta),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BranchDelta {
    pub children: IndexMap<String, Delta>,
    pub structural: Vec<Structural>,
}

/// Structural operations on the children of a branch.
#[derive(Debug, Clone, PartialEq)]
pub enum Structural {
    Remove(Vec<String>),
    Add(IndexMap<String, Value>),
    React(Reaction),
}

/// Named reactions that rewrite several children atomically.
#[derive(Debug, Clone, PartialEq)]
pub enum Reaction {
    /// Replace `mother` by the `daughters` literals.
    Divide {
        mother: String,
        daughters: IndexMap<String, Value>,
    },
}

impl Default for Delta {
    fn default() -> Self {
        Delta::Merge(Value::Null)
    }
}

impl Delta {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn merge(value: impl Into<Value>) -> Self {
        Delta::Merge(value.into())
    }

    pub fn branch() -> Self {
        Delta::Branch(BranchDelta::default())
    }

    /// Whether applying this delta can change anything.
    pub fn is_empty(&self) -> bool {
        match self {
            Delta::Merge(value) => value.is_null(),
            Delta::Branch(b) => b.structural.is_empty() && b.children.values().all(Delta::is_empty),
        }
    }

    fn branch_mut(&mut self) -> &mut BranchDelta {
        if let Delta::Merge(value) = self {
            let children = match std::mem::take(value) {
                Value::Map(entries) => entries.into_iter().map(|(k, v)| (k, Delta::Merge(v))).collect(),
                _ => IndexMap::new(),
            };
            *self = Delta::Branch(BranchDelta {
                children,
                structural: Vec::new(),
            });
        }
        match self {
            Delta::Branch(b) => b,
            Delta::Merge(_) => unreachable!("converted to a branch delta above"),
        }
    }

    /// Attach a child delta.
    pub fn child(mut self, key: impl Into<String>, delta: Delta) -> Self {
        self.branch_mut().children.insert(key.into(), delta);
        self
    }

    pub fn remove<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        if !keys.is_empty() {
            self.branch_mut().structural.push(Structural::Remove(keys));
        }
        self
    }

    pub fn add(mut self, key: impl Into<String>, literal: Value) -> Self {
        let mut entries = IndexMap::new();
        entries.insert(key.into(), literal);
        self.branch_mut().structural.push(Structural::Add(entries));
        self
    }

    pub fn react(mut self, reaction: Reaction) -> Self {
        self.branch_mut().structural.push(Structural::React(reaction));
        self
    }

    /// Parse the marker form used in composite literals:
    /// `_remove: [keys]`, `_add: {key: literal}` and
    /// `_react: {divide: {mother, daughters}}`. Any other map key is a child
    /// delta; non-map values are plain merges.
    pub fn from_value(value: &Value) -> Result<Delta> {
        let Value::Map(entries) = value else {
            return Ok(Delta::Merge(value.clone()));
        };
        let has_markers = entries.keys().any(|k| matches!(k.as_str(), "_remove" | "_add" | "_react"));
        if !has_markers {
            let mut branch = BranchDelta::default();
            for (key, child) in entries {
                branch.children.insert(key.clone(), Delta::from_value(child)?);
            }
            return Ok(Delta::Branch(branch));
        }

        let malformed = |message: &str| Error::InvalidDeclaration {
            path: Path::root(),
            message: format!("malformed delta marker: {message}"),
        };
        let mut branch = BranchDelta::default();
        for (key, entry) in entries {
            match key.as_str() {
                "_remove" => {
                    let keys = entry
                        .as_list()
                        .ok_or_else(|| malformed("`_remove` must be a list"))?
                        .iter()
                        .map(|k| key_string(k).ok_or_else(|| malformed("`_remove` keys must be strings")))
                        .collect::<Result<Vec<_>>>()?;
                    branch.structural.push(Structural::Remove(keys));
                }
                "_add" => {
                    let added = entry.as_map().ok_or_else(|| malformed("`_add` must be a map"))?;
                    branch.structural.push(Structural::Add(added.clone()));
                }
                "_react" => {
                    let divide = entry
                        .get("divide")
                        .ok_or_else(|| malformed("unknown reaction"))?;
                    let mother = divide
                        .get("mother")
                        .and_then(key_string)
                        .ok_or_else(|| malformed("`divide` needs a `mother` key"))?;
                    let daughters = divide_daughters(divide.get("daughters"))
                        .ok_or_else(|| malformed("`divide` needs `daughters`"))?;
                    branch
                        .structural
                        .push(Structural::React(Reaction::Divide { mother, daughters }));
                }
                _ => {
                    branch.children.insert(key.clone(), Delta::from_value(entry)?);
                }
            }
        }
        Ok(Delta::Branch(branch))
    }
}

fn key_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Integer(i) => Some(i.to_string()),
        _ => None,
    }
}

/// Daughters are either a map of key to literal, or a list of
/// `{"key": ..., "state": ...}` entries.
fn divide_daughters(value: Option<&Value>) -> Option<IndexMap<String, Value>> {
    match value? {
        Value::Map(entries) => Some(entries.clone()),
        Value::List(items) => items
            .iter()
            .map(|item| {
                let key = item.get("key").and_then(key_string)?;
                let state = item.get("state").cloned().unwrap_or_else(Value::map);
                Some((key, state))
            })
            .collect(),
        _ => None,
    }
}

impl BranchDelta {
    /// Keys removed and literals added by this delta, reactions expanded.
    fn plan(&self) -> (IndexSet<String>, Vec<(String, Value)>) {
        let mut removes = IndexSet::new();
        let mut adds = Vec::new();
        for op in &self.structural {
            match op {
                Structural::Remove(keys) => removes.extend(keys.iter().cloned()),
                Structural::Add(entries) => {
                    adds.extend(entries.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                Structural::React(Reaction::Divide { mother, daughters }) => {
                    removes.insert(mother.clone());
                    adds.extend(daughters.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
            }
        }
        (removes, adds)
    }
}

/// What an application changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Applied {
    pub changed: bool,
    /// Roots of subtrees removed, in application order.
    pub removed: Vec<Path>,
    /// Roots of subtrees added, in application order.
    pub added: Vec<Path>,
}

impl Applied {
    pub(crate) fn absorb(&mut self, other: Applied) {
        self.changed |= other.changed;
        self.removed.extend(other.removed);
        self.added.extend(other.added);
    }
}

impl StateTree {
    /// Apply a delta at `at`. Either the whole delta is applied or, on
    /// error, the tree is left untouched.
    pub fn apply(&mut self, at: &Path, delta: &Delta, types: &TypeRegistry) -> Result<Applied> {
        if delta.is_empty() {
            return Ok(Applied::default());
        }
        let mut scratch = self.node(at)?.clone();
        let applied = apply_node(&mut scratch, at, delta, types)?;
        *self.node_mut(at)? = scratch;
        trace!(path = %at, changed = applied.changed, "applied delta");
        Ok(applied)
    }

    /// Apply a legacy marker-form literal at `at`.
    pub fn apply_value(&mut self, at: &Path, value: &Value, types: &TypeRegistry) -> Result<Applied> {
        let delta = Delta::from_value(value)?;
        self.apply(at, &delta, types)
    }
}

fn apply_node(node: &mut Node, path: &Path, delta: &Delta, types: &TypeRegistry) -> Result<Applied> {
    let mut applied = Applied::default();
    let branch = match delta {
        Delta::Merge(value) => {
            applied.changed = node.merge(value, path, types)?;
            return Ok(applied);
        }
        Delta::Branch(branch) => branch,
    };

    if matches!(node.kind, NodeKind::Leaf(_)) && branch.structural.is_empty() {
        // plain child deltas against a leaf map are an ordinary merge
        let value = Value::Map(
            branch
                .children
                .iter()
                .map(|(k, d)| -> Result<(String, Value)> { Ok((k.clone(), delta_to_value(d, path)?)) })
                .collect::<Result<ValueMap>>()?,
        );
        applied.changed = node.merge(&value, path, types)?;
        return Ok(applied);
    }

    let Node { schema, kind, .. } = node;
    let NodeKind::Branch(children) = kind else {
        return Err(Error::mismatch(path, "branch", "leaf"));
    };

    let (removes, adds) = branch.plan();

    for key in &removes {
        if children.shift_remove(key).is_some() {
            applied.changed = true;
            applied.removed.push(path.child(key.as_str()));
        }
    }

    for (key, child_delta) in &branch.children {
        if removes.contains(key) {
            continue;
        }
        let child_path = path.child(key.as_str());
        match (children.get_mut(key), child_delta) {
            (Some(child), _) => applied.absorb(apply_node(child, &child_path, child_delta, types)?),
            (None, Delta::Merge(value)) if value.is_null() => {}
            (None, Delta::Merge(value)) => {
                let node = Node::merged_child(value, schema.child(key), &child_path, types)?;
                children.insert(key.clone(), node);
                applied.changed = true;
            }
            (None, Delta::Branch(_)) => return Err(Error::PathNotFound(child_path)),
        }
    }

    for (key, literal) in adds {
        let child_path = path.child(key.as_str());
        let new_node = Node::from_value(&literal, schema.child(&key), &child_path, types)?;
        if children.insert(key, new_node).is_some() {
            warn!(path = %child_path, "add replaced an existing child");
        }
        applied.changed = true;
        applied.added.push(child_path);
    }

    Ok(applied)
}

fn delta_to_value(delta: &Delta, path: &Path) -> Result<Value> {
    match delta {
        Delta::Merge(value) => Ok(value.clone()),
        Delta::Branch(branch) if branch.structural.is_empty() => Ok(Value::Map(
            branch
                .children
                .iter()
                .map(|(k, d)| -> Result<(String, Value)> { Ok((k.clone(), delta_to_value(d, path)?)) })
                .collect::<Result<ValueMap>>()?,
        )),
        Delta::Branch(_) => Err(Error::mismatch(path, "branch", "leaf")),
    }
}
