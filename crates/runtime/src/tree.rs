//! The state tree
//!
//! A typed, nested key-value store. Every node carries a [`Schema`]; branch
//! nodes own ordered children, leaf nodes own a [`Value`] and unit nodes hold
//! the declaration of a process or step.
//!
//! The tree is exclusively owned by the scheduler. Units only ever see copies
//! of their port values, and all writes go through merges, explicit sets or
//! [`apply`](StateTree::apply).
//!
//! Two literal forms are recognised when building nodes:
//! - a map with `_type: "process" | "step"` is a unit declaration
//! - a map with `_type: <type expression>` (and optionally `_value`) is a
//!   typed node; without `_value` it starts from the type's default

use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::path::Path;
use crate::registry::TypeRegistry;
use crate::schema::Schema;
use crate::types::Value;
use crate::wiring::UnitDeclaration;

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Leaf(Value),
    Branch(IndexMap<String, Node>),
    Unit(UnitDeclaration),
}

/// A node of the state tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub(crate) schema: Schema,
    /// Whether the schema was declared (by a literal or a port) rather than
    /// inferred from the value.
    pub(crate) declared: bool,
    pub(crate) kind: NodeKind,
}

impl Node {
    pub fn branch() -> Self {
        Self {
            schema: Schema::Any,
            declared: false,
            kind: NodeKind::Branch(IndexMap::new()),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn is_declared(&self) -> bool {
        self.declared
    }

    /// Build a node from a tree literal.
    ///
    /// `hint` is the schema the parent pins for this position, if any.
    pub fn from_value(
        value: &Value,
        hint: Option<&Schema>,
        path: &Path,
        types: &TypeRegistry,
    ) -> Result<Node> {
        if let Value::Map(entries) = value {
            if UnitDeclaration::is_declaration(value) {
                return Ok(Node {
                    schema: Schema::Opaque,
                    declared: false,
                    kind: NodeKind::Unit(UnitDeclaration::from_value(value, path)?),
                });
            }
            if let Some(expr) = entries.get("_type").and_then(Value::as_str) {
                let declared = types.resolve(expr)?;
                let schema = match hint {
                    Some(h) => h
                        .unify(&declared)
                        .ok_or_else(|| Error::mismatch(path, h, &declared))?,
                    None => declared,
                };
                let inner = match entries.get("_value") {
                    Some(v) => v.clone(),
                    None => types.default_value(&schema),
                };
                return Node::from_value(&inner, Some(&schema), path, types);
            }
        }

        let (schema, declared) = match hint {
            Some(s) => (s.clone(), true),
            None => (Schema::infer(value), false),
        };

        if schema.is_branch() {
            let Value::Map(entries) = value else {
                return Err(Error::mismatch(path, &schema, value.kind_name()));
            };
            let mut children = IndexMap::with_capacity(entries.len());
            for (key, child) in entries {
                let node = Node::from_value(child, schema.child(key), &path.child(key.as_str()), types)?;
                children.insert(key.clone(), node);
            }
            Ok(Node {
                schema,
                declared,
                kind: NodeKind::Branch(children),
            })
        } else {
            if declared {
                types.validate(value, &schema, path)?;
            }
            Ok(Node {
                schema,
                declared,
                kind: NodeKind::Leaf(value.clone()),
            })
        }
    }

    /// Snapshot this node as a literal.
    pub fn to_value(&self) -> Value {
        match &self.kind {
            NodeKind::Leaf(value) => value.clone(),
            NodeKind::Branch(children) => Value::Map(
                children
                    .iter()
                    .map(|(k, child)| (k.clone(), child.to_value()))
                    .collect(),
            ),
            NodeKind::Unit(decl) => decl.to_value(),
        }
    }

    /// Ordinary schema-aware merge. Returns whether anything changed.
    pub(crate) fn merge(&mut self, delta: &Value, path: &Path, types: &TypeRegistry) -> Result<bool> {
        if delta.is_null() {
            return Ok(false);
        }
        match &mut self.kind {
            NodeKind::Leaf(value) => {
                let next = types.merge(value, delta, &self.schema, path)?;
                let changed = next != *value;
                *value = next;
                Ok(changed)
            }
            NodeKind::Branch(children) => {
                let Value::Map(updates) = delta else {
                    return Err(Error::mismatch(path, &self.schema, delta.kind_name()));
                };
                let mut changed = false;
                for (key, update) in updates {
                    let child_path = path.child(key.as_str());
                    match children.get_mut(key) {
                        Some(child) => changed |= child.merge(update, &child_path, types)?,
                        None if update.is_null() => {}
                        None => {
                            let node = Node::merged_child(update, self.schema.child(key), &child_path, types)?;
                            children.insert(key.clone(), node);
                            changed = true;
                        }
                    }
                }
                Ok(changed)
            }
            NodeKind::Unit(_) => Err(Error::mismatch(path, "state value", "unit declaration")),
        }
    }

    /// A child created by an ordinary merge into a branch.
    ///
    /// Units are only created through add markers, never by a merge.
    pub(crate) fn merged_child(
        value: &Value,
        schema: Option<&Schema>,
        path: &Path,
        types: &TypeRegistry,
    ) -> Result<Node> {
        if UnitDeclaration::is_declaration(value) {
            return Err(Error::mismatch(path, "state value", "unit declaration"));
        }
        Node::from_value(value, schema, path, types)
    }

    /// Adopt a declared schema, validating the current contents against it.
    ///
    /// Record fields missing from the node are seeded with defaults.
    pub(crate) fn adopt(&mut self, schema: &Schema, path: &Path, types: &TypeRegistry) -> Result<()> {
        let target = if self.declared {
            self.schema
                .unify(schema)
                .ok_or_else(|| Error::mismatch(path, schema, &self.schema))?
        } else {
            schema.clone()
        };

        match &mut self.kind {
            NodeKind::Unit(_) => {
                return Err(Error::mismatch(path, &target, "unit declaration"));
            }
            NodeKind::Leaf(value) => {
                if target.is_branch() {
                    let value = value.clone();
                    *self = Node::from_value(&value, Some(&target), path, types)?;
                    return Ok(());
                }
                types.validate(value, &target, path)?;
            }
            NodeKind::Branch(children) => {
                if target.is_branch() {
                    for (key, child) in children.iter_mut() {
                        if let Some(child_schema) = target.child(key) {
                            child.adopt(child_schema, &path.child(key.as_str()), types)?;
                        }
                    }
                    if let Schema::Record(fields) = &target {
                        for (key, field) in fields {
                            if !children.contains_key(key) {
                                let default = types.default_value(field);
                                let node =
                                    Node::from_value(&default, Some(field), &path.child(key.as_str()), types)?;
                                children.insert(key.clone(), node);
                            }
                        }
                    }
                } else {
                    let value = Value::Map(
                        children
                            .iter()
                            .map(|(k, child)| (k.clone(), child.to_value()))
                            .collect(),
                    );
                    types.validate(&value, &target, path)?;
                    self.kind = NodeKind::Leaf(value);
                }
            }
        }
        self.schema = target;
        self.declared = true;
        Ok(())
    }

    fn collect_units(&self, path: &Path, out: &mut Vec<(Path, UnitDeclaration)>) {
        match &self.kind {
            NodeKind::Unit(decl) => out.push((path.clone(), decl.clone())),
            NodeKind::Branch(children) => {
                for (key, child) in children {
                    child.collect_units(&path.child(key.as_str()), out);
                }
            }
            NodeKind::Leaf(_) => {}
        }
    }
}

/// Hierarchical simulation state.
#[derive(Debug, Clone, PartialEq)]
pub struct StateTree {
    root: Node,
}

impl Default for StateTree {
    fn default() -> Self {
        Self { root: Node::branch() }
    }
}

impl StateTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree from a nested literal. The root must be a map.
    pub fn from_value(value: &Value, types: &TypeRegistry) -> Result<Self> {
        let root = Node::from_value(value, None, &Path::root(), types)?;
        if !matches!(root.kind, NodeKind::Branch(_)) {
            return Err(Error::mismatch(&Path::root(), "map", value.kind_name()));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    pub fn node(&self, path: &Path) -> Result<&Node> {
        let mut node = &self.root;
        for seg in path.segments() {
            node = match &node.kind {
                NodeKind::Branch(children) => children
                    .get(seg)
                    .ok_or_else(|| Error::PathNotFound(path.clone()))?,
                _ => return Err(Error::PathNotFound(path.clone())),
            };
        }
        Ok(node)
    }

    pub(crate) fn node_mut(&mut self, path: &Path) -> Result<&mut Node> {
        let mut node = &mut self.root;
        for seg in path.segments() {
            node = match &mut node.kind {
                NodeKind::Branch(children) => children
                    .get_mut(seg)
                    .ok_or_else(|| Error::PathNotFound(path.clone()))?,
                _ => return Err(Error::PathNotFound(path.clone())),
            };
        }
        Ok(node)
    }

    /// Whether a node exists at `path`.
    pub fn contains(&self, path: &Path) -> bool {
        self.node(path).is_ok()
    }

    /// Copy out the value at `path`, descending into leaf maps if needed.
    pub fn get(&self, path: &Path) -> Result<Value> {
        let mut node = &self.root;
        for (depth, seg) in path.segments().iter().enumerate() {
            node = match &node.kind {
                NodeKind::Branch(children) => children
                    .get(seg)
                    .ok_or_else(|| Error::PathNotFound(path.clone()))?,
                NodeKind::Leaf(value) => {
                    return value
                        .get_path(&path.segments()[depth..])
                        .cloned()
                        .ok_or_else(|| Error::PathNotFound(path.clone()));
                }
                NodeKind::Unit(_) => return Err(Error::PathNotFound(path.clone())),
            };
        }
        Ok(node.to_value())
    }

    /// Schema of the node at `path`, if it exists.
    pub fn schema_at(&self, path: &Path) -> Option<&Schema> {
        self.node(path).ok().map(Node::schema)
    }

    /// Ordered children of the branch at `path`.
    pub fn children(&self, path: &Path) -> Result<Vec<(&str, &Node)>> {
        match &self.node(path)?.kind {
            NodeKind::Branch(children) => Ok(children.iter().map(|(k, n)| (k.as_str(), n)).collect()),
            _ => Err(Error::mismatch(path, "branch", "leaf")),
        }
    }

    /// Replace the node at `path`. The parent must exist.
    ///
    /// A declared schema already in place (or pinned by the parent) is kept
    /// and the new value is validated against it.
    pub fn set(&mut self, path: &Path, value: Value, types: &TypeRegistry) -> Result<()> {
        let Some(parent) = path.parent() else {
            *self = StateTree::from_value(&value, types)?;
            return Ok(());
        };
        let hint = self.position_schema(path);
        let node = Node::from_value(&value, hint.as_ref(), path, types)?;
        let key = path.last().unwrap_or_default().to_string();
        match &mut self.node_mut(&parent)?.kind {
            NodeKind::Branch(children) => {
                children.insert(key, node);
                Ok(())
            }
            _ => Err(Error::mismatch(&parent, "branch", "leaf")),
        }
    }

    /// Ordinary schema-aware merge at `path`.
    pub fn merge(&mut self, path: &Path, delta: &Value, types: &TypeRegistry) -> Result<bool> {
        if delta.is_null() {
            return Ok(false);
        }
        self.node_mut(path)?.merge(delta, path, types)
    }

    /// Explicitly add a literal at `path`, creating intermediate branches.
    /// Returns the node previously at `path`, if any.
    pub fn insert(&mut self, path: &Path, value: &Value, types: &TypeRegistry) -> Result<Option<Node>> {
        let hint = self.position_schema(path);
        let node = Node::from_value(value, hint.as_ref(), path, types)?;
        self.insert_node(path, node)
    }

    /// Remove the node at `path`. Removing a missing path is a no-op.
    pub fn remove(&mut self, path: &Path) -> Option<Node> {
        let parent = path.parent()?;
        let key = path.last()?;
        match &mut self.node_mut(&parent).ok()?.kind {
            NodeKind::Branch(children) => children.shift_remove(key),
            _ => None,
        }
    }

    /// Make sure `path` exists with `schema`.
    ///
    /// Missing nodes are created from the schema default; existing nodes adopt
    /// the schema after validation. Returns `true` when the node was created.
    pub fn declare(&mut self, path: &Path, schema: &Schema, types: &TypeRegistry) -> Result<bool> {
        if self.contains(path) {
            self.node_mut(path)?.adopt(schema, path, types)?;
            return Ok(false);
        }
        let default = types.default_value(schema);
        let node = Node::from_value(&default, Some(schema), path, types)?;
        self.insert_node(path, node)?;
        Ok(true)
    }

    /// Every unit declaration in the tree, in tree order.
    pub fn units(&self) -> Vec<(Path, UnitDeclaration)> {
        self.units_under(&Path::root())
    }

    /// Unit declarations at or below `path`.
    pub fn units_under(&self, path: &Path) -> Vec<(Path, UnitDeclaration)> {
        let mut out = Vec::new();
        if let Ok(node) = self.node(path) {
            node.collect_units(path, &mut out);
        }
        out
    }

    /// Snapshot the whole tree as a literal.
    pub fn to_value(&self) -> Value {
        self.root.to_value()
    }

    /// Schema pinned for `path` by an existing declared node or its parent.
    fn position_schema(&self, path: &Path) -> Option<Schema> {
        if let Ok(node) = self.node(path)
            && node.declared
        {
            return Some(node.schema.clone());
        }
        let parent = self.node(&path.parent()?).ok()?;
        parent.schema.child(path.last()?).cloned()
    }

    pub(crate) fn insert_node(&mut self, path: &Path, node: Node) -> Result<Option<Node>> {
        let Some(key) = path.last() else {
            if !matches!(node.kind, NodeKind::Branch(_)) {
                return Err(Error::mismatch(path, "map", "leaf"));
            }
            return Ok(Some(std::mem::replace(&mut self.root, node)));
        };
        let mut current = &mut self.root;
        for (depth, seg) in path.segments()[..path.len() - 1].iter().enumerate() {
            current = match &mut current.kind {
                NodeKind::Branch(children) => children.entry(seg.clone()).or_insert_with(Node::branch),
                _ => {
                    let at = Path::new(path.segments()[..depth].iter().cloned());
                    return Err(Error::mismatch(&at, "branch", "leaf"));
                }
            };
        }
        match &mut current.kind {
            NodeKind::Branch(children) => Ok(children.insert(key.to_string(), node)),
            _ => Err(Error::mismatch(&path.parent().unwrap_or_default(), "branch", "leaf")),
        }
    }
}
