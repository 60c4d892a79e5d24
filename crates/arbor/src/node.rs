//! The arena of nodes behind every live tree.
//!
//! One `Node` per live composite value; primitives are stored inline as
//! [`Child::Leaf`] slots and never wrapped. Parent links are arena indices
//! (never owning references), dead slots are tombstoned and never reused,
//! and each root carries its own identity map.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use arbor_pointer::{format_pointer, join_pointer};
use arbor_signals::ObservableCell;
use indexmap::IndexMap;
use serde_json::Value;

use crate::error::TreeError;
use crate::types::{identifier_of, is_identifier_prop, TypeDesc, TypeRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct NodeId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeState {
    Alive,
    Detaching,
    Dead,
}

/// A slot in a composite value: an inline primitive or a child node.
#[derive(Clone)]
pub(crate) enum Child {
    Leaf(Value),
    Node(NodeId),
}

pub(crate) enum NodeValue {
    Object(IndexMap<String, Child>),
    Array(Vec<Child>),
    Map(IndexMap<String, Child>),
}

pub(crate) struct Node {
    pub type_: TypeRef,
    pub parent: Option<NodeId>,
    pub subpath: String,
    pub value: NodeValue,
    pub identifier: Option<Value>,
    pub state: NodeState,
    /// Last known path, recorded at death for error messages.
    pub dead_path: String,
    /// Memoized recursive snapshot, cleared on any descendant mutation.
    pub cached: Option<Value>,
    /// Bumped on every committed mutation to this node or a descendant;
    /// drives the snapshot channel.
    pub version: ObservableCell<u64>,
}

/// What `resolve_input` decided a slot should hold.
pub(crate) enum Resolved {
    Null,
    Leaf(Value),
    Node(TypeRef, Value),
}

/// Unwraps optional/maybe/union layers around `t`, substituting defaults
/// for absent input, and decides whether the slot is a leaf or a node.
pub(crate) fn resolve_input(
    t: &TypeRef,
    input: Option<Value>,
    path: &str,
) -> Result<Resolved, TreeError> {
    match &**t {
        TypeDesc::Optional { inner, default } => {
            let v = match input {
                Some(v) => v,
                None => default.produce(),
            };
            resolve_input(inner, Some(v), path)
        }
        TypeDesc::Maybe { inner } => match input {
            None | Some(Value::Null) => Ok(Resolved::Null),
            Some(v) => resolve_input(inner, Some(v), path),
        },
        TypeDesc::Union { options } => {
            for option in options {
                if option.is(input.as_ref()) {
                    return resolve_input(option, input, path);
                }
            }
            Err(TreeError::conversion(path, input.as_ref(), &t.name()))
        }
        TypeDesc::Model(_) | TypeDesc::Array { .. } | TypeDesc::Map { .. } => match input {
            Some(v) if t.is(Some(&v)) => Ok(Resolved::Node(t.clone(), v)),
            other => Err(TreeError::conversion(path, other.as_ref(), &t.name())),
        },
        _ => match input {
            Some(v) if t.is(Some(&v)) => Ok(Resolved::Leaf(v)),
            other => Err(TreeError::conversion(path, other.as_ref(), &t.name())),
        },
    }
}

fn identity_key(value: &Value) -> String {
    value.to_string()
}

/// Identifier carried by a candidate array element, with the concrete
/// model type declaring it.
fn element_identity(t: &TypeRef, value: &Value) -> Option<(TypeRef, Value)> {
    match &**t {
        TypeDesc::Optional { inner, .. } | TypeDesc::Maybe { inner } => {
            element_identity(inner, value)
        }
        TypeDesc::Union { options } => options
            .iter()
            .find(|o| o.is(Some(value)))
            .and_then(|o| element_identity(o, value)),
        TypeDesc::Model(_) => identifier_of(t, value).map(|v| (t.clone(), v)),
        _ => None,
    }
}

pub(crate) struct Store {
    pub nodes: Vec<Node>,
    /// Per-root identity map: root arena index -> identifier key -> node.
    pub identities: HashMap<usize, HashMap<String, NodeId>>,
}

impl Store {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            identities: HashMap::new(),
        }
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    pub fn ensure_alive(&self, id: NodeId) -> Result<(), TreeError> {
        let node = self.node(id);
        if node.state == NodeState::Dead {
            return Err(TreeError::DeadNode {
                type_name: node.type_.name(),
                path: node.dead_path.clone(),
            });
        }
        Ok(())
    }

    pub fn path_of(&self, id: NodeId) -> String {
        let mut segments = Vec::new();
        let mut current = id;
        while let Some(parent) = self.node(current).parent {
            segments.push(self.node(current).subpath.clone());
            current = parent;
        }
        segments.reverse();
        format_pointer(&segments)
    }

    pub fn root_of(&self, id: NodeId) -> NodeId {
        let mut current = id;
        while let Some(parent) = self.node(current).parent {
            current = parent;
        }
        current
    }

    /// Root-first chain of `(node, absolute path)` ending at `id` itself.
    pub fn ancestors_with_paths(&self, id: NodeId) -> Vec<(NodeId, String)> {
        let mut chain = Vec::new();
        let mut current = Some(id);
        while let Some(c) = current {
            chain.push(c);
            current = self.node(c).parent;
        }
        chain.reverse();
        let mut out = Vec::with_capacity(chain.len());
        let mut path = String::new();
        for (i, node) in chain.iter().enumerate() {
            if i > 0 {
                path = join_pointer(&path, &self.node(*node).subpath);
            }
            out.push((*node, path.clone()));
        }
        out
    }

    pub fn child_snapshot(&mut self, child: &Child) -> Value {
        match child {
            Child::Leaf(v) => v.clone(),
            Child::Node(id) => self.snapshot(*id),
        }
    }

    pub fn snapshot(&mut self, id: NodeId) -> Value {
        if let Some(cached) = &self.nodes[id.0].cached {
            return cached.clone();
        }
        enum Shape {
            Obj(Vec<(String, Child)>),
            Arr(Vec<Child>),
        }
        let shape = match &self.nodes[id.0].value {
            NodeValue::Object(children) | NodeValue::Map(children) => Shape::Obj(
                children
                    .iter()
                    .map(|(k, c)| (k.clone(), c.clone()))
                    .collect(),
            ),
            NodeValue::Array(children) => Shape::Arr(children.clone()),
        };
        let built = match shape {
            Shape::Obj(pairs) => {
                let mut out = serde_json::Map::new();
                for (key, child) in pairs {
                    out.insert(key, self.child_snapshot(&child));
                }
                Value::Object(out)
            }
            Shape::Arr(items) => Value::Array(
                items
                    .iter()
                    .map(|child| self.child_snapshot(child))
                    .collect(),
            ),
        };
        self.nodes[id.0].cached = Some(built.clone());
        built
    }

    /// Clears memoized snapshots from `id` up to its root and returns the
    /// version cells to bump once the mutation borrow is released.
    pub fn invalidate(&mut self, id: NodeId) -> Vec<ObservableCell<u64>> {
        let mut cells = Vec::new();
        let mut current = Some(id);
        while let Some(c) = current {
            let node = &mut self.nodes[c.0];
            node.cached = None;
            cells.push(node.version.clone());
            current = node.parent;
        }
        cells
    }

    pub fn instantiate(
        &mut self,
        t: &TypeRef,
        parent: Option<NodeId>,
        subpath: &str,
        input: Option<Value>,
        path: &str,
    ) -> Result<Child, TreeError> {
        match resolve_input(t, input, path)? {
            Resolved::Null => Ok(Child::Leaf(Value::Null)),
            Resolved::Leaf(v) => Ok(Child::Leaf(v)),
            Resolved::Node(concrete, v) => {
                let id = self.instantiate_node(&concrete, parent, subpath, v, path)?;
                Ok(Child::Node(id))
            }
        }
    }

    /// Allocates the backing node for a composite value and recursively
    /// instantiates its children. `snapshot` has already been accepted by
    /// the concrete type.
    pub fn instantiate_node(
        &mut self,
        t: &TypeRef,
        parent: Option<NodeId>,
        subpath: &str,
        snapshot: Value,
        path: &str,
    ) -> Result<NodeId, TreeError> {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            type_: t.clone(),
            parent,
            subpath: subpath.to_string(),
            value: NodeValue::Object(IndexMap::new()),
            identifier: None,
            state: NodeState::Alive,
            dead_path: String::new(),
            cached: None,
            version: ObservableCell::new(0),
        });
        match self.fill_node(t, id, snapshot, path) {
            Ok(()) => Ok(id),
            Err(err) => {
                // Partially built children may already hold identifier
                // registrations; kill the subtree before propagating.
                self.kill_subtree(id);
                Err(err)
            }
        }
    }

    fn fill_node(
        &mut self,
        t: &TypeRef,
        id: NodeId,
        snapshot: Value,
        path: &str,
    ) -> Result<(), TreeError> {
        match &**t {
            TypeDesc::Model(m) => {
                let obj = match snapshot {
                    Value::Object(obj) => obj,
                    other => return Err(TreeError::conversion(path, Some(&other), &t.name())),
                };
                let mut identifier = None;
                let mut children = IndexMap::with_capacity(m.props.len());
                for (key, prop) in &m.props {
                    let input = obj.get(key).cloned();
                    if is_identifier_prop(prop) {
                        identifier = input.clone();
                    }
                    let child =
                        self.instantiate(prop, Some(id), key, input, &join_pointer(path, key))?;
                    children.insert(key.clone(), child);
                }
                self.nodes[id.0].value = NodeValue::Object(children);
                if let Some(value) = identifier {
                    self.register_identifier(id, value)?;
                }
            }
            TypeDesc::Array { item } => {
                let items = match snapshot {
                    Value::Array(items) => items,
                    other => return Err(TreeError::conversion(path, Some(&other), &t.name())),
                };
                let mut children = Vec::with_capacity(items.len());
                for (index, el) in items.into_iter().enumerate() {
                    let subpath = index.to_string();
                    let child = self.instantiate(
                        item,
                        Some(id),
                        &subpath,
                        Some(el),
                        &join_pointer(path, &subpath),
                    )?;
                    children.push(child);
                }
                self.nodes[id.0].value = NodeValue::Array(children);
            }
            TypeDesc::Map { value } => {
                let obj = match snapshot {
                    Value::Object(obj) => obj,
                    other => return Err(TreeError::conversion(path, Some(&other), &t.name())),
                };
                let mut children = IndexMap::with_capacity(obj.len());
                for (key, el) in obj {
                    let child = self.instantiate(
                        value,
                        Some(id),
                        &key,
                        Some(el),
                        &join_pointer(path, &key),
                    )?;
                    children.insert(key, child);
                }
                self.nodes[id.0].value = NodeValue::Map(children);
            }
            _ => {
                return Err(TreeError::conversion(path, Some(&snapshot), &t.name()));
            }
        }
        Ok(())
    }

    fn register_identifier(&mut self, id: NodeId, value: Value) -> Result<(), TreeError> {
        let root = self.root_of(id);
        let key = identity_key(&value);
        let type_name = self.node(id).type_.name();
        let map = self.identities.entry(root.0).or_default();
        if map.contains_key(&key) {
            return Err(TreeError::DuplicateIdentifier { id: key, type_name });
        }
        map.insert(key, id);
        self.nodes[id.0].identifier = Some(value);
        Ok(())
    }

    pub fn lookup_identifier(&self, from: NodeId, value: &Value) -> Option<NodeId> {
        let root = self.root_of(from);
        let id = self
            .identities
            .get(&root.0)?
            .get(&identity_key(value))
            .copied()?;
        (self.node(id).state == NodeState::Alive).then_some(id)
    }

    /// Marks `id` and every descendant dead, recording their last known
    /// paths and dropping their identifier registrations.
    pub fn kill_subtree(&mut self, id: NodeId) {
        let path = self.path_of(id);
        let root = self.root_of(id);
        self.kill_rec(id, &path, root);
    }

    fn kill_rec(&mut self, id: NodeId, path: &str, root: NodeId) {
        let children: Vec<(String, NodeId)> = match &self.nodes[id.0].value {
            NodeValue::Object(map) | NodeValue::Map(map) => map
                .iter()
                .filter_map(|(k, c)| match c {
                    Child::Node(n) => Some((k.clone(), *n)),
                    Child::Leaf(_) => None,
                })
                .collect(),
            NodeValue::Array(items) => items
                .iter()
                .enumerate()
                .filter_map(|(i, c)| match c {
                    Child::Node(n) => Some((i.to_string(), *n)),
                    Child::Leaf(_) => None,
                })
                .collect(),
        };
        for (subpath, child) in children {
            self.kill_rec(child, &join_pointer(path, &subpath), root);
        }
        let identifier = {
            let node = &mut self.nodes[id.0];
            node.state = NodeState::Dead;
            node.dead_path = path.to_string();
            node.cached = None;
            node.identifier.clone()
        };
        if let Some(value) = identifier {
            if let Some(map) = self.identities.get_mut(&root.0) {
                map.remove(&identity_key(&value));
            }
        }
    }

    /// Reuses `existing` for the resolved input when possible, otherwise
    /// kills it and instantiates a replacement. Returns the slot's new
    /// child and whether anything observable changed.
    #[allow(clippy::too_many_arguments)]
    pub fn reconcile_child(
        &mut self,
        parent: NodeId,
        existing: Child,
        slot_type: &TypeRef,
        input: Option<Value>,
        subpath: &str,
        path: &str,
        reuse: bool,
        cells: &mut Vec<ObservableCell<u64>>,
    ) -> Result<(Child, bool), TreeError> {
        let resolved = resolve_input(slot_type, input, path)?;
        match (existing, resolved) {
            (Child::Node(existing_id), Resolved::Node(concrete, v)) => {
                let reusable = reuse && {
                    let node = self.node(existing_id);
                    node.state == NodeState::Alive
                        && Rc::ptr_eq(&node.type_, &concrete)
                        && (node.identifier.is_none()
                            || node.identifier == identifier_of(&concrete, &v))
                };
                if reusable {
                    let changed = self.update_in_place(existing_id, &v, path, cells)?;
                    Ok((Child::Node(existing_id), changed))
                } else {
                    self.kill_subtree(existing_id);
                    let id = self.instantiate_node(&concrete, Some(parent), subpath, v, path)?;
                    Ok((Child::Node(id), true))
                }
            }
            (Child::Node(existing_id), Resolved::Leaf(v)) => {
                self.kill_subtree(existing_id);
                Ok((Child::Leaf(v), true))
            }
            (Child::Node(existing_id), Resolved::Null) => {
                self.kill_subtree(existing_id);
                Ok((Child::Leaf(Value::Null), true))
            }
            (Child::Leaf(_), Resolved::Node(concrete, v)) => {
                let id = self.instantiate_node(&concrete, Some(parent), subpath, v, path)?;
                Ok((Child::Node(id), true))
            }
            (Child::Leaf(old), Resolved::Leaf(v)) => {
                let changed = old != v;
                Ok((Child::Leaf(v), changed))
            }
            (Child::Leaf(old), Resolved::Null) => {
                let changed = old != Value::Null;
                Ok((Child::Leaf(Value::Null), changed))
            }
        }
    }

    /// Structural diff of `id`'s children against `snapshot`, mutating in
    /// place and preserving sub-nodes not structurally replaced. The
    /// snapshot has already been accepted by `id`'s type.
    pub fn update_in_place(
        &mut self,
        id: NodeId,
        snapshot: &Value,
        path: &str,
        cells: &mut Vec<ObservableCell<u64>>,
    ) -> Result<bool, TreeError> {
        let t = self.nodes[id.0].type_.clone();
        let mut changed = false;
        match &*t {
            TypeDesc::Model(m) => {
                let Value::Object(obj) = snapshot else {
                    return Err(TreeError::conversion(path, Some(snapshot), &t.name()));
                };
                for (key, prop) in &m.props {
                    if is_identifier_prop(prop) {
                        let current = self.node(id).identifier.clone();
                        if current.is_some() && current != obj.get(key).cloned() {
                            return Err(TreeError::IdentifierImmutable {
                                type_name: t.name(),
                                path: path.to_string(),
                            });
                        }
                    }
                    let existing = match &self.nodes[id.0].value {
                        NodeValue::Object(children) => children
                            .get(key)
                            .cloned()
                            .unwrap_or(Child::Leaf(Value::Null)),
                        _ => Child::Leaf(Value::Null),
                    };
                    let (updated, slot_changed) = self.reconcile_child(
                        id,
                        existing,
                        prop,
                        obj.get(key).cloned(),
                        key,
                        &join_pointer(path, key),
                        true,
                        cells,
                    )?;
                    if let NodeValue::Object(children) = &mut self.nodes[id.0].value {
                        children.insert(key.clone(), updated);
                    }
                    changed |= slot_changed;
                }
            }
            TypeDesc::Array { item } => {
                let Value::Array(new_items) = snapshot else {
                    return Err(TreeError::conversion(path, Some(snapshot), &t.name()));
                };
                let children = match &mut self.nodes[id.0].value {
                    NodeValue::Array(v) => std::mem::take(v),
                    _ => Vec::new(),
                };
                // Identified elements are matched to existing children by
                // identifier wherever they sat; everything else matches
                // by position.
                let mut by_identity: HashMap<String, usize> = HashMap::new();
                for (index, child) in children.iter().enumerate() {
                    if let Child::Node(n) = child {
                        if let Some(value) = &self.nodes[n.0].identifier {
                            by_identity.insert(identity_key(value), index);
                        }
                    }
                }
                let mut incoming: Vec<Option<String>> = Vec::with_capacity(new_items.len());
                let mut seen = HashSet::new();
                for el in new_items {
                    let key = match element_identity(item, el) {
                        Some((concrete, value)) => {
                            let key = identity_key(&value);
                            if !seen.insert(key.clone()) {
                                self.restore_array(id, children);
                                return Err(TreeError::DuplicateIdentifier {
                                    id: key,
                                    type_name: concrete.name(),
                                });
                            }
                            Some(key)
                        }
                        None => None,
                    };
                    incoming.push(key);
                }
                let mut claimed = vec![false; children.len()];
                let mut sources = Vec::with_capacity(new_items.len());
                for (index, key) in incoming.iter().enumerate() {
                    let source = match key {
                        Some(k) => by_identity.get(k).copied().filter(|&i| !claimed[i]),
                        None => (index < children.len()
                            && !claimed[index]
                            && !matches!(
                                &children[index],
                                Child::Node(n) if self.nodes[n.0].identifier.is_some()
                            ))
                        .then_some(index),
                    };
                    if let Some(i) = source {
                        claimed[i] = true;
                    }
                    sources.push(source);
                }
                let mut next = Vec::with_capacity(new_items.len());
                let mut fresh = Vec::new();
                for (index, el) in new_items.iter().enumerate() {
                    let subpath = index.to_string();
                    let slot_path = join_pointer(path, &subpath);
                    let result = match sources[index] {
                        Some(source) => self
                            .reconcile_child(
                                id,
                                children[source].clone(),
                                item,
                                Some(el.clone()),
                                &subpath,
                                &slot_path,
                                true,
                                cells,
                            )
                            .map(|(updated, slot_changed)| {
                                (updated, slot_changed || source != index)
                            }),
                        None => self
                            .instantiate(item, Some(id), &subpath, Some(el.clone()), &slot_path)
                            .map(|child| (child, true)),
                    };
                    match result {
                        Ok((child, slot_changed)) => {
                            if sources[index].is_none() {
                                if let Child::Node(n) = &child {
                                    fresh.push(*n);
                                }
                            }
                            next.push(child);
                            changed |= slot_changed;
                        }
                        Err(err) => {
                            // Unmatched old children die only after the
                            // whole rebuild; undo the fresh ones here.
                            for n in fresh {
                                self.kill_subtree(n);
                            }
                            self.restore_array(id, children);
                            return Err(err);
                        }
                    }
                }
                for (index, child) in children.into_iter().enumerate() {
                    if claimed[index] {
                        continue;
                    }
                    if let Child::Node(n) = child {
                        self.kill_subtree(n);
                    }
                    changed = true;
                }
                self.restore_array(id, next);
                self.renumber_array(id, 0);
            }
            TypeDesc::Map { value: item } => {
                let Value::Object(new_entries) = snapshot else {
                    return Err(TreeError::conversion(path, Some(snapshot), &t.name()));
                };
                let existing_keys: Vec<String> = match &self.nodes[id.0].value {
                    NodeValue::Map(children) => children.keys().cloned().collect(),
                    _ => Vec::new(),
                };
                for key in &existing_keys {
                    if !new_entries.contains_key(key) {
                        let removed = match &mut self.nodes[id.0].value {
                            NodeValue::Map(children) => children.shift_remove(key),
                            _ => None,
                        };
                        if let Some(Child::Node(n)) = removed {
                            self.kill_subtree(n);
                        }
                        changed = true;
                    }
                }
                for (key, el) in new_entries {
                    let slot_path = join_pointer(path, key);
                    let existing = match &self.nodes[id.0].value {
                        NodeValue::Map(children) => children.get(key).cloned(),
                        _ => None,
                    };
                    match existing {
                        Some(existing) => {
                            let (updated, slot_changed) = self.reconcile_child(
                                id,
                                existing,
                                item,
                                Some(el.clone()),
                                key,
                                &slot_path,
                                true,
                                cells,
                            )?;
                            if let NodeValue::Map(children) = &mut self.nodes[id.0].value {
                                children.insert(key.clone(), updated);
                            }
                            changed |= slot_changed;
                        }
                        None => {
                            let child = self.instantiate(
                                item,
                                Some(id),
                                key,
                                Some(el.clone()),
                                &slot_path,
                            )?;
                            if let NodeValue::Map(children) = &mut self.nodes[id.0].value {
                                children.insert(key.clone(), child);
                            }
                            changed = true;
                        }
                    }
                }
            }
            _ => {
                return Err(TreeError::conversion(path, Some(snapshot), &t.name()));
            }
        }
        if changed {
            self.nodes[id.0].cached = None;
            cells.push(self.nodes[id.0].version.clone());
        }
        Ok(changed)
    }

    fn restore_array(&mut self, id: NodeId, children: Vec<Child>) {
        if let NodeValue::Array(slot) = &mut self.nodes[id.0].value {
            *slot = children;
        }
    }

    /// Rewrites the subpaths of array children from `start` onward after
    /// elements shifted position.
    pub fn renumber_array(&mut self, id: NodeId, start: usize) {
        let node_ids: Vec<(usize, NodeId)> = match &self.nodes[id.0].value {
            NodeValue::Array(children) => children
                .iter()
                .enumerate()
                .skip(start)
                .filter_map(|(i, c)| match c {
                    Child::Node(n) => Some((i, *n)),
                    Child::Leaf(_) => None,
                })
                .collect(),
            _ => Vec::new(),
        };
        for (index, child) in node_ids {
            self.nodes[child.0].subpath = index.to_string();
        }
    }

    /// Moves `id`'s identifier registrations out of its old root's map and
    /// promotes it to a root of its own.
    pub fn promote_to_root(&mut self, id: NodeId) {
        let old_root = self.root_of(id);
        let entries = self.collect_identifier_entries(id);
        if let Some(map) = self.identities.get_mut(&old_root.0) {
            for (key, _) in &entries {
                map.remove(key);
            }
        }
        self.nodes[id.0].parent = None;
        self.nodes[id.0].subpath = String::new();
        let map = self.identities.entry(id.0).or_default();
        for (key, node) in entries {
            map.insert(key, node);
        }
    }

    fn collect_identifier_entries(&self, id: NodeId) -> Vec<(String, NodeId)> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let node = &self.nodes[current.0];
            if let Some(value) = &node.identifier {
                out.push((identity_key(value), current));
            }
            match &node.value {
                NodeValue::Object(map) | NodeValue::Map(map) => {
                    for child in map.values() {
                        if let Child::Node(n) = child {
                            stack.push(*n);
                        }
                    }
                }
                NodeValue::Array(items) => {
                    for child in items {
                        if let Child::Node(n) = child {
                            stack.push(*n);
                        }
                    }
                }
            }
        }
        out
    }
}
