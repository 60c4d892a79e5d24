//! Live trees and the [`NodeRef`] handle.
//!
//! A tree is an arena plus shared bookkeeping: listener registries, the
//! protection gate counters, and the store-wide version cell that view
//! computeds track. `NodeRef` is a cheap cloneable handle (shared arena +
//! node index); all reads and writes go through it.
//!
//! Every mutation runs inside a signals batch so snapshot listeners see
//! one coalesced emission per top-level operation, after all patch
//! listeners have fired.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use arbor_pointer::{join_pointer, parse_pointer};
use arbor_signals::{batch, Computed, ObservableCell};
use serde_json::Value;

use crate::error::TreeError;
use crate::events::{ActionCall, Listeners, Patch, PatchEvent, PatchOp};
use crate::node::{Child, NodeId, NodeState, NodeValue, Store};
use crate::types::{is_identifier_prop, TypeDesc, TypeRef};

pub(crate) struct TreeShared {
    pub store: RefCell<Store>,
    pub listeners: RefCell<Listeners>,
    pub protected: Cell<bool>,
    pub action_depth: Cell<usize>,
    pub view_depth: Cell<usize>,
    pub env: Option<Value>,
    /// Bumped once per committed top-level mutation; the coarse
    /// invalidation source for view computeds.
    pub store_version: ObservableCell<u64>,
    pub view_cache: RefCell<HashMap<(usize, String), Computed<Result<Value, TreeError>>>>,
}

impl TreeShared {
    pub(crate) fn assert_writable(&self, path: &str) -> Result<(), TreeError> {
        if self.view_depth.get() > 0 {
            return Err(TreeError::Protected {
                path: path.to_string(),
            });
        }
        if self.protected.get() && self.action_depth.get() == 0 {
            return Err(TreeError::Protected {
                path: path.to_string(),
            });
        }
        Ok(())
    }
}

/// Marks an action as running for the guard's lifetime, unlocking the
/// protection gate. Nests.
pub(crate) struct ActionGuard {
    shared: Rc<TreeShared>,
}

impl ActionGuard {
    pub(crate) fn new(shared: &Rc<TreeShared>) -> Self {
        shared.action_depth.set(shared.action_depth.get() + 1);
        Self {
            shared: shared.clone(),
        }
    }
}

impl Drop for ActionGuard {
    fn drop(&mut self) {
        self.shared.action_depth.set(self.shared.action_depth.get() - 1);
    }
}

/// Marks a view as running; any write attempt while one is active fails,
/// even inside an action.
struct ViewGuard {
    shared: Rc<TreeShared>,
}

impl ViewGuard {
    fn new(shared: &Rc<TreeShared>) -> Self {
        shared.view_depth.set(shared.view_depth.get() + 1);
        Self {
            shared: shared.clone(),
        }
    }
}

impl Drop for ViewGuard {
    fn drop(&mut self) {
        self.shared.view_depth.set(self.shared.view_depth.get() - 1);
    }
}

/// Handle to a live node. Cloning is cheap and clones never outlive the
/// node's death checks: every operation re-verifies liveness.
#[derive(Clone)]
pub struct NodeRef {
    pub(crate) shared: Rc<TreeShared>,
    pub(crate) id: NodeId,
}

impl PartialEq for NodeRef {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.shared, &other.shared) && self.id == other.id
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.shared.store.try_borrow() {
            Ok(store) => write!(
                f,
                "NodeRef({} at `{}`)",
                store.node(self.id).type_.name(),
                store.path_of(self.id)
            ),
            Err(_) => write!(f, "NodeRef(#{})", self.id.0),
        }
    }
}

/// Instantiates a tree from a type descriptor and an optional snapshot.
/// An absent snapshot falls back to the type's default snapshot where it
/// has one, or the empty composite, letting optional properties fill in
/// their defaults.
pub fn create(t: &TypeRef, snapshot: Option<Value>) -> Result<NodeRef, TreeError> {
    create_impl(t, snapshot, None)
}

/// Like [`create`], with an environment value exposed to actions and
/// views via [`NodeRef::env`].
pub fn create_with_env(t: &TypeRef, snapshot: Option<Value>, env: Value) -> Result<NodeRef, TreeError> {
    create_impl(t, snapshot, Some(env))
}

fn create_impl(t: &TypeRef, snapshot: Option<Value>, env: Option<Value>) -> Result<NodeRef, TreeError> {
    let mut store = Store::new();
    let input = match snapshot {
        Some(v) => Some(v),
        None => match &**t {
            TypeDesc::Model(_) => Some(
                t.default_snapshot()
                    .unwrap_or_else(|| Value::Object(serde_json::Map::new())),
            ),
            TypeDesc::Map { .. } => Some(Value::Object(serde_json::Map::new())),
            TypeDesc::Array { .. } => Some(Value::Array(Vec::new())),
            _ => None,
        },
    };
    let child = store.instantiate(t, None, "", input, "")?;
    let Child::Node(id) = child else {
        return Err(TreeError::InvalidRoot { type_name: t.name() });
    };
    let shared = Rc::new(TreeShared {
        store: RefCell::new(store),
        listeners: RefCell::new(Listeners::default()),
        protected: Cell::new(true),
        action_depth: Cell::new(0),
        view_depth: Cell::new(0),
        env,
        store_version: ObservableCell::new(0),
        view_cache: RefCell::new(HashMap::new()),
    });
    Ok(NodeRef { shared, id })
}

fn child_at(store: &Store, id: NodeId, segment: &str) -> Result<Option<Child>, TreeError> {
    match &store.node(id).value {
        NodeValue::Object(children) | NodeValue::Map(children) => Ok(children.get(segment).cloned()),
        NodeValue::Array(items) => {
            let index: usize = segment.parse().map_err(|_| TreeError::InvalidPointer {
                pointer: segment.to_string(),
            })?;
            Ok(items.get(index).cloned())
        }
    }
}

type MutationOutcome<R> = (R, Vec<PatchEvent>, Vec<ObservableCell<u64>>);

impl NodeRef {
    /// Liveness, gate, and commit plumbing shared by every write. The
    /// closure mutates the store and reports emitted patches plus the
    /// version cells to bump; dispatch and bumping happen after the store
    /// borrow is released, inside one batch.
    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut Store, &str) -> Result<MutationOutcome<R>, TreeError>,
    ) -> Result<R, TreeError> {
        batch(|| {
            let (out, events, cells) = {
                let mut store = self.shared.store.borrow_mut();
                store.ensure_alive(self.id)?;
                let path = store.path_of(self.id);
                self.shared.assert_writable(&path)?;
                f(&mut store, &path)?
            };
            self.shared.dispatch_patches(&events);
            let changed = !events.is_empty() || !cells.is_empty();
            for cell in &cells {
                cell.update(|v| *v += 1);
            }
            if changed {
                self.shared.store_version.update(|v| *v += 1);
            }
            Ok(out)
        })
    }

    // ---- reads ----

    /// Recursive JSON snapshot of this node, memoized until a descendant
    /// mutates.
    pub fn snapshot(&self) -> Result<Value, TreeError> {
        let mut store = self.shared.store.borrow_mut();
        store.ensure_alive(self.id)?;
        Ok(store.snapshot(self.id))
    }

    /// Snapshot of one child slot (model property, map key, or array
    /// index rendered as a string).
    pub fn get(&self, segment: &str) -> Result<Value, TreeError> {
        let mut store = self.shared.store.borrow_mut();
        store.ensure_alive(self.id)?;
        match child_at(&store, self.id, segment)? {
            Some(child) => Ok(store.child_snapshot(&child)),
            None => Err(TreeError::PathNotFound {
                path: join_pointer(&store.path_of(self.id), segment),
            }),
        }
    }

    /// Handle to a composite child slot.
    pub fn at(&self, segment: &str) -> Result<NodeRef, TreeError> {
        let store = self.shared.store.borrow();
        store.ensure_alive(self.id)?;
        match child_at(&store, self.id, segment)? {
            Some(Child::Node(id)) => Ok(NodeRef {
                shared: self.shared.clone(),
                id,
            }),
            Some(Child::Leaf(_)) => Err(TreeError::WrongKind {
                expected: "composite",
            }),
            None => Err(TreeError::PathNotFound {
                path: join_pointer(&store.path_of(self.id), segment),
            }),
        }
    }

    /// Resolves a JSON Pointer relative to this node down to a composite
    /// node.
    pub fn resolve_path(&self, pointer: &str) -> Result<NodeRef, TreeError> {
        let segments = parse_pointer(pointer).map_err(|_| TreeError::InvalidPointer {
            pointer: pointer.to_string(),
        })?;
        let mut current = self.clone();
        for segment in &segments {
            current = current.at(segment)?;
        }
        Ok(current)
    }

    /// Absolute path from the root, as a JSON Pointer (empty for roots).
    pub fn path(&self) -> String {
        self.shared.store.borrow().path_of(self.id)
    }

    pub fn parent(&self) -> Option<NodeRef> {
        self.shared
            .store
            .borrow()
            .node(self.id)
            .parent
            .map(|id| NodeRef {
                shared: self.shared.clone(),
                id,
            })
    }

    pub fn root(&self) -> NodeRef {
        let id = self.shared.store.borrow().root_of(self.id);
        NodeRef {
            shared: self.shared.clone(),
            id,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.shared.store.borrow().node(self.id).state != NodeState::Dead
    }

    pub fn type_name(&self) -> String {
        self.shared.store.borrow().node(self.id).type_.name()
    }

    /// Number of child slots (model properties, array elements, or map
    /// entries).
    pub fn len(&self) -> Result<usize, TreeError> {
        let store = self.shared.store.borrow();
        store.ensure_alive(self.id)?;
        Ok(match &store.node(self.id).value {
            NodeValue::Object(children) | NodeValue::Map(children) => children.len(),
            NodeValue::Array(items) => items.len(),
        })
    }

    pub fn is_empty(&self) -> Result<bool, TreeError> {
        Ok(self.len()? == 0)
    }

    /// Keys of a map or property names of a model, in order.
    pub fn keys(&self) -> Result<Vec<String>, TreeError> {
        let store = self.shared.store.borrow();
        store.ensure_alive(self.id)?;
        match &store.node(self.id).value {
            NodeValue::Object(children) | NodeValue::Map(children) => {
                Ok(children.keys().cloned().collect())
            }
            NodeValue::Array(_) => Err(TreeError::WrongKind { expected: "map" }),
        }
    }

    /// The environment value the tree was created with, if any.
    pub fn env(&self) -> Option<Value> {
        self.shared.env.clone()
    }

    /// Finds the live node registered under `value` in this tree's
    /// identifier index.
    pub fn resolve_identifier(&self, value: &Value) -> Option<NodeRef> {
        let store = self.shared.store.borrow();
        let id = store.lookup_identifier(self.id, value)?;
        Some(NodeRef {
            shared: self.shared.clone(),
            id,
        })
    }

    // ---- protection gate ----

    pub fn protect(&self) {
        self.shared.protected.set(true);
    }

    pub fn unprotect(&self) {
        self.shared.protected.set(false);
    }

    pub fn is_protected(&self) -> bool {
        self.shared.protected.get()
    }

    // ---- model writes ----

    /// Assigns a model property from a snapshot value, reconciling the
    /// existing child where possible.
    pub fn set(&self, prop: &str, value: Value) -> Result<(), TreeError> {
        self.set_prop(prop, Some(value), true)
    }

    /// Clears a model property back to its default. Fails for required
    /// properties.
    pub fn unset(&self, prop: &str) -> Result<(), TreeError> {
        self.set_prop(prop, None, true)
    }

    /// Assigns a model property from another live instance. The slot is
    /// rebuilt from the instance's snapshot; any previous child dies, and
    /// the source instance is left untouched.
    pub fn set_node(&self, prop: &str, instance: &NodeRef) -> Result<(), TreeError> {
        let snap = {
            let mut store = instance.shared.store.borrow_mut();
            store.ensure_alive(instance.id)?;
            store.snapshot(instance.id)
        };
        self.set_prop(prop, Some(snap), false)
    }

    fn set_prop(&self, prop: &str, input: Option<Value>, reuse: bool) -> Result<(), TreeError> {
        self.mutate(|store, path| {
            let t = store.node(self.id).type_.clone();
            let TypeDesc::Model(m) = &*t else {
                return Err(TreeError::WrongKind { expected: "model" });
            };
            let Some(pt) = m.props.get(prop).cloned() else {
                return Err(TreeError::UnknownProperty {
                    name: prop.to_string(),
                    type_name: t.name(),
                });
            };
            if is_identifier_prop(&pt) {
                let current = store.node(self.id).identifier.clone();
                if current.is_some() && current != input {
                    return Err(TreeError::IdentifierImmutable {
                        type_name: t.name(),
                        path: path.to_string(),
                    });
                }
            }
            let slot_path = join_pointer(path, prop);
            let existing = match &store.node(self.id).value {
                NodeValue::Object(children) => children
                    .get(prop)
                    .cloned()
                    .unwrap_or(Child::Leaf(Value::Null)),
                _ => Child::Leaf(Value::Null),
            };
            let old = store.child_snapshot(&existing);
            let mut cells = Vec::new();
            let (updated, changed) = store.reconcile_child(
                self.id, existing, &pt, input, prop, &slot_path, reuse, &mut cells,
            )?;
            if let NodeValue::Object(children) = &mut store.node_mut(self.id).value {
                children.insert(prop.to_string(), updated.clone());
            }
            let mut events = Vec::new();
            if changed {
                cells.extend(store.invalidate(self.id));
                let new = store.child_snapshot(&updated);
                events.push(PatchEvent {
                    ancestors: store.ancestors_with_paths(self.id),
                    forward: Patch {
                        op: PatchOp::Replace,
                        path: slot_path.clone(),
                        value: Some(new),
                    },
                    inverse: Patch {
                        op: PatchOp::Replace,
                        path: slot_path,
                        value: Some(old),
                    },
                });
            }
            Ok(((), events, cells))
        })
    }

    // ---- array writes ----

    pub fn push(&self, value: Value) -> Result<(), TreeError> {
        let len = self.len()?;
        self.splice(len, 0, vec![value]).map(|_| ())
    }

    pub fn set_index(&self, index: usize, value: Value) -> Result<(), TreeError> {
        self.mutate(|store, path| {
            let t = store.node(self.id).type_.clone();
            let TypeDesc::Array { item } = &*t else {
                return Err(TreeError::WrongKind { expected: "array" });
            };
            let existing = match &store.node(self.id).value {
                NodeValue::Array(items) => match items.get(index) {
                    Some(c) => c.clone(),
                    None => {
                        return Err(TreeError::IndexOutOfRange {
                            index,
                            length: items.len(),
                        })
                    }
                },
                _ => return Err(TreeError::WrongKind { expected: "array" }),
            };
            let subpath = index.to_string();
            let slot_path = join_pointer(path, &subpath);
            let old = store.child_snapshot(&existing);
            let mut cells = Vec::new();
            let (updated, changed) = store.reconcile_child(
                self.id,
                existing,
                item,
                Some(value),
                &subpath,
                &slot_path,
                true,
                &mut cells,
            )?;
            if let NodeValue::Array(items) = &mut store.node_mut(self.id).value {
                items[index] = updated.clone();
            }
            let mut events = Vec::new();
            if changed {
                cells.extend(store.invalidate(self.id));
                let new = store.child_snapshot(&updated);
                events.push(PatchEvent {
                    ancestors: store.ancestors_with_paths(self.id),
                    forward: Patch {
                        op: PatchOp::Replace,
                        path: slot_path.clone(),
                        value: Some(new),
                    },
                    inverse: Patch {
                        op: PatchOp::Replace,
                        path: slot_path,
                        value: Some(old),
                    },
                });
            }
            Ok(((), events, cells))
        })
    }

    pub fn remove_index(&self, index: usize) -> Result<(), TreeError> {
        self.splice(index, 1, Vec::new()).map(|_| ())
    }

    /// Removes `delete_count` elements at `start`, inserts `items` in
    /// their place, and returns the snapshots of the removed elements.
    /// One patch is emitted per removal and per insertion.
    pub fn splice(
        &self,
        start: usize,
        delete_count: usize,
        items: Vec<Value>,
    ) -> Result<Vec<Value>, TreeError> {
        self.mutate(|store, path| {
            let t = store.node(self.id).type_.clone();
            let TypeDesc::Array { item } = &*t else {
                return Err(TreeError::WrongKind { expected: "array" });
            };
            let len = match &store.node(self.id).value {
                NodeValue::Array(items) => items.len(),
                _ => 0,
            };
            if start > len {
                return Err(TreeError::IndexOutOfRange {
                    index: start,
                    length: len,
                });
            }
            if start + delete_count > len {
                return Err(TreeError::IndexOutOfRange {
                    index: start + delete_count,
                    length: len,
                });
            }
            // Items are checked up front so a bad one cannot leave the
            // splice half-applied.
            for (offset, v) in items.iter().enumerate() {
                if !item.is(Some(v)) {
                    let slot_path = join_pointer(path, &(start + offset).to_string());
                    return Err(TreeError::conversion(&slot_path, Some(v), &item.name()));
                }
            }
            let mut children = match &mut store.node_mut(self.id).value {
                NodeValue::Array(items) => std::mem::take(items),
                _ => Vec::new(),
            };
            let ancestors = store.ancestors_with_paths(self.id);
            let mut events = Vec::new();
            let mut cells = Vec::new();
            let mut removed = Vec::with_capacity(delete_count);
            let mut killed = Vec::new();
            for _ in 0..delete_count {
                let child = children.remove(start);
                let snap = store.child_snapshot(&child);
                let slot_path = join_pointer(path, &start.to_string());
                events.push(PatchEvent {
                    ancestors: ancestors.clone(),
                    forward: Patch {
                        op: PatchOp::Remove,
                        path: slot_path.clone(),
                        value: None,
                    },
                    inverse: Patch {
                        op: PatchOp::Add,
                        path: slot_path,
                        value: Some(snap.clone()),
                    },
                });
                removed.push(snap);
                if let Child::Node(n) = child {
                    killed.push(n);
                }
            }
            for n in killed {
                store.kill_subtree(n);
            }
            let mut inserted = Vec::with_capacity(items.len());
            for (offset, v) in items.into_iter().enumerate() {
                let index = start + offset;
                let subpath = index.to_string();
                let slot_path = join_pointer(path, &subpath);
                match store.instantiate(item, Some(self.id), &subpath, Some(v), &slot_path) {
                    Ok(child) => {
                        let snap = store.child_snapshot(&child);
                        events.push(PatchEvent {
                            ancestors: ancestors.clone(),
                            forward: Patch {
                                op: PatchOp::Add,
                                path: slot_path.clone(),
                                value: Some(snap),
                            },
                            inverse: Patch {
                                op: PatchOp::Remove,
                                path: slot_path,
                                value: None,
                            },
                        });
                        inserted.push(child);
                    }
                    Err(err) => {
                        if let NodeValue::Array(slot) = &mut store.node_mut(self.id).value {
                            *slot = children;
                        }
                        store.renumber_array(self.id, 0);
                        return Err(err);
                    }
                }
            }
            children.splice(start..start, inserted);
            if let NodeValue::Array(slot) = &mut store.node_mut(self.id).value {
                *slot = children;
            }
            store.renumber_array(self.id, start);
            if !events.is_empty() {
                cells.extend(store.invalidate(self.id));
            }
            Ok((removed, events, cells))
        })
    }

    // ---- map writes ----

    /// Adds or replaces one map entry.
    pub fn set_key(&self, key: &str, value: Value) -> Result<(), TreeError> {
        self.mutate(|store, path| {
            let t = store.node(self.id).type_.clone();
            let TypeDesc::Map { value: item } = &*t else {
                return Err(TreeError::WrongKind { expected: "map" });
            };
            let mut events = Vec::new();
            let mut cells = Vec::new();
            map_put(store, self.id, item, key, value, path, &mut events, &mut cells)?;
            Ok(((), events, cells))
        })
    }

    pub fn remove_key(&self, key: &str) -> Result<(), TreeError> {
        self.mutate(|store, path| {
            let t = store.node(self.id).type_.clone();
            if !matches!(&*t, TypeDesc::Map { .. }) {
                return Err(TreeError::WrongKind { expected: "map" });
            }
            let slot_path = join_pointer(path, key);
            let existing = match &store.node(self.id).value {
                NodeValue::Map(children) => children.get(key).cloned(),
                _ => None,
            };
            let Some(existing) = existing else {
                return Err(TreeError::PathNotFound { path: slot_path });
            };
            let old = store.child_snapshot(&existing);
            if let NodeValue::Map(children) = &mut store.node_mut(self.id).value {
                children.shift_remove(key);
            }
            if let Child::Node(n) = existing {
                store.kill_subtree(n);
            }
            let cells = store.invalidate(self.id);
            let events = vec![PatchEvent {
                ancestors: store.ancestors_with_paths(self.id),
                forward: Patch {
                    op: PatchOp::Remove,
                    path: slot_path.clone(),
                    value: None,
                },
                inverse: Patch {
                    op: PatchOp::Add,
                    path: slot_path,
                    value: Some(old),
                },
            }];
            Ok(((), events, cells))
        })
    }

    /// Adds or replaces every entry of `entries` in one transaction.
    pub fn merge(&self, entries: serde_json::Map<String, Value>) -> Result<(), TreeError> {
        self.mutate(|store, path| {
            let t = store.node(self.id).type_.clone();
            let TypeDesc::Map { value: item } = &*t else {
                return Err(TreeError::WrongKind { expected: "map" });
            };
            let mut events = Vec::new();
            let mut cells = Vec::new();
            for (key, value) in entries {
                map_put(store, self.id, item, &key, value, path, &mut events, &mut cells)?;
            }
            Ok(((), events, cells))
        })
    }

    /// Empties an array or map.
    pub fn clear(&self) -> Result<(), TreeError> {
        enum Kind {
            Array,
            Map,
        }
        let kind = {
            let store = self.shared.store.borrow();
            store.ensure_alive(self.id)?;
            match &*store.node(self.id).type_ {
                TypeDesc::Array { .. } => Kind::Array,
                TypeDesc::Map { .. } => Kind::Map,
                _ => {
                    return Err(TreeError::WrongKind {
                        expected: "collection",
                    })
                }
            }
        };
        match kind {
            Kind::Array => {
                let len = self.len()?;
                self.splice(0, len, Vec::new()).map(|_| ())
            }
            Kind::Map => {
                let keys = self.keys()?;
                self.mutate(|store, path| {
                    let mut events = Vec::new();
                    let mut cells = Vec::new();
                    for key in keys {
                        let slot_path = join_pointer(path, &key);
                        let existing = match &store.node(self.id).value {
                            NodeValue::Map(children) => children.get(&key).cloned(),
                            _ => None,
                        };
                        let Some(existing) = existing else { continue };
                        let old = store.child_snapshot(&existing);
                        if let NodeValue::Map(children) = &mut store.node_mut(self.id).value {
                            children.shift_remove(&key);
                        }
                        if let Child::Node(n) = existing {
                            store.kill_subtree(n);
                        }
                        events.push(PatchEvent {
                            ancestors: store.ancestors_with_paths(self.id),
                            forward: Patch {
                                op: PatchOp::Remove,
                                path: slot_path.clone(),
                                value: None,
                            },
                            inverse: Patch {
                                op: PatchOp::Add,
                                path: slot_path,
                                value: Some(old),
                            },
                        });
                    }
                    if !events.is_empty() {
                        cells.extend(store.invalidate(self.id));
                    }
                    Ok(((), events, cells))
                })
            }
        }
    }

    // ---- whole-node writes ----

    /// Replaces this node's contents from a snapshot, reconciling children
    /// structurally so unchanged sub-instances survive. Runs as a built-in
    /// action.
    pub fn apply_snapshot(&self, snapshot: &Value) -> Result<(), TreeError> {
        {
            let store = self.shared.store.borrow();
            store.ensure_alive(self.id)?;
            let issues = store.node(self.id).type_.validate(Some(snapshot), "");
            if !issues.is_empty() {
                return Err(TreeError::Validation(issues));
            }
        }
        let _guard = ActionGuard::new(&self.shared);
        self.mutate(|store, path| {
            let old = store.snapshot(self.id);
            let mut cells = Vec::new();
            let changed = store.update_in_place(self.id, snapshot, path, &mut cells)?;
            let mut events = Vec::new();
            if changed {
                cells.extend(store.invalidate(self.id));
                events.push(PatchEvent {
                    ancestors: store.ancestors_with_paths(self.id),
                    forward: Patch {
                        op: PatchOp::Replace,
                        path: path.to_string(),
                        value: Some(snapshot.clone()),
                    },
                    inverse: Patch {
                        op: PatchOp::Replace,
                        path: path.to_string(),
                        value: Some(old),
                    },
                });
            }
            Ok(((), events, cells))
        })
    }

    // ---- actions and views ----

    /// Invokes a declared action. The invocation record is dispatched to
    /// action listeners before the body runs; the whole call is one
    /// transaction.
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, TreeError> {
        let (action, ancestors, path) = {
            let store = self.shared.store.borrow();
            store.ensure_alive(self.id)?;
            let t = &store.node(self.id).type_;
            let TypeDesc::Model(m) = &**t else {
                return Err(TreeError::WrongKind { expected: "model" });
            };
            let Some(action) = m.actions.get(name).cloned() else {
                return Err(TreeError::UnknownAction {
                    name: name.to_string(),
                    type_name: t.name(),
                });
            };
            let ancestors = store.ancestors_with_paths(self.id);
            let path = ancestors
                .last()
                .map(|(_, p)| p.clone())
                .unwrap_or_default();
            (action, ancestors, path)
        };
        batch(|| {
            self.shared.dispatch_action(
                &ancestors,
                &ActionCall {
                    name: name.to_string(),
                    path,
                    args: args.to_vec(),
                },
            );
            let _guard = ActionGuard::new(&self.shared);
            action(self, args)
        })
    }

    /// Evaluates a declared view. Results are memoized per node and
    /// invalidated by any committed mutation anywhere in the tree.
    pub fn view(&self, name: &str) -> Result<Value, TreeError> {
        let view_fn = {
            let store = self.shared.store.borrow();
            store.ensure_alive(self.id)?;
            let t = &store.node(self.id).type_;
            let TypeDesc::Model(m) = &**t else {
                return Err(TreeError::WrongKind { expected: "model" });
            };
            let Some(view_fn) = m.views.get(name).cloned() else {
                return Err(TreeError::UnknownView {
                    name: name.to_string(),
                    type_name: t.name(),
                });
            };
            view_fn
        };
        let computed = {
            let mut cache = self.shared.view_cache.borrow_mut();
            cache
                .entry((self.id.0, name.to_string()))
                .or_insert_with(|| {
                    let weak = Rc::downgrade(&self.shared);
                    let id = self.id;
                    let sv = self.shared.store_version.clone();
                    let type_name = self.type_name();
                    Computed::new(move || {
                        let _ = sv.get();
                        let Some(shared) = weak.upgrade() else {
                            return Err(TreeError::DeadNode {
                                type_name: type_name.clone(),
                                path: String::new(),
                            });
                        };
                        let node = NodeRef {
                            shared: shared.clone(),
                            id,
                        };
                        let _guard = ViewGuard::new(&shared);
                        view_fn(&node)
                    })
                })
                .clone()
        };
        computed.get()
    }

    // ---- lifecycle ----

    /// Unlinks this node from its parent and promotes it to a root of its
    /// own, keeping it alive. A required model slot refuses (its default
    /// cannot be materialized), failing before anything changes.
    pub fn detach(&self) -> Result<(), TreeError> {
        batch(|| {
            let (events, cells) = {
                let mut store = self.shared.store.borrow_mut();
                store.ensure_alive(self.id)?;
                let path = store.path_of(self.id);
                self.shared.assert_writable(&path)?;
                let Some(parent) = store.node(self.id).parent else {
                    return Err(TreeError::AlreadyRoot);
                };
                store.node_mut(self.id).state = NodeState::Detaching;
                let result = unlink_from_parent(&mut store, self.id, parent);
                store.node_mut(self.id).state = NodeState::Alive;
                let (events, cells) = result?;
                store.promote_to_root(self.id);
                (events, cells)
            };
            self.shared.dispatch_patches(&events);
            for cell in &cells {
                cell.update(|v| *v += 1);
            }
            self.shared.store_version.update(|v| *v += 1);
            Ok(())
        })
    }

    /// Unlinks this node and kills its whole subtree. Destroying a root
    /// kills the tree without emitting patches.
    pub fn destroy(&self) -> Result<(), TreeError> {
        batch(|| {
            let (events, cells) = {
                let mut store = self.shared.store.borrow_mut();
                store.ensure_alive(self.id)?;
                let path = store.path_of(self.id);
                self.shared.assert_writable(&path)?;
                match store.node(self.id).parent {
                    Some(parent) => {
                        let (events, cells) = unlink_from_parent(&mut store, self.id, parent)?;
                        store.kill_subtree(self.id);
                        (events, cells)
                    }
                    None => {
                        store.kill_subtree(self.id);
                        (Vec::new(), Vec::new())
                    }
                }
            };
            self.shared.dispatch_patches(&events);
            for cell in &cells {
                cell.update(|v| *v += 1);
            }
            self.shared.store_version.update(|v| *v += 1);
            Ok(())
        })
    }
}

/// Removes `id` from `parent`'s children without touching `id` itself.
/// For model slots the default replacement is instantiated first, so a
/// required slot fails before any visible mutation.
fn unlink_from_parent(
    store: &mut Store,
    id: NodeId,
    parent: NodeId,
) -> Result<(Vec<PatchEvent>, Vec<ObservableCell<u64>>), TreeError> {
    let subpath = store.node(id).subpath.clone();
    let parent_path = store.path_of(parent);
    let slot_path = join_pointer(&parent_path, &subpath);
    let old = store.snapshot(id);
    let ancestors = store.ancestors_with_paths(parent);
    let mut events = Vec::new();
    let pt = store.node(parent).type_.clone();
    match &*pt {
        TypeDesc::Model(m) => {
            let slot_type = m.props.get(&subpath).cloned().ok_or_else(|| {
                TreeError::PathNotFound {
                    path: slot_path.clone(),
                }
            })?;
            let replacement = store.instantiate(&slot_type, Some(parent), &subpath, None, &slot_path)?;
            let new = store.child_snapshot(&replacement);
            if let NodeValue::Object(children) = &mut store.node_mut(parent).value {
                children.insert(subpath.clone(), replacement);
            }
            events.push(PatchEvent {
                ancestors,
                forward: Patch {
                    op: PatchOp::Replace,
                    path: slot_path.clone(),
                    value: Some(new),
                },
                inverse: Patch {
                    op: PatchOp::Replace,
                    path: slot_path,
                    value: Some(old),
                },
            });
        }
        TypeDesc::Array { .. } => {
            let index: usize = subpath.parse().map_err(|_| TreeError::PathNotFound {
                path: slot_path.clone(),
            })?;
            if let NodeValue::Array(children) = &mut store.node_mut(parent).value {
                if index < children.len() {
                    children.remove(index);
                }
            }
            store.renumber_array(parent, index);
            events.push(PatchEvent {
                ancestors,
                forward: Patch {
                    op: PatchOp::Remove,
                    path: slot_path.clone(),
                    value: None,
                },
                inverse: Patch {
                    op: PatchOp::Add,
                    path: slot_path,
                    value: Some(old),
                },
            });
        }
        TypeDesc::Map { .. } => {
            if let NodeValue::Map(children) = &mut store.node_mut(parent).value {
                children.shift_remove(&subpath);
            }
            events.push(PatchEvent {
                ancestors,
                forward: Patch {
                    op: PatchOp::Remove,
                    path: slot_path.clone(),
                    value: None,
                },
                inverse: Patch {
                    op: PatchOp::Add,
                    path: slot_path,
                    value: Some(old),
                },
            });
        }
        _ => {
            return Err(TreeError::PathNotFound { path: slot_path });
        }
    }
    let cells = store.invalidate(parent);
    Ok((events, cells))
}

#[allow(clippy::too_many_arguments)]
fn map_put(
    store: &mut Store,
    id: NodeId,
    item: &TypeRef,
    key: &str,
    value: Value,
    path: &str,
    events: &mut Vec<PatchEvent>,
    cells: &mut Vec<ObservableCell<u64>>,
) -> Result<(), TreeError> {
    let slot_path = join_pointer(path, key);
    let existing = match &store.node(id).value {
        NodeValue::Map(children) => children.get(key).cloned(),
        _ => None,
    };
    match existing {
        Some(existing) => {
            let old = store.child_snapshot(&existing);
            let (updated, changed) = store.reconcile_child(
                id,
                existing,
                item,
                Some(value),
                key,
                &slot_path,
                true,
                cells,
            )?;
            if let NodeValue::Map(children) = &mut store.node_mut(id).value {
                children.insert(key.to_string(), updated.clone());
            }
            if changed {
                cells.extend(store.invalidate(id));
                let new = store.child_snapshot(&updated);
                events.push(PatchEvent {
                    ancestors: store.ancestors_with_paths(id),
                    forward: Patch {
                        op: PatchOp::Replace,
                        path: slot_path.clone(),
                        value: Some(new),
                    },
                    inverse: Patch {
                        op: PatchOp::Replace,
                        path: slot_path,
                        value: Some(old),
                    },
                });
            }
        }
        None => {
            let child = store.instantiate(item, Some(id), key, Some(value), &slot_path)?;
            let snap = store.child_snapshot(&child);
            if let NodeValue::Map(children) = &mut store.node_mut(id).value {
                children.insert(key.to_string(), child);
            }
            cells.extend(store.invalidate(id));
            events.push(PatchEvent {
                ancestors: store.ancestors_with_paths(id),
                forward: Patch {
                    op: PatchOp::Add,
                    path: slot_path.clone(),
                    value: Some(snap),
                },
                inverse: Patch {
                    op: PatchOp::Remove,
                    path: slot_path,
                    value: None,
                },
            });
        }
    }
    Ok(())
}
