//! Observation channels and their wire forms.
//!
//! Three channels hang off every node: snapshot (coalesced, one emission
//! per top-level mutation), patch (synchronous RFC 6902-style add, remove,
//! replace records with inverses), and action (invocation records emitted
//! before the action body runs). Paths delivered to a listener are rebased
//! to be relative to the node it subscribed on.

use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use arbor_pointer::rebase_pointer;
use arbor_signals::{effect, Effect};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::node::NodeId;
use crate::tree::{NodeRef, TreeShared};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Add,
    Remove,
    Replace,
}

/// One mutation record. `path` is a JSON Pointer; `value` is absent for
/// removals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub op: PatchOp,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value: Option<Value>,
}

/// A recorded action invocation, replayable via `apply_action`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCall {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// An emitted patch still carrying absolute paths, plus the subscriber
/// anchor points it can be rebased against.
pub(crate) struct PatchEvent {
    /// Root-first `(node, absolute path)` chain of the mutated node.
    pub ancestors: Vec<(NodeId, String)>,
    pub forward: Patch,
    pub inverse: Patch,
}

type PatchCallback = Box<dyn FnMut(&Patch, &Patch)>;
type ActionCallback = Box<dyn FnMut(&ActionCall)>;

/// Listener registries. Callbacks are stored behind `Option` so dispatch
/// can take one out, invoke it without holding the registry borrow, and
/// put it back.
#[derive(Default)]
pub(crate) struct Listeners {
    next: u64,
    patch: BTreeMap<u64, (NodeId, Option<PatchCallback>)>,
    action: BTreeMap<u64, (NodeId, Option<ActionCallback>)>,
    snapshot: BTreeMap<u64, Effect>,
}

#[derive(Clone, Copy)]
enum Channel {
    Patch,
    Action,
    Snapshot,
}

/// Handle returned by the `on_*` registration methods. Dropping it keeps
/// the listener alive; call [`Disposer::dispose`] to unregister.
pub struct Disposer {
    shared: Weak<TreeShared>,
    channel: Channel,
    id: u64,
}

impl Disposer {
    pub fn dispose(self) {
        if let Some(shared) = self.shared.upgrade() {
            let mut listeners = shared.listeners.borrow_mut();
            match self.channel {
                Channel::Patch => {
                    listeners.patch.remove(&self.id);
                }
                Channel::Action => {
                    listeners.action.remove(&self.id);
                }
                Channel::Snapshot => {
                    listeners.snapshot.remove(&self.id);
                }
            }
        }
    }
}

impl TreeShared {
    pub(crate) fn dispatch_patches(&self, events: &[PatchEvent]) {
        for ev in events {
            let targets: Vec<(u64, NodeId)> = self
                .listeners
                .borrow()
                .patch
                .iter()
                .map(|(lid, (nid, _))| (*lid, *nid))
                .collect();
            for (lid, nid) in targets {
                let Some(prefix) = ev
                    .ancestors
                    .iter()
                    .find(|(a, _)| *a == nid)
                    .map(|(_, p)| p.clone())
                else {
                    continue;
                };
                let (Some(fwd_path), Some(inv_path)) = (
                    rebase_pointer(&prefix, &ev.forward.path),
                    rebase_pointer(&prefix, &ev.inverse.path),
                ) else {
                    continue;
                };
                let cb = self
                    .listeners
                    .borrow_mut()
                    .patch
                    .get_mut(&lid)
                    .and_then(|(_, slot)| slot.take());
                if let Some(mut cb) = cb {
                    let forward = Patch {
                        path: fwd_path,
                        ..ev.forward.clone()
                    };
                    let inverse = Patch {
                        path: inv_path,
                        ..ev.inverse.clone()
                    };
                    cb(&forward, &inverse);
                    if let Some((_, slot)) = self.listeners.borrow_mut().patch.get_mut(&lid) {
                        *slot = Some(cb);
                    }
                }
            }
        }
    }

    pub(crate) fn dispatch_action(&self, ancestors: &[(NodeId, String)], call: &ActionCall) {
        let targets: Vec<(u64, NodeId)> = self
            .listeners
            .borrow()
            .action
            .iter()
            .map(|(lid, (nid, _))| (*lid, *nid))
            .collect();
        for (lid, nid) in targets {
            let Some(prefix) = ancestors
                .iter()
                .find(|(a, _)| *a == nid)
                .map(|(_, p)| p.clone())
            else {
                continue;
            };
            let Some(path) = rebase_pointer(&prefix, &call.path) else {
                continue;
            };
            let cb = self
                .listeners
                .borrow_mut()
                .action
                .get_mut(&lid)
                .and_then(|(_, slot)| slot.take());
            if let Some(mut cb) = cb {
                let rebased = ActionCall {
                    name: call.name.clone(),
                    path,
                    args: call.args.clone(),
                };
                cb(&rebased);
                if let Some((_, slot)) = self.listeners.borrow_mut().action.get_mut(&lid) {
                    *slot = Some(cb);
                }
            }
        }
    }
}

impl NodeRef {
    /// Subscribes to patches touching this node's subtree. Paths are
    /// rebased to be relative to this node.
    pub fn on_patch(&self, f: impl FnMut(&Patch, &Patch) + 'static) -> Disposer {
        let mut listeners = self.shared.listeners.borrow_mut();
        listeners.next += 1;
        let id = listeners.next;
        listeners.patch.insert(id, (self.id, Some(Box::new(f))));
        Disposer {
            shared: Rc::downgrade(&self.shared),
            channel: Channel::Patch,
            id,
        }
    }

    /// Subscribes to top-level action invocations within this node's
    /// subtree. Fires before the action body runs.
    pub fn on_action(&self, f: impl FnMut(&ActionCall) + 'static) -> Disposer {
        let mut listeners = self.shared.listeners.borrow_mut();
        listeners.next += 1;
        let id = listeners.next;
        listeners.action.insert(id, (self.id, Some(Box::new(f))));
        Disposer {
            shared: Rc::downgrade(&self.shared),
            channel: Channel::Action,
            id,
        }
    }

    /// Subscribes to this node's snapshot. Emissions are coalesced: a
    /// top-level mutation producing many patches yields one call with the
    /// final state.
    pub fn on_snapshot(&self, mut f: impl FnMut(&Value) + 'static) -> Disposer {
        let cell = self.shared.store.borrow().node(self.id).version.clone();
        let weak = Rc::downgrade(&self.shared);
        let node_id = self.id;
        // The establishing run only subscribes; it must not emit.
        let mut first = true;
        let eff = effect(move || {
            let _ = cell.get();
            if first {
                first = false;
                return;
            }
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let snap = shared.store.borrow_mut().snapshot(node_id);
            f(&snap);
        });
        let mut listeners = self.shared.listeners.borrow_mut();
        listeners.next += 1;
        let id = listeners.next;
        listeners.snapshot.insert(id, eff);
        Disposer {
            shared: Rc::downgrade(&self.shared),
            channel: Channel::Snapshot,
            id,
        }
    }
}
