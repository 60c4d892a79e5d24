//! Replay: feeding recorded patches and action calls back into a tree.
//!
//! Replaying the patch stream emitted by one tree into a second tree
//! created from the same initial snapshot converges both to the same
//! state; likewise for the action stream, provided the action bodies are
//! deterministic.

use arbor_pointer::parse_pointer;
use arbor_signals::batch;
use serde_json::Value;

use crate::error::TreeError;
use crate::events::{ActionCall, Patch, PatchOp};
use crate::tree::{ActionGuard, NodeRef};
use crate::types::{TypeDesc, TypeRef};

enum SlotKind {
    Model(TypeRef),
    Array(TypeRef),
    Map(TypeRef),
}

impl NodeRef {
    /// Applies one patch, addressed relative to this node. The value is
    /// validated against the target slot's type before anything mutates.
    /// Runs as a built-in action.
    pub fn apply_patch(&self, patch: &Patch) -> Result<(), TreeError> {
        let segments = parse_pointer(&patch.path).map_err(|_| TreeError::InvalidPointer {
            pointer: patch.path.clone(),
        })?;
        if segments.is_empty() {
            return match patch.op {
                PatchOp::Replace => {
                    let value = patch.value.as_ref().ok_or_else(|| TreeError::InvalidPatch {
                        message: "replace requires a value".to_string(),
                    })?;
                    self.apply_snapshot(value)
                }
                _ => Err(TreeError::InvalidPatch {
                    message: "add and remove are not valid at the root".to_string(),
                }),
            };
        }
        let (parents, last) = segments.split_at(segments.len() - 1);
        let mut target = self.clone();
        for segment in parents {
            target = target.at(segment)?;
        }
        let segment = last[0].clone();
        let kind = {
            let t = target.type_ref();
            match &*t {
                TypeDesc::Model(m) => {
                    let pt = m.props.get(&segment).cloned().ok_or_else(|| {
                        TreeError::UnknownProperty {
                            name: segment.clone(),
                            type_name: t.name(),
                        }
                    })?;
                    SlotKind::Model(pt)
                }
                TypeDesc::Array { item } => SlotKind::Array(item.clone()),
                TypeDesc::Map { value } => SlotKind::Map(value.clone()),
                _ => {
                    return Err(TreeError::PathNotFound {
                        path: patch.path.clone(),
                    })
                }
            }
        };
        let value = match patch.op {
            PatchOp::Add | PatchOp::Replace => {
                let value = patch.value.clone().ok_or_else(|| TreeError::InvalidPatch {
                    message: format!("{:?} requires a value", patch.op).to_lowercase(),
                })?;
                let slot_type = match &kind {
                    SlotKind::Model(t) | SlotKind::Array(t) | SlotKind::Map(t) => t,
                };
                let issues = slot_type.validate(Some(&value), &patch.path);
                if !issues.is_empty() {
                    return Err(TreeError::Validation(issues));
                }
                Some(value)
            }
            PatchOp::Remove => None,
        };
        batch(|| {
            let _guard = ActionGuard::new(&self.shared);
            match kind {
                SlotKind::Model(_) => match patch.op {
                    PatchOp::Add | PatchOp::Replace => {
                        target.set(&segment, value.unwrap_or(Value::Null))
                    }
                    PatchOp::Remove => target.unset(&segment),
                },
                SlotKind::Array(_) => match patch.op {
                    PatchOp::Add => {
                        let index = if segment == "-" {
                            target.len()?
                        } else {
                            parse_index(&segment)?
                        };
                        target
                            .splice(index, 0, vec![value.unwrap_or(Value::Null)])
                            .map(|_| ())
                    }
                    PatchOp::Replace => {
                        target.set_index(parse_index(&segment)?, value.unwrap_or(Value::Null))
                    }
                    PatchOp::Remove => {
                        target.splice(parse_index(&segment)?, 1, Vec::new()).map(|_| ())
                    }
                },
                SlotKind::Map(_) => match patch.op {
                    PatchOp::Add | PatchOp::Replace => {
                        target.set_key(&segment, value.unwrap_or(Value::Null))
                    }
                    PatchOp::Remove => target.remove_key(&segment),
                },
            }
        })
    }

    /// Applies patches in order, stopping at the first failure. Patches
    /// already applied stay applied.
    pub fn apply_patches(&self, patches: &[Patch]) -> Result<(), TreeError> {
        for patch in patches {
            self.apply_patch(patch)?;
        }
        Ok(())
    }

    /// Replays one recorded action call against the node at its path.
    pub fn apply_action(&self, call: &ActionCall) -> Result<Value, TreeError> {
        let target = self.resolve_path(&call.path)?;
        target.call(&call.name, &call.args)
    }

    /// Replays calls in order, stopping at the first failure.
    pub fn apply_actions(&self, calls: &[ActionCall]) -> Result<Vec<Value>, TreeError> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            results.push(self.apply_action(call)?);
        }
        Ok(results)
    }

    fn type_ref(&self) -> TypeRef {
        self.shared.store.borrow().node(self.id).type_.clone()
    }
}

fn parse_index(segment: &str) -> Result<usize, TreeError> {
    segment.parse().map_err(|_| TreeError::InvalidPatch {
        message: format!("`{segment}` is not an array index"),
    })
}
