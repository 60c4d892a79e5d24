use std::cell::RefCell;
use std::rc::Rc;

use arbor::{create, types, NodeRef, Patch};
use proptest::prelude::*;
use serde_json::json;

#[derive(Debug, Clone)]
enum Op {
    Push(String),
    SetTitle(usize, String),
    Toggle(usize),
    Remove(usize),
    SetTag(String, i64),
    RemoveTag(String),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        "[a-z]{1,6}".prop_map(Op::Push),
        (0usize..4, "[a-z]{1,6}").prop_map(|(i, t)| Op::SetTitle(i, t)),
        (0usize..4).prop_map(Op::Toggle),
        (0usize..4).prop_map(Op::Remove),
        ("[a-d]", any::<i64>()).prop_map(|(k, v)| Op::SetTag(k, v)),
        "[a-d]".prop_map(Op::RemoveTag),
    ]
}

fn schema() -> types::TypeRef {
    let todo = types::model("Todo")
        .prop("title", types::string())
        .prop("done", types::optional(types::boolean(), json!(false)))
        .build();
    types::model("App")
        .prop("todos", types::array_of(todo))
        .prop("tags", types::map_of(types::number()))
        .build()
}

fn empty_app(t: &types::TypeRef) -> NodeRef {
    let node = create(t, Some(json!({ "todos": [], "tags": {} }))).unwrap();
    node.unprotect();
    node
}

/// Ops target indices and keys that may not exist; failures are expected
/// and must leave no partial state behind.
fn apply_op(node: &NodeRef, op: &Op) {
    let todos = node.at("todos").unwrap();
    let tags = node.at("tags").unwrap();
    match op {
        Op::Push(title) => {
            let _ = todos.push(json!({ "title": title }));
        }
        Op::SetTitle(i, t) => {
            if let Ok(el) = todos.at(&i.to_string()) {
                let _ = el.set("title", json!(t));
            }
        }
        Op::Toggle(i) => {
            if let Ok(el) = todos.at(&i.to_string()) {
                let done = el.get("done").ok() == Some(json!(true));
                let _ = el.set("done", json!(!done));
            }
        }
        Op::Remove(i) => {
            let _ = todos.remove_index(*i);
        }
        Op::SetTag(k, v) => {
            let _ = tags.set_key(k, json!(v));
        }
        Op::RemoveTag(k) => {
            let _ = tags.remove_key(k);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn patch_replay_converges(ops in proptest::collection::vec(op_strategy(), 1..40)) {
        let t = schema();
        let source = empty_app(&t);
        let recorded: Rc<RefCell<Vec<Patch>>> = Rc::new(RefCell::new(Vec::new()));
        let log = recorded.clone();
        let _d = source.on_patch(move |f, _| log.borrow_mut().push(f.clone()));
        for op in &ops {
            apply_op(&source, op);
        }
        let replica = empty_app(&t);
        replica.apply_patches(&recorded.borrow()).unwrap();
        prop_assert_eq!(replica.snapshot().unwrap(), source.snapshot().unwrap());
    }

    #[test]
    fn snapshots_stay_valid_and_round_trip(ops in proptest::collection::vec(op_strategy(), 1..40)) {
        let t = schema();
        let source = empty_app(&t);
        for op in &ops {
            apply_op(&source, op);
        }
        let snap = source.snapshot().unwrap();
        prop_assert!(t.is(Some(&snap)));
        let copy = create(&t, Some(snap.clone())).unwrap();
        prop_assert_eq!(copy.snapshot().unwrap(), snap);
    }

    #[test]
    fn inverse_patches_restore_the_initial_state(ops in proptest::collection::vec(op_strategy(), 1..25)) {
        let t = schema();
        let source = empty_app(&t);
        let initial = source.snapshot().unwrap();
        let inverses: Rc<RefCell<Vec<Patch>>> = Rc::new(RefCell::new(Vec::new()));
        let log = inverses.clone();
        let _d = source.on_patch(move |_, i| log.borrow_mut().push(i.clone()));
        for op in &ops {
            apply_op(&source, op);
        }
        let mut undo = inverses.borrow().clone();
        undo.reverse();
        source.apply_patches(&undo).unwrap();
        prop_assert_eq!(source.snapshot().unwrap(), initial);
    }
}
