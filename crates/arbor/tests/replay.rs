use std::cell::RefCell;
use std::rc::Rc;

use arbor::{create, types, ActionCall, Patch, PatchOp, TreeError};
use serde_json::{json, Value};

fn app() -> types::TypeRef {
    let todo = types::model("Todo")
        .prop("title", types::string())
        .prop("done", types::optional(types::boolean(), json!(false)))
        .action("toggle", |node, _args| {
            let done = node.get("done")? == json!(true);
            node.set("done", json!(!done))?;
            Ok(Value::Null)
        })
        .build();
    types::model("App")
        .prop("todos", types::array_of(todo))
        .action("add_todo", |node, args| {
            let title = args.first().cloned().unwrap_or(Value::Null);
            node.at("todos")?.push(json!({ "title": title }))?;
            Ok(Value::Null)
        })
        .action("remove_todo", |node, args| {
            let index = args.first().and_then(Value::as_u64).unwrap_or(0) as usize;
            node.at("todos")?.remove_index(index)?;
            Ok(Value::Null)
        })
        .build()
}

#[test]
fn recorded_patches_replay_into_an_equivalent_tree() {
    let t = app();
    let source = create(&t, Some(json!({ "todos": [] }))).unwrap();
    let recorded: Rc<RefCell<Vec<Patch>>> = Rc::new(RefCell::new(Vec::new()));
    let log = recorded.clone();
    let _d = source.on_patch(move |f, _| log.borrow_mut().push(f.clone()));

    source.call("add_todo", &[json!("a")]).unwrap();
    source.call("add_todo", &[json!("b")]).unwrap();
    source.unprotect();
    source
        .at("todos")
        .unwrap()
        .at("1")
        .unwrap()
        .set("done", json!(true))
        .unwrap();
    source.at("todos").unwrap().remove_index(0).unwrap();

    let replica = create(&t, Some(json!({ "todos": [] }))).unwrap();
    replica.apply_patches(&recorded.borrow()).unwrap();
    assert_eq!(replica.snapshot().unwrap(), source.snapshot().unwrap());
    assert_eq!(
        replica.snapshot().unwrap(),
        json!({ "todos": [{ "title": "b", "done": true }] })
    );
}

#[test]
fn inverse_patches_undo_in_reverse_order() {
    let t = app();
    let node = create(&t, Some(json!({ "todos": [{ "title": "a" }] }))).unwrap();
    let initial = node.snapshot().unwrap();
    let inverses: Rc<RefCell<Vec<Patch>>> = Rc::new(RefCell::new(Vec::new()));
    let log = inverses.clone();
    let _d = node.on_patch(move |_, i| log.borrow_mut().push(i.clone()));

    node.call("add_todo", &[json!("b")]).unwrap();
    node.unprotect();
    node.at("todos")
        .unwrap()
        .at("0")
        .unwrap()
        .set("title", json!("a2"))
        .unwrap();

    let mut undo = inverses.borrow().clone();
    undo.reverse();
    node.apply_patches(&undo).unwrap();
    assert_eq!(node.snapshot().unwrap(), initial);
}

#[test]
fn recorded_actions_replay_into_an_equivalent_tree() {
    let t = app();
    let source = create(&t, Some(json!({ "todos": [] }))).unwrap();
    let recorded: Rc<RefCell<Vec<ActionCall>>> = Rc::new(RefCell::new(Vec::new()));
    let log = recorded.clone();
    let _d = source.on_action(move |call| log.borrow_mut().push(call.clone()));

    source.call("add_todo", &[json!("a")]).unwrap();
    source.call("add_todo", &[json!("b")]).unwrap();
    source
        .at("todos")
        .unwrap()
        .at("0")
        .unwrap()
        .call("toggle", &[])
        .unwrap();
    source.call("remove_todo", &[json!(1)]).unwrap();

    let replica = create(&t, Some(json!({ "todos": [] }))).unwrap();
    replica.apply_actions(&recorded.borrow()).unwrap();
    assert_eq!(replica.snapshot().unwrap(), source.snapshot().unwrap());
    assert_eq!(
        replica.snapshot().unwrap(),
        json!({ "todos": [{ "title": "a", "done": true }] })
    );
}

#[test]
fn patch_application_validates_before_mutating() {
    let t = app();
    let node = create(&t, Some(json!({ "todos": [{ "title": "a" }] }))).unwrap();
    let before = node.snapshot().unwrap();
    let err = node
        .apply_patch(&Patch {
            op: PatchOp::Replace,
            path: "/todos/0/title".to_string(),
            value: Some(json!(42)),
        })
        .unwrap_err();
    assert!(matches!(err, TreeError::Validation(_)));
    assert_eq!(node.snapshot().unwrap(), before);
}

#[test]
fn patch_sequences_abort_on_first_failure() {
    let t = app();
    let node = create(&t, Some(json!({ "todos": [] }))).unwrap();
    let patches = vec![
        Patch {
            op: PatchOp::Add,
            path: "/todos/0".to_string(),
            value: Some(json!({ "title": "ok" })),
        },
        Patch {
            op: PatchOp::Add,
            path: "/todos/1".to_string(),
            value: Some(json!({ "title": 7 })),
        },
        Patch {
            op: PatchOp::Add,
            path: "/todos/2".to_string(),
            value: Some(json!({ "title": "never" })),
        },
    ];
    assert!(node.apply_patches(&patches).is_err());
    // The patch before the failure stays applied, the rest never ran.
    assert_eq!(
        node.snapshot().unwrap(),
        json!({ "todos": [{ "title": "ok", "done": false }] })
    );
}

#[test]
fn dash_index_appends_to_arrays() {
    let t = app();
    let node = create(&t, Some(json!({ "todos": [{ "title": "a" }] }))).unwrap();
    node.apply_patch(&Patch {
        op: PatchOp::Add,
        path: "/todos/-".to_string(),
        value: Some(json!({ "title": "z" })),
    })
    .unwrap();
    assert_eq!(
        node.get("todos").unwrap(),
        json!([
            { "title": "a", "done": false },
            { "title": "z", "done": false }
        ])
    );
}

#[test]
fn root_replace_is_an_apply_snapshot() {
    let t = app();
    let node = create(&t, Some(json!({ "todos": [] }))).unwrap();
    node.apply_patch(&Patch {
        op: PatchOp::Replace,
        path: String::new(),
        value: Some(json!({ "todos": [{ "title": "r" }] })),
    })
    .unwrap();
    assert_eq!(
        node.snapshot().unwrap(),
        json!({ "todos": [{ "title": "r", "done": false }] })
    );
    let err = node
        .apply_patch(&Patch {
            op: PatchOp::Remove,
            path: String::new(),
            value: None,
        })
        .unwrap_err();
    assert!(matches!(err, TreeError::InvalidPatch { .. }));
}

#[test]
fn action_calls_round_trip_through_serde() {
    let call = ActionCall {
        name: "toggle".to_string(),
        path: "/todos/0".to_string(),
        args: vec![],
    };
    let wire = serde_json::to_string(&call).unwrap();
    assert_eq!(
        serde_json::from_str::<ActionCall>(&wire).unwrap(),
        call
    );
    let patch = Patch {
        op: PatchOp::Remove,
        path: "/todos/0".to_string(),
        value: None,
    };
    let wire = serde_json::to_value(&patch).unwrap();
    // Removals serialize without a value field.
    assert_eq!(wire, json!({ "op": "remove", "path": "/todos/0" }));
}
