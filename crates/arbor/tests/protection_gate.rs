use arbor::{create, types, TreeError};
use serde_json::{json, Value};

fn counter() -> types::TypeRef {
    types::model("Counter")
        .prop("count", types::optional(types::number(), json!(0)))
        .action("increment", |node, _args| {
            let n = node.get("count")?.as_i64().unwrap_or(0);
            node.set("count", json!(n + 1))?;
            Ok(Value::Null)
        })
        .action("increment_twice", |node, _args| {
            node.call("increment", &[])?;
            node.call("increment", &[])?;
            Ok(Value::Null)
        })
        .action("fails_after_bump", |node, _args| {
            node.set("count", json!(99))?;
            Err(TreeError::InvalidPatch {
                message: "boom".to_string(),
            })
        })
        .view("doubled", |node| {
            Ok(json!(node.get("count")?.as_i64().unwrap_or(0) * 2))
        })
        .view("sneaky", |node| {
            node.set("count", json!(1000))?;
            Ok(Value::Null)
        })
        .build()
}

#[test]
fn direct_writes_fail_while_protected() {
    let node = create(&counter(), None).unwrap();
    let err = node.set("count", json!(5)).unwrap_err();
    assert!(matches!(err, TreeError::Protected { .. }));
    assert_eq!(node.snapshot().unwrap(), json!({ "count": 0 }));
}

#[test]
fn actions_unlock_the_gate() {
    let node = create(&counter(), None).unwrap();
    node.call("increment", &[]).unwrap();
    assert_eq!(node.get("count").unwrap(), json!(1));
}

#[test]
fn unprotect_allows_direct_writes() {
    let node = create(&counter(), None).unwrap();
    node.unprotect();
    assert!(!node.is_protected());
    node.set("count", json!(7)).unwrap();
    assert_eq!(node.get("count").unwrap(), json!(7));
    node.protect();
    assert!(node.set("count", json!(8)).is_err());
}

#[test]
fn nested_action_calls_stay_unlocked() {
    let node = create(&counter(), None).unwrap();
    node.call("increment_twice", &[]).unwrap();
    assert_eq!(node.get("count").unwrap(), json!(2));
}

#[test]
fn error_exit_restores_the_gate() {
    let node = create(&counter(), None).unwrap();
    assert!(node.call("fails_after_bump", &[]).is_err());
    // Mutations made before the failure stay applied.
    assert_eq!(node.get("count").unwrap(), json!(99));
    let err = node.set("count", json!(0)).unwrap_err();
    assert!(matches!(err, TreeError::Protected { .. }));
}

#[test]
fn views_may_never_write() {
    let node = create(&counter(), None).unwrap();
    let err = node.view("sneaky").unwrap_err();
    assert!(matches!(err, TreeError::Protected { .. }));
    assert_eq!(node.get("count").unwrap(), json!(0));
}

#[test]
fn views_read_current_state() {
    let node = create(&counter(), None).unwrap();
    assert_eq!(node.view("doubled").unwrap(), json!(0));
    node.call("increment", &[]).unwrap();
    assert_eq!(node.view("doubled").unwrap(), json!(2));
}

#[test]
fn unknown_actions_and_views_are_reported() {
    let node = create(&counter(), None).unwrap();
    assert!(matches!(
        node.call("nope", &[]).unwrap_err(),
        TreeError::UnknownAction { .. }
    ));
    assert!(matches!(
        node.view("nope").unwrap_err(),
        TreeError::UnknownView { .. }
    ));
}

#[test]
fn collection_mutators_respect_the_gate() {
    let t = types::model("List")
        .prop("items", types::array_of(types::number()))
        .build();
    let node = create(&t, Some(json!({ "items": [1] }))).unwrap();
    let items = node.at("items").unwrap();
    assert!(matches!(
        items.push(json!(2)).unwrap_err(),
        TreeError::Protected { .. }
    ));
    assert_eq!(node.get("items").unwrap(), json!([1]));
    node.unprotect();
    items.push(json!(2)).unwrap();
    assert_eq!(node.get("items").unwrap(), json!([1, 2]));
}
