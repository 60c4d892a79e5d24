use arbor::{create, types, NodeRef, TreeError};
use serde_json::{json, Value};

fn bag() -> types::TypeRef {
    let item = types::model("Item").prop("name", types::string()).build();
    types::model("Bag")
        .prop("main", item.clone())
        .prop("spare", types::maybe(item.clone()))
        .prop("items", types::array_of(item))
        .build()
}

fn full_bag() -> NodeRef {
    let node = create(
        &bag(),
        Some(json!({
            "main": { "name": "m" },
            "spare": { "name": "s" },
            "items": [{ "name": "a" }, { "name": "b" }]
        })),
    )
    .unwrap();
    node.unprotect();
    node
}

#[test]
fn destroyed_nodes_report_their_last_path() {
    let node = full_bag();
    let first = node.at("items").unwrap().at("0").unwrap();
    first.destroy().unwrap();
    assert!(!first.is_alive());
    match first.snapshot().unwrap_err() {
        TreeError::DeadNode { path, type_name } => {
            assert_eq!(path, "/items/0");
            assert_eq!(type_name, "Item");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(matches!(
        first.set("name", json!("x")).unwrap_err(),
        TreeError::DeadNode { .. }
    ));
    // Siblings shift down and stay alive.
    assert_eq!(node.get("items").unwrap(), json!([{ "name": "b" }]));
    assert_eq!(
        node.at("items").unwrap().at("0").unwrap().get("name").unwrap(),
        json!("b")
    );
}

#[test]
fn required_child_cannot_be_detached() {
    let node = full_bag();
    let main = node.at("main").unwrap();
    let err = main.detach().unwrap_err();
    assert_eq!(err.to_string(), "Error while converting `undefined` to `Item`");
    assert!(main.is_alive());
    assert_eq!(node.get("main").unwrap(), json!({ "name": "m" }));
}

#[test]
fn required_child_cannot_be_destroyed() {
    let node = full_bag();
    let main = node.at("main").unwrap();
    let err = main.destroy().unwrap_err();
    assert!(matches!(err, TreeError::Conversion { .. }));
    assert!(main.is_alive());
    assert_eq!(node.get("main").unwrap(), json!({ "name": "m" }));
}

#[test]
fn optional_child_detaches_to_a_new_root() {
    let node = full_bag();
    let spare = node.at("spare").unwrap();
    spare.detach().unwrap();
    assert!(spare.is_alive());
    assert_eq!(spare.path(), "");
    assert!(spare.parent().is_none());
    assert_eq!(node.get("spare").unwrap(), Value::Null);
    assert_eq!(spare.snapshot().unwrap(), json!({ "name": "s" }));
    // A detached node is a root; detaching again refuses.
    assert!(matches!(spare.detach().unwrap_err(), TreeError::AlreadyRoot));
}

#[test]
fn instance_assignment_replaces_and_kills_the_old_child() {
    let node = full_bag();
    let old_main = node.at("main").unwrap();
    let spare = node.at("spare").unwrap();
    node.set_node("main", &spare).unwrap();
    assert!(!old_main.is_alive());
    // The source instance is copied, not moved.
    assert!(spare.is_alive());
    assert_eq!(spare.path(), "/spare");
    assert_eq!(node.get("main").unwrap(), json!({ "name": "s" }));
}

#[test]
fn snapshot_assignment_reuses_existing_children() {
    let node = full_bag();
    let main = node.at("main").unwrap();
    node.apply_snapshot(&json!({
        "main": { "name": "renamed" },
        "spare": { "name": "s" },
        "items": [{ "name": "a" }, { "name": "b" }]
    }))
    .unwrap();
    assert!(main.is_alive());
    assert_eq!(main.get("name").unwrap(), json!("renamed"));
}

#[test]
fn apply_snapshot_rejects_invalid_input_up_front() {
    let node = full_bag();
    let before = node.snapshot().unwrap();
    let err = node
        .apply_snapshot(&json!({ "main": { "name": 5 }, "spare": null, "items": [] }))
        .unwrap_err();
    assert!(matches!(err, TreeError::Validation(_)));
    assert_eq!(node.snapshot().unwrap(), before);
}

#[test]
fn destroying_the_root_kills_the_whole_tree() {
    let node = full_bag();
    let main = node.at("main").unwrap();
    node.destroy().unwrap();
    assert!(!node.is_alive());
    assert!(!main.is_alive());
}

#[test]
fn truncating_reconciliation_kills_dropped_elements() {
    let node = full_bag();
    let second = node.at("items").unwrap().at("1").unwrap();
    node.apply_snapshot(&json!({
        "main": { "name": "m" },
        "spare": { "name": "s" },
        "items": [{ "name": "a" }]
    }))
    .unwrap();
    assert!(!second.is_alive());
    assert_eq!(node.get("items").unwrap(), json!([{ "name": "a" }]));
}
