use arbor::{create, types, TreeError};
use serde_json::json;

#[test]
fn union_picks_first_matching_option() {
    let t = types::model("Cell")
        .prop("value", types::union(vec![types::number(), types::string()]))
        .build();
    let node = create(&t, Some(json!({ "value": "text" }))).unwrap();
    assert_eq!(node.get("value").unwrap(), json!("text"));
    let node = create(&t, Some(json!({ "value": 4 }))).unwrap();
    assert_eq!(node.get("value").unwrap(), json!(4));
}

#[test]
fn union_of_literals_models_a_role_field() {
    let role = types::union(vec![
        types::literal(json!("admin")),
        types::literal(json!("editor")),
        types::literal(json!("viewer")),
        types::literal(json!("guest")),
    ]);
    let t = types::model("User").prop("role", role).build();
    let node = create(&t, Some(json!({ "role": "editor" }))).unwrap();
    assert_eq!(node.get("role").unwrap(), json!("editor"));
    let err = create(&t, Some(json!({ "role": "owner" }))).unwrap_err();
    assert!(matches!(err, TreeError::Conversion { .. }));
}

#[test]
fn union_accepts_composite_options() {
    let point = types::model("Point")
        .prop("x", types::number())
        .prop("y", types::number())
        .build();
    let t = types::model("Holder")
        .prop("shape", types::union(vec![types::string(), point]))
        .build();
    let node = create(&t, Some(json!({ "shape": { "x": 1, "y": 2 } }))).unwrap();
    assert_eq!(node.at("shape").unwrap().type_name(), "Point");
}

#[test]
fn union_name_lists_options() {
    let u = types::union(vec![types::number(), types::string()]);
    assert_eq!(u.name(), "(number | string)");
}

#[test]
fn compose_merges_and_later_parts_override() {
    let base = types::model("Base")
        .prop("id", types::string())
        .prop("size", types::number())
        .view("label", |n| n.get("id"))
        .build();
    let extra = types::model("Extra")
        .prop("size", types::string())
        .prop("color", types::string())
        .build();
    let combined = types::compose("Combined", &[base, extra]).unwrap();
    let node = create(
        &combined,
        Some(json!({ "id": "k1", "size": "large", "color": "red" })),
    )
    .unwrap();
    assert_eq!(node.type_name(), "Combined");
    assert_eq!(node.get("size").unwrap(), json!("large"));
    assert_eq!(node.view("label").unwrap(), json!("k1"));
}

#[test]
fn compose_conflicts_resolve_to_the_last_part() {
    let a = types::model("A")
        .prop("v", types::optional(types::number(), json!(1)))
        .build();
    let b = types::model("B")
        .prop("v", types::optional(types::number(), json!(2)))
        .build();
    let c = types::model("C")
        .prop("v", types::optional(types::number(), json!(3)))
        .build();
    let ab = types::compose("AB", &[a.clone(), b.clone()]).unwrap();
    let abc = types::compose("ABC", &[a, b, c]).unwrap();
    assert_eq!(create(&ab, None).unwrap().get("v").unwrap(), json!(2));
    assert_eq!(create(&abc, None).unwrap().get("v").unwrap(), json!(3));
}

#[test]
fn compose_rejects_non_models() {
    let err = types::compose("Bad", &[types::string()]).unwrap_err();
    assert!(matches!(err, TreeError::NotComposable { .. }));
}
