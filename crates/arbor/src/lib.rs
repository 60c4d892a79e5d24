//! Typed, observable state trees.
//!
//! Declare a schema out of composable type descriptors, instantiate it
//! into a live tree of validated nodes, and mutate it through actions.
//! Every node knows its type, its path, and whether it is still alive;
//! every mutation is validated, emits forward and inverse patches, and
//! coalesces into one snapshot emission per top-level operation. Patch
//! and action streams can be serialized and replayed into another tree.
//!
//! ```
//! use arbor::{create, types};
//! use serde_json::{json, Value};
//!
//! let todo = types::model("Todo")
//!     .prop("title", types::string())
//!     .prop("done", types::optional(types::boolean(), json!(false)))
//!     .action("toggle", |node, _args| {
//!         let done = node.get("done")? == json!(true);
//!         node.set("done", json!(!done))?;
//!         Ok(Value::Null)
//!     })
//!     .build();
//!
//! let node = create(&todo, Some(json!({ "title": "write docs" }))).unwrap();
//! assert_eq!(node.get("done").unwrap(), json!(false));
//! node.call("toggle", &[]).unwrap();
//! assert_eq!(node.get("done").unwrap(), json!(true));
//! ```

pub mod error;
pub mod types;

mod apply;
mod events;
mod node;
mod tree;

pub use error::{TreeError, ValidationIssue};
pub use events::{ActionCall, Disposer, Patch, PatchOp};
pub use tree::{create, create_with_env, NodeRef};
