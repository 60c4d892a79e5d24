//! Error taxonomy for the tree engine.
//!
//! Every error message embeds enough context (type name, path, offending
//! value) to locate the fault without a debugger.

use serde_json::Value;
use thiserror::Error;

/// One validation failure at a specific path.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationIssue {
    /// Pointer path of the offending slot, relative to the validated value.
    pub path: String,
    /// Name of the descriptor that rejected the value.
    pub type_name: String,
    /// Rendered offending value (`undefined` for an absent slot).
    pub value: String,
    pub message: String,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "at `{}`: {}", self.path, self.message)
    }
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Renders a candidate value the way error messages expect (`undefined`
/// for an absent slot, JSON otherwise).
pub fn render_value(value: Option<&Value>) -> String {
    match value {
        None => "undefined".to_string(),
        Some(v) => v.to_string(),
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TreeError {
    /// A candidate value does not conform to a type descriptor.
    #[error("invalid value: {}", format_issues(.0))]
    Validation(Vec<ValidationIssue>),

    /// A slot could not be instantiated from its input. The message form
    /// is fixed; `path` carries the offending slot for programmatic use.
    #[error("Error while converting `{value}` to `{type_name}`")]
    Conversion {
        path: String,
        value: String,
        type_name: String,
    },

    /// Mutation attempted outside an action while the tree is protected,
    /// or from inside a view.
    #[error("cannot modify `{path}`: the tree is protected and no action is running")]
    Protected { path: String },

    /// Access to a node that has been destroyed or superseded.
    #[error("`{type_name}` at `{path}` has died and can no longer be used")]
    DeadNode { type_name: String, path: String },

    #[error("path `{path}` could not be resolved")]
    PathNotFound { path: String },

    #[error("`{pointer}` is not a valid json pointer")]
    InvalidPointer { pointer: String },

    #[error("invalid patch: {message}")]
    InvalidPatch { message: String },

    #[error("index {index} is out of range (length {length})")]
    IndexOutOfRange { index: usize, length: usize },

    #[error("no action `{name}` on `{type_name}`")]
    UnknownAction { name: String, type_name: String },

    #[error("no view `{name}` on `{type_name}`")]
    UnknownView { name: String, type_name: String },

    #[error("no property `{name}` on `{type_name}`")]
    UnknownProperty { name: String, type_name: String },

    #[error("duplicate identifier {id} for `{type_name}`")]
    DuplicateIdentifier { id: String, type_name: String },

    #[error("identifier of `{type_name}` at `{path}` cannot change once assigned")]
    IdentifierImmutable { type_name: String, path: String },

    #[error("cannot create a tree from non-composite type `{type_name}`")]
    InvalidRoot { type_name: String },

    #[error("compose expects model types, got `{type_name}`")]
    NotComposable { type_name: String },

    #[error("node is already a root")]
    AlreadyRoot,

    #[error("operation requires a {expected} node")]
    WrongKind { expected: &'static str },
}

impl TreeError {
    pub(crate) fn conversion(path: &str, value: Option<&Value>, type_name: &str) -> Self {
        TreeError::Conversion {
            path: path.to_string(),
            value: render_value(value),
            type_name: type_name.to_string(),
        }
    }
}
