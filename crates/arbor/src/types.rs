//! Type descriptors: the declarative schema grammar.
//!
//! A descriptor is built once at schema-declaration time, shared via
//! [`TypeRef`] by every instance, and never mutated. Composite descriptors
//! hold their children in declaration order; validation walks the same
//! order and reports one [`ValidationIssue`] per offending slot.

use std::fmt;
use std::rc::Rc;

use arbor_pointer::join_pointer;
use indexmap::IndexMap;
use serde_json::Value;

use crate::error::{render_value, TreeError, ValidationIssue};
use crate::tree::NodeRef;

pub type TypeRef = Rc<TypeDesc>;

/// Body of a declared action: receives the instance it was invoked on and
/// the positional arguments, returns a result value (often `Value::Null`).
pub type ActionFn = Rc<dyn Fn(&NodeRef, &[Value]) -> Result<Value, TreeError>>;

/// Body of a declared view: a derived, read-only value. Views must never
/// mutate the tree; the engine enforces this at the mutation site.
pub type ViewFn = Rc<dyn Fn(&NodeRef) -> Result<Value, TreeError>>;

/// Default for an optional property. Generator defaults are invoked per
/// creation so instances never share a mutable default.
#[derive(Clone)]
pub enum DefaultValue {
    Value(Value),
    Generator(Rc<dyn Fn() -> Value>),
}

impl DefaultValue {
    pub fn produce(&self) -> Value {
        match self {
            DefaultValue::Value(v) => v.clone(),
            DefaultValue::Generator(f) => f(),
        }
    }
}

pub struct ModelType {
    pub name: String,
    pub props: IndexMap<String, TypeRef>,
    pub actions: IndexMap<String, ActionFn>,
    pub views: IndexMap<String, ViewFn>,
}

/// The closed sum of descriptor variants. The variant set is fixed, so the
/// engine switches on the tag and the compiler checks exhaustiveness.
pub enum TypeDesc {
    String,
    Number,
    Boolean,
    /// Snapshot form: milliseconds since the Unix epoch.
    Date,
    /// Accepts any JSON value; stored immutably and shared by clone.
    Frozen,
    /// Matches one exact primitive value by strict equality.
    Literal(Value),
    Optional {
        inner: TypeRef,
        default: DefaultValue,
    },
    Maybe {
        inner: TypeRef,
    },
    /// Tree-unique key of a model; `numeric` selects number identifiers.
    Identifier {
        numeric: bool,
    },
    Model(ModelType),
    Array {
        item: TypeRef,
    },
    Map {
        value: TypeRef,
    },
    /// Ordered candidates, first `is` match wins.
    Union {
        options: Vec<TypeRef>,
    },
}

impl fmt::Debug for TypeDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeDesc({})", self.name())
    }
}

impl TypeDesc {
    /// Human-readable name, used in every error message.
    pub fn name(&self) -> String {
        match self {
            TypeDesc::String => "string".to_string(),
            TypeDesc::Number => "number".to_string(),
            TypeDesc::Boolean => "boolean".to_string(),
            TypeDesc::Date => "Date".to_string(),
            TypeDesc::Frozen => "frozen".to_string(),
            TypeDesc::Literal(v) => format!("literal({v})"),
            TypeDesc::Optional { inner, .. } => format!("{}?", inner.name()),
            TypeDesc::Maybe { inner } => format!("({} | null)", inner.name()),
            TypeDesc::Identifier { numeric: false } => "identifier".to_string(),
            TypeDesc::Identifier { numeric: true } => "identifierNumber".to_string(),
            TypeDesc::Model(m) => m.name.clone(),
            TypeDesc::Array { item } => format!("{}[]", item.name()),
            TypeDesc::Map { value } => format!("Map<string, {}>", value.name()),
            TypeDesc::Union { options } => {
                let names: Vec<String> = options.iter().map(|o| o.name()).collect();
                format!("({})", names.join(" | "))
            }
        }
    }

    /// Non-throwing structural check. `None` stands for an absent slot.
    pub fn is(&self, value: Option<&Value>) -> bool {
        self.validate(value, "").is_empty()
    }

    /// Validates a candidate; an empty issue list means the value conforms.
    pub fn validate(&self, value: Option<&Value>, path: &str) -> Vec<ValidationIssue> {
        let mut out = Vec::new();
        self.validate_into(value, path, &mut out);
        out
    }

    fn mismatch(&self, value: Option<&Value>, path: &str) -> ValidationIssue {
        ValidationIssue {
            path: path.to_string(),
            type_name: self.name(),
            value: render_value(value),
            message: format!(
                "value `{}` is not assignable to `{}`",
                render_value(value),
                self.name()
            ),
        }
    }

    fn validate_into(&self, value: Option<&Value>, path: &str, out: &mut Vec<ValidationIssue>) {
        match self {
            TypeDesc::String => {
                if !matches!(value, Some(Value::String(_))) {
                    out.push(self.mismatch(value, path));
                }
            }
            TypeDesc::Number | TypeDesc::Date => {
                if !matches!(value, Some(Value::Number(_))) {
                    out.push(self.mismatch(value, path));
                }
            }
            TypeDesc::Boolean => {
                if !matches!(value, Some(Value::Bool(_))) {
                    out.push(self.mismatch(value, path));
                }
            }
            TypeDesc::Frozen => {
                if value.is_none() {
                    out.push(self.mismatch(value, path));
                }
            }
            TypeDesc::Literal(expected) => {
                if value != Some(expected) {
                    out.push(self.mismatch(value, path));
                }
            }
            TypeDesc::Optional { inner, .. } => {
                if let Some(v) = value {
                    inner.validate_into(Some(v), path, out);
                }
            }
            TypeDesc::Maybe { inner } => match value {
                None | Some(Value::Null) => {}
                Some(v) => inner.validate_into(Some(v), path, out),
            },
            TypeDesc::Identifier { numeric } => {
                let ok = match value {
                    Some(Value::String(_)) => !numeric,
                    Some(Value::Number(_)) => *numeric,
                    _ => false,
                };
                if !ok {
                    out.push(self.mismatch(value, path));
                }
            }
            TypeDesc::Model(m) => match value {
                Some(Value::Object(obj)) => {
                    for (key, prop) in &m.props {
                        prop.validate_into(obj.get(key), &join_pointer(path, key), out);
                    }
                    for key in obj.keys() {
                        if !m.props.contains_key(key) {
                            out.push(ValidationIssue {
                                path: join_pointer(path, key),
                                type_name: self.name(),
                                value: render_value(obj.get(key)),
                                message: format!("unknown property `{key}` on `{}`", m.name),
                            });
                        }
                    }
                }
                _ => out.push(self.mismatch(value, path)),
            },
            TypeDesc::Array { item } => match value {
                Some(Value::Array(items)) => {
                    for (index, el) in items.iter().enumerate() {
                        item.validate_into(Some(el), &join_pointer(path, &index.to_string()), out);
                    }
                }
                _ => out.push(self.mismatch(value, path)),
            },
            TypeDesc::Map { value: item } => match value {
                Some(Value::Object(obj)) => {
                    for (key, el) in obj {
                        item.validate_into(Some(el), &join_pointer(path, key), out);
                    }
                }
                _ => out.push(self.mismatch(value, path)),
            },
            TypeDesc::Union { options } => {
                if !options.iter().any(|o| o.is(value)) {
                    out.push(ValidationIssue {
                        path: path.to_string(),
                        type_name: self.name(),
                        value: render_value(value),
                        message: format!(
                            "value `{}` matches none of {}",
                            render_value(value),
                            self.name()
                        ),
                    });
                }
            }
        }
    }

    /// The snapshot this descriptor produces for an absent slot, if any.
    /// A model is defaultable only when every one of its props is.
    pub fn default_snapshot(&self) -> Option<Value> {
        match self {
            TypeDesc::Optional { default, .. } => Some(default.produce()),
            TypeDesc::Maybe { .. } => Some(Value::Null),
            TypeDesc::Model(m) => {
                let mut obj = serde_json::Map::with_capacity(m.props.len());
                for (key, prop) in &m.props {
                    obj.insert(key.clone(), prop.default_snapshot()?);
                }
                Some(Value::Object(obj))
            }
            _ => None,
        }
    }
}

/// `true` when the property (possibly wrapped in optional/maybe) is the
/// model's identifier.
pub(crate) fn is_identifier_prop(t: &TypeRef) -> bool {
    match &**t {
        TypeDesc::Identifier { .. } => true,
        TypeDesc::Optional { inner, .. } | TypeDesc::Maybe { inner } => is_identifier_prop(inner),
        _ => false,
    }
}

/// Extracts the declared identifier value out of a model snapshot.
pub(crate) fn identifier_of(t: &TypeRef, snapshot: &Value) -> Option<Value> {
    if let (TypeDesc::Model(m), Value::Object(obj)) = (&**t, snapshot) {
        for (key, prop) in &m.props {
            if is_identifier_prop(prop) {
                return obj.get(key).cloned();
            }
        }
    }
    None
}

pub fn string() -> TypeRef {
    Rc::new(TypeDesc::String)
}

pub fn number() -> TypeRef {
    Rc::new(TypeDesc::Number)
}

pub fn boolean() -> TypeRef {
    Rc::new(TypeDesc::Boolean)
}

pub fn date() -> TypeRef {
    Rc::new(TypeDesc::Date)
}

pub fn frozen() -> TypeRef {
    Rc::new(TypeDesc::Frozen)
}

pub fn literal(value: Value) -> TypeRef {
    Rc::new(TypeDesc::Literal(value))
}

pub fn optional(inner: TypeRef, default: Value) -> TypeRef {
    Rc::new(TypeDesc::Optional {
        inner,
        default: DefaultValue::Value(default),
    })
}

/// Optional with a generator default, invoked per creation.
pub fn optional_with(inner: TypeRef, default: impl Fn() -> Value + 'static) -> TypeRef {
    Rc::new(TypeDesc::Optional {
        inner,
        default: DefaultValue::Generator(Rc::new(default)),
    })
}

pub fn maybe(inner: TypeRef) -> TypeRef {
    Rc::new(TypeDesc::Maybe { inner })
}

pub fn identifier() -> TypeRef {
    Rc::new(TypeDesc::Identifier { numeric: false })
}

pub fn identifier_number() -> TypeRef {
    Rc::new(TypeDesc::Identifier { numeric: true })
}

pub fn array_of(item: TypeRef) -> TypeRef {
    Rc::new(TypeDesc::Array { item })
}

pub fn map_of(value: TypeRef) -> TypeRef {
    Rc::new(TypeDesc::Map { value })
}

pub fn union(options: Vec<TypeRef>) -> TypeRef {
    Rc::new(TypeDesc::Union { options })
}

pub fn model(name: &str) -> ModelBuilder {
    ModelBuilder {
        name: name.to_string(),
        props: IndexMap::new(),
        actions: IndexMap::new(),
        views: IndexMap::new(),
    }
}

/// Merges model descriptors into one; later arguments override earlier
/// ones for same-named properties, actions, and views.
pub fn compose(name: &str, parts: &[TypeRef]) -> Result<TypeRef, TreeError> {
    let mut props = IndexMap::new();
    let mut actions = IndexMap::new();
    let mut views = IndexMap::new();
    for part in parts {
        match &**part {
            TypeDesc::Model(m) => {
                for (k, v) in &m.props {
                    props.insert(k.clone(), v.clone());
                }
                for (k, v) in &m.actions {
                    actions.insert(k.clone(), v.clone());
                }
                for (k, v) in &m.views {
                    views.insert(k.clone(), v.clone());
                }
            }
            other => {
                return Err(TreeError::NotComposable {
                    type_name: other.name(),
                })
            }
        }
    }
    Ok(Rc::new(TypeDesc::Model(ModelType {
        name: name.to_string(),
        props,
        actions,
        views,
    })))
}

pub struct ModelBuilder {
    name: String,
    props: IndexMap<String, TypeRef>,
    actions: IndexMap<String, ActionFn>,
    views: IndexMap<String, ViewFn>,
}

impl ModelBuilder {
    pub fn prop(mut self, name: &str, t: TypeRef) -> Self {
        self.props.insert(name.to_string(), t);
        self
    }

    pub fn action(
        mut self,
        name: &str,
        f: impl Fn(&NodeRef, &[Value]) -> Result<Value, TreeError> + 'static,
    ) -> Self {
        self.actions.insert(name.to_string(), Rc::new(f));
        self
    }

    pub fn view(
        mut self,
        name: &str,
        f: impl Fn(&NodeRef) -> Result<Value, TreeError> + 'static,
    ) -> Self {
        self.views.insert(name.to_string(), Rc::new(f));
        self
    }

    pub fn build(self) -> TypeRef {
        Rc::new(TypeDesc::Model(ModelType {
            name: self.name,
            props: self.props,
            actions: self.actions,
            views: self.views,
        }))
    }
}
