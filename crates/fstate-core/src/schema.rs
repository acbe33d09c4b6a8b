#![forbid(unsafe_code)]

//! Schema validation for wrapped containers.
//!
//! A schema sees the whole prospective container: at wrap time the initial
//! value, and before every mutation a shallow copy with the mutation
//! already applied. Strict nodes refuse the mutation on failure; other
//! nodes report a diagnostic and proceed.

use std::fmt;
use std::rc::Rc;

use crate::value::{ContainerKind, Key, Value};

/// One reason a candidate value failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaIssue {
    /// Dotted field path, empty for the container itself.
    pub path: String,
    pub message: String,
}

impl SchemaIssue {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            path: String::new(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn at(mut self, key: &Key) -> Self {
        self.path = if self.path.is_empty() {
            key.to_string()
        } else {
            format!("{key}.{}", self.path)
        };
        self
    }
}

impl fmt::Display for SchemaIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.path.is_empty() {
            write!(f, "{}: ", self.path)?;
        }
        f.write_str(&self.message)
    }
}

impl std::error::Error for SchemaIssue {}

/// A validator over the prospective state of a container.
pub trait Schema {
    fn validate(&self, candidate: &Value) -> Result<(), SchemaIssue>;
}

impl<F> Schema for F
where
    F: Fn(&Value) -> Result<(), String>,
{
    fn validate(&self, candidate: &Value) -> Result<(), SchemaIssue> {
        self(candidate).map_err(SchemaIssue::new)
    }
}

/// Leaf or container type expected at a record field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Any,
    Null,
    Bool,
    Int,
    /// Integer or float.
    Number,
    Str,
    Container(ContainerKind),
}

impl ValueType {
    #[must_use]
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::Any => true,
            Self::Null => value.is_null(),
            Self::Bool => matches!(value, Value::Bool(_)),
            Self::Int => matches!(value, Value::Int(_)),
            Self::Number => matches!(value, Value::Int(_) | Value::Float(_)),
            Self::Str => matches!(value, Value::Str(_)),
            Self::Container(kind) => value.kind() == Some(kind),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("any"),
            Self::Null => f.write_str("null"),
            Self::Bool => f.write_str("bool"),
            Self::Int => f.write_str("int"),
            Self::Number => f.write_str("number"),
            Self::Str => f.write_str("string"),
            Self::Container(kind) => write!(f, "{kind}"),
        }
    }
}

type Check = Rc<dyn Fn(&Value) -> Result<(), String>>;

struct Field {
    key: Key,
    ty: ValueType,
    required: bool,
    check: Option<Check>,
}

/// Declarative record validator.
///
/// ```
/// use fstate_core::{RecordSchema, Schema, Value, ValueType};
///
/// let schema = RecordSchema::new()
///     .field("name", ValueType::Str)
///     .optional("age", ValueType::Int)
///     .deny_unknown();
/// assert!(schema.validate(&Value::record([("name", "ada")])).is_ok());
/// assert!(schema.validate(&Value::record([("name", 3)])).is_err());
/// ```
#[derive(Default)]
pub struct RecordSchema {
    fields: Vec<Field>,
    deny_unknown: bool,
}

impl RecordSchema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn field(mut self, key: impl Into<Key>, ty: ValueType) -> Self {
        self.fields.push(Field {
            key: key.into().to_field(),
            ty,
            required: true,
            check: None,
        });
        self
    }

    #[must_use]
    pub fn optional(mut self, key: impl Into<Key>, ty: ValueType) -> Self {
        self.fields.push(Field {
            key: key.into().to_field(),
            ty,
            required: false,
            check: None,
        });
        self
    }

    /// Attach an extra predicate to the most recently declared field.
    #[must_use]
    pub fn check(mut self, f: impl Fn(&Value) -> Result<(), String> + 'static) -> Self {
        if let Some(field) = self.fields.last_mut() {
            field.check = Some(Rc::new(f));
        }
        self
    }

    /// Reject fields that were not declared.
    #[must_use]
    pub fn deny_unknown(mut self) -> Self {
        self.deny_unknown = true;
        self
    }
}

impl Schema for RecordSchema {
    fn validate(&self, candidate: &Value) -> Result<(), SchemaIssue> {
        let Some(record) = candidate
            .as_container()
            .filter(|c| c.kind() == ContainerKind::Record)
        else {
            return Err(SchemaIssue::new("expected a record"));
        };
        for field in &self.fields {
            match record.get(&field.key) {
                None if field.required => {
                    return Err(SchemaIssue::new("missing required field").at(&field.key));
                }
                None => {}
                Some(value) => {
                    if !field.ty.matches(&value) {
                        return Err(
                            SchemaIssue::new(format!("expected {}", field.ty)).at(&field.key)
                        );
                    }
                    if let Some(check) = &field.check {
                        check(&value).map_err(|m| SchemaIssue::new(m).at(&field.key))?;
                    }
                }
            }
        }
        if self.deny_unknown {
            if let Some(extra) = record
                .keys()
                .into_iter()
                .find(|k| !self.fields.iter().any(|f| &f.key == k))
            {
                return Err(SchemaIssue::new("unknown field").at(&extra));
            }
        }
        Ok(())
    }
}
