#![forbid(unsafe_code)]

//! Error types for graph operations.
//!
//! [`StateError`] is what every fallible operation returns. Registry and
//! schema failures convert into it with `?`.

use thiserror::Error;

use crate::change::ChangeKind;
use crate::registry::NodeId;
use crate::schema::SchemaIssue;
use crate::value::ContainerKind;

pub type Result<T> = std::result::Result<T, StateError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("container is already registered as node {0}")]
    AlreadyRegistered(NodeId),

    #[error("unknown node {0}")]
    UnknownNode(NodeId),
}

/// A schema rejected a candidate value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("validation failed: {issue}")]
pub struct ValidationError {
    pub node: Option<NodeId>,
    pub issue: SchemaIssue,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("value is not a linkable container")]
    NotLinkable,

    #[error("{operation} is not supported on a {found}")]
    KindMismatch {
        operation: ChangeKind,
        found: ContainerKind,
    },

    #[error("position {position} is out of bounds for length {length}")]
    OutOfBounds { position: usize, length: usize },

    #[error("invalid key for this container: {key}")]
    InvalidKey { key: String },

    #[error("node {0} has been destroyed")]
    UnknownNode(NodeId),
}

impl StateError {
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    pub(crate) fn invalid_key(key: impl std::fmt::Display) -> Self {
        Self::InvalidKey {
            key: key.to_string(),
        }
    }
}
