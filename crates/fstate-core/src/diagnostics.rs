#![forbid(unsafe_code)]

//! Diagnostic sink for recoverable conditions.
//!
//! Nothing here is fatal. The triggering call returns a safe default and
//! the condition is handed to the engine's [`Reporter`].

use std::fmt;
use std::rc::Rc;

use crate::change::ChangeKind;
use crate::registry::NodeId;
use crate::value::Key;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// A non-strict node accepted a value its schema rejects.
    Validation { node: Option<NodeId>, message: String },
    /// A write was attempted through a read-only or non-allow-listed view.
    ContractViolation {
        node: NodeId,
        operation: ChangeKind,
        keys: Vec<Key>,
    },
    AlreadyRegistered { node: NodeId },
    UnknownNode { node: NodeId },
}

impl Diagnostic {
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::ContractViolation { .. } => "contract-violation",
            Self::AlreadyRegistered { .. } => "already-registered",
            Self::UnknownNode { .. } => "unknown-node",
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation {
                node: Some(node),
                message,
            } => write!(f, "validation failed on node {node}: {message}"),
            Self::Validation { node: None, message } => write!(f, "validation failed: {message}"),
            Self::ContractViolation {
                node,
                operation,
                keys,
            } => {
                write!(f, "contract violation on node {node}: {operation} not permitted")?;
                if !keys.is_empty() {
                    let keys: Vec<String> = keys.iter().map(ToString::to_string).collect();
                    write!(f, " for [{}]", keys.join(", "))?;
                }
                Ok(())
            }
            Self::AlreadyRegistered { node } => write!(f, "container already registered as {node}"),
            Self::UnknownNode { node } => write!(f, "unknown node {node}"),
        }
    }
}

/// Pluggable diagnostic sink.
pub type Reporter = Rc<dyn Fn(&Diagnostic)>;

/// The default reporter: one `warn` event per diagnostic.
#[must_use]
pub fn tracing_reporter() -> Reporter {
    Rc::new(|diag: &Diagnostic| {
        tracing::warn!(kind = diag.label(), "{diag}");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_contract_violation() {
        let d = Diagnostic::ContractViolation {
            node: NodeId::new(3),
            operation: ChangeKind::Set,
            keys: vec![Key::from("a")],
        };
        assert_eq!(
            d.to_string(),
            "contract violation on node #3: set not permitted for [a]"
        );
        assert_eq!(d.label(), "contract-violation");
    }

    #[test]
    fn default_reporter_does_not_panic() {
        let r = tracing_reporter();
        r(&Diagnostic::UnknownNode { node: NodeId::new(1) });
    }
}
