//! `portmerge-types` – shared data model for the merge workspace.
//!
//! - [`Record`] / [`Value`] – the structured record every source delivers
//!   and every merge tick produces, with a whitespace/parenthesis text form
//!   (see [`text`]).
//! - [`MergeError`] – the single error taxonomy used across the workspace.

pub mod record;
pub mod text;

pub use record::{Record, Value};

use thiserror::Error;

/// Global error type spanning format syntax, source connection, per-tick
/// evaluation and command validation failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MergeError {
    /// Malformed format text or port specifier.
    #[error("Syntax error in '{token}': {reason}")]
    Syntax { token: String, reason: String },

    /// A named producer could not be resolved or connected.
    #[error("Cannot connect to '{name}': {details}")]
    Connection { name: String, details: String },

    /// A 1-based index fell outside the record it was applied to.
    #[error("Index {index} out of range for '{port}' (record has {len} elements)")]
    IndexRange {
        port: String,
        index: u32,
        len: usize,
    },

    /// A further dimension was applied to a scalar element.
    #[error("Cannot index a non-list value at index {index} of '{port}'")]
    IndexType { port: String, index: u32 },

    /// A source was looked up without ever being declared.
    #[error("Attempt to retrieve undeclared source '{0}'")]
    Lookup(String),

    /// A command or setting was rejected; nothing was changed.
    #[error("Invalid value: {0}")]
    Validation(String),

    /// The engine cannot enter the requested state with its current setup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Underlying channel I/O failed.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Merge engine is closed")]
    Closed,
}

impl MergeError {
    /// Shorthand for [`MergeError::Syntax`].
    pub fn syntax(token: impl Into<String>, reason: impl Into<String>) -> Self {
        MergeError::Syntax {
            token: token.into(),
            reason: reason.into(),
        }
    }

    /// `true` for errors that only affect a single tick or a single command:
    /// evaluation errors and rejected values.  Everything else invalidates
    /// the configuration attempt or the engine itself.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MergeError::IndexRange { .. } | MergeError::IndexType { .. } | MergeError::Validation(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_error_display() {
        let err = MergeError::syntax("/a[1", "Missing closing bracket ']'");
        assert!(err.to_string().contains("/a[1"));
        assert!(err.to_string().contains("']'"));

        let err = MergeError::IndexRange {
            port: "/a".to_string(),
            index: 5,
            len: 3,
        };
        assert!(err.to_string().contains("Index 5 out of range"));
    }

    #[test]
    fn evaluation_errors_are_recoverable() {
        assert!(
            MergeError::IndexType {
                port: "/a".to_string(),
                index: 1
            }
            .is_recoverable()
        );
        assert!(MergeError::Validation("freq".to_string()).is_recoverable());
        assert!(!MergeError::syntax("x", "y").is_recoverable());
        assert!(!MergeError::Lookup("/a".to_string()).is_recoverable());
        assert!(!MergeError::Closed.is_recoverable());
    }
}
