#![forbid(unsafe_code)]

//! Error type for controller, computed-value and model operations.
//!
//! Only usage errors and conditions that a caller must react to are
//! represented here. Compute, recompute and listener failures are reported
//! through `tracing` and never change the return value of the call that
//! triggered them, except when the failing computed read is the call itself.

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised synchronously at the call site.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// An action was invoked while a previous call is still pending.
    #[error("Invoked action {key} but one is already active.")]
    DuplicatePending { key: String },

    /// A strict update request did not match the pending state.
    #[error("Strict update() did {}find pending updates.", negate(.expected))]
    StrictUpdate { expected: bool },

    /// A child model was created without the parent it requires.
    #[error(
        "New {child} created standalone but requires parent of type {expects}. Did you remember to create it as a child?"
    )]
    Required { expects: String, child: String },

    /// A child model was created under a parent of the wrong type.
    #[error("New {child} created as child of {got}, but must be instanceof {expects}.")]
    Unexpected {
        expects: String,
        child: String,
        got: String,
    },

    /// Value is not ready yet. Higher layers interpret this as "suspend".
    #[error("{model}.{key} is not ready yet.")]
    Suspend { model: String, key: String },

    /// Property does not exist on the model.
    #[error("{model} has no property {key}.")]
    UnknownKey { model: String, key: String },

    /// Property exists but cannot be assigned.
    #[error("{model}.{key} is read-only.")]
    ReadOnly { model: String, key: String },

    /// Property exists but is not a method or action.
    #[error("{model}.{key} is not callable.")]
    NotCallable { model: String, key: String },

    /// A subscriber outlived the model it observes.
    #[error("subscriber is detached from its model")]
    Detached,

    /// Value conversion failed.
    #[error("expected {expected}, found {found}")]
    Type {
        expected: &'static str,
        found: &'static str,
    },

    /// Failure raised by user code (getters, methods, actions).
    #[error("{0}")]
    Custom(String),
}

fn negate(expected: &bool) -> &'static str {
    if *expected { "not " } else { "" }
}

impl Error {
    /// Wrap an arbitrary message as a user-code failure.
    #[must_use]
    pub fn custom(message: impl std::fmt::Display) -> Self {
        Self::Custom(message.to_string())
    }

    /// Whether this is the distinguished "value not ready" condition.
    #[must_use]
    pub fn is_suspense(&self) -> bool {
        matches!(self, Self::Suspend { .. })
    }

    pub(crate) fn unknown(model: &str, key: &str) -> Self {
        Self::UnknownKey {
            model: model.to_owned(),
            key: key.to_owned(),
        }
    }

    pub(crate) fn read_only(model: &str, key: &str) -> Self {
        Self::ReadOnly {
            model: model.to_owned(),
            key: key.to_owned(),
        }
    }

    pub(crate) fn not_callable(model: &str, key: &str) -> Self {
        Self::NotCallable {
            model: model.to_owned(),
            key: key.to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_update_message_depends_on_expectation() {
        assert_eq!(
            Error::StrictUpdate { expected: true }.to_string(),
            "Strict update() did not find pending updates."
        );
        assert_eq!(
            Error::StrictUpdate { expected: false }.to_string(),
            "Strict update() did find pending updates."
        );
    }

    #[test]
    fn duplicate_pending_names_the_key() {
        let err = Error::DuplicatePending { key: "save".into() };
        assert_eq!(err.to_string(), "Invoked action save but one is already active.");
    }

    #[test]
    fn suspense_is_distinguished() {
        let suspend = Error::Suspend {
            model: "Profile".into(),
            key: "user".into(),
        };
        assert!(suspend.is_suspense());
        assert!(!Error::custom("boom").is_suspense());
        assert!(!Error::Detached.is_suspense());
    }
}
