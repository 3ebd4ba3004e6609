//! Custom error types for the host framework.
//!
//! This module defines the primary error type, `HostError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the failure modes of the coordination core:
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or
//!   format problems in the settings file.
//! - **`Configuration`**: Semantic errors in the settings, such as values
//!   that parse but are logically invalid (e.g. an unknown log level). These
//!   are caught by the validation step.
//! - **`ConfigInconsistency`**: The same config-tree key was resolved twice
//!   with different defaults. Defaults must be a pure function of the code,
//!   not of call order, so this is a programmer error and is fatal at
//!   startup rather than silently tolerated.
//! - **Registration errors**: a cell registered under two channel names, an
//!   enum channel without state labels, or an attribute that does not fit
//!   the channel's scalar kind.
//!
//! Note that *validation outcomes* on cell writes (accepted / coerced /
//! rejected) are not errors: they are returned as the tagged
//! [`WriteOutcome`](crate::cell::WriteOutcome) enum, since a coerced or
//! rejected write is an expected part of normal operation.

use thiserror::Error;

/// Convenience alias for results using the host error type.
pub type AppResult<T> = std::result::Result<T, HostError>;

/// Central error type for the host framework.
#[derive(Error, Debug)]
pub enum HostError {
    /// Settings file could not be loaded or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Settings loaded but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File or network I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A config-tree key was resolved twice with different defaults.
    #[error(
        "Inconsistent config default for '{path}': previously {previous}, now {requested}"
    )]
    ConfigInconsistency {
        /// Slash-joined tree path of the offending key.
        path: String,
        /// Default recorded by the first resolution.
        previous: serde_json::Value,
        /// Default supplied by the conflicting call.
        requested: serde_json::Value,
    },

    /// A config-tree value could not be converted to the requested type.
    #[error("Config value at '{path}' is not a {expected}: {value}")]
    ConfigTypeMismatch {
        /// Slash-joined tree path of the key.
        path: String,
        /// Name of the requested type.
        expected: &'static str,
        /// The resolved value that failed conversion.
        value: serde_json::Value,
    },

    /// The same cell was registered under two different channel names.
    #[error("Cell already registered as channel '{existing}', refusing '{requested}'")]
    DuplicateCell {
        /// Channel name of the prior registration.
        existing: String,
        /// Name the conflicting registration asked for.
        requested: String,
    },

    /// Two registrations resolved to the same channel name.
    #[error("Channel name '{0}' is already registered")]
    DuplicateChannel(String),

    /// An enum channel was registered without its state labels.
    #[error("Enum channel '{0}' requires state labels")]
    MissingEnumStates(String),

    /// A registration attribute does not apply to the channel's scalar kind.
    #[error("Attribute '{attribute}' does not apply to {kind} channel '{name}'")]
    AttributeKindMismatch {
        /// Channel name being registered.
        name: String,
        /// The offending attribute.
        attribute: &'static str,
        /// Scalar kind of the channel.
        kind: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inconsistency_message_names_both_defaults() {
        let err = HostError::ConfigInconsistency {
            path: "laser/power".into(),
            previous: serde_json::json!(5),
            requested: serde_json::json!(6),
        };
        let msg = err.to_string();
        assert!(msg.contains("laser/power"));
        assert!(msg.contains('5'));
        assert!(msg.contains('6'));
    }

    #[test]
    fn duplicate_cell_message_names_both_channels() {
        let err = HostError::DuplicateCell {
            existing: "N".into(),
            requested: "M".into(),
        };
        assert!(err.to_string().contains("'N'"));
        assert!(err.to_string().contains("'M'"));
    }
}
