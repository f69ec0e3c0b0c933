//! Error types for toposync.
//!
//! All errors are strongly typed using thiserror. Object-scoped validation
//! problems (bad names, duplicate keys, tree-limit violations) are *not*
//! errors: they roll back or discard the offending candidate and surface as
//! warnings on the reconciliation outcome. The types here cover failures
//! that abort a rule run or a prototype batch.

use thiserror::Error;

use crate::rule::RuleId;
use crate::store::StorageError;

/// Rule-configuration errors. Fatal to the rule run that hits them.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown global expression '@{name}'")]
    UnknownNamedExpression {
        name: String,
    },

    #[error("invalid discovery macro name '{name}'")]
    InvalidMacroName {
        name: String,
    },

    #[error("invalid regular expression '{pattern}': {reason}")]
    InvalidPattern {
        pattern: String,
        reason: String,
    },

    #[error("custom expression references unknown condition id '{id}'")]
    UnknownFormulaCondition {
        id: String,
    },

    #[error("invalid custom expression: {reason}")]
    InvalidFormula {
        reason: String,
    },

    #[error("filter combinator '{combinator}' requires {requirement}")]
    IncompleteFilter {
        combinator: &'static str,
        requirement: &'static str,
    },
}

/// Top-level error type for discovery processing.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("invalid discovery payload: {reason}")]
    MalformedInput {
        reason: String,
    },

    #[error("discovery rule not found: {rule}")]
    RuleNotFound {
        rule: RuleId,
    },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("internal error: {message}")]
    Internal {
        message: String,
    },
}

impl DiscoveryError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a malformed-input error.
    #[must_use]
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedInput {
            reason: reason.into(),
        }
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Returns true if this is a storage error.
    #[must_use]
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns true if this error is retryable on a later scheduler pass.
    ///
    /// Malformed payloads and configuration errors will fail identically
    /// until the input or the rule changes; storage problems may clear up.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::MalformedInput { .. } | Self::Config(_) | Self::Internal { .. } => false,
            Self::RuleNotFound { .. } => false,
            Self::Storage(e) => e.is_transient(),
        }
    }
}

/// Result type alias for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;
