//! Error taxonomy for visit tracking
//!
//! Three kinds of failure reach callers:
//! - `InvalidVisitor`: the identifiers passed to a visit call are missing,
//!   malformed, or rejected by the visitable's configuration. Always surfaced
//!   as-is, never wrapped.
//! - `InvalidConfigValue`: a registration problem, reported at setup time.
//! - `Record`: a storage failure while persisting a visit or its counters,
//!   carrying the pairing that was being written.

use thiserror::Error;

use crate::models::{VisitableRef, VisitorKey};
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum VisitError {
    #[error("invalid visitor: {0}")]
    InvalidVisitor(String),

    #[error("invalid configuration value: {0}")]
    InvalidConfigValue(String),

    #[error("could not record visit for {context}: {source}")]
    Record {
        context: String,
        #[source]
        source: StorageError,
    },
}

pub type VisitResult<T> = Result<T, VisitError>;

impl VisitError {
    pub fn invalid_visitor(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::debug!(error = %message, "rejected visitor");
        Self::InvalidVisitor(message)
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::debug!(error = %message, "rejected configuration");
        Self::InvalidConfigValue(message)
    }

    /// Wrap a storage failure for a specific (visitable, visitor) pairing.
    pub fn record(visitable: &VisitableRef, visitor: &VisitorKey, source: StorageError) -> Self {
        Self::record_for(format!("{visitable} by {visitor}"), source)
    }

    /// Wrap a storage failure that concerns a visitable as a whole.
    pub fn record_for(context: impl Into<String>, source: StorageError) -> Self {
        let context = context.into();
        tracing::debug!(context = %context, error = %source, "visit storage failure");
        Self::Record { context, source }
    }

    pub fn is_invalid_visitor(&self) -> bool {
        matches!(self, Self::InvalidVisitor(_))
    }
}
