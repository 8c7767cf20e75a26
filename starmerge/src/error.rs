use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use starmerge_store::StoreError;
use uuid::Uuid;

/// A fact reference that could not be resolved to a dimension version.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnresolvedReference {
    pub transaction_id: String,
    pub dimension: String,
    pub business_key: String,
    pub event_date: NaiveDate,
    pub reason: String,
}

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("watermark of `{0}` is not initialized")]
    NotInitialized(String),

    #[error("no `{dimension}` member with business key `{business_key}`")]
    UnknownBusinessKey {
        dimension: String,
        business_key: String,
    },

    #[error("`{dimension}` member `{business_key}` has no version valid on {date}")]
    NoVersionAtDate {
        dimension: String,
        business_key: String,
        date: NaiveDate,
    },

    #[error("{} fact rows reference unresolved dimension members", failures.len())]
    UnresolvedDimensionReference { failures: Vec<UnresolvedReference> },

    #[error("conflicting changes for `{key}` in `{scope}` at {changed_at}")]
    DuplicateBusinessKeyConflict {
        scope: String,
        key: String,
        changed_at: DateTime<Utc>,
    },

    #[error("referential integrity violated: {0}")]
    ReferentialIntegrityViolation(String),

    #[error("business rule violated: {0}")]
    BusinessRuleViolation(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("merge left `{dimension}` member `{business_key}` inconsistent: {detail}")]
    MergeNotAtomic {
        dimension: String,
        business_key: String,
        detail: String,
    },

    #[error("watermark of `{source_name}` would regress from {current} to {next}")]
    WatermarkRegression {
        source_name: String,
        current: DateTime<Utc>,
        next: DateTime<Utc>,
    },

    #[error("resource `{resource}` is locked by run {owner}")]
    LockHeld { resource: String, owner: Uuid },

    #[error("lock of run {owner} on `{resource}` expired before commit")]
    LockExpired { resource: String, owner: Uuid },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("feed `{feed}`: {error}")]
    Feed {
        feed: String,
        #[source]
        error: anyhow::Error,
    },

    #[error("store `{0}`")]
    Store(#[source] StoreError),

    #[error("serde_json `{0}`")]
    SerdeJson(#[from] serde_json::Error),

    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

impl From<StoreError> for MergeError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::LeaseHeld { resource, owner } => MergeError::LockHeld { resource, owner },
            StoreError::LeaseExpired { resource, owner } => {
                MergeError::LockExpired { resource, owner }
            }
            StoreError::WatermarkRegression {
                source_name,
                current,
                next,
            } => MergeError::WatermarkRegression {
                source_name,
                current,
                next,
            },
            e => MergeError::Store(e),
        }
    }
}

impl MergeError {
    /// Failures caused by the data of a run, as opposed to the infrastructure it runs on.
    ///
    /// A run failing this way is rolled back and reported through its outcome.
    /// `MergeNotAtomic` is a broken engine invariant and stays an error.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            MergeError::UnknownBusinessKey { .. }
                | MergeError::NoVersionAtDate { .. }
                | MergeError::UnresolvedDimensionReference { .. }
                | MergeError::DuplicateBusinessKeyConflict { .. }
                | MergeError::ReferentialIntegrityViolation(_)
                | MergeError::BusinessRuleViolation(_)
                | MergeError::Validation(_)
                | MergeError::WatermarkRegression { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, MergeError>;
