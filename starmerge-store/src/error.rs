use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("resource `{resource}` is leased by run {owner}")]
    LeaseHeld { resource: String, owner: Uuid },

    #[error("lease of run {owner} on `{resource}` expired")]
    LeaseExpired { resource: String, owner: Uuid },

    #[error("watermark of `{source_name}` would regress from {current} to {next}")]
    WatermarkRegression {
        source_name: String,
        current: DateTime<Utc>,
        next: DateTime<Utc>,
    },

    #[error("unknown run status `{0}`")]
    UnknownRunStatus(String),

    #[cfg(feature = "pg")]
    #[error("sqlx `{0}`")]
    Sqlx(#[from] sqlx::Error),

    #[error("serde_json `{0}`")]
    SerdeJson(#[from] serde_json::Error),

    #[error("std::num `{0}`")]
    TryFromInt(#[from] std::num::TryFromIntError),

    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
