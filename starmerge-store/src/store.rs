use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{engine::Engine, error::Result, StoreError};

/// Business key of the row every dimension falls back to when a fact cannot be resolved.
pub const UNKNOWN_MEMBER: &str = "__unknown__";

pub type Attributes = BTreeMap<String, Value>;

/// One version of a dimension member.
///
/// Validity is the half-open interval `[effective_from, effective_to)`, an `effective_to`
/// of `None` being the open end carried by the current version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "pg", derive(sqlx::FromRow))]
pub struct DimensionRow {
    pub dimension: String,
    pub business_key: String,
    pub surrogate_key: Uuid,
    #[cfg_attr(feature = "pg", sqlx(json))]
    pub attributes: Attributes,
    pub effective_from: NaiveDate,
    pub effective_to: Option<NaiveDate>,
    pub is_current: bool,
    pub version: i32,
    pub changed_at: DateTime<Utc>,
}

impl DimensionRow {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.effective_from <= date && self.effective_to.map_or(true, |to| date < to)
    }

    pub fn is_unknown_member(&self) -> bool {
        self.business_key == UNKNOWN_MEMBER
    }

    pub fn unknown_member(dimension: impl Into<String>) -> Self {
        Self {
            dimension: dimension.into(),
            business_key: UNKNOWN_MEMBER.to_owned(),
            surrogate_key: Uuid::nil(),
            attributes: Attributes::new(),
            effective_from: NaiveDate::from_ymd_opt(1, 1, 1).unwrap_or(NaiveDate::MIN),
            effective_to: None,
            is_current: true,
            version: 1,
            changed_at: DateTime::<Utc>::default(),
        }
    }
}

/// A fact's reference into one dimension.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DimensionRef {
    pub business_key: String,
    pub surrogate_key: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "pg", derive(sqlx::FromRow))]
pub struct FactRow {
    pub transaction_id: String,
    pub source: String,
    pub event_timestamp: DateTime<Utc>,
    pub event_date: NaiveDate,
    #[cfg_attr(feature = "pg", sqlx(json))]
    pub dimension_keys: BTreeMap<String, DimensionRef>,
    pub quantity: i64,
    pub amount_minor: i64,
    pub currency: String,
    pub changed_at: DateTime<Utc>,
    pub load_timestamp: DateTime<Utc>,
}

impl FactRow {
    /// Compares keys and measures, ignoring provenance and audit columns.
    pub fn same_payload(&self, other: &FactRow) -> bool {
        self.transaction_id == other.transaction_id
            && self.event_timestamp == other.event_timestamp
            && self.event_date == other.event_date
            && self.dimension_keys == other.dimension_keys
            && self.quantity == other.quantity
            && self.amount_minor == other.amount_minor
            && self.currency == other.currency
    }

    pub fn surrogate_key(&self, dimension: &str) -> Option<Uuid> {
        self.dimension_keys.get(dimension).map(|r| r.surrogate_key)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    PartiallySucceeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::PartiallySucceeded => "partially_succeeded",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(RunStatus::Succeeded),
            "partially_succeeded" => Ok(RunStatus::PartiallySucceeded),
            "failed" => Ok(RunStatus::Failed),
            other => Err(StoreError::UnknownRunStatus(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Watermark {
    pub source_name: String,
    pub last_processed_value: DateTime<Utc>,
    pub last_run_status: RunStatus,
    pub updated_at: DateTime<Utc>,
}

/// A change record set aside instead of being merged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "pg", derive(sqlx::FromRow))]
pub struct QuarantineRow {
    pub id: Uuid,
    pub run_id: Uuid,
    pub source: String,
    pub record_key: Option<String>,
    pub reason: String,
    pub payload: Value,
    pub quarantined_at: DateTime<Utc>,
}

/// Leases a commit must still hold when it is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseClaim {
    pub owner: Uuid,
    pub resources: Vec<String>,
}

/// Everything a run writes, applied by [`Engine::commit`] as one unit.
///
/// Dimension rows are upserted by `(dimension, surrogate_key)`, facts by
/// `transaction_id` and watermarks by source name. A watermark lower than the stored one
/// fails the whole commit, and so does a `lease` that expired or was taken over.
/// Quarantine rows listed in `resolved` are removed.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub lease: Option<LeaseClaim>,
    pub dimension_rows: Vec<DimensionRow>,
    pub facts: Vec<FactRow>,
    pub quarantine: Vec<QuarantineRow>,
    pub resolved: Vec<Uuid>,
    pub watermarks: Vec<Watermark>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.dimension_rows.is_empty()
            && self.facts.is_empty()
            && self.quarantine.is_empty()
            && self.resolved.is_empty()
            && self.watermarks.is_empty()
    }
}

#[derive(Clone)]
pub struct Store {
    pub(crate) engine: Box<dyn Engine>,
}

impl Store {
    pub fn new<E: Engine + 'static>(engine: E) -> Self {
        Self {
            engine: Box::new(engine),
        }
    }

    pub async fn acquire(&self, owner: Uuid, resources: &[String], ttl: Duration) -> Result<()> {
        self.engine.acquire(owner, resources, ttl).await
    }

    pub async fn release(&self, owner: Uuid) -> Result<()> {
        self.engine.release(owner).await
    }

    pub async fn watermark(&self, source_name: &str) -> Result<Option<Watermark>> {
        self.engine.watermark(source_name).await
    }

    pub async fn set_run_status(&self, source_name: &str, status: RunStatus) -> Result<()> {
        self.engine.set_run_status(source_name, status).await
    }

    pub async fn dimension_versions(
        &self,
        dimension: &str,
        business_keys: &[String],
    ) -> Result<Vec<DimensionRow>> {
        if business_keys.is_empty() {
            return Ok(vec![]);
        }

        self.engine.dimension_versions(dimension, business_keys).await
    }

    /// All versions of one member, ordered by version.
    pub async fn dimension_history(
        &self,
        dimension: &str,
        business_key: impl Into<String>,
    ) -> Result<Vec<DimensionRow>> {
        let mut rows = self
            .dimension_versions(dimension, &[business_key.into()])
            .await?;

        rows.sort_by_key(|row| row.version);

        Ok(rows)
    }

    pub async fn existing_surrogate_keys(
        &self,
        dimension: &str,
        surrogate_keys: &[Uuid],
    ) -> Result<Vec<Uuid>> {
        if surrogate_keys.is_empty() {
            return Ok(vec![]);
        }

        self.engine
            .existing_surrogate_keys(dimension, surrogate_keys)
            .await
    }

    pub async fn facts(&self, transaction_ids: &[String]) -> Result<Vec<FactRow>> {
        if transaction_ids.is_empty() {
            return Ok(vec![]);
        }

        self.engine.facts(transaction_ids).await
    }

    pub async fn fact(&self, transaction_id: impl Into<String>) -> Result<Option<FactRow>> {
        let facts = self.facts(&[transaction_id.into()]).await?;

        Ok(facts.into_iter().next())
    }

    pub async fn facts_referencing(
        &self,
        dimension: &str,
        business_key: &str,
        from: NaiveDate,
        to: Option<NaiveDate>,
    ) -> Result<Vec<FactRow>> {
        self.engine
            .facts_referencing(dimension, business_key, from, to)
            .await
    }

    pub async fn facts_loaded_since(&self, since: DateTime<Utc>) -> Result<Vec<FactRow>> {
        self.engine.facts_loaded_since(since).await
    }

    pub async fn count_facts(&self) -> Result<u64> {
        self.engine.count_facts().await
    }

    pub async fn quarantined(&self, source: Option<&str>) -> Result<Vec<QuarantineRow>> {
        self.engine.quarantined(source).await
    }

    pub async fn commit(&self, changes: ChangeSet) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        self.engine.commit(changes).await
    }
}
