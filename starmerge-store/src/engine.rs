use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use dyn_clone::DynClone;
use uuid::Uuid;

use crate::{
    error::Result,
    store::{ChangeSet, DimensionRow, FactRow, QuarantineRow, RunStatus, Watermark},
};

#[cfg(feature = "memory")]
mod memory;
#[cfg(feature = "pg")]
mod pg;

#[cfg(feature = "memory")]
pub use memory::*;
#[cfg(feature = "pg")]
pub use pg::*;

#[async_trait]
pub trait Engine: DynClone + Send + Sync {
    /// Takes an exclusive lease on every resource or on none of them.
    async fn acquire(&self, owner: Uuid, resources: &[String], ttl: Duration) -> Result<()>;

    async fn release(&self, owner: Uuid) -> Result<()>;

    async fn watermark(&self, source_name: &str) -> Result<Option<Watermark>>;

    /// Records the outcome of a run without moving the watermark value.
    async fn set_run_status(&self, source_name: &str, status: RunStatus) -> Result<()>;

    async fn dimension_versions(
        &self,
        dimension: &str,
        business_keys: &[String],
    ) -> Result<Vec<DimensionRow>>;

    async fn existing_surrogate_keys(
        &self,
        dimension: &str,
        surrogate_keys: &[Uuid],
    ) -> Result<Vec<Uuid>>;

    async fn facts(&self, transaction_ids: &[String]) -> Result<Vec<FactRow>>;

    /// Facts pointing at `business_key` whose event date falls in `[from, to)`.
    async fn facts_referencing(
        &self,
        dimension: &str,
        business_key: &str,
        from: NaiveDate,
        to: Option<NaiveDate>,
    ) -> Result<Vec<FactRow>>;

    async fn facts_loaded_since(&self, since: DateTime<Utc>) -> Result<Vec<FactRow>>;

    async fn count_facts(&self) -> Result<u64>;

    async fn quarantined(&self, source: Option<&str>) -> Result<Vec<QuarantineRow>>;

    async fn commit(&self, changes: ChangeSet) -> Result<()>;
}

dyn_clone::clone_trait_object!(Engine);
