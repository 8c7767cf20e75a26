use chrono::{DateTime, Utc};
use starmerge_store::{ChangeSet, RunStatus, Store, Watermark};
use tracing::debug;

use crate::{
    error::{MergeError, Result},
    record::ChangeTracked,
};

/// Reads and moves the "last processed" position of each source feed.
#[derive(Clone)]
pub struct WatermarkTracker {
    store: Store,
    initial: DateTime<Utc>,
}

impl WatermarkTracker {
    pub fn new(store: Store, initial: DateTime<Utc>) -> Self {
        Self { store, initial }
    }

    pub async fn read_watermark(&self, source_name: &str) -> Result<Watermark> {
        self.store
            .watermark(source_name)
            .await?
            .ok_or_else(|| MergeError::NotInitialized(source_name.to_owned()))
    }

    /// The stored value, or the configured initial watermark for a new source.
    pub async fn read_or_initial(&self, source_name: &str) -> Result<DateTime<Utc>> {
        match self.read_watermark(source_name).await {
            Ok(watermark) => Ok(watermark.last_processed_value),
            Err(MergeError::NotInitialized(_)) => {
                debug!("watermark of {source_name} not initialized, using {}", self.initial);

                Ok(self.initial)
            }
            Err(e) => Err(e),
        }
    }

    /// Keeps the records changed strictly after `watermark`, in input order.
    pub fn filter_new<R: ChangeTracked>(records: Vec<R>, watermark: DateTime<Utc>) -> Vec<R> {
        records
            .into_iter()
            .filter(|record| record.changed_at() > watermark)
            .collect()
    }

    pub fn next_watermark<R: ChangeTracked>(records: &[R]) -> Option<DateTime<Utc>> {
        records.iter().map(ChangeTracked::changed_at).max()
    }

    /// Builds the watermark record a successful run commits.
    ///
    /// Writing the stored value again is accepted, a lower value is not.
    pub fn staged(
        current: Option<&Watermark>,
        source_name: &str,
        value: DateTime<Utc>,
        status: RunStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<Watermark> {
        if let Some(current) = current {
            if value < current.last_processed_value {
                return Err(MergeError::WatermarkRegression {
                    source_name: source_name.to_owned(),
                    current: current.last_processed_value,
                    next: value,
                });
            }
        }

        Ok(Watermark {
            source_name: source_name.to_owned(),
            last_processed_value: value,
            last_run_status: status,
            updated_at,
        })
    }

    /// Moves the watermark of one source on its own, outside a pipeline run.
    pub async fn advance_watermark(&self, source_name: &str, value: DateTime<Utc>) -> Result<()> {
        let current = self.store.watermark(source_name).await?;
        let watermark = Self::staged(
            current.as_ref(),
            source_name,
            value,
            RunStatus::Succeeded,
            Utc::now(),
        )?;

        self.store
            .commit(ChangeSet {
                watermarks: vec![watermark],
                ..ChangeSet::default()
            })
            .await?;

        Ok(())
    }

    pub async fn mark_failed(&self, source_name: &str) -> Result<()> {
        self.store
            .set_run_status(source_name, RunStatus::Failed)
            .await?;

        Ok(())
    }
}
