//! Configuration constants and defaults for a load pipeline.
//!
//! Every knob a run reads lives in [`PipelineConfig`]; [`ConfigBuilder`] overrides the
//! defaults below one at a time.

use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, NaiveDate, Utc};

/// What the fact merge does with a row whose dimension reference cannot be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnresolvedPolicy {
    /// Move the row to the quarantine table and merge the rest of the batch.
    #[default]
    Quarantine,
    /// Collect every failure of the batch and fail the run.
    Abort,
    /// Point the reference at the dimension's unknown-member row.
    UnknownMember,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Watermark used for a source that has never completed a run.
    pub initial_watermark: DateTime<Utc>,

    pub unresolved_policy: UnresolvedPolicy,

    /// Upper bound for reading one change feed.
    pub feed_timeout: Duration,

    /// Upper bound for each read against the warehouse store.
    pub store_timeout: Duration,

    /// Upper bound for the final commit.
    pub commit_timeout: Duration,

    /// How long the run's exclusive lease on its tables stays valid.
    pub lease_ttl: Duration,

    /// Raw column read to place non-conforming rows relative to the watermark.
    pub change_tracking_column: String,

    /// Numeric dimension attributes that must never be negative, keyed by dimension.
    pub non_negative_attributes: HashMap<String, Vec<String>>,

    /// Earliest accepted fact event date.
    pub min_event_date: NaiveDate,

    /// How many days past the run date a fact event date may lie.
    pub max_future_days: i64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            initial_watermark: DateTime::<Utc>::default(),
            unresolved_policy: UnresolvedPolicy::default(),
            feed_timeout: FEED_TIMEOUT,
            store_timeout: STORE_TIMEOUT,
            commit_timeout: COMMIT_TIMEOUT,
            lease_ttl: LEASE_TTL,
            change_tracking_column: CHANGE_TRACKING_COLUMN.to_owned(),
            non_negative_attributes: HashMap::from([(
                "price".to_owned(),
                vec!["list_price_minor".to_owned()],
            )]),
            min_event_date: NaiveDate::from_ymd_opt(MIN_EVENT_YEAR, 1, 1)
                .unwrap_or(NaiveDate::MIN),
            max_future_days: MAX_FUTURE_DAYS,
        }
    }
}

pub const FEED_TIMEOUT: Duration = Duration::from_secs(30);

pub const STORE_TIMEOUT: Duration = Duration::from_secs(30);

/// A commit writes every staged row of a run in one transaction.
pub const COMMIT_TIMEOUT: Duration = Duration::from_secs(120);

pub const LEASE_TTL: Duration = Duration::from_secs(15 * 60);

pub const CHANGE_TRACKING_COLUMN: &str = "updated_at";

pub const MIN_EVENT_YEAR: i32 = 2000;

pub const MAX_FUTURE_DAYS: i64 = 1;

#[derive(Debug)]
pub struct ConfigBuilder {
    config: PipelineConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
        }
    }

    pub fn initial_watermark(mut self, value: DateTime<Utc>) -> Self {
        self.config.initial_watermark = value;
        self
    }

    pub fn unresolved_policy(mut self, policy: UnresolvedPolicy) -> Self {
        self.config.unresolved_policy = policy;
        self
    }

    pub fn feed_timeout(mut self, timeout: Duration) -> Self {
        self.config.feed_timeout = timeout;
        self
    }

    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.config.store_timeout = timeout;
        self
    }

    pub fn commit_timeout(mut self, timeout: Duration) -> Self {
        self.config.commit_timeout = timeout;
        self
    }

    pub fn lease_ttl(mut self, ttl: Duration) -> Self {
        self.config.lease_ttl = ttl;
        self
    }

    pub fn change_tracking_column(mut self, column: impl Into<String>) -> Self {
        self.config.change_tracking_column = column.into();
        self
    }

    /// Adds an attribute to the non-negative checks of `dimension`.
    pub fn non_negative(mut self, dimension: impl Into<String>, attribute: impl Into<String>) -> Self {
        self.config
            .non_negative_attributes
            .entry(dimension.into())
            .or_default()
            .push(attribute.into());
        self
    }

    pub fn event_date_window(mut self, min_event_date: NaiveDate, max_future_days: i64) -> Self {
        self.config.min_event_date = min_event_date;
        self.config.max_future_days = max_future_days;
        self
    }

    pub fn build(self) -> PipelineConfig {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
