#![forbid(unsafe_code)]
//! Incremental loads of change feeds into a star-schema warehouse.
//!
//! A [`Pipeline`] run reads every feed past its watermark, merges dimension changes as
//! Type-2 history, merges facts against the dimension versions valid on their event
//! date, re-points facts hit by retroactive dimension changes and validates the staged
//! result. Everything the run writes is committed at once together with the new
//! watermarks, or not at all.

pub mod config;
mod error;
mod fact;
mod feed;
mod late_arriving;
mod outcome;
mod pipeline;
mod record;
mod resolver;
mod scd2;
mod validator;
mod watermark;

pub use config::{ConfigBuilder, PipelineConfig, UnresolvedPolicy};
pub use error::{MergeError, Result, UnresolvedReference};
pub use fact::{FactMerge, FactMerger};
pub use feed::{Feed, JsonLinesFeed, MemoryFeed};
pub use late_arriving::{Correction, LateArrivingHandler};
pub use outcome::{DimensionSummary, RunCounts, RunOutcome, RunPhase};
pub use pipeline::Pipeline;
pub use record::{
    dedup_latest, ChangeTracked, CustomerChange, DimensionChange, DimensionRecord, FactChange,
    FactRecord, PriceChange, ProductChange, SaleChange, Sourced,
};
pub use resolver::{resolve_in, DimensionIndex, KeyResolver};
pub use scd2::{DimensionMerge, Scd2Merger};
pub use validator::{
    contiguous_history, single_current_version, CheckResult, Severity, Staged,
    ValidationReport, Validator,
};
pub use watermark::WatermarkTracker;

pub use starmerge_store::{
    self as store, ChangeSet, DimensionRef, DimensionRow, FactRow, LeaseClaim, QuarantineRow,
    RunStatus, Store, StoreError, Watermark, UNKNOWN_MEMBER,
};

#[cfg(feature = "memory")]
pub use starmerge_store::MemoryStore;

#[cfg(feature = "pg")]
pub use starmerge_store::PgStore;
