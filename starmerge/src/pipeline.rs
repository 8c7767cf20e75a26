use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    future::Future,
    time::Duration,
};

use chrono::{DateTime, NaiveDate, Utc};
use futures_util::future::join_all;
use serde_json::Value;
use starmerge_store::{
    ChangeSet, DimensionRow, LeaseClaim, QuarantineRow, RunStatus, Store, Watermark,
    UNKNOWN_MEMBER,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    config::{PipelineConfig, UnresolvedPolicy},
    error::{MergeError, Result},
    fact::{FactMerge, FactMerger, FACT_SCOPE},
    feed::Feed,
    late_arriving::LateArrivingHandler,
    outcome::{DimensionSummary, RunCounts, RunOutcome, RunPhase},
    record::{
        decode_dimension, decode_fact, ChangeTracked, DimensionChange, DimensionRecord,
        FactChange, FactRecord, Sourced,
    },
    resolver::DimensionIndex,
    scd2::{DimensionMerge, Scd2Merger},
    validator::{Staged, ValidationReport, Validator},
    watermark::WatermarkTracker,
};

type Decode<C> = fn(&Value) -> std::result::Result<C, String>;

#[derive(Clone)]
struct DimensionSource {
    dimension: &'static str,
    source: String,
    feed: Box<dyn Feed>,
    decode: Decode<DimensionChange>,
}

#[derive(Clone)]
struct FactSource {
    source: String,
    feed: Box<dyn Feed>,
    decode: Decode<FactChange>,
}

/// Rows of one source read by a run, past its watermark.
struct SourceBatch<C> {
    source: String,
    current: Option<Watermark>,
    changes: Vec<Sourced<C>>,
    quarantine: Vec<QuarantineRow>,
    /// Quarantined rows of earlier runs merged again, their changes are part of `changes`.
    resubmitted: Vec<QuarantineRow>,
    next: Option<DateTime<Utc>>,
}

struct Run {
    id: Uuid,
    now: DateTime<Utc>,
    phase: RunPhase,
    counts: RunCounts,
    dimensions: Vec<DimensionSummary>,
    report: Option<ValidationReport>,
    quarantined: usize,
    resolved: usize,
}

impl Run {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            now,
            phase: RunPhase::Resolving,
            counts: RunCounts::default(),
            dimensions: vec![],
            report: None,
            quarantined: 0,
            resolved: 0,
        }
    }

    fn advance(&mut self, next: RunPhase) {
        if !self.phase.can_advance_to(next) {
            warn!("run {} cannot move from {:?} to {next:?}", self.id, self.phase);
            return;
        }

        debug!("run {} {:?} -> {next:?}", self.id, self.phase);
        self.phase = next;
    }

    fn into_outcome(self, failure: Option<MergeError>) -> RunOutcome {
        let status = match (&failure, self.quarantined) {
            (Some(_), _) => RunStatus::Failed,
            (None, 0) => RunStatus::Succeeded,
            (None, _) => RunStatus::PartiallySucceeded,
        };

        RunOutcome {
            run_id: self.id,
            phase: self.phase,
            status,
            counts: self.counts,
            dimensions: self.dimensions,
            report: self.report,
            quarantined: self.quarantined,
            resolved: self.resolved,
            failure,
        }
    }
}

/// An incremental load of dimension and fact feeds into the star schema.
///
/// ```no_run
/// # async fn load(store: starmerge::Store) -> starmerge::Result<()> {
/// use starmerge::{CustomerChange, JsonLinesFeed, Pipeline, SaleChange};
///
/// let outcome = Pipeline::new(store)
///     .dimension::<CustomerChange>("org_a.customers", JsonLinesFeed::new("customers.jsonl"))
///     .facts::<SaleChange>("org_a.sales", JsonLinesFeed::new("sales.jsonl"))
///     .run()
///     .await?;
///
/// println!("{:?} {:?}", outcome.status, outcome.counts);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Pipeline {
    store: Store,
    config: PipelineConfig,
    dimensions: Vec<DimensionSource>,
    facts: Vec<FactSource>,
}

impl Pipeline {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            config: PipelineConfig::default(),
            dimensions: vec![],
            facts: vec![],
        }
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Adds a change feed of dimension `R::DIMENSION`. Several sources may feed the same
    /// dimension, their rows are merged as one batch.
    pub fn dimension<R: DimensionRecord>(
        mut self,
        source: impl Into<String>,
        feed: impl Feed + 'static,
    ) -> Self {
        self.dimensions.push(DimensionSource {
            dimension: R::DIMENSION,
            source: source.into(),
            feed: Box::new(feed),
            decode: decode_dimension::<R>,
        });
        self
    }

    pub fn facts<R: FactRecord>(mut self, source: impl Into<String>, feed: impl Feed + 'static) -> Self {
        self.facts.push(FactSource {
            source: source.into(),
            feed: Box::new(feed),
            decode: decode_fact::<R>,
        });
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn watermarks(&self) -> WatermarkTracker {
        WatermarkTracker::new(self.store.clone(), self.config.initial_watermark)
    }

    pub fn late_arriving(&self) -> LateArrivingHandler {
        LateArrivingHandler::new(self.store.clone()).lease_ttl(self.config.lease_ttl)
    }

    pub async fn run(&self) -> Result<RunOutcome> {
        self.run_at(Utc::now()).await
    }

    /// Runs the pipeline as of `now`, which dates audit columns and defaults effective
    /// dates of dimension changes.
    ///
    /// Failures caused by the data (validation, unresolved references under
    /// [`UnresolvedPolicy::Abort`], conflicting duplicates) roll the run back and come back
    /// as a failed [`RunOutcome`]; infrastructure failures are returned as errors. Either
    /// way nothing of the run is persisted and watermarks stay where they were.
    ///
    /// Facts quarantined by earlier runs for an unresolved reference are merged again,
    /// unless the policy is [`UnresolvedPolicy::Abort`].
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<RunOutcome> {
        let mut run = Run::new(now);
        let resources = self.resources();
        let ttl = chrono::Duration::from_std(self.config.lease_ttl).map_err(anyhow::Error::from)?;

        info!("run {} started, locking {}", run.id, resources.join(", "));

        timed(
            "lock",
            self.config.store_timeout,
            self.store.acquire(run.id, &resources, ttl),
        )
        .await?;

        let lease = LeaseClaim {
            owner: run.id,
            resources,
        };
        let res = self.execute(&mut run, lease).await;

        if res.is_err() {
            run.advance(RunPhase::RolledBack);
            self.mark_failed(run.id).await;
        }

        if let Err(e) = self.store.release(run.id).await {
            error!("run {} failed to release its lease: {e}", run.id);
        }

        match res {
            Ok(()) => {
                info!(
                    "run {} committed, {} inserted, {} updated, {} quarantined",
                    run.id, run.counts.inserted, run.counts.updated, run.quarantined
                );

                Ok(run.into_outcome(None))
            }
            Err(e) => {
                if e.is_rejection() {
                    warn!("run {} rolled back: {e}", run.id);

                    return Ok(run.into_outcome(Some(e)));
                }

                error!("run {} aborted: {e}", run.id);

                Err(e)
            }
        }
    }

    fn resources(&self) -> Vec<String> {
        let dimensions = self
            .dimensions
            .iter()
            .map(|s| s.dimension)
            .collect::<BTreeSet<_>>();

        let mut resources = dimensions
            .into_iter()
            .map(|d| format!("dimension:{d}"))
            .collect::<Vec<_>>();

        // dimension corrections re-point stored facts
        resources.push(FACT_SCOPE.to_owned());

        resources.extend(self.sources().map(|s| format!("watermark:{s}")));

        resources
    }

    fn sources(&self) -> impl Iterator<Item = &str> {
        self.dimensions
            .iter()
            .map(|s| s.source.as_str())
            .chain(self.facts.iter().map(|s| s.source.as_str()))
    }

    async fn execute(&self, run: &mut Run, lease: LeaseClaim) -> Result<()> {
        let run_date = run.now.date_naive();
        let facts_before =
            timed("fact count", self.config.store_timeout, self.store.count_facts()).await?;

        let mut dimension_batches = join_all(self.dimensions.iter().map(|s| {
            self.read_source(run.id, run.now, &s.source, s.feed.as_ref(), s.decode, false)
        }))
        .await
        .into_iter()
        .collect::<Result<Vec<_>>>()?;

        // facts quarantined as unresolved get another chance once their members may exist
        let resubmit = self.config.unresolved_policy != UnresolvedPolicy::Abort;
        let fact_batches = join_all(self.facts.iter().map(|s| {
            self.read_source(run.id, run.now, &s.source, s.feed.as_ref(), s.decode, resubmit)
        }))
        .await
        .into_iter()
        .collect::<Result<Vec<_>>>()?;

        run.advance(RunPhase::Merging);

        let mut grouped: BTreeMap<&str, (Vec<Sourced<DimensionChange>>, usize)> = BTreeMap::new();
        for (source, batch) in self.dimensions.iter().zip(dimension_batches.iter_mut()) {
            let (changes, quarantined) = grouped.entry(source.dimension).or_default();
            changes.append(&mut batch.changes);
            *quarantined += batch.quarantine.len();
        }

        let mut index = DimensionIndex::new();
        let mut dimension_merges = vec![];

        let merges = join_all(
            grouped
                .into_iter()
                .map(|(dimension, (changes, quarantined))| async move {
                    let (mut merge, keys, rows) =
                        self.merge_dimension(dimension, changes, run_date).await?;
                    merge.counts.received += quarantined;
                    merge.counts.quarantined += quarantined;

                    Ok::<_, MergeError>((merge, keys, rows))
                }),
        )
        .await;

        for res in merges {
            let (merge, keys, rows) = res?;
            index.load(&merge.dimension, &keys, rows);
            index.apply(&merge.rows);

            run.dimensions.push(DimensionSummary {
                dimension: merge.dimension.to_owned(),
                counts: merge.counts,
                corrections: merge.corrections.len(),
            });
            dimension_merges.push(merge);
        }

        let fact_merge = if self.facts.is_empty() {
            None
        } else {
            Some(self.merge_facts(run, &mut index, &fact_batches).await?)
        };

        let corrections = dimension_merges
            .iter()
            .flat_map(|m| m.corrections.iter().cloned())
            .collect::<Vec<_>>();
        let skip = fact_batches
            .iter()
            .flat_map(|b| b.changes.iter().map(|c| c.change.transaction_id.to_owned()))
            .collect::<HashSet<_>>();

        let repointed = timed(
            "late-arriving correction",
            self.config.store_timeout,
            self.late_arriving()
                .correct(&index, &corrections, &skip, run.now),
        )
        .await?;

        if let Some(merge) = &fact_merge {
            run.counts = merge.counts;
        }
        run.counts.repointed = repointed.len();

        run.advance(RunPhase::Validating);

        let report = timed(
            "validation",
            self.config.store_timeout,
            Validator::new(self.store.clone(), self.config.clone()).validate(&Staged {
                index: &index,
                dimensions: &dimension_merges,
                facts: fact_merge.as_ref(),
                repointed: &repointed,
                facts_before,
                as_of: run_date,
            }),
        )
        .await?;

        run.counts.rejected = report.rejected;
        let failure = report.error();
        run.report = Some(report);

        if let Some(e) = failure {
            return Err(e);
        }

        let mut changes = ChangeSet {
            lease: Some(lease),
            ..ChangeSet::default()
        };
        let mut fact_merge = fact_merge.unwrap_or_default();

        for open in fact_batches.iter().flat_map(|b| b.resubmitted.iter()) {
            let again = fact_merge
                .quarantine
                .iter()
                .position(|q| q.source == open.source && q.record_key == open.record_key);

            match again {
                Some(pos) if fact_merge.quarantine[pos].payload == open.payload => {
                    fact_merge.quarantine.remove(pos);
                }
                _ => changes.resolved.push(open.id),
            }
        }
        run.resolved = changes.resolved.len();

        changes.quarantine = dimension_batches
            .iter()
            .flat_map(|b| b.quarantine.iter().cloned())
            .chain(fact_batches.iter().flat_map(|b| b.quarantine.iter().cloned()))
            .chain(fact_merge.quarantine)
            .collect();
        run.quarantined = changes.quarantine.len();

        for batch in dimension_batches
            .iter()
            .map(|b| (&b.source, &b.current, b.next))
            .chain(fact_batches.iter().map(|b| (&b.source, &b.current, b.next)))
        {
            let (source, current, next) = batch;
            let Some(value) = next.or(current.as_ref().map(|w| w.last_processed_value)) else {
                continue;
            };

            let status = if changes.quarantine.iter().any(|q| &q.source == source) {
                RunStatus::PartiallySucceeded
            } else {
                RunStatus::Succeeded
            };

            changes.watermarks.push(WatermarkTracker::staged(
                current.as_ref(),
                source,
                value,
                status,
                run.now,
            )?);
        }

        changes.dimension_rows = dimension_merges
            .into_iter()
            .flat_map(|m| m.rows)
            .chain(fact_merge.unknown_members)
            .collect();
        changes.facts = fact_merge.facts.into_iter().chain(repointed).collect();

        debug!(
            "run {} commits {} dimension rows, {} facts, {} quarantined, {} resolved, {} watermarks",
            run.id,
            changes.dimension_rows.len(),
            changes.facts.len(),
            changes.quarantine.len(),
            changes.resolved.len(),
            changes.watermarks.len()
        );

        timed(
            "commit",
            self.config.commit_timeout,
            self.store.commit(changes),
        )
        .await?;

        run.advance(RunPhase::Committed);

        Ok(())
    }

    async fn read_source<C: ChangeTracked>(
        &self,
        run_id: Uuid,
        now: DateTime<Utc>,
        source: &str,
        feed: &dyn Feed,
        decode: Decode<C>,
        resubmit: bool,
    ) -> Result<SourceBatch<C>> {
        let current = timed(
            "watermark read",
            self.config.store_timeout,
            self.store.watermark(source),
        )
        .await?;
        let watermark = current
            .as_ref()
            .map_or(self.config.initial_watermark, |w| w.last_processed_value);

        let rows = tokio::time::timeout(self.config.feed_timeout, feed.fetch(Some(watermark)))
            .await
            .map_err(|_| MergeError::Timeout {
                operation: format!("feed {source}"),
                after: self.config.feed_timeout,
            })?
            .map_err(|error| MergeError::Feed {
                feed: source.to_owned(),
                error,
            })?;

        let open = timed(
            "quarantine read",
            self.config.store_timeout,
            self.store.quarantined(Some(source)),
        )
        .await?;

        let received = rows.len();
        let mut decoded = vec![];
        let mut quarantine: Vec<QuarantineRow> = vec![];
        let mut next = None;

        for (position, payload) in rows.into_iter().enumerate() {
            match decode(&payload) {
                Ok(change) => decoded.push(Sourced {
                    source: source.to_owned(),
                    position,
                    payload,
                    change,
                }),
                Err(reason) => {
                    let changed_at = self.raw_changed_at(&payload);
                    if changed_at.is_some_and(|at| at <= watermark) {
                        continue;
                    }

                    // without a readable change-tracking value the row comes back every run
                    if open
                        .iter()
                        .chain(quarantine.iter())
                        .any(|q| q.payload == payload)
                    {
                        continue;
                    }

                    next = next.max(changed_at);
                    quarantine.push(QuarantineRow {
                        id: Uuid::new_v4(),
                        run_id,
                        source: source.to_owned(),
                        record_key: None,
                        reason,
                        payload,
                        quarantined_at: now,
                    });
                }
            }
        }

        let mut changes = WatermarkTracker::filter_new(decoded, watermark);
        let next = next.max(WatermarkTracker::next_watermark(&changes));

        let mut resubmitted = vec![];
        for row in open.into_iter().filter(|q| resubmit && q.record_key.is_some()) {
            match decode(&row.payload) {
                Ok(change) => {
                    changes.push(Sourced {
                        source: source.to_owned(),
                        position: received + resubmitted.len(),
                        payload: row.payload.clone(),
                        change,
                    });
                    resubmitted.push(row);
                }
                Err(reason) => warn!("quarantined row {} of {source} stays: {reason}", row.id),
            }
        }

        debug!(
            "{source} past {watermark}: {} of {received} rows, {} non-conforming, {} resubmitted",
            changes.len() - resubmitted.len(),
            quarantine.len(),
            resubmitted.len()
        );

        Ok(SourceBatch {
            source: source.to_owned(),
            current,
            changes,
            quarantine,
            resubmitted,
            next,
        })
    }

    fn raw_changed_at(&self, payload: &Value) -> Option<DateTime<Utc>> {
        payload
            .get(self.config.change_tracking_column.as_str())?
            .as_str()?
            .parse()
            .ok()
    }

    async fn merge_dimension(
        &self,
        dimension: &str,
        changes: Vec<Sourced<DimensionChange>>,
        run_date: NaiveDate,
    ) -> Result<(DimensionMerge, Vec<String>, Vec<DimensionRow>)> {
        let keys = changes
            .iter()
            .map(|c| c.change.business_key.to_owned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();

        let rows = timed(
            "dimension read",
            self.config.store_timeout,
            self.store.dimension_versions(dimension, &keys),
        )
        .await?;

        let mut index = DimensionIndex::new();
        index.load(dimension, &keys, rows.clone());

        let merge = Scd2Merger::new(dimension).merge(&index, changes, run_date)?;

        info!(
            "{dimension}: {} inserted, {} updated, {} unchanged, {} corrections",
            merge.counts.inserted,
            merge.counts.updated,
            merge.counts.unchanged,
            merge.corrections.len()
        );

        Ok((merge, keys, rows))
    }

    async fn merge_facts(
        &self,
        run: &Run,
        index: &mut DimensionIndex,
        batches: &[SourceBatch<FactChange>],
    ) -> Result<FactMerge> {
        let changes = batches
            .iter()
            .flat_map(|b| b.changes.iter().cloned())
            .collect::<Vec<_>>();
        let quarantined = batches.iter().map(|b| b.quarantine.len()).sum::<usize>();

        let mut keys: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for sourced in &changes {
            for (dimension, business_key) in &sourced.change.dimension_keys {
                let dimension_keys = keys.entry(dimension.to_owned()).or_default();
                dimension_keys.push(business_key.to_owned());

                if self.config.unresolved_policy == UnresolvedPolicy::UnknownMember {
                    dimension_keys.push(UNKNOWN_MEMBER.to_owned());
                }
            }
        }

        for (dimension, business_keys) in keys {
            let missing = index.missing(&dimension, &business_keys);
            let rows = timed(
                "dimension read",
                self.config.store_timeout,
                self.store.dimension_versions(&dimension, &missing),
            )
            .await?;
            index.load(&dimension, &missing, rows);
        }

        let ids = changes
            .iter()
            .map(|c| c.change.transaction_id.to_owned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();
        let existing = timed("fact read", self.config.store_timeout, self.store.facts(&ids))
            .await?
            .into_iter()
            .map(|f| (f.transaction_id.to_owned(), f))
            .collect::<HashMap<_, _>>();

        let mut merge = FactMerger::new(run.id, self.config.unresolved_policy).merge(
            index,
            &existing,
            changes,
            run.now,
        )?;
        merge.counts.received += quarantined;
        merge.counts.quarantined += quarantined;

        info!(
            "facts: {} inserted, {} updated, {} unchanged, {} quarantined, {} deduplicated",
            merge.counts.inserted,
            merge.counts.updated,
            merge.counts.unchanged,
            merge.counts.quarantined,
            merge.counts.deduplicated
        );

        Ok(merge)
    }

    async fn mark_failed(&self, run_id: Uuid) {
        for source in self.sources() {
            let res = timed(
                "watermark status",
                self.config.store_timeout,
                self.store.set_run_status(source, RunStatus::Failed),
            )
            .await;

            if let Err(e) = res {
                error!("run {run_id} failed to mark {source} as failed: {e}");
            }
        }
    }
}

async fn timed<T, E, F>(operation: &str, after: Duration, future: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: Into<MergeError>,
{
    match tokio::time::timeout(after, future).await {
        Ok(res) => res.map_err(Into::into),
        Err(_) => Err(MergeError::Timeout {
            operation: operation.to_owned(),
            after,
        }),
    }
}
