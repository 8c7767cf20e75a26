//! Type-2 merge of dimension changes.
//!
//! Every change is applied to the version whose interval contains its effective date.
//! Closing that version and inserting the next one is computed against a copy of the
//! member's history; only rows that differ from the stored history are staged, and the
//! resulting history must pass the single-current and contiguity checks before anything
//! is handed to the commit.

use std::collections::HashMap;

use chrono::NaiveDate;
use starmerge_store::DimensionRow;
use tracing::debug;
use uuid::Uuid;

use crate::{
    error::{MergeError, Result},
    late_arriving::Correction,
    outcome::RunCounts,
    record::{dedup_latest, DimensionChange, Sourced},
    resolver::DimensionIndex,
    validator::{contiguous_history, single_current_version},
};

/// Staged result of merging one dimension.
#[derive(Debug, Clone, Default)]
pub struct DimensionMerge {
    pub dimension: String,
    pub counts: RunCounts,
    /// New and modified version rows.
    pub rows: Vec<DimensionRow>,
    /// One per inserted version. Facts of a new member may have been routed to the
    /// unknown member before it arrived.
    pub corrections: Vec<Correction>,
    pub touched: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemberOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct Scd2Merger {
    dimension: String,
}

impl Scd2Merger {
    pub fn new(dimension: impl Into<String>) -> Self {
        Self {
            dimension: dimension.into(),
        }
    }

    pub fn dimension(&self) -> &str {
        &self.dimension
    }

    /// Merges a batch of changes against the histories held by `index`.
    ///
    /// `run_date` is the effective date of changes that do not carry one. The index is
    /// left untouched, the caller applies [`DimensionMerge::rows`] once the merge of every
    /// dimension succeeded.
    pub fn merge(
        &self,
        index: &DimensionIndex,
        changes: Vec<Sourced<DimensionChange>>,
        run_date: NaiveDate,
    ) -> Result<DimensionMerge> {
        let received = changes.len();
        let (changes, deduplicated) =
            dedup_latest(&self.dimension, changes, |c| c.business_key.as_str())?;

        let mut merge = DimensionMerge {
            dimension: self.dimension.to_owned(),
            counts: RunCounts {
                received,
                deduplicated,
                ..RunCounts::default()
            },
            ..DimensionMerge::default()
        };

        for sourced in changes {
            let change = sourced.change;
            let effective = change.effective_from.unwrap_or(run_date);
            let stored = index.history(&self.dimension, &change.business_key);
            let (outcome, rows, correction) = self.merge_member(stored, &change, effective)?;

            debug!(
                "{} `{}` {:?} at {effective}",
                self.dimension, change.business_key, outcome
            );

            match outcome {
                MemberOutcome::Inserted => merge.counts.inserted += 1,
                MemberOutcome::Updated => merge.counts.updated += 1,
                MemberOutcome::Unchanged => merge.counts.unchanged += 1,
            }

            if outcome != MemberOutcome::Unchanged {
                merge.touched.push(change.business_key.to_owned());
            }

            merge.rows.extend(rows);
            merge.corrections.extend(correction);
        }

        Ok(merge)
    }

    fn merge_member(
        &self,
        stored: &[DimensionRow],
        change: &DimensionChange,
        effective: NaiveDate,
    ) -> Result<(MemberOutcome, Vec<DimensionRow>, Option<Correction>)> {
        if stored.is_empty() {
            let row = self.new_version(change, effective, None, 1);
            let correction = self.correction(&change.business_key, effective, None);

            return Ok((MemberOutcome::Inserted, vec![row], Some(correction)));
        }

        let mut history = stored.to_vec();
        history.sort_by_key(|row| row.version);

        let correction = match history.iter().position(|row| row.contains(effective)) {
            Some(pos) => {
                if history[pos].attributes == change.attributes {
                    return Ok((MemberOutcome::Unchanged, vec![], None));
                }

                // same start date: the version is restated, its surrogate key is kept
                if history[pos].effective_from == effective {
                    let mut row = history[pos].clone();
                    row.attributes = change.attributes.clone();
                    row.changed_at = change.changed_at;

                    return Ok((MemberOutcome::Updated, vec![row], None));
                }

                let end = history[pos].effective_to;
                let row = self.new_version(change, effective, end, 0);

                history[pos].effective_to = Some(effective);
                history[pos].is_current = false;
                history.insert(pos + 1, row);

                self.correction(&change.business_key, effective, end)
            }
            None => {
                let first_from = history[0].effective_from;
                if effective >= first_from {
                    return Err(self.not_atomic(
                        &change.business_key,
                        format!("no version covers {effective}"),
                    ));
                }

                if history[0].attributes == change.attributes {
                    history[0].effective_from = effective;
                } else {
                    let row = self.new_version(change, effective, Some(first_from), 0);
                    history.insert(0, row);
                }

                self.correction(&change.business_key, effective, Some(first_from))
            }
        };

        for (pos, row) in history.iter_mut().enumerate() {
            row.version = pos as i32 + 1;
        }

        single_current_version(&history)
            .and_then(|_| contiguous_history(&history))
            .map_err(|detail| self.not_atomic(&change.business_key, detail))?;

        let stored = stored
            .iter()
            .map(|row| (row.surrogate_key, row))
            .collect::<HashMap<Uuid, &DimensionRow>>();

        let rows = history
            .into_iter()
            .filter(|row| stored.get(&row.surrogate_key).map_or(true, |old| *old != row))
            .collect();

        Ok((MemberOutcome::Updated, rows, Some(correction)))
    }

    fn new_version(
        &self,
        change: &DimensionChange,
        from: NaiveDate,
        to: Option<NaiveDate>,
        version: i32,
    ) -> DimensionRow {
        DimensionRow {
            dimension: self.dimension.to_owned(),
            business_key: change.business_key.to_owned(),
            surrogate_key: Uuid::new_v4(),
            attributes: change.attributes.clone(),
            effective_from: from,
            effective_to: to,
            is_current: to.is_none(),
            version,
            changed_at: change.changed_at,
        }
    }

    fn correction(
        &self,
        business_key: &str,
        from: NaiveDate,
        to: Option<NaiveDate>,
    ) -> Correction {
        Correction {
            dimension: self.dimension.to_owned(),
            business_key: business_key.to_owned(),
            effective_from: from,
            effective_to: to,
        }
    }

    fn not_atomic(&self, business_key: &str, detail: String) -> MergeError {
        MergeError::MergeNotAtomic {
            dimension: self.dimension.to_owned(),
            business_key: business_key.to_owned(),
            detail,
        }
    }
}
