use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use starmerge_store::{DimensionRef, DimensionRow, FactRow, QuarantineRow, UNKNOWN_MEMBER};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    config::UnresolvedPolicy,
    error::{MergeError, Result, UnresolvedReference},
    outcome::RunCounts,
    record::{dedup_latest, FactChange, Sourced},
    resolver::DimensionIndex,
};

pub const FACT_SCOPE: &str = "fact";

/// Staged result of merging a fact batch.
#[derive(Debug, Clone, Default)]
pub struct FactMerge {
    pub counts: RunCounts,
    /// Inserted and updated facts.
    pub facts: Vec<FactRow>,
    pub quarantine: Vec<QuarantineRow>,
    /// Unknown-member rows created for this batch.
    pub unknown_members: Vec<DimensionRow>,
    /// Facts that point at least one reference at an unknown member.
    pub routed_to_unknown: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct FactMerger {
    run_id: Uuid,
    policy: UnresolvedPolicy,
}

impl FactMerger {
    pub fn new(run_id: Uuid, policy: UnresolvedPolicy) -> Self {
        Self { run_id, policy }
    }

    /// Resolves and merges `changes` by transaction id.
    ///
    /// `existing` holds the stored facts with the same transaction ids. Unknown-member
    /// rows created for the batch are applied to `index` and returned for staging.
    pub fn merge(
        &self,
        index: &mut DimensionIndex,
        existing: &HashMap<String, FactRow>,
        changes: Vec<Sourced<FactChange>>,
        now: DateTime<Utc>,
    ) -> Result<FactMerge> {
        let received = changes.len();
        let (changes, deduplicated) =
            dedup_latest(FACT_SCOPE, changes, |c| c.transaction_id.as_str())?;

        let mut merge = FactMerge {
            counts: RunCounts {
                received,
                deduplicated,
                ..RunCounts::default()
            },
            ..FactMerge::default()
        };
        let mut failures = vec![];

        for sourced in changes {
            let change = &sourced.change;
            let event_date = change.event_date();
            let mut dimension_keys = BTreeMap::new();
            let mut unresolved = vec![];

            for (dimension, business_key) in &change.dimension_keys {
                match index.resolve(dimension, business_key, event_date) {
                    Ok(row) => {
                        dimension_keys.insert(
                            dimension.to_owned(),
                            DimensionRef {
                                business_key: business_key.to_owned(),
                                surrogate_key: row.surrogate_key,
                            },
                        );
                    }
                    Err(e) => unresolved.push(UnresolvedReference {
                        transaction_id: change.transaction_id.to_owned(),
                        dimension: dimension.to_owned(),
                        business_key: business_key.to_owned(),
                        event_date,
                        reason: e.to_string(),
                    }),
                }
            }

            if !unresolved.is_empty() {
                match self.policy {
                    UnresolvedPolicy::Quarantine => {
                        let reason = unresolved
                            .iter()
                            .map(|r| r.reason.to_owned())
                            .collect::<Vec<_>>()
                            .join("; ");

                        debug!("quarantine fact `{}`: {reason}", change.transaction_id);

                        merge.quarantine.push(QuarantineRow {
                            id: Uuid::new_v4(),
                            run_id: self.run_id,
                            source: sourced.source.to_owned(),
                            record_key: Some(change.transaction_id.to_owned()),
                            reason,
                            payload: sourced.payload.clone(),
                            quarantined_at: now,
                        });
                        merge.counts.quarantined += 1;
                        continue;
                    }
                    UnresolvedPolicy::Abort => {
                        failures.extend(unresolved);
                        continue;
                    }
                    UnresolvedPolicy::UnknownMember => {
                        for reference in unresolved {
                            let surrogate_key =
                                self.unknown_member(index, &reference.dimension, &mut merge);
                            dimension_keys.insert(
                                reference.dimension,
                                DimensionRef {
                                    business_key: reference.business_key,
                                    surrogate_key,
                                },
                            );
                        }
                        merge.routed_to_unknown.push(change.transaction_id.to_owned());
                    }
                }
            }

            let fact = FactRow {
                transaction_id: change.transaction_id.to_owned(),
                source: sourced.source.to_owned(),
                event_timestamp: change.event_timestamp,
                event_date,
                dimension_keys,
                quantity: change.quantity,
                amount_minor: change.amount_minor,
                currency: change.currency.to_owned(),
                changed_at: change.changed_at,
                load_timestamp: now,
            };

            match existing.get(&fact.transaction_id) {
                None => {
                    merge.counts.inserted += 1;
                    merge.facts.push(fact);
                }
                Some(stored) if stored.same_payload(&fact) => merge.counts.unchanged += 1,
                Some(_) => {
                    merge.counts.updated += 1;
                    merge.facts.push(fact);
                }
            }
        }

        if !failures.is_empty() {
            warn!("{} unresolved fact references, aborting", failures.len());

            return Err(MergeError::UnresolvedDimensionReference { failures });
        }

        Ok(merge)
    }

    fn unknown_member(
        &self,
        index: &mut DimensionIndex,
        dimension: &str,
        merge: &mut FactMerge,
    ) -> Uuid {
        if let Some(row) = index.history(dimension, UNKNOWN_MEMBER).first() {
            return row.surrogate_key;
        }

        let row = DimensionRow::unknown_member(dimension);
        let surrogate_key = row.surrogate_key;
        index.apply(std::slice::from_ref(&row));
        merge.unknown_members.push(row);

        surrogate_key
    }
}
