use std::{
    collections::{BTreeMap, HashSet},
    time::Duration,
};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use starmerge_store::{ChangeSet, FactRow, LeaseClaim, Store};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{config::LEASE_TTL, error::Result, fact::FACT_SCOPE, resolver::DimensionIndex};

/// A version inserted into existing history. Facts of `business_key` whose event date
/// falls inside `[effective_from, effective_to)` may point at the wrong version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Correction {
    pub dimension: String,
    pub business_key: String,
    pub effective_from: NaiveDate,
    pub effective_to: Option<NaiveDate>,
}

/// Re-points already loaded facts at the dimension versions valid on their event date.
#[derive(Clone)]
pub struct LateArrivingHandler {
    store: Store,
    lease_ttl: Duration,
}

impl LateArrivingHandler {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            lease_ttl: LEASE_TTL,
        }
    }

    /// How long a rescan holds the fact table.
    pub fn lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Facts touched by `corrections`, re-resolved against `index`.
    ///
    /// Only facts whose reference actually changes are returned, with `load_timestamp`
    /// set to `now`. Facts listed in `skip` were merged by the current run and are
    /// already resolved against the staged dimensions.
    pub async fn correct(
        &self,
        index: &DimensionIndex,
        corrections: &[Correction],
        skip: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> Result<Vec<FactRow>> {
        let mut repointed: BTreeMap<String, FactRow> = BTreeMap::new();

        for correction in corrections {
            let facts = self
                .store
                .facts_referencing(
                    &correction.dimension,
                    &correction.business_key,
                    correction.effective_from,
                    correction.effective_to,
                )
                .await?;

            for fact in facts {
                if skip.contains(&fact.transaction_id) {
                    continue;
                }

                let (fact, seen) = match repointed.remove(&fact.transaction_id) {
                    Some(staged) => (staged, true),
                    None => (fact, false),
                };

                match repoint(index, fact, &correction.dimension, now) {
                    Ok(fact) => {
                        repointed.insert(fact.transaction_id.to_owned(), fact);
                    }
                    Err(fact) if seen => {
                        repointed.insert(fact.transaction_id.to_owned(), fact);
                    }
                    Err(_) => {}
                }
            }
        }

        debug!(
            "{} corrections re-pointed {} facts",
            corrections.len(),
            repointed.len()
        );

        Ok(repointed.into_values().collect())
    }

    /// Re-resolves every reference of the facts loaded at or after `since` and commits
    /// the facts whose references were stale.
    ///
    /// The fact table is leased for the duration of the rescan, so it fails with
    /// [`MergeError::LockHeld`](crate::MergeError::LockHeld) while a run is loading facts.
    pub async fn rescan_loaded_since(
        &self,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<FactRow>> {
        let owner = Uuid::new_v4();
        let resources = vec![FACT_SCOPE.to_owned()];
        let ttl = chrono::Duration::from_std(self.lease_ttl).map_err(anyhow::Error::from)?;

        self.store.acquire(owner, &resources, ttl).await?;

        let res = self
            .rescan(since, now, LeaseClaim { owner, resources })
            .await;

        if let Err(e) = self.store.release(owner).await {
            error!("rescan {owner} failed to release its lease: {e}");
        }

        res
    }

    async fn rescan(
        &self,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
        lease: LeaseClaim,
    ) -> Result<Vec<FactRow>> {
        let facts = self.store.facts_loaded_since(since).await?;

        let mut index = DimensionIndex::new();
        let mut keys: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for fact in &facts {
            for (dimension, reference) in &fact.dimension_keys {
                keys.entry(dimension.to_owned())
                    .or_default()
                    .push(reference.business_key.to_owned());
            }
        }

        for (dimension, business_keys) in keys {
            let business_keys = index.missing(&dimension, &business_keys);
            let rows = self
                .store
                .dimension_versions(&dimension, &business_keys)
                .await?;
            index.load(&dimension, &business_keys, rows);
        }

        let mut repointed = vec![];
        for fact in facts {
            let dimensions = fact.dimension_keys.keys().cloned().collect::<Vec<_>>();
            let mut fact = fact;
            let mut changed = false;

            for dimension in dimensions {
                match repoint(&index, fact, &dimension, now) {
                    Ok(next) => {
                        fact = next;
                        changed = true;
                    }
                    Err(next) => fact = next,
                }
            }

            if changed {
                repointed.push(fact);
            }
        }

        info!(
            "rescan of facts loaded since {since} re-pointed {}",
            repointed.len()
        );

        self.store
            .commit(ChangeSet {
                lease: Some(lease),
                facts: repointed.clone(),
                ..ChangeSet::default()
            })
            .await?;

        Ok(repointed)
    }
}

/// Points the `dimension` reference of `fact` at the version valid on its event date.
///
/// Returns `Err` with the fact unchanged when the reference is already right or cannot be
/// resolved.
fn repoint(
    index: &DimensionIndex,
    mut fact: FactRow,
    dimension: &str,
    now: DateTime<Utc>,
) -> std::result::Result<FactRow, FactRow> {
    let Some(reference) = fact.dimension_keys.get(dimension) else {
        return Err(fact);
    };

    let surrogate_key = match index.resolve(dimension, &reference.business_key, fact.event_date) {
        Ok(row) => row.surrogate_key,
        Err(e) => {
            warn!("fact `{}` keeps its reference: {e}", fact.transaction_id);
            return Err(fact);
        }
    };

    if surrogate_key == reference.surrogate_key {
        return Err(fact);
    }

    if let Some(reference) = fact.dimension_keys.get_mut(dimension) {
        reference.surrogate_key = surrogate_key;
    }
    fact.load_timestamp = now;

    Ok(fact)
}
