use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};
use uuid::Uuid;

use crate::{
    engine::Engine,
    error::{Result, StoreError},
    store::{ChangeSet, DimensionRow, FactRow, QuarantineRow, RunStatus, Store, Watermark},
};

#[derive(Debug, Clone)]
struct Lease {
    owner: Uuid,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Tables {
    dimensions: HashMap<String, HashMap<String, Vec<DimensionRow>>>,
    facts: HashMap<String, FactRow>,
    watermarks: HashMap<String, Watermark>,
    quarantine: Vec<QuarantineRow>,
    leases: HashMap<String, Lease>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore(Arc<RwLock<Tables>>);

impl MemoryStore {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> Store {
        Store::new(Self::default())
    }
}

#[async_trait]
impl Engine for MemoryStore {
    async fn acquire(&self, owner: Uuid, resources: &[String], ttl: Duration) -> Result<()> {
        let mut tables = self.0.write();
        let now = Utc::now();

        for resource in resources {
            if let Some(lease) = tables.leases.get(resource) {
                if lease.owner != owner && lease.expires_at > now {
                    return Err(StoreError::LeaseHeld {
                        resource: resource.to_owned(),
                        owner: lease.owner,
                    });
                }
            }
        }

        for resource in resources {
            tables.leases.insert(
                resource.to_owned(),
                Lease {
                    owner,
                    expires_at: now + ttl,
                },
            );
        }

        Ok(())
    }

    async fn release(&self, owner: Uuid) -> Result<()> {
        self.0.write().leases.retain(|_, lease| lease.owner != owner);

        Ok(())
    }

    async fn watermark(&self, source_name: &str) -> Result<Option<Watermark>> {
        Ok(self.0.read().watermarks.get(source_name).cloned())
    }

    async fn set_run_status(&self, source_name: &str, status: RunStatus) -> Result<()> {
        if let Some(watermark) = self.0.write().watermarks.get_mut(source_name) {
            watermark.last_run_status = status;
            watermark.updated_at = Utc::now();
        }

        Ok(())
    }

    async fn dimension_versions(
        &self,
        dimension: &str,
        business_keys: &[String],
    ) -> Result<Vec<DimensionRow>> {
        let tables = self.0.read();
        let Some(members) = tables.dimensions.get(dimension) else {
            return Ok(vec![]);
        };

        Ok(business_keys
            .iter()
            .filter_map(|key| members.get(key))
            .flatten()
            .cloned()
            .collect())
    }

    async fn existing_surrogate_keys(
        &self,
        dimension: &str,
        surrogate_keys: &[Uuid],
    ) -> Result<Vec<Uuid>> {
        let tables = self.0.read();
        let Some(members) = tables.dimensions.get(dimension) else {
            return Ok(vec![]);
        };

        Ok(members
            .values()
            .flatten()
            .map(|row| row.surrogate_key)
            .filter(|key| surrogate_keys.contains(key))
            .collect())
    }

    async fn facts(&self, transaction_ids: &[String]) -> Result<Vec<FactRow>> {
        let tables = self.0.read();

        Ok(transaction_ids
            .iter()
            .filter_map(|id| tables.facts.get(id))
            .cloned()
            .collect())
    }

    async fn facts_referencing(
        &self,
        dimension: &str,
        business_key: &str,
        from: NaiveDate,
        to: Option<NaiveDate>,
    ) -> Result<Vec<FactRow>> {
        let tables = self.0.read();

        let mut facts = tables
            .facts
            .values()
            .filter(|fact| {
                fact.dimension_keys
                    .get(dimension)
                    .is_some_and(|r| r.business_key == business_key)
                    && fact.event_date >= from
                    && to.map_or(true, |to| fact.event_date < to)
            })
            .cloned()
            .collect::<Vec<_>>();

        facts.sort_by(|a, b| a.transaction_id.cmp(&b.transaction_id));

        Ok(facts)
    }

    async fn facts_loaded_since(&self, since: DateTime<Utc>) -> Result<Vec<FactRow>> {
        let tables = self.0.read();

        let mut facts = tables
            .facts
            .values()
            .filter(|fact| fact.load_timestamp >= since)
            .cloned()
            .collect::<Vec<_>>();

        facts.sort_by(|a, b| a.transaction_id.cmp(&b.transaction_id));

        Ok(facts)
    }

    async fn count_facts(&self) -> Result<u64> {
        Ok(u64::try_from(self.0.read().facts.len())?)
    }

    async fn quarantined(&self, source: Option<&str>) -> Result<Vec<QuarantineRow>> {
        Ok(self
            .0
            .read()
            .quarantine
            .iter()
            .filter(|row| source.map_or(true, |source| row.source == source))
            .cloned()
            .collect())
    }

    async fn commit(&self, changes: ChangeSet) -> Result<()> {
        let mut tables = self.0.write();

        // checked before anything is applied so a rejected commit leaves no trace
        if let Some(claim) = &changes.lease {
            let now = Utc::now();

            for resource in &claim.resources {
                match tables.leases.get(resource) {
                    Some(lease) if lease.owner != claim.owner => {
                        return Err(StoreError::LeaseHeld {
                            resource: resource.to_owned(),
                            owner: lease.owner,
                        });
                    }
                    Some(lease) if lease.expires_at > now => {}
                    _ => {
                        return Err(StoreError::LeaseExpired {
                            resource: resource.to_owned(),
                            owner: claim.owner,
                        });
                    }
                }
            }
        }

        for watermark in changes.watermarks.iter() {
            if let Some(current) = tables.watermarks.get(&watermark.source_name) {
                if watermark.last_processed_value < current.last_processed_value {
                    return Err(StoreError::WatermarkRegression {
                        source_name: watermark.source_name.to_owned(),
                        current: current.last_processed_value,
                        next: watermark.last_processed_value,
                    });
                }
            }
        }

        for row in changes.dimension_rows {
            let versions = tables
                .dimensions
                .entry(row.dimension.to_owned())
                .or_default()
                .entry(row.business_key.to_owned())
                .or_default();

            match versions
                .iter_mut()
                .find(|existing| existing.surrogate_key == row.surrogate_key)
            {
                Some(existing) => *existing = row,
                _ => versions.push(row),
            }

            versions.sort_by_key(|row| row.version);
        }

        for fact in changes.facts {
            tables.facts.insert(fact.transaction_id.to_owned(), fact);
        }

        tables
            .quarantine
            .retain(|row| !changes.resolved.contains(&row.id));
        tables.quarantine.extend(changes.quarantine);

        for watermark in changes.watermarks {
            tables
                .watermarks
                .insert(watermark.source_name.to_owned(), watermark);
        }

        Ok(())
    }
}
