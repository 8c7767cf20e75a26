use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use sqlx::{types::Json, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::{
    engine::Engine,
    error::{Result, StoreError},
    store::{
        ChangeSet, DimensionRow, FactRow, LeaseClaim, QuarantineRow, RunStatus, Store, Watermark,
    },
};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    prefix: Option<String>,
}

impl PgStore {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(pool: &PgPool) -> Store {
        Store::new(Self {
            pool: pool.clone(),
            prefix: None,
        })
    }

    pub fn with_prefix(pool: &PgPool, prefix: impl Into<String>) -> Store {
        Store::new(Self {
            pool: pool.clone(),
            prefix: Some(prefix.into()),
        })
    }

    pub fn table(&self, name: impl Into<String>) -> String {
        format!(
            "{}_{}",
            self.prefix.as_deref().unwrap_or("sm"),
            name.into()
        )
    }

    pub fn table_dimension(&self) -> String {
        self.table("dimension")
    }

    pub fn table_fact(&self) -> String {
        self.table("fact")
    }

    pub fn table_watermark(&self) -> String {
        self.table("watermark")
    }

    pub fn table_quarantine(&self) -> String {
        self.table("quarantine")
    }

    pub fn table_lease(&self) -> String {
        self.table("lease")
    }

    /// Locks the claimed leases for the rest of the transaction and checks they are still
    /// held by the claiming run.
    async fn check_lease(
        &self,
        tx: &mut sqlx::Transaction<'_, Postgres>,
        claim: &LeaseClaim,
    ) -> Result<()> {
        let table_lease = self.table_lease();

        let leases = sqlx::query_as::<_, (String, Uuid, DateTime<Utc>)>(
            format!(
                "SELECT resource, owner, expires_at FROM {table_lease} WHERE resource = ANY($1) FOR UPDATE"
            )
            .as_str(),
        )
        .bind(&claim.resources)
        .fetch_all(&mut **tx)
        .await?;

        let now = Utc::now();
        for resource in &claim.resources {
            match leases.iter().find(|(r, _, _)| r == resource) {
                Some((_, owner, _)) if *owner != claim.owner => {
                    return Err(StoreError::LeaseHeld {
                        resource: resource.to_owned(),
                        owner: *owner,
                    });
                }
                Some((_, _, expires_at)) if *expires_at > now => {}
                _ => {
                    return Err(StoreError::LeaseExpired {
                        resource: resource.to_owned(),
                        owner: claim.owner,
                    });
                }
            }
        }

        Ok(())
    }

    async fn upsert_dimension_rows(
        &self,
        tx: &mut sqlx::Transaction<'_, Postgres>,
        rows: &[&DimensionRow],
    ) -> Result<()> {
        let table_dimension = self.table_dimension();

        for rows in rows.chunks(100) {
            let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {table_dimension} (dimension, surrogate_key, business_key, attributes, effective_from, effective_to, is_current, version, changed_at) "
            ));

            query_builder.push_values(rows, |mut b, row| {
                b.push_bind(row.dimension.to_owned())
                    .push_bind(row.surrogate_key)
                    .push_bind(row.business_key.to_owned())
                    .push_bind(Json(row.attributes.clone()))
                    .push_bind(row.effective_from)
                    .push_bind(row.effective_to)
                    .push_bind(row.is_current)
                    .push_bind(row.version)
                    .push_bind(row.changed_at);
            });

            query_builder.push(
                r#"
                ON CONFLICT (dimension, surrogate_key) DO UPDATE SET
                    attributes = EXCLUDED.attributes,
                    effective_from = EXCLUDED.effective_from,
                    effective_to = EXCLUDED.effective_to,
                    is_current = EXCLUDED.is_current,
                    version = EXCLUDED.version,
                    changed_at = EXCLUDED.changed_at
                "#,
            );

            query_builder.build().execute(&mut **tx).await?;
        }

        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct WatermarkRow {
    source_name: String,
    last_processed_value: DateTime<Utc>,
    last_run_status: String,
    updated_at: DateTime<Utc>,
}

impl TryFrom<WatermarkRow> for Watermark {
    type Error = StoreError;

    fn try_from(row: WatermarkRow) -> Result<Self> {
        Ok(Watermark {
            source_name: row.source_name,
            last_processed_value: row.last_processed_value,
            last_run_status: row.last_run_status.parse()?,
            updated_at: row.updated_at,
        })
    }
}

#[async_trait]
impl Engine for PgStore {
    async fn acquire(&self, owner: Uuid, resources: &[String], ttl: Duration) -> Result<()> {
        let table_lease = self.table_lease();
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        for resource in resources {
            let acquired = sqlx::query_as::<_, (Uuid,)>(
                format!(
                    r#"
                INSERT INTO {table_lease} (resource, owner, expires_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (resource)
                DO
                    UPDATE SET owner = EXCLUDED.owner, expires_at = EXCLUDED.expires_at
                    WHERE {table_lease}.owner = EXCLUDED.owner OR {table_lease}.expires_at < $4
                RETURNING owner
                "#
                )
                .as_str(),
            )
            .bind(resource)
            .bind(owner)
            .bind(now + ttl)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;

            if acquired.is_none() {
                let (holder,) = sqlx::query_as::<_, (Uuid,)>(
                    format!("SELECT owner FROM {table_lease} WHERE resource = $1").as_str(),
                )
                .bind(resource)
                .fetch_one(&mut *tx)
                .await?;

                tx.rollback().await?;

                return Err(StoreError::LeaseHeld {
                    resource: resource.to_owned(),
                    owner: holder,
                });
            }
        }

        tx.commit().await?;

        Ok(())
    }

    async fn release(&self, owner: Uuid) -> Result<()> {
        let table_lease = self.table_lease();

        sqlx::query(format!("DELETE FROM {table_lease} WHERE owner = $1").as_str())
            .bind(owner)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn watermark(&self, source_name: &str) -> Result<Option<Watermark>> {
        let table_watermark = self.table_watermark();

        let row = sqlx::query_as::<_, WatermarkRow>(
            format!("SELECT * FROM {table_watermark} WHERE source_name = $1").as_str(),
        )
        .bind(source_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Watermark::try_from).transpose()
    }

    async fn set_run_status(&self, source_name: &str, status: RunStatus) -> Result<()> {
        let table_watermark = self.table_watermark();

        sqlx::query(
            format!(
                r#"
            UPDATE {table_watermark}
            SET last_run_status = $2, updated_at = $3
            WHERE source_name = $1
            "#
            )
            .as_str(),
        )
        .bind(source_name)
        .bind(status.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn dimension_versions(
        &self,
        dimension: &str,
        business_keys: &[String],
    ) -> Result<Vec<DimensionRow>> {
        let table_dimension = self.table_dimension();

        let rows = sqlx::query_as::<_, DimensionRow>(
            format!(
                r#"
                SELECT * FROM {table_dimension}
                WHERE dimension = $1 AND business_key = ANY($2)
                ORDER BY business_key ASC, version ASC
                "#
            )
            .as_str(),
        )
        .bind(dimension)
        .bind(business_keys)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn existing_surrogate_keys(
        &self,
        dimension: &str,
        surrogate_keys: &[Uuid],
    ) -> Result<Vec<Uuid>> {
        let table_dimension = self.table_dimension();

        let rows = sqlx::query_as::<_, (Uuid,)>(
            format!(
                "SELECT surrogate_key FROM {table_dimension} WHERE dimension = $1 AND surrogate_key = ANY($2)"
            )
            .as_str(),
        )
        .bind(dimension)
        .bind(surrogate_keys)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(key,)| key).collect())
    }

    async fn facts(&self, transaction_ids: &[String]) -> Result<Vec<FactRow>> {
        let table_fact = self.table_fact();

        let facts = sqlx::query_as::<_, FactRow>(
            format!("SELECT * FROM {table_fact} WHERE transaction_id = ANY($1)").as_str(),
        )
        .bind(transaction_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(facts)
    }

    async fn facts_referencing(
        &self,
        dimension: &str,
        business_key: &str,
        from: NaiveDate,
        to: Option<NaiveDate>,
    ) -> Result<Vec<FactRow>> {
        let table_fact = self.table_fact();

        let facts = sqlx::query_as::<_, FactRow>(
            format!(
                r#"
                SELECT * FROM {table_fact}
                WHERE dimension_keys -> $1 ->> 'business_key' = $2
                    AND event_date >= $3
                    AND ($4::date IS NULL OR event_date < $4)
                ORDER BY transaction_id ASC
                "#
            )
            .as_str(),
        )
        .bind(dimension)
        .bind(business_key)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        Ok(facts)
    }

    async fn facts_loaded_since(&self, since: DateTime<Utc>) -> Result<Vec<FactRow>> {
        let table_fact = self.table_fact();

        let facts = sqlx::query_as::<_, FactRow>(
            format!(
                "SELECT * FROM {table_fact} WHERE load_timestamp >= $1 ORDER BY transaction_id ASC"
            )
            .as_str(),
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(facts)
    }

    async fn count_facts(&self) -> Result<u64> {
        let table_fact = self.table_fact();

        let (count,) =
            sqlx::query_as::<_, (i64,)>(format!("SELECT COUNT(*) FROM {table_fact}").as_str())
                .fetch_one(&self.pool)
                .await?;

        Ok(u64::try_from(count)?)
    }

    async fn quarantined(&self, source: Option<&str>) -> Result<Vec<QuarantineRow>> {
        let table_quarantine = self.table_quarantine();

        let rows = sqlx::query_as::<_, QuarantineRow>(
            format!(
                r#"
                SELECT * FROM {table_quarantine}
                WHERE ($1::varchar IS NULL OR source = $1)
                ORDER BY quarantined_at ASC, id ASC
                "#
            )
            .as_str(),
        )
        .bind(source)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn commit(&self, changes: ChangeSet) -> Result<()> {
        let table_fact = self.table_fact();
        let table_quarantine = self.table_quarantine();
        let table_watermark = self.table_watermark();
        let mut tx = self.pool.begin().await?;

        if let Some(claim) = &changes.lease {
            self.check_lease(&mut tx, claim).await?;
        }

        // closed versions first, the partial unique index allows one current row per key
        let (current, closed): (Vec<&DimensionRow>, Vec<&DimensionRow>) = changes
            .dimension_rows
            .iter()
            .partition(|row| row.is_current);

        self.upsert_dimension_rows(&mut tx, &closed).await?;
        self.upsert_dimension_rows(&mut tx, &current).await?;

        for facts in changes.facts.chunks(100) {
            let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {table_fact} (transaction_id, source, event_timestamp, event_date, dimension_keys, quantity, amount_minor, currency, changed_at, load_timestamp) "
            ));

            query_builder.push_values(facts, |mut b, fact| {
                b.push_bind(fact.transaction_id.to_owned())
                    .push_bind(fact.source.to_owned())
                    .push_bind(fact.event_timestamp)
                    .push_bind(fact.event_date)
                    .push_bind(Json(fact.dimension_keys.clone()))
                    .push_bind(fact.quantity)
                    .push_bind(fact.amount_minor)
                    .push_bind(fact.currency.to_owned())
                    .push_bind(fact.changed_at)
                    .push_bind(fact.load_timestamp);
            });

            query_builder.push(
                r#"
                ON CONFLICT (transaction_id) DO UPDATE SET
                    source = EXCLUDED.source,
                    event_timestamp = EXCLUDED.event_timestamp,
                    event_date = EXCLUDED.event_date,
                    dimension_keys = EXCLUDED.dimension_keys,
                    quantity = EXCLUDED.quantity,
                    amount_minor = EXCLUDED.amount_minor,
                    currency = EXCLUDED.currency,
                    changed_at = EXCLUDED.changed_at,
                    load_timestamp = EXCLUDED.load_timestamp
                "#,
            );

            query_builder.build().execute(&mut *tx).await?;
        }

        if !changes.resolved.is_empty() {
            sqlx::query(format!("DELETE FROM {table_quarantine} WHERE id = ANY($1)").as_str())
                .bind(&changes.resolved)
                .execute(&mut *tx)
                .await?;
        }

        for rows in changes.quarantine.chunks(100) {
            let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {table_quarantine} (id, run_id, source, record_key, reason, payload, quarantined_at) "
            ));

            query_builder.push_values(rows, |mut b, row| {
                b.push_bind(row.id)
                    .push_bind(row.run_id)
                    .push_bind(row.source.to_owned())
                    .push_bind(row.record_key.to_owned())
                    .push_bind(row.reason.to_owned())
                    .push_bind(row.payload.clone())
                    .push_bind(row.quarantined_at);
            });

            query_builder.build().execute(&mut *tx).await?;
        }

        for watermark in changes.watermarks.iter() {
            let advanced = sqlx::query_as::<_, (String,)>(
                format!(
                    r#"
                INSERT INTO {table_watermark} (source_name, last_processed_value, last_run_status, updated_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (source_name)
                DO
                    UPDATE SET
                        last_processed_value = EXCLUDED.last_processed_value,
                        last_run_status = EXCLUDED.last_run_status,
                        updated_at = EXCLUDED.updated_at
                    WHERE {table_watermark}.last_processed_value <= EXCLUDED.last_processed_value
                RETURNING source_name
                "#
                )
                .as_str(),
            )
            .bind(&watermark.source_name)
            .bind(watermark.last_processed_value)
            .bind(watermark.last_run_status.as_str())
            .bind(watermark.updated_at)
            .fetch_optional(&mut *tx)
            .await?;

            if advanced.is_none() {
                let current = sqlx::query_as::<_, WatermarkRow>(
                    format!("SELECT * FROM {table_watermark} WHERE source_name = $1").as_str(),
                )
                .bind(&watermark.source_name)
                .fetch_one(&mut *tx)
                .await?;

                tx.rollback().await?;

                return Err(StoreError::WatermarkRegression {
                    source_name: watermark.source_name.to_owned(),
                    current: current.last_processed_value,
                    next: watermark.last_processed_value,
                });
            }
        }

        tx.commit().await?;

        Ok(())
    }
}
