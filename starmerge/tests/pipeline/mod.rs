use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parse_display::Display;
use serde_json::{json, Value};
use starmerge::{
    ConfigBuilder, CustomerChange, Feed, KeyResolver, MemoryFeed, MergeError, Pipeline,
    PipelineConfig, PriceChange, ProductChange, RunPhase, RunStatus, SaleChange, Store,
    UnresolvedPolicy, UNKNOWN_MEMBER,
};
use uuid::Uuid;

#[derive(Display, Clone, Copy)]
#[display(style = "snake_case")]
pub enum Source {
    Customers,
    Products,
    Prices,
    Sales,
}

impl Source {
    fn of(&self, organization: &str) -> String {
        format!("{organization}.{self}")
    }
}

#[derive(Clone, Default)]
pub struct Feeds {
    pub customers: MemoryFeed,
    pub products: MemoryFeed,
    pub prices: MemoryFeed,
    pub sales: MemoryFeed,
}

impl Feeds {
    pub fn pipeline(&self, store: &Store, organization: &str, config: PipelineConfig) -> Pipeline {
        Pipeline::new(store.clone())
            .config(config)
            .dimension::<CustomerChange>(Source::Customers.of(organization), self.customers.clone())
            .dimension::<ProductChange>(Source::Products.of(organization), self.products.clone())
            .dimension::<PriceChange>(Source::Prices.of(organization), self.prices.clone())
            .facts::<SaleChange>(Source::Sales.of(organization), self.sales.clone())
    }
}

#[derive(Clone)]
struct SlowFeed(Duration);

#[async_trait]
impl Feed for SlowFeed {
    async fn fetch(&self, _after: Option<DateTime<Utc>>) -> anyhow::Result<Vec<Value>> {
        tokio::time::sleep(self.0).await;

        Ok(vec![])
    }
}

fn ts(value: &str) -> DateTime<Utc> {
    value.parse().unwrap()
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn customer(id: &str, city: &str, updated_at: &str, effective_from: Option<&str>) -> Value {
    let mut row = json!({
        "customer_id": id,
        "name": format!("Customer {id}"),
        "city": city,
        "country": "IN",
        "segment": "retail",
        "updated_at": updated_at,
    });

    if let Some(from) = effective_from {
        row["effective_from"] = json!(from);
    }

    row
}

fn sale(id: &str, customer_id: &str, sold_at: &str, quantity: i64, updated_at: &str) -> Value {
    json!({
        "transaction_id": id,
        "customer_id": customer_id,
        "product_id": "SKU-1",
        "sold_at": sold_at,
        "quantity": quantity,
        "amount_minor": quantity.abs() * 1500,
        "currency": "INR",
        "updated_at": updated_at,
    })
}

fn with_policy(policy: UnresolvedPolicy) -> PipelineConfig {
    ConfigBuilder::new().unresolved_policy(policy).build()
}

/// Loads CUST-1 living in Delhi since 2025-01-01 and product SKU-1 with its price.
async fn seed(store: &Store, feeds: &Feeds, config: PipelineConfig) -> Result<()> {
    feeds.customers.push(customer(
        "CUST-1",
        "Delhi",
        "2025-01-01T08:00:00Z",
        Some("2025-01-01"),
    ));
    feeds.products.push(json!({
        "product_id": "SKU-1",
        "name": "Masala chai",
        "category": "tea",
        "brand": "Chai Co",
        "updated_at": "2025-01-01T08:00:00Z",
        "effective_from": "2025-01-01",
    }));
    feeds.prices.push(json!({
        "product_id": "SKU-1",
        "list_price_minor": 1500,
        "currency": "INR",
        "updated_at": "2025-01-01T08:00:00Z",
        "effective_from": "2025-01-01",
    }));

    let outcome = feeds
        .pipeline(store, "org_a", config)
        .run_at(ts("2025-01-01T12:00:00Z"))
        .await?;

    assert_eq!(outcome.phase, RunPhase::Committed);
    assert_eq!(outcome.status, RunStatus::Succeeded);

    Ok(())
}

/// CUST-1 moves to Mumbai on 2025-06-01, with one sale before and one after the move.
async fn move_customer(store: &Store, feeds: &Feeds) -> Result<()> {
    seed(store, feeds, PipelineConfig::default()).await?;

    feeds
        .customers
        .push(customer("CUST-1", "Mumbai", "2025-06-01T08:00:00Z", None));
    feeds.sales.extend([
        sale("T-1", "CUST-1", "2025-05-01T10:00:00Z", 1, "2025-06-01T09:00:00Z"),
        sale("T-2", "CUST-1", "2025-06-01T10:00:00Z", 2, "2025-06-01T09:00:00Z"),
    ]);

    let outcome = feeds
        .pipeline(store, "org_a", PipelineConfig::default())
        .run_at(ts("2025-06-01T12:00:00Z"))
        .await?;

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(outcome.counts.received, 2);
    assert_eq!(outcome.counts.inserted, 2);

    let customers = outcome
        .dimensions
        .iter()
        .find(|d| d.dimension == "customer")
        .unwrap();
    assert_eq!(customers.counts.updated, 1);

    Ok(())
}

pub async fn test_customer_moves(store: &Store) -> Result<()> {
    let feeds = Feeds::default();
    move_customer(store, &feeds).await?;

    let history = store.dimension_history("customer", "CUST-1").await?;
    assert_eq!(history.len(), 2);

    assert_eq!(history[0].attributes["city"], json!("Delhi"));
    assert_eq!(history[0].effective_from, date(2025, 1, 1));
    assert_eq!(history[0].effective_to, Some(date(2025, 6, 1)));
    assert!(!history[0].is_current);

    assert_eq!(history[1].attributes["city"], json!("Mumbai"));
    assert_eq!(history[1].effective_from, date(2025, 6, 1));
    assert_eq!(history[1].effective_to, None);
    assert!(history[1].is_current);
    assert_eq!(history[1].version, 2);

    let before = store.fact("T-1").await?.unwrap();
    assert_eq!(before.surrogate_key("customer"), Some(history[0].surrogate_key));

    let after = store.fact("T-2").await?.unwrap();
    assert_eq!(after.surrogate_key("customer"), Some(history[1].surrogate_key));
    assert_eq!(after.amount_minor, 3000);

    let watermark = store.watermark("org_a.customers").await?.unwrap();
    assert_eq!(watermark.last_processed_value, ts("2025-06-01T08:00:00Z"));

    let watermark = store.watermark("org_a.sales").await?.unwrap();
    assert_eq!(watermark.last_processed_value, ts("2025-06-01T09:00:00Z"));
    assert_eq!(watermark.last_run_status, RunStatus::Succeeded);

    Ok(())
}

pub async fn test_historical_resolution(store: &Store) -> Result<()> {
    let feeds = Feeds::default();
    move_customer(store, &feeds).await?;

    feeds.sales.push(sale(
        "T-3",
        "CUST-1",
        "2025-05-15T10:00:00Z",
        1,
        "2025-06-02T09:00:00Z",
    ));

    let outcome = feeds
        .pipeline(store, "org_a", PipelineConfig::default())
        .run_at(ts("2025-06-02T12:00:00Z"))
        .await?;
    assert_eq!(outcome.counts.inserted, 1);

    let history = store.dimension_history("customer", "CUST-1").await?;
    let late = store.fact("T-3").await?.unwrap();
    assert_eq!(late.surrogate_key("customer"), Some(history[0].surrogate_key));

    let resolver = KeyResolver::new(store.clone());
    assert_eq!(
        resolver.resolve("customer", "CUST-1", date(2025, 5, 1)).await?,
        history[0].surrogate_key
    );
    assert_eq!(
        resolver.resolve("customer", "CUST-1", date(2025, 6, 2)).await?,
        history[1].surrogate_key
    );

    let res = resolver.resolve("customer", "CUST-1", date(2024, 12, 1)).await;
    assert!(matches!(res, Err(MergeError::NoVersionAtDate { .. })));

    Ok(())
}

pub async fn test_retroactive_split(store: &Store) -> Result<()> {
    let feeds = Feeds::default();
    move_customer(store, &feeds).await?;

    feeds.customers.push(customer(
        "CUST-1",
        "Noida",
        "2025-06-03T08:00:00Z",
        Some("2025-04-01"),
    ));

    let outcome = feeds
        .pipeline(store, "org_a", PipelineConfig::default())
        .run_at(ts("2025-06-03T12:00:00Z"))
        .await?;

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(outcome.counts.repointed, 1);

    let history = store.dimension_history("customer", "CUST-1").await?;
    let cities = history
        .iter()
        .map(|row| {
            (
                row.attributes["city"].clone(),
                row.effective_from,
                row.effective_to,
                row.is_current,
                row.version,
            )
        })
        .collect::<Vec<_>>();

    assert_eq!(
        cities,
        vec![
            (json!("Delhi"), date(2025, 1, 1), Some(date(2025, 4, 1)), false, 1),
            (json!("Noida"), date(2025, 4, 1), Some(date(2025, 6, 1)), false, 2),
            (json!("Mumbai"), date(2025, 6, 1), None, true, 3),
        ]
    );

    let repointed = store.fact("T-1").await?.unwrap();
    assert_eq!(repointed.surrogate_key("customer"), Some(history[1].surrogate_key));
    assert_eq!(repointed.load_timestamp, ts("2025-06-03T12:00:00Z"));

    let untouched = store.fact("T-2").await?.unwrap();
    assert_eq!(untouched.surrogate_key("customer"), Some(history[2].surrogate_key));
    assert_eq!(untouched.load_timestamp, ts("2025-06-01T12:00:00Z"));

    Ok(())
}

pub async fn test_duplicate_transaction(store: &Store) -> Result<()> {
    let feeds = Feeds::default();
    seed(store, &feeds, PipelineConfig::default()).await?;

    feeds.sales.extend([
        sale("T-1", "CUST-1", "2025-02-01T08:00:00Z", 1, "2025-02-01T09:00:00Z"),
        sale("T-1", "CUST-1", "2025-02-01T08:00:00Z", 3, "2025-02-01T10:00:00Z"),
    ]);

    let outcome = feeds
        .pipeline(store, "org_a", PipelineConfig::default())
        .run_at(ts("2025-02-01T12:00:00Z"))
        .await?;

    assert_eq!(outcome.counts.received, 2);
    assert_eq!(outcome.counts.deduplicated, 1);
    assert_eq!(outcome.counts.inserted, 1);
    assert_eq!(store.count_facts().await?, 1);
    assert_eq!(store.fact("T-1").await?.unwrap().quantity, 3);

    feeds.sales.push(sale(
        "T-1",
        "CUST-1",
        "2025-02-01T08:00:00Z",
        5,
        "2025-02-02T09:00:00Z",
    ));

    let outcome = feeds
        .pipeline(store, "org_a", PipelineConfig::default())
        .run_at(ts("2025-02-02T12:00:00Z"))
        .await?;

    assert_eq!(outcome.counts.updated, 1);
    assert_eq!(store.count_facts().await?, 1);

    let fact = store.fact("T-1").await?.unwrap();
    assert_eq!(fact.quantity, 5);
    assert_eq!(fact.amount_minor, 7500);
    assert_eq!(fact.load_timestamp, ts("2025-02-02T12:00:00Z"));

    Ok(())
}

pub async fn test_idempotent_rerun(store: &Store) -> Result<()> {
    let feeds = Feeds::default();
    seed(store, &feeds, PipelineConfig::default()).await?;

    feeds.sales.push(sale(
        "T-1",
        "CUST-1",
        "2025-02-01T08:00:00Z",
        1,
        "2025-02-01T09:00:00Z",
    ));

    feeds
        .pipeline(store, "org_a", PipelineConfig::default())
        .run_at(ts("2025-02-01T12:00:00Z"))
        .await?;

    let history = store.dimension_history("customer", "CUST-1").await?;
    let fact = store.fact("T-1").await?.unwrap();

    let outcome = feeds
        .pipeline(store, "org_a", PipelineConfig::default())
        .run_at(ts("2025-02-02T12:00:00Z"))
        .await?;

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(outcome.counts.received, 0);
    assert!(outcome.dimensions.iter().all(|d| d.counts.received == 0));

    // Same rows delivered again under other source names skip the watermark filter.
    let outcome = feeds
        .pipeline(store, "replay", PipelineConfig::default())
        .run_at(ts("2025-02-03T12:00:00Z"))
        .await?;

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(outcome.counts.received, 1);
    assert_eq!(outcome.counts.unchanged, 1);
    assert!(outcome
        .dimensions
        .iter()
        .all(|d| d.counts.unchanged == 1 && d.counts.inserted == 0 && d.counts.updated == 0));

    assert_eq!(store.dimension_history("customer", "CUST-1").await?, history);
    assert_eq!(store.fact("T-1").await?.unwrap(), fact);
    assert_eq!(store.count_facts().await?, 1);

    Ok(())
}

pub async fn test_watermark_no_regress(store: &Store) -> Result<()> {
    let feeds = Feeds::default();
    seed(store, &feeds, PipelineConfig::default()).await?;

    let pipeline = feeds.pipeline(store, "org_a", PipelineConfig::default());
    let tracker = pipeline.watermarks();

    let watermark = tracker.read_watermark("org_a.customers").await?;
    assert_eq!(watermark.last_processed_value, ts("2025-01-01T08:00:00Z"));
    assert!(matches!(
        tracker.read_watermark("org_a.sales").await,
        Err(MergeError::NotInitialized(_))
    ));

    feeds.customers.push(customer(
        "CUST-2",
        "Pune",
        "2024-12-31T08:00:00Z",
        Some("2024-12-31"),
    ));

    let outcome = pipeline.run_at(ts("2025-01-02T12:00:00Z")).await?;
    let customers = outcome
        .dimensions
        .iter()
        .find(|d| d.dimension == "customer")
        .unwrap();
    assert_eq!(customers.counts.received, 0);
    assert!(store.dimension_history("customer", "CUST-2").await?.is_empty());

    let res = tracker
        .advance_watermark("org_a.customers", ts("2024-12-31T08:00:00Z"))
        .await;
    assert!(matches!(res, Err(MergeError::WatermarkRegression { .. })));

    let watermark = tracker.read_watermark("org_a.customers").await?;
    assert_eq!(watermark.last_processed_value, ts("2025-01-01T08:00:00Z"));

    Ok(())
}

pub async fn test_quarantine(store: &Store) -> Result<()> {
    let config = ConfigBuilder::new()
        .unresolved_policy(UnresolvedPolicy::Quarantine)
        .initial_watermark(ts("2025-01-01T00:00:00Z"))
        .build();

    let feeds = Feeds::default();
    seed(store, &feeds, config.clone()).await?;

    feeds.sales.extend([
        sale("T-1", "CUST-1", "2025-02-01T08:00:00Z", 1, "2025-02-01T09:00:00Z"),
        sale("T-9", "CUST-9", "2025-02-01T08:00:00Z", 1, "2025-02-01T09:00:00Z"),
        json!({"transaction_id": "T-X", "updated_at": "2025-02-01T09:30:00Z"}),
        json!({"transaction_id": "T-OLD", "updated_at": "2024-01-01T00:00:00Z"}),
    ]);

    let outcome = feeds
        .pipeline(store, "org_a", config)
        .run_at(ts("2025-02-01T12:00:00Z"))
        .await?;

    assert_eq!(outcome.status, RunStatus::PartiallySucceeded);
    assert_eq!(outcome.phase, RunPhase::Committed);
    assert_eq!(outcome.quarantined, 2);
    assert_eq!(outcome.counts.received, 3);
    assert_eq!(outcome.counts.inserted, 1);
    assert_eq!(outcome.counts.quarantined, 2);

    let quarantined = store.quarantined(Some("org_a.sales")).await?;
    assert_eq!(quarantined.len(), 2);
    assert!(quarantined
        .iter()
        .any(|q| q.record_key.as_deref() == Some("T-9") && q.reason.contains("CUST-9")));
    assert!(quarantined
        .iter()
        .any(|q| q.record_key.is_none() && q.payload["transaction_id"] == json!("T-X")));

    assert!(store.fact("T-9").await?.is_none());

    let watermark = store.watermark("org_a.sales").await?.unwrap();
    assert_eq!(watermark.last_processed_value, ts("2025-02-01T09:30:00Z"));
    assert_eq!(watermark.last_run_status, RunStatus::PartiallySucceeded);

    Ok(())
}

pub async fn test_abort(store: &Store) -> Result<()> {
    let feeds = Feeds::default();
    seed(store, &feeds, with_policy(UnresolvedPolicy::Abort)).await?;

    feeds
        .customers
        .push(customer("CUST-2", "Pune", "2025-02-01T08:00:00Z", None));
    feeds.sales.extend([
        sale("T-1", "CUST-9", "2025-02-01T08:00:00Z", 1, "2025-02-01T09:00:00Z"),
        sale("T-2", "CUST-8", "2025-02-01T08:00:00Z", 1, "2025-02-01T09:00:00Z"),
        sale("T-3", "CUST-1", "2025-02-01T08:00:00Z", 1, "2025-02-01T09:00:00Z"),
    ]);

    let outcome = feeds
        .pipeline(store, "org_a", with_policy(UnresolvedPolicy::Abort))
        .run_at(ts("2025-02-01T12:00:00Z"))
        .await?;

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.phase, RunPhase::RolledBack);
    match &outcome.failure {
        Some(MergeError::UnresolvedDimensionReference { failures }) => {
            let keys = failures
                .iter()
                .map(|f| f.business_key.as_str())
                .collect::<Vec<_>>();
            assert_eq!(keys, vec!["CUST-9", "CUST-8"]);
        }
        other => panic!("unexpected failure {other:?}"),
    }

    assert_eq!(store.count_facts().await?, 0);
    assert!(store.dimension_history("customer", "CUST-2").await?.is_empty());
    assert!(store.watermark("org_a.sales").await?.is_none());

    let watermark = store.watermark("org_a.customers").await?.unwrap();
    assert_eq!(watermark.last_processed_value, ts("2025-01-01T08:00:00Z"));
    assert_eq!(watermark.last_run_status, RunStatus::Failed);

    Ok(())
}

pub async fn test_unknown_member(store: &Store) -> Result<()> {
    let feeds = Feeds::default();
    seed(store, &feeds, with_policy(UnresolvedPolicy::UnknownMember)).await?;

    feeds.sales.push(sale(
        "T-1",
        "CUST-9",
        "2025-02-01T08:00:00Z",
        1,
        "2025-02-01T09:00:00Z",
    ));

    let outcome = feeds
        .pipeline(store, "org_a", with_policy(UnresolvedPolicy::UnknownMember))
        .run_at(ts("2025-02-01T12:00:00Z"))
        .await?;

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(outcome.counts.inserted, 1);

    let report = outcome.report.as_ref().unwrap();
    assert!(report.passed());
    assert!(!report.check("unknown_member_references").unwrap().passed);

    let unknown = store.dimension_history("customer", UNKNOWN_MEMBER).await?;
    assert_eq!(unknown.len(), 1);
    assert_eq!(unknown[0].surrogate_key, Uuid::nil());

    let fact = store.fact("T-1").await?.unwrap();
    assert_eq!(fact.surrogate_key("customer"), Some(Uuid::nil()));
    assert_eq!(fact.dimension_keys["customer"].business_key, "CUST-9");

    feeds.customers.push(customer(
        "CUST-9",
        "Jaipur",
        "2025-02-02T08:00:00Z",
        Some("2025-01-15"),
    ));

    let outcome = feeds
        .pipeline(store, "org_a", with_policy(UnresolvedPolicy::UnknownMember))
        .run_at(ts("2025-02-02T12:00:00Z"))
        .await?;

    assert_eq!(outcome.counts.repointed, 1);

    let history = store.dimension_history("customer", "CUST-9").await?;
    let fact = store.fact("T-1").await?.unwrap();
    assert_eq!(fact.surrogate_key("customer"), Some(history[0].surrogate_key));

    Ok(())
}

pub async fn test_duplicate_conflict(store: &Store) -> Result<()> {
    let feeds = Feeds::default();
    seed(store, &feeds, PipelineConfig::default()).await?;

    feeds.customers.extend([
        customer("CUST-2", "Pune", "2025-02-01T08:00:00Z", None),
        customer("CUST-2", "Goa", "2025-02-01T08:00:00Z", None),
    ]);

    let outcome = feeds
        .pipeline(store, "org_a", PipelineConfig::default())
        .run_at(ts("2025-02-01T12:00:00Z"))
        .await?;

    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(matches!(
        outcome.failure,
        Some(MergeError::DuplicateBusinessKeyConflict { ref key, .. }) if key == "CUST-2"
    ));
    assert!(store.dimension_history("customer", "CUST-2").await?.is_empty());

    Ok(())
}

pub async fn test_validation_rollback(store: &Store) -> Result<()> {
    let feeds = Feeds::default();
    seed(store, &feeds, PipelineConfig::default()).await?;

    feeds
        .customers
        .push(customer("CUST-2", "Pune", "2025-02-01T08:00:00Z", None));
    feeds.sales.extend([
        sale("T-1", "CUST-1", "2025-02-01T08:00:00Z", -1, "2025-02-01T09:00:00Z"),
        sale("T-2", "CUST-1", "2025-02-01T08:00:00Z", 2, "2025-02-01T09:00:00Z"),
    ]);

    let outcome = feeds
        .pipeline(store, "org_a", PipelineConfig::default())
        .run_at(ts("2025-02-01T12:00:00Z"))
        .await?;

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.phase, RunPhase::RolledBack);
    assert_eq!(outcome.counts.rejected, 1);
    assert!(matches!(
        outcome.failure,
        Some(MergeError::BusinessRuleViolation(ref detail)) if detail.contains("T-1")
    ));

    let report = outcome.report.as_ref().unwrap();
    assert!(!report.passed());
    assert!(!report.check("business_rules").unwrap().passed);
    assert!(report.check("referential_integrity").unwrap().passed);

    assert_eq!(store.count_facts().await?, 0);
    assert!(store.dimension_history("customer", "CUST-2").await?.is_empty());
    assert!(store.watermark("org_a.sales").await?.is_none());

    let watermark = store.watermark("org_a.customers").await?.unwrap();
    assert_eq!(watermark.last_processed_value, ts("2025-01-01T08:00:00Z"));
    assert_eq!(watermark.last_run_status, RunStatus::Failed);

    Ok(())
}

pub async fn test_lock_held(store: &Store) -> Result<()> {
    let feeds = Feeds::default();
    seed(store, &feeds, PipelineConfig::default()).await?;

    let owner = Uuid::new_v4();
    store
        .acquire(owner, &["fact".to_owned()], chrono::Duration::minutes(10))
        .await?;

    let res = feeds
        .pipeline(store, "org_a", PipelineConfig::default())
        .run_at(ts("2025-02-01T12:00:00Z"))
        .await;

    match res {
        Err(MergeError::LockHeld { resource, owner: held_by }) => {
            assert_eq!(resource, "fact");
            assert_eq!(held_by, owner);
        }
        other => panic!("unexpected {other:?}"),
    }

    store.release(owner).await?;

    let outcome = feeds
        .pipeline(store, "org_a", PipelineConfig::default())
        .run_at(ts("2025-02-01T12:00:00Z"))
        .await?;
    assert!(outcome.is_committed());

    Ok(())
}

pub async fn test_feed_timeout(store: &Store) -> Result<()> {
    let config = ConfigBuilder::new()
        .feed_timeout(Duration::from_millis(20))
        .build();

    let res = Pipeline::new(store.clone())
        .config(config)
        .dimension::<CustomerChange>("org_a.customers", SlowFeed(Duration::from_millis(500)))
        .run_at(ts("2025-01-01T12:00:00Z"))
        .await;

    assert!(matches!(res, Err(MergeError::Timeout { .. })));

    // The lease of the failed run is released.
    let owner = Uuid::new_v4();
    store
        .acquire(
            owner,
            &["dimension:customer".to_owned()],
            chrono::Duration::minutes(1),
        )
        .await?;
    store.release(owner).await?;

    Ok(())
}

pub async fn test_resubmit_quarantined(store: &Store) -> Result<()> {
    let config = ConfigBuilder::new()
        .unresolved_policy(UnresolvedPolicy::Quarantine)
        .initial_watermark(ts("2025-01-01T00:00:00Z"))
        .build();

    let feeds = Feeds::default();
    seed(store, &feeds, config.clone()).await?;

    feeds.sales.push(sale(
        "T-9",
        "CUST-9",
        "2025-02-01T08:00:00Z",
        1,
        "2025-02-01T09:00:00Z",
    ));

    let outcome = feeds
        .pipeline(store, "org_a", config.clone())
        .run_at(ts("2025-02-01T12:00:00Z"))
        .await?;

    assert_eq!(outcome.status, RunStatus::PartiallySucceeded);
    assert_eq!(outcome.quarantined, 1);

    let quarantined = store.quarantined(Some("org_a.sales")).await?;
    assert_eq!(quarantined.len(), 1);

    // CUST-9 is still unknown, the quarantined row stays as it is
    let outcome = feeds
        .pipeline(store, "org_a", config.clone())
        .run_at(ts("2025-02-02T12:00:00Z"))
        .await?;

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(outcome.quarantined, 0);
    assert_eq!(outcome.resolved, 0);
    assert_eq!(outcome.counts.received, 1);
    assert_eq!(outcome.counts.quarantined, 1);
    assert_eq!(store.quarantined(Some("org_a.sales")).await?, quarantined);
    assert!(store.fact("T-9").await?.is_none());

    feeds.customers.push(customer(
        "CUST-9",
        "Jaipur",
        "2025-02-03T08:00:00Z",
        Some("2025-01-01"),
    ));

    let outcome = feeds
        .pipeline(store, "org_a", config.clone())
        .run_at(ts("2025-02-03T12:00:00Z"))
        .await?;

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(outcome.resolved, 1);
    assert_eq!(outcome.counts.inserted, 1);
    assert!(store.quarantined(Some("org_a.sales")).await?.is_empty());

    let history = store.dimension_history("customer", "CUST-9").await?;
    let fact = store.fact("T-9").await?.unwrap();
    assert_eq!(fact.surrogate_key("customer"), Some(history[0].surrogate_key));
    assert_eq!(fact.load_timestamp, ts("2025-02-03T12:00:00Z"));

    let watermark = store.watermark("org_a.sales").await?.unwrap();
    assert_eq!(watermark.last_processed_value, ts("2025-02-01T09:00:00Z"));
    assert_eq!(watermark.last_run_status, RunStatus::Succeeded);

    let outcome = feeds
        .pipeline(store, "org_a", config)
        .run_at(ts("2025-02-04T12:00:00Z"))
        .await?;

    assert_eq!(outcome.resolved, 0);
    assert_eq!(outcome.counts.received, 0);
    assert_eq!(store.count_facts().await?, 1);

    Ok(())
}

pub async fn test_malformed_quarantined_once(store: &Store) -> Result<()> {
    let feeds = Feeds::default();
    seed(store, &feeds, PipelineConfig::default()).await?;

    feeds
        .sales
        .push(json!({"transaction_id": "T-X", "quantity": "many"}));

    let outcome = feeds
        .pipeline(store, "org_a", PipelineConfig::default())
        .run_at(ts("2025-02-01T12:00:00Z"))
        .await?;

    assert_eq!(outcome.status, RunStatus::PartiallySucceeded);
    assert_eq!(outcome.quarantined, 1);

    for day in ["2025-02-02T12:00:00Z", "2025-02-03T12:00:00Z"] {
        let outcome = feeds
            .pipeline(store, "org_a", PipelineConfig::default())
            .run_at(ts(day))
            .await?;

        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(outcome.quarantined, 0);
        assert_eq!(outcome.counts.received, 0);
    }

    let quarantined = store.quarantined(Some("org_a.sales")).await?;
    assert_eq!(quarantined.len(), 1);
    assert!(quarantined[0].record_key.is_none());

    Ok(())
}

pub async fn test_lease_expired(store: &Store) -> Result<()> {
    let feeds = Feeds::default();
    seed(store, &feeds, PipelineConfig::default()).await?;

    feeds.sales.push(sale(
        "T-1",
        "CUST-1",
        "2025-02-01T08:00:00Z",
        1,
        "2025-02-01T09:00:00Z",
    ));

    let config = ConfigBuilder::new()
        .lease_ttl(Duration::from_millis(20))
        .build();
    let slow = feeds
        .pipeline(store, "org_a", config)
        .dimension::<CustomerChange>("org_a.backfill", SlowFeed(Duration::from_millis(300)));

    let other = Feeds::default();
    other
        .customers
        .push(customer("CUST-2", "Pune", "2025-02-01T08:00:00Z", None));

    let second = async {
        tokio::time::sleep(Duration::from_millis(100)).await;

        other
            .pipeline(store, "org_b", PipelineConfig::default())
            .run_at(ts("2025-02-01T12:30:00Z"))
            .await
    };

    let (res, outcome) = tokio::join!(slow.run_at(ts("2025-02-01T12:00:00Z")), second);

    // the second run took over the expired lease and committed first
    assert!(outcome?.is_committed());
    assert!(matches!(res, Err(MergeError::LockExpired { .. })));

    assert_eq!(store.dimension_history("customer", "CUST-2").await?.len(), 1);
    assert!(store.fact("T-1").await?.is_none());
    assert!(store.watermark("org_a.sales").await?.is_none());

    let watermark = store.watermark("org_a.customers").await?.unwrap();
    assert_eq!(watermark.last_run_status, RunStatus::Failed);

    Ok(())
}
