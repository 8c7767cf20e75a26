//! Typed change records accepted at the ingestion boundary.
//!
//! Feeds deliver loosely shaped JSON rows. Each row is decoded into one of the record
//! structs below and validated before anything deeper in the engine sees it; rows that
//! do not conform are quarantined with the decoding error as reason. Field aliases cover
//! the column names used by the second source organization.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use starmerge_store::Attributes;
use validator::Validate;

use crate::error::MergeError;

pub trait ChangeTracked {
    fn changed_at(&self) -> DateTime<Utc>;
}

/// A new attribute set for one dimension member.
#[derive(Debug, Clone, PartialEq)]
pub struct DimensionChange {
    pub business_key: String,
    pub changed_at: DateTime<Utc>,
    /// Falls back to the run date when the source does not say.
    pub effective_from: Option<NaiveDate>,
    pub attributes: Attributes,
}

impl ChangeTracked for DimensionChange {
    fn changed_at(&self) -> DateTime<Utc> {
        self.changed_at
    }
}

/// A sale as delivered by a source, dimension references still as business keys.
#[derive(Debug, Clone, PartialEq)]
pub struct FactChange {
    pub transaction_id: String,
    pub event_timestamp: DateTime<Utc>,
    pub dimension_keys: BTreeMap<String, String>,
    pub quantity: i64,
    pub amount_minor: i64,
    pub currency: String,
    pub changed_at: DateTime<Utc>,
}

impl FactChange {
    pub fn event_date(&self) -> NaiveDate {
        self.event_timestamp.date_naive()
    }
}

impl ChangeTracked for FactChange {
    fn changed_at(&self) -> DateTime<Utc> {
        self.changed_at
    }
}

pub trait DimensionRecord: DeserializeOwned + Validate {
    const DIMENSION: &'static str;

    fn into_change(self) -> DimensionChange;
}

pub trait FactRecord: DeserializeOwned + Validate {
    fn into_change(self) -> FactChange;
}

/// A decoded change together with the raw row it came from.
#[derive(Debug, Clone)]
pub struct Sourced<C> {
    pub source: String,
    /// Position of the row in its feed.
    pub position: usize,
    pub payload: Value,
    pub change: C,
}

impl<C: ChangeTracked> ChangeTracked for Sourced<C> {
    fn changed_at(&self) -> DateTime<Utc> {
        self.change.changed_at()
    }
}

/// Keeps the latest change per key, returning the survivors in input order and the
/// number of rows dropped.
///
/// Only rows at the latest change-tracking value of their key compete: identical
/// payloads collapse to the first row, contradictory ones fail with
/// `DuplicateBusinessKeyConflict`. Ties below the latest value are superseded, so the
/// result does not depend on input order.
pub fn dedup_latest<C: ChangeTracked + PartialEq>(
    scope: &str,
    rows: Vec<Sourced<C>>,
    key: impl Fn(&C) -> &str,
) -> Result<(Vec<Sourced<C>>, usize), MergeError> {
    let received = rows.len();

    let mut latest: HashMap<String, DateTime<Utc>> = HashMap::new();
    for row in &rows {
        let at = latest.entry(key(&row.change).to_owned()).or_insert(row.changed_at());
        *at = (*at).max(row.changed_at());
    }

    let mut kept: HashMap<String, usize> = HashMap::new();
    let mut survivors: Vec<Sourced<C>> = vec![];

    for row in rows {
        let k = key(&row.change).to_owned();
        if latest.get(&k) != Some(&row.changed_at()) {
            continue;
        }

        match kept.get(&k) {
            Some(&pos) if survivors[pos].change != row.change => {
                return Err(MergeError::DuplicateBusinessKeyConflict {
                    scope: scope.to_owned(),
                    key: k,
                    changed_at: row.changed_at(),
                });
            }
            Some(_) => {}
            None => {
                kept.insert(k, survivors.len());
                survivors.push(row);
            }
        }
    }

    let deduplicated = received - survivors.len();

    Ok((survivors, deduplicated))
}

pub fn decode<R: DeserializeOwned + Validate>(payload: &Value) -> Result<R, String> {
    let record: R = serde_json::from_value(payload.clone()).map_err(|e| e.to_string())?;
    record.validate().map_err(|e| e.to_string())?;

    Ok(record)
}

pub fn decode_dimension<R: DimensionRecord>(payload: &Value) -> Result<DimensionChange, String> {
    decode::<R>(payload).map(R::into_change)
}

pub fn decode_fact<R: FactRecord>(payload: &Value) -> Result<FactChange, String> {
    decode::<R>(payload).map(R::into_change)
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CustomerChange {
    #[serde(alias = "cust_code")]
    #[validate(length(min = 1, max = 100))]
    pub customer_id: String,
    #[serde(alias = "customer_name")]
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    pub city: Option<String>,
    pub country: Option<String>,
    pub segment: Option<String>,
    #[serde(alias = "modified_at")]
    pub updated_at: DateTime<Utc>,
    pub effective_from: Option<NaiveDate>,
}

impl DimensionRecord for CustomerChange {
    const DIMENSION: &'static str = "customer";

    fn into_change(self) -> DimensionChange {
        DimensionChange {
            business_key: self.customer_id,
            changed_at: self.updated_at,
            effective_from: self.effective_from,
            attributes: BTreeMap::from([
                ("name".to_owned(), json!(self.name)),
                ("city".to_owned(), json!(self.city)),
                ("country".to_owned(), json!(self.country)),
                ("segment".to_owned(), json!(self.segment)),
            ]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ProductChange {
    #[serde(alias = "sku")]
    #[validate(length(min = 1, max = 100))]
    pub product_id: String,
    #[serde(alias = "product_name")]
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    pub category: Option<String>,
    pub brand: Option<String>,
    #[serde(alias = "modified_at")]
    pub updated_at: DateTime<Utc>,
    pub effective_from: Option<NaiveDate>,
}

impl DimensionRecord for ProductChange {
    const DIMENSION: &'static str = "product";

    fn into_change(self) -> DimensionChange {
        DimensionChange {
            business_key: self.product_id,
            changed_at: self.updated_at,
            effective_from: self.effective_from,
            attributes: BTreeMap::from([
                ("name".to_owned(), json!(self.name)),
                ("category".to_owned(), json!(self.category)),
                ("brand".to_owned(), json!(self.brand)),
            ]),
        }
    }
}

/// List price of a product, versioned like any other dimension.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PriceChange {
    #[serde(alias = "sku")]
    #[validate(length(min = 1, max = 100))]
    pub product_id: String,
    pub list_price_minor: i64,
    #[validate(length(equal = 3))]
    pub currency: String,
    #[serde(alias = "modified_at")]
    pub updated_at: DateTime<Utc>,
    pub effective_from: Option<NaiveDate>,
}

impl DimensionRecord for PriceChange {
    const DIMENSION: &'static str = "price";

    fn into_change(self) -> DimensionChange {
        DimensionChange {
            business_key: self.product_id,
            changed_at: self.updated_at,
            effective_from: self.effective_from,
            attributes: BTreeMap::from([
                ("list_price_minor".to_owned(), json!(self.list_price_minor)),
                ("currency".to_owned(), json!(self.currency)),
            ]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SaleChange {
    #[serde(alias = "txn_ref")]
    #[validate(length(min = 1, max = 100))]
    pub transaction_id: String,
    #[serde(alias = "cust_code")]
    #[validate(length(min = 1, max = 100))]
    pub customer_id: String,
    #[serde(alias = "sku")]
    #[validate(length(min = 1, max = 100))]
    pub product_id: String,
    #[serde(alias = "txn_time")]
    pub sold_at: DateTime<Utc>,
    #[serde(alias = "qty")]
    pub quantity: i64,
    pub amount_minor: i64,
    #[validate(length(equal = 3))]
    pub currency: String,
    #[serde(alias = "modified_at")]
    pub updated_at: DateTime<Utc>,
}

impl FactRecord for SaleChange {
    fn into_change(self) -> FactChange {
        FactChange {
            transaction_id: self.transaction_id,
            event_timestamp: self.sold_at,
            dimension_keys: BTreeMap::from([
                (CustomerChange::DIMENSION.to_owned(), self.customer_id),
                (ProductChange::DIMENSION.to_owned(), self.product_id.to_owned()),
                (PriceChange::DIMENSION.to_owned(), self.product_id),
            ]),
            quantity: self.quantity,
            amount_minor: self.amount_minor,
            currency: self.currency,
            changed_at: self.updated_at,
        }
    }
}
