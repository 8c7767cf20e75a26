use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dyn_clone::DynClone;
use parking_lot::RwLock;
use serde_json::Value;

/// An ordered change feed of one source.
///
/// `after` is the watermark of the source; a feed may use it to skip rows it knows are
/// old, the engine filters again either way.
#[async_trait]
pub trait Feed: DynClone + Send + Sync {
    async fn fetch(&self, after: Option<DateTime<Utc>>) -> anyhow::Result<Vec<Value>>;
}

dyn_clone::clone_trait_object!(Feed);

/// In-process feed, rows are kept in push order.
#[derive(Debug, Clone, Default)]
pub struct MemoryFeed(Arc<RwLock<Vec<Value>>>);

impl MemoryFeed {
    pub fn new(rows: Vec<Value>) -> Self {
        Self(Arc::new(RwLock::new(rows)))
    }

    pub fn push(&self, row: Value) {
        self.0.write().push(row);
    }

    pub fn extend(&self, rows: impl IntoIterator<Item = Value>) {
        self.0.write().extend(rows);
    }
}

#[async_trait]
impl Feed for MemoryFeed {
    async fn fetch(&self, _after: Option<DateTime<Utc>>) -> anyhow::Result<Vec<Value>> {
        Ok(self.0.read().clone())
    }
}

/// Newline-delimited JSON extract on disk.
///
/// A line that is not valid JSON is handed on as a string so that it ends up in
/// quarantine instead of failing the whole feed.
#[derive(Debug, Clone)]
pub struct JsonLinesFeed {
    path: PathBuf,
}

impl JsonLinesFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Feed for JsonLinesFeed {
    async fn fetch(&self, _after: Option<DateTime<Utc>>) -> anyhow::Result<Vec<Value>> {
        let content = tokio::fs::read_to_string(&self.path).await?;

        Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                serde_json::from_str(line).unwrap_or_else(|_| Value::String(line.to_owned()))
            })
            .collect())
    }
}
