use std::collections::{BTreeSet, HashMap};

use chrono::NaiveDate;
use starmerge_store::{DimensionRow, Store};
use uuid::Uuid;

use crate::error::{MergeError, Result};

/// Picks the version of one member valid on `date`.
///
/// Versions are never assumed to be current: a fact dated inside a closed interval
/// resolves to that historical version.
pub fn resolve_in<'a>(
    dimension: &str,
    business_key: &str,
    versions: &'a [DimensionRow],
    date: NaiveDate,
) -> Result<&'a DimensionRow> {
    if versions.is_empty() {
        return Err(MergeError::UnknownBusinessKey {
            dimension: dimension.to_owned(),
            business_key: business_key.to_owned(),
        });
    }

    versions
        .iter()
        .find(|row| row.contains(date))
        .ok_or_else(|| MergeError::NoVersionAtDate {
            dimension: dimension.to_owned(),
            business_key: business_key.to_owned(),
            date,
        })
}

/// Resolves surrogate keys straight from the store.
#[derive(Clone)]
pub struct KeyResolver {
    store: Store,
}

impl KeyResolver {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn resolve(
        &self,
        dimension: &str,
        business_key: &str,
        as_of: NaiveDate,
    ) -> Result<Uuid> {
        let versions = self.store.dimension_history(dimension, business_key).await?;

        resolve_in(dimension, business_key, &versions, as_of).map(|row| row.surrogate_key)
    }
}

/// Dimension histories of the members a run works on, as staged by the run.
///
/// A key that was loaded but has no versions is kept with an empty history so that it
/// is not read from the store again.
#[derive(Debug, Clone, Default)]
pub struct DimensionIndex {
    members: HashMap<String, HashMap<String, Vec<DimensionRow>>>,
}

impl DimensionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers stored versions of `business_keys`.
    pub fn load(&mut self, dimension: &str, business_keys: &[String], rows: Vec<DimensionRow>) {
        let members = self.members.entry(dimension.to_owned()).or_default();

        for key in business_keys {
            members.entry(key.to_owned()).or_default();
        }

        for row in rows {
            let versions = members.entry(row.business_key.to_owned()).or_default();
            if !versions.iter().any(|v| v.surrogate_key == row.surrogate_key) {
                versions.push(row);
            }
        }

        for versions in members.values_mut() {
            versions.sort_by_key(|row| row.version);
        }
    }

    /// Applies staged rows, replacing versions with the same surrogate key.
    pub fn apply(&mut self, rows: &[DimensionRow]) {
        for row in rows {
            let versions = self
                .members
                .entry(row.dimension.to_owned())
                .or_default()
                .entry(row.business_key.to_owned())
                .or_default();

            match versions
                .iter_mut()
                .find(|v| v.surrogate_key == row.surrogate_key)
            {
                Some(version) => *version = row.clone(),
                None => versions.push(row.clone()),
            }

            versions.sort_by_key(|row| row.version);
        }
    }

    pub fn is_loaded(&self, dimension: &str, business_key: &str) -> bool {
        self.members
            .get(dimension)
            .map_or(false, |members| members.contains_key(business_key))
    }

    /// Keys of `business_keys` that were never loaded, deduplicated and sorted.
    pub fn missing<'a>(
        &self,
        dimension: &str,
        business_keys: impl IntoIterator<Item = &'a String>,
    ) -> Vec<String> {
        business_keys
            .into_iter()
            .filter(|key| !self.is_loaded(dimension, key))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn history(&self, dimension: &str, business_key: &str) -> &[DimensionRow] {
        self.members
            .get(dimension)
            .and_then(|members| members.get(business_key))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn resolve(
        &self,
        dimension: &str,
        business_key: &str,
        as_of: NaiveDate,
    ) -> Result<&DimensionRow> {
        resolve_in(
            dimension,
            business_key,
            self.history(dimension, business_key),
            as_of,
        )
    }

    pub fn contains_surrogate_key(&self, dimension: &str, surrogate_key: Uuid) -> bool {
        self.members.get(dimension).map_or(false, |members| {
            members
                .values()
                .flatten()
                .any(|row| row.surrogate_key == surrogate_key)
        })
    }
}
