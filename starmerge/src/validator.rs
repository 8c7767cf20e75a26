//! Post-merge reconciliation of a staged run.
//!
//! Checks only look at what the run touched: the staged fact rows and the histories of
//! the business keys the dimension merges changed. A failed [`Severity::Hard`] check stops
//! the commit; soft checks are reported and logged.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{Duration, NaiveDate};
use serde::Serialize;
use serde_json::Value;
use starmerge_store::{DimensionRow, FactRow, Store};
use tracing::warn;
use uuid::Uuid;

use crate::{
    config::PipelineConfig,
    error::{MergeError, Result},
    fact::FactMerge,
    resolver::DimensionIndex,
    scd2::DimensionMerge,
};

pub const ROW_COUNT: &str = "row_count";
pub const REFERENTIAL_INTEGRITY: &str = "referential_integrity";
pub const BUSINESS_RULES: &str = "business_rules";
pub const SINGLE_CURRENT_VERSION: &str = "single_current_version";
pub const CONTIGUOUS_HISTORY: &str = "contiguous_history";
pub const UNKNOWN_MEMBER_REFERENCES: &str = "unknown_member_references";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Hard,
    Soft,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub name: &'static str,
    pub passed: bool,
    pub severity: Severity,
    pub detail: String,
}

impl CheckResult {
    fn from_problems(name: &'static str, severity: Severity, problems: Vec<String>) -> Self {
        Self {
            name,
            passed: problems.is_empty(),
            severity,
            detail: if problems.is_empty() {
                "ok".to_owned()
            } else {
                problems.join("; ")
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub checks: Vec<CheckResult>,
    /// Staged facts breaking a business rule.
    pub rejected: usize,
}

impl ValidationReport {
    /// No hard check failed.
    pub fn passed(&self) -> bool {
        !self
            .checks
            .iter()
            .any(|c| !c.passed && c.severity == Severity::Hard)
    }

    pub fn check(&self, name: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| !c.passed)
    }

    /// The error of the first failed hard check.
    pub fn error(&self) -> Option<MergeError> {
        let check = self
            .failures()
            .find(|c| c.severity == Severity::Hard)?;

        Some(match check.name {
            REFERENTIAL_INTEGRITY => {
                MergeError::ReferentialIntegrityViolation(check.detail.to_owned())
            }
            BUSINESS_RULES => MergeError::BusinessRuleViolation(check.detail.to_owned()),
            name => MergeError::Validation(format!("{name}: {}", check.detail)),
        })
    }
}

/// Exactly one current version, the last one, carrying the open end.
pub fn single_current_version(history: &[DimensionRow]) -> std::result::Result<(), String> {
    let current = history.iter().filter(|row| row.is_current).count();
    if current != 1 {
        return Err(format!("{current} current versions"));
    }

    let Some(last) = history.last() else {
        return Err("no versions".to_owned());
    };

    if !last.is_current || last.effective_to.is_some() {
        return Err(format!("version {} is not the open current version", last.version));
    }

    if let Some(row) = history[..history.len() - 1]
        .iter()
        .find(|row| row.effective_to.is_none())
    {
        return Err(format!("closed version {} has no end", row.version));
    }

    Ok(())
}

/// Versions numbered from 1 in time order, each starting where the previous one ends.
pub fn contiguous_history(history: &[DimensionRow]) -> std::result::Result<(), String> {
    for (pos, row) in history.iter().enumerate() {
        if row.version != pos as i32 + 1 {
            return Err(format!("version {} at position {}", row.version, pos + 1));
        }

        if row.effective_to.is_some_and(|to| to < row.effective_from) {
            return Err(format!("version {} ends before it starts", row.version));
        }
    }

    for pair in history.windows(2) {
        if pair[0].effective_to != Some(pair[1].effective_from) {
            return Err(format!(
                "gap or overlap between version {} and {}",
                pair[0].version, pair[1].version
            ));
        }
    }

    Ok(())
}

/// What a run staged, as seen by the checks.
pub struct Staged<'a> {
    pub index: &'a DimensionIndex,
    pub dimensions: &'a [DimensionMerge],
    pub facts: Option<&'a FactMerge>,
    /// Already loaded facts re-pointed by the late-arriving pass.
    pub repointed: &'a [FactRow],
    /// Size of the fact table when the run took its lease.
    pub facts_before: u64,
    pub as_of: NaiveDate,
}

impl Staged<'_> {
    fn fact_rows(&self) -> impl Iterator<Item = &FactRow> {
        self.facts
            .into_iter()
            .flat_map(|merge| merge.facts.iter())
            .chain(self.repointed.iter())
    }
}

#[derive(Clone)]
pub struct Validator {
    store: Store,
    config: PipelineConfig,
}

impl Validator {
    pub fn new(store: Store, config: PipelineConfig) -> Self {
        Self { store, config }
    }

    pub async fn validate(&self, staged: &Staged<'_>) -> Result<ValidationReport> {
        let (business_rules, rejected) = self.business_rules(staged);

        let checks = vec![
            self.row_count(staged).await?,
            self.referential_integrity(staged).await?,
            business_rules,
            self.history_check(staged, SINGLE_CURRENT_VERSION, single_current_version),
            self.history_check(staged, CONTIGUOUS_HISTORY, contiguous_history),
            self.unknown_member_references(staged),
        ];

        for check in checks.iter().filter(|c| !c.passed) {
            warn!("check {} ({:?}) failed: {}", check.name, check.severity, check.detail);
        }

        Ok(ValidationReport { checks, rejected })
    }

    async fn row_count(&self, staged: &Staged<'_>) -> Result<CheckResult> {
        let mut problems = vec![];

        for merge in staged.dimensions {
            if !merge.counts.is_balanced() {
                problems.push(format!("{} counts do not balance: {:?}", merge.dimension, merge.counts));
            }
        }

        let inserted = match staged.facts {
            Some(merge) => {
                if !merge.counts.is_balanced() {
                    problems.push(format!("fact counts do not balance: {:?}", merge.counts));
                }

                if merge.facts.len() != merge.counts.inserted + merge.counts.updated {
                    problems.push(format!(
                        "{} fact rows staged for {} inserted and {} updated",
                        merge.facts.len(),
                        merge.counts.inserted,
                        merge.counts.updated
                    ));
                }

                merge.counts.inserted
            }
            None => 0,
        };

        let current = self.store.count_facts().await?;
        if current != staged.facts_before {
            problems.push(format!(
                "fact table changed during the run: {} rows, now {current}",
                staged.facts_before
            ));
        }

        let ids = staged
            .fact_rows()
            .map(|f| f.transaction_id.to_owned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();
        let stored = self
            .store
            .facts(&ids)
            .await?
            .into_iter()
            .map(|f| f.transaction_id)
            .collect::<HashSet<_>>();
        let projected = current + ids.iter().filter(|id| !stored.contains(*id)).count() as u64;
        let expected = staged.facts_before + inserted as u64;

        if projected != expected {
            problems.push(format!(
                "fact table would hold {projected} rows, expected {expected}"
            ));
        }

        Ok(CheckResult::from_problems(ROW_COUNT, Severity::Hard, problems))
    }

    async fn referential_integrity(&self, staged: &Staged<'_>) -> Result<CheckResult> {
        let mut missing: BTreeMap<String, BTreeSet<Uuid>> = BTreeMap::new();

        for fact in staged.fact_rows() {
            for (dimension, reference) in &fact.dimension_keys {
                if !staged
                    .index
                    .contains_surrogate_key(dimension, reference.surrogate_key)
                {
                    missing
                        .entry(dimension.to_owned())
                        .or_default()
                        .insert(reference.surrogate_key);
                }
            }
        }

        let mut problems = vec![];
        for (dimension, keys) in missing {
            let keys = keys.into_iter().collect::<Vec<_>>();
            let existing = self
                .store
                .existing_surrogate_keys(&dimension, &keys)
                .await?
                .into_iter()
                .collect::<HashSet<_>>();

            for key in keys.iter().filter(|k| !existing.contains(*k)) {
                problems.push(format!("{dimension} surrogate key {key} does not exist"));
            }
        }

        Ok(CheckResult::from_problems(
            REFERENTIAL_INTEGRITY,
            Severity::Hard,
            problems,
        ))
    }

    fn business_rules(&self, staged: &Staged<'_>) -> (CheckResult, usize) {
        let mut problems = vec![];
        let mut rejected = BTreeSet::new();
        let max_event_date = staged.as_of + Duration::days(self.config.max_future_days);

        for fact in staged.fact_rows() {
            let mut broken = vec![];
            if fact.quantity < 0 {
                broken.push(format!("quantity {}", fact.quantity));
            }
            if fact.amount_minor < 0 {
                broken.push(format!("amount {}", fact.amount_minor));
            }
            if fact.event_date < self.config.min_event_date || fact.event_date > max_event_date {
                broken.push(format!("event date {}", fact.event_date));
            }

            if !broken.is_empty() {
                problems.push(format!("fact `{}`: {}", fact.transaction_id, broken.join(", ")));
                rejected.insert(fact.transaction_id.as_str());
            }
        }

        for merge in staged.dimensions {
            let Some(attributes) = self.config.non_negative_attributes.get(&merge.dimension) else {
                continue;
            };

            for row in &merge.rows {
                for attribute in attributes {
                    let negative = match row.attributes.get(attribute) {
                        Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n < 0.0),
                        _ => false,
                    };

                    if negative {
                        problems.push(format!(
                            "{} `{}` has negative {attribute}",
                            merge.dimension, row.business_key
                        ));
                    }
                }
            }
        }

        (
            CheckResult::from_problems(BUSINESS_RULES, Severity::Hard, problems),
            rejected.len(),
        )
    }

    fn history_check(
        &self,
        staged: &Staged<'_>,
        name: &'static str,
        check: fn(&[DimensionRow]) -> std::result::Result<(), String>,
    ) -> CheckResult {
        let mut problems = vec![];

        for merge in staged.dimensions {
            for business_key in &merge.touched {
                let history = staged.index.history(&merge.dimension, business_key);
                if let Err(detail) = check(history) {
                    problems.push(format!("{} `{business_key}`: {detail}", merge.dimension));
                }
            }
        }

        CheckResult::from_problems(name, Severity::Hard, problems)
    }

    fn unknown_member_references(&self, staged: &Staged<'_>) -> CheckResult {
        let problems: Vec<String> = staged
            .facts
            .map(|merge| {
                merge
                    .routed_to_unknown
                    .iter()
                    .map(|id| format!("fact `{id}` references an unknown member"))
                    .collect()
            })
            .unwrap_or_default();

        CheckResult::from_problems(UNKNOWN_MEMBER_REFERENCES, Severity::Soft, problems)
    }
}
