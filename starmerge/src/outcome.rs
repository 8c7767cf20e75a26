use serde::Serialize;
use starmerge_store::RunStatus;
use uuid::Uuid;

use crate::{error::MergeError, validator::ValidationReport};

/// Phases of a run, in order. A run ends in either `Committed` or `RolledBack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Resolving,
    Merging,
    Validating,
    Committed,
    RolledBack,
}

impl RunPhase {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_advance_to(&self, next: RunPhase) -> bool {
        use RunPhase::*;

        matches!(
            (self, next),
            (Resolving, Merging)
                | (Merging, Validating)
                | (Validating, Committed)
                | (Resolving | Merging | Validating, RolledBack)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Committed | RunPhase::RolledBack)
    }
}

/// Row accounting of one merge.
///
/// `received = inserted + updated + unchanged + quarantined + deduplicated` holds for every
/// merge; `rejected` counts staged rows that broke a business rule and `repointed` counts
/// already loaded facts whose references were corrected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounts {
    pub received: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub quarantined: usize,
    pub rejected: usize,
    pub deduplicated: usize,
    pub repointed: usize,
}

impl RunCounts {
    pub fn is_balanced(&self) -> bool {
        self.received
            == self.inserted + self.updated + self.unchanged + self.quarantined + self.deduplicated
    }

    pub fn add(&mut self, other: &RunCounts) {
        self.received += other.received;
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.quarantined += other.quarantined;
        self.rejected += other.rejected;
        self.deduplicated += other.deduplicated;
        self.repointed += other.repointed;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DimensionSummary {
    pub dimension: String,
    pub counts: RunCounts,
    pub corrections: usize,
}

#[derive(Debug, Serialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub phase: RunPhase,
    pub status: RunStatus,
    /// Fact counts, repointed facts included.
    pub counts: RunCounts,
    pub dimensions: Vec<DimensionSummary>,
    pub report: Option<ValidationReport>,
    pub quarantined: usize,
    /// Rows quarantined by earlier runs that this run loaded.
    pub resolved: usize,
    #[serde(skip)]
    pub failure: Option<MergeError>,
}

impl RunOutcome {
    pub fn is_committed(&self) -> bool {
        self.phase == RunPhase::Committed
    }
}
