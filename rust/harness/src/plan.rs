//! Work plan: how many progress units each algorithm family may consume.
//!
//! A plan is a list of work items. Each item names a family, a kind of work
//! (single build or hyperparameter search), how many times that work is still
//! expected to run and the share of progress units one run is worth.
//! `remaining_work` is the sum of `remaining * share` and is what the run's
//! progress bar counts down.

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use automl_config::{AlgorithmId, BuildModels};
use serde::{Deserialize, Serialize};

/// What a task does.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    /// One model trained with fixed parameters.
    Build,
    /// A random hyperparameter search producing many models.
    Search,
}

impl std::fmt::Display for WorkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Build => write!(f, "model build"),
            Self::Search => write!(f, "hyperparameter search"),
        }
    }
}

/// One allocation entry. Shared by reference so routines and the plan agree
/// on how much is left.
#[derive(Debug)]
pub struct WorkItem {
    family: AlgorithmId,
    kind: WorkKind,
    /// Progress units per repetition.
    share: u32,
    /// Repetitions not yet consumed.
    remaining: AtomicU32,
}

impl WorkItem {
    fn new(family: AlgorithmId, count: u32, kind: WorkKind, share: u32) -> Self {
        Self {
            family,
            kind,
            share,
            remaining: AtomicU32::new(count),
        }
    }

    /// Algorithm family the item budgets.
    #[must_use]
    pub fn family(&self) -> AlgorithmId {
        self.family
    }

    #[must_use]
    pub fn kind(&self) -> WorkKind {
        self.kind
    }

    /// Progress units one repetition is worth.
    #[must_use]
    pub fn share(&self) -> u32 {
        self.share
    }

    /// Repetitions left. Each launch or skip consumes one.
    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.remaining.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    /// Units still available from this item.
    #[must_use]
    pub fn remaining_work(&self) -> u64 {
        u64::from(self.remaining()) * u64::from(self.share)
    }

    /// Consume up to `n` repetitions, returning the progress units they were worth.
    pub fn consume(&self, n: u32) -> u64 {
        let mut taken = 0;
        // fetch_update only fails when the closure returns None, which it never does
        let _ = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                taken = current.min(n);
                Some(current - taken)
            });
        u64::from(taken) * u64::from(self.share)
    }

    /// Consume every remaining repetition.
    pub fn consume_all(&self) -> u64 {
        self.consume(u32::MAX)
    }
}

/// Serializable description of a plan entry, used in config files and `plan` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub algo: AlgorithmId,
    /// Maximum number of builds or searches.
    pub count: u32,
    pub kind: WorkKind,
    /// Progress units each one is worth.
    pub share: u32,
}

/// Ordered allocation table, sealed before the run starts.
#[derive(Debug, Default)]
pub struct WorkPlan {
    items: Vec<Arc<WorkItem>>,
    sealed: bool,
}

impl WorkPlan {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The allocation table used when the configuration does not provide one.
    #[must_use]
    pub fn default_allocations() -> Vec<Allocation> {
        use AlgorithmId::{DeepLearning, Drf, Gbm, Glm, StackedEnsemble, XGBoost};
        use WorkKind::{Build, Search};

        [
            (DeepLearning, 1, Build, 10),
            (DeepLearning, 3, Search, 20),
            (Drf, 2, Build, 10),
            (Gbm, 5, Build, 10),
            (Gbm, 1, Search, 60),
            (Glm, 1, Search, 20),
            (XGBoost, 3, Build, 10),
            (XGBoost, 1, Search, 100),
            (StackedEnsemble, 2, Build, 15),
        ]
        .into_iter()
        .map(|(algo, count, kind, share)| Allocation {
            algo,
            count,
            kind,
            share,
        })
        .collect()
    }

    /// Build an unsealed plan from an allocation table.
    pub fn from_allocations(allocations: &[Allocation]) -> Result<Self, PlanError> {
        let mut plan = Self::new();
        for a in allocations {
            plan.allocate(a.algo, a.count, a.kind, a.share)?;
        }
        Ok(plan)
    }

    /// Append an item.
    pub fn allocate(
        &mut self,
        family: AlgorithmId,
        count: u32,
        kind: WorkKind,
        share: u32,
    ) -> Result<&mut Self, PlanError> {
        if self.sealed {
            return Err(PlanError::Sealed);
        }
        if self.get(family, kind).is_some() {
            return Err(PlanError::Duplicate(family, kind));
        }
        self.items
            .push(Arc::new(WorkItem::new(family, count, kind, share)));
        Ok(self)
    }

    /// Drop every item of a family. Only allowed before sealing.
    pub fn remove(&mut self, family: AlgorithmId) -> Result<(), PlanError> {
        if self.sealed {
            return Err(PlanError::Sealed);
        }
        self.items.retain(|item| item.family != family);
        Ok(())
    }

    /// Freeze the set of items.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Item for a family and kind, or `None` meaning "skip this work".
    #[must_use]
    pub fn get(&self, family: AlgorithmId, kind: WorkKind) -> Option<Arc<WorkItem>> {
        self.items
            .iter()
            .find(|item| item.family == family && item.kind == kind)
            .cloned()
    }

    #[must_use]
    pub fn remaining_work(&self) -> u64 {
        self.items.iter().map(|item| item.remaining_work()).sum()
    }

    #[must_use]
    pub fn items(&self) -> &[Arc<WorkItem>] {
        &self.items
    }

    #[must_use]
    pub fn contains_family(&self, family: AlgorithmId) -> bool {
        self.items.iter().any(|item| item.family == family)
    }

    /// Snapshot of the current allocations.
    #[must_use]
    pub fn allocations(&self) -> Vec<Allocation> {
        self.items
            .iter()
            .map(|item| Allocation {
                algo: item.family,
                count: item.remaining(),
                kind: item.kind,
                share: item.share,
            })
            .collect()
    }
}

/// Why a family was left out of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exclusion {
    /// Excluded, or not included, by the build models lists.
    Requested,
    /// The task substrate can't train it.
    Unavailable,
}

/// Build the sealed plan for a run.
///
/// `include_algos` and `exclude_algos` are mutually exclusive, even when empty.
/// Returns the plan and the families removed from it, in `AlgorithmId::ALL` order.
pub fn build_plan(
    models: &BuildModels,
    allocations: &[Allocation],
    is_available: impl Fn(AlgorithmId) -> bool,
) -> Result<(WorkPlan, Vec<(AlgorithmId, Exclusion)>), PlanError> {
    if models.include_algos.is_some() && models.exclude_algos.is_some() {
        return Err(PlanError::ExclusiveAlgos);
    }

    let mut skipped = Vec::new();
    for algo in AlgorithmId::ALL {
        let requested = match (&models.include_algos, &models.exclude_algos) {
            (_, Some(exclude)) => exclude.contains(&algo),
            (Some(include), None) => !include.contains(&algo),
            (None, None) => false,
        };
        if requested {
            skipped.push((algo, Exclusion::Requested));
        } else if !is_available(algo) {
            skipped.push((algo, Exclusion::Unavailable));
        }
    }

    let mut plan = WorkPlan::from_allocations(allocations)?;
    for (algo, _) in &skipped {
        plan.remove(*algo)?;
    }
    plan.seal();
    Ok((plan, skipped))
}

/// Errors that can occur when building a plan.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PlanError {
    #[error(
        "Parameters `exclude_algos` and `include_algos` are mutually exclusive: please use only one of them if necessary."
    )]
    ExclusiveAlgos,
    #[error("work plan is sealed; can't allocate or remove work")]
    Sealed,
    #[error("duplicate allocation for {0} {1}")]
    Duplicate(AlgorithmId, WorkKind),
}
