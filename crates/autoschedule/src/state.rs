//! Per-subgraph tuning state: the top-K memory and novelty sets.

use graphforge_graph::Target;
use graphforge_space::{CandidateSpace, RealizedSchedule, ScheduleEntity};
use serde::{Deserialize, Serialize};
use std::collections::{BinaryHeap, HashSet};

/// Proposals completed before seeded sampling may kick in.
pub const WARM_UP_TRIALS: usize = 64;

/// Active-generation size that triggers the seen-set swap.
pub const SEEN_GENERATION_LIMIT: usize = 500;

/// Scoring policy for candidate batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    Profile,
    Random,
}

impl std::str::FromStr for Policy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "profile" => Ok(Policy::Profile),
            "random" => Ok(Policy::Random),
            other => anyhow::bail!("no support for policy {other:?}"),
        }
    }
}

/// A scored schedule. Higher `score` (GFLOPS) is better; ordering uses
/// the score alone.
#[derive(Debug, Clone)]
pub struct EvaluatedResult {
    pub schedule: RealizedSchedule,
    pub entity: ScheduleEntity,
    pub score: f64,
}

/// Heap adapter: reverses the score ordering so the binary max-heap
/// exposes the worst element at its top.
struct MinScored(EvaluatedResult);

impl PartialEq for MinScored {
    fn eq(&self, other: &Self) -> bool {
        self.0.score == other.0.score
    }
}

impl Eq for MinScored {}

impl PartialOrd for MinScored {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MinScored {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.0.score.total_cmp(&self.0.score)
    }
}

/// Tuning memory for one subgraph key.
///
/// Single-writer by construction: the schedule worker serializes search
/// invocations per key, so the owning mutex in the scheduler suffices.
pub struct TuneState {
    pub space: CandidateSpace,
    top_k: BinaryHeap<MinScored>,
    seen_stable: HashSet<ScheduleEntity>,
    seen_active: HashSet<ScheduleEntity>,
    pub counts: usize,
    pub topk: usize,
    pub new_trial: usize,
    pub policy: Policy,
    pub target: Target,
    pub rng: fastrand::Rng,
}

impl TuneState {
    pub fn new(
        space: CandidateSpace,
        topk: usize,
        new_trial: usize,
        policy: Policy,
        target: Target,
    ) -> Self {
        Self {
            space,
            top_k: BinaryHeap::new(),
            seen_stable: HashSet::new(),
            seen_active: HashSet::new(),
            counts: 0,
            topk: topk.max(1),
            new_trial: new_trial.max(1),
            policy,
            target,
            rng: fastrand::Rng::new(),
        }
    }

    /// Fix both the sampling and selection RNGs for reproducible tests.
    pub fn seed_rng(&mut self, seed: u64) {
        self.rng = fastrand::Rng::with_seed(seed);
        self.space.seed_rng(seed.wrapping_mul(0x9e37_79b9_7f4a_7c15));
    }

    pub fn top_k_len(&self) -> usize {
        self.top_k.len()
    }

    /// Non-destructive snapshot of the top-K, ascending by score (the
    /// last element is the best known).
    pub fn snapshot_sorted(&self) -> Vec<EvaluatedResult> {
        let mut entries: Vec<EvaluatedResult> =
            self.top_k.iter().map(|e| e.0.clone()).collect();
        entries.sort_by(|a, b| a.score.total_cmp(&b.score));
        entries
    }

    /// Best known score, if any feedback has landed.
    pub fn best_score(&self) -> Option<f64> {
        self.snapshot_sorted().last().map(|e| e.score)
    }

    /// A first-pass candidate is rejected only when both generations
    /// already contain it.
    pub fn rejects_as_seen(&self, entity: &ScheduleEntity) -> bool {
        self.seen_stable.contains(entity) && self.seen_active.contains(entity)
    }

    pub fn warmed_up(&self) -> bool {
        self.counts > WARM_UP_TRIALS
    }

    /// Ingest a post-measurement score for `schedule`.
    ///
    /// Positive scores compete for a top-K slot (strictly better than
    /// the current minimum evicts it). Every feedback records the entity
    /// in the active generation; overflowing the generation swaps it
    /// into the stable slot wholesale.
    pub fn add_feedback(&mut self, schedule: &RealizedSchedule, score: f64) {
        if score > 0.0 {
            let evaluated = EvaluatedResult {
                schedule: schedule.clone(),
                entity: schedule.entity.clone(),
                score,
            };
            if self.top_k.len() < self.topk {
                self.top_k.push(MinScored(evaluated));
            } else if self
                .top_k
                .peek()
                .is_some_and(|min| score > min.0.score)
            {
                self.top_k.pop();
                self.top_k.push(MinScored(evaluated));
            }
        }

        self.seen_active.insert(schedule.entity.clone());
        if self.seen_active.len() > SEEN_GENERATION_LIMIT {
            self.seen_stable = std::mem::take(&mut self.seen_active);
        }
        self.counts += 1;
    }

    #[cfg(test)]
    pub(crate) fn seen_sizes(&self) -> (usize, usize) {
        (self.seen_stable.len(), self.seen_active.len())
    }

    #[cfg(test)]
    pub(crate) fn force_seen(&mut self, entity: &ScheduleEntity, stable: bool, active: bool) {
        if stable {
            self.seen_stable.insert(entity.clone());
        }
        if active {
            self.seen_active.insert(entity.clone());
        }
    }
}
