//! The autoscheduler front end: pooled search jobs, synchronous entity
//! realization, and feedback ingestion.

use crate::state::{EvaluatedResult, Policy, TuneState};
use anyhow::{bail, Result};
use graphforge_graph::{Subgraph, SubgraphKey, Target, TensorMeta};
use graphforge_measure::MeasureClient;
use graphforge_pool::{LogSink, Priority, SharedFuture, WorkerPool};
use graphforge_space::{feature_extract, interpret, CandidateSpace, RealizedSchedule, ScheduleEntity};
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// Probability of attempting a seeded (exploitation) sample per slot.
const EXPLOIT_PROBABILITY: f64 = 0.7;

/// Optional scoring hook that replaces measurement entirely.
pub trait CostModel: Send + Sync {
    fn score(
        &self,
        schedules: &[RealizedSchedule],
        target: &Target,
        gflop: f64,
    ) -> Result<Vec<f64>>;
}

#[derive(Debug, Clone)]
pub struct AutoSchedulerOptions {
    pub topk: usize,
    pub new_trial: usize,
    pub policy: Policy,
    pub parallel: usize,
    pub report_profile: bool,
    /// Fixes per-key RNGs for reproducible searches.
    pub rng_seed: Option<u64>,
}

impl Default for AutoSchedulerOptions {
    fn default() -> Self {
        Self {
            topk: 20,
            new_trial: 20,
            policy: Policy::Profile,
            parallel: 2,
            report_profile: false,
            rng_seed: None,
        }
    }
}

struct SchedulerInner {
    contexts: Mutex<HashMap<SubgraphKey, Arc<Mutex<TuneState>>>>,
    measurer: Arc<dyn MeasureClient>,
    cost_model: RwLock<Option<Arc<dyn CostModel>>>,
    opts: AutoSchedulerOptions,
    default_target: Target,
    log: Option<Arc<LogSink>>,
    profile_log: Option<Arc<LogSink>>,
}

impl SchedulerInner {
    fn context(
        &self,
        key: SubgraphKey,
        subgraph: &Subgraph,
        metas: &[TensorMeta],
        target: Target,
    ) -> Arc<Mutex<TuneState>> {
        let mut contexts = self.contexts.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(contexts.entry(key).or_insert_with(|| {
            let space = CandidateSpace::for_subgraph(subgraph, metas);
            let mut state = TuneState::new(
                space,
                self.opts.topk,
                self.opts.new_trial,
                self.opts.policy,
                target,
            );
            if let Some(seed) = self.opts.rng_seed {
                state.seed_rng(seed ^ (key.0 as u64).wrapping_mul(0x51_7c_c1_b7));
            }
            Arc::new(Mutex::new(state))
        }))
    }
}

/// Candidate proposer with per-key tuning memory.
///
/// Search jobs run on an owned worker pool; the emergency lane jumps the
/// queue head for keys the evaluate stage flagged as starved.
pub struct AutoScheduler {
    pool: WorkerPool,
    inner: Arc<SchedulerInner>,
}

impl AutoScheduler {
    pub fn new(
        default_target: Target,
        opts: AutoSchedulerOptions,
        measurer: Arc<dyn MeasureClient>,
        log: Option<Arc<LogSink>>,
        profile_log: Option<Arc<LogSink>>,
    ) -> Self {
        let pool = WorkerPool::new("autoschedule", opts.parallel);
        Self {
            pool,
            inner: Arc::new(SchedulerInner {
                contexts: Mutex::new(HashMap::new()),
                measurer,
                cost_model: RwLock::new(None),
                opts,
                default_target,
                log,
                profile_log,
            }),
        }
    }

    /// Replace measurement-based scoring with a cost model.
    pub fn register_cost_model(&self, model: Arc<dyn CostModel>) {
        *self
            .inner
            .cost_model
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(model);
    }

    /// Enqueue one search step for `key` and return its future.
    pub fn schedule_for(
        &self,
        key: SubgraphKey,
        subgraph: &Arc<Subgraph>,
        metas: &Arc<Vec<TensorMeta>>,
        target: Target,
        priority: Priority,
    ) -> SharedFuture<EvaluatedResult> {
        let inner = Arc::clone(&self.inner);
        let subgraph = Arc::clone(subgraph);
        let metas = Arc::clone(metas);
        self.pool.submit(priority, move || {
            let context = inner.context(key, &subgraph, &metas, target);
            let mut state = context.lock().unwrap_or_else(|e| e.into_inner());
            let cost_model = inner
                .cost_model
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            search_step(
                &mut state,
                &subgraph,
                &metas,
                &target,
                inner.measurer.as_ref(),
                cost_model.as_deref(),
                inner.opts.report_profile,
                inner.log.as_deref(),
            )
        })
    }

    /// Synchronously realize a provided entity (no search).
    pub fn schedule_with_entity(
        &self,
        key: SubgraphKey,
        subgraph: &Arc<Subgraph>,
        metas: &Arc<Vec<TensorMeta>>,
        target: Target,
        entity: &ScheduleEntity,
    ) -> Result<RealizedSchedule> {
        let _context = self.inner.context(key, subgraph, metas, target);
        interpret(subgraph, metas, &target, entity)
    }

    /// Ingest a post-measurement score and append the profile record.
    pub fn feedback_for(
        &self,
        key: SubgraphKey,
        subgraph: &Arc<Subgraph>,
        metas: &Arc<Vec<TensorMeta>>,
        schedule: &RealizedSchedule,
        gflops: f64,
    ) {
        let target = self.inner.default_target;
        let context = self.inner.context(key, subgraph, metas, target);
        {
            let mut state = context.lock().unwrap_or_else(|e| e.into_inner());
            state.add_feedback(schedule, gflops);
        }

        if let Some(profile_log) = &self.inner.profile_log {
            let features = feature_extract(schedule, &target);
            let loop_nests: Vec<f64> = features
                .iter()
                .filter_map(|f| f.values.last().copied())
                .collect();
            let record = serde_json::json!({
                "gflop": subgraph.gflop,
                "loop_nests": loop_nests,
                "features": features,
                "schedules": schedule.entity.to_string(),
                "evaluation": gflops,
            });
            profile_log.line(record.to_string());
        }
    }

    /// Current top-K occupancy for a key (0 when no context exists).
    pub fn top_k_len(&self, key: SubgraphKey) -> usize {
        let contexts = self
            .inner
            .contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        contexts
            .get(&key)
            .map(|c| c.lock().unwrap_or_else(|e| e.into_inner()).top_k_len())
            .unwrap_or(0)
    }

    /// Completed proposals for a key.
    pub fn counts(&self, key: SubgraphKey) -> usize {
        let contexts = self
            .inner
            .contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        contexts
            .get(&key)
            .map(|c| c.lock().unwrap_or_else(|e| e.into_inner()).counts)
            .unwrap_or(0)
    }
}

/// One search invocation for one key; the caller holds the state lock,
/// which serializes searches per key.
#[allow(clippy::too_many_arguments)]
fn search_step(
    state: &mut TuneState,
    subgraph: &Subgraph,
    metas: &[TensorMeta],
    target: &Target,
    measurer: &dyn MeasureClient,
    cost_model: Option<&dyn CostModel>,
    report_profile: bool,
    log: Option<&LogSink>,
) -> Result<EvaluatedResult> {
    // Exploitation ladder over the current top-K, ascending by score.
    let snapshot = state.snapshot_sorted();
    let m = snapshot.len();
    let best = snapshot.last().map(|e| e.score).unwrap_or(0.0);
    let weight = EXPLOIT_PROBABILITY * m as f64 / state.topk as f64;
    let p: Vec<f64> = snapshot
        .iter()
        .map(|e| (e.score - best).exp() * weight)
        .collect();

    // Build the candidate batch; the freshness filter applies on the
    // first pass only and is dropped if it yields nothing.
    let mut candidates: Vec<ScheduleEntity> = Vec::new();
    let mut must_new = true;
    while candidates.is_empty() {
        for _ in 0..state.new_trial {
            let mut entity = None;
            if state.rng.f64() < EXPLOIT_PROBABILITY && state.warmed_up() {
                for i in (0..m).rev() {
                    if state.rng.f64() < p[i] {
                        let seed = snapshot[i].entity.clone();
                        entity = Some(state.space.choose_one_with_seed(&seed));
                        break;
                    }
                }
            }
            let entity = entity.unwrap_or_else(|| state.space.choose_one());
            if must_new && state.rejects_as_seen(&entity) {
                continue;
            }
            candidates.push(entity);
        }
        must_new = false;
    }

    let realized: Vec<RealizedSchedule> = candidates
        .par_iter()
        .filter_map(|entity| match interpret(subgraph, metas, target, entity) {
            Ok(schedule) => Some(schedule),
            Err(error) => {
                tracing::debug!(%error, %entity, "dropping unrealizable candidate");
                None
            }
        })
        .collect();
    if realized.is_empty() {
        bail!(
            "no candidate for {} survived interpretation",
            subgraph.name
        );
    }

    let scores: Vec<f64> = if let Some(model) = cost_model {
        model.score(&realized, target, subgraph.gflop)?
    } else {
        match state.policy {
            Policy::Profile => {
                measurer.measure(&realized, target, &target.device_ctx(), subgraph.gflop)?
            }
            Policy::Random => realized.iter().map(|_| state.rng.f64()).collect(),
        }
    };
    if scores.len() != realized.len() {
        bail!(
            "scorer returned {} scores for {} schedules",
            scores.len(),
            realized.len()
        );
    }

    if state.policy == Policy::Profile && cost_model.is_none() {
        for (schedule, &score) in realized.iter().zip(&scores) {
            state.add_feedback(schedule, score);
        }
    }

    if report_profile {
        if let Some(log) = log {
            let rendered: Vec<String> = scores.iter().map(|s| format!("{s:.4}")).collect();
            log.line(format!("judge values: {}", rendered.join(" ")));
        }
    }

    let best_idx = scores
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .expect("non-empty batch");
    Ok(EvaluatedResult {
        schedule: realized[best_idx].clone(),
        entity: realized[best_idx].entity.clone(),
        score: scores[best_idx],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphforge_graph::{ComputeStep, DataType, TensorId};
    use graphforge_measure::RandomMeasure;

    fn subgraph() -> (Arc<Subgraph>, Arc<Vec<TensorMeta>>) {
        let metas = vec![
            TensorMeta::new("x", &[8, 8], DataType::F32),
            TensorMeta::new("w", &[8, 8], DataType::F32),
            TensorMeta::new("y", &[8, 8], DataType::F32),
        ];
        let mut sg = Subgraph {
            name: "mm".into(),
            steps: vec![ComputeStep::MatMul {
                lhs: TensorId(0),
                rhs: TensorId(1),
                dst: TensorId(2),
            }],
            inputs: vec![TensorId(0)],
            labels: vec![],
            outputs: vec![TensorId(2)],
            weights: vec![TensorId(1)],
            loss: None,
            gradients: vec![],
            lr: None,
            updates: vec![],
            tag: String::new(),
            gflop: 0.0,
        };
        sg.tag = sg.compute_tag(&metas);
        sg.gflop = sg.compute_gflop(&metas);
        (Arc::new(sg), Arc::new(metas))
    }

    fn scheduler(policy: Policy, topk: usize, new_trial: usize) -> AutoScheduler {
        AutoScheduler::new(
            Target::llvm(0),
            AutoSchedulerOptions {
                topk,
                new_trial,
                policy,
                parallel: 2,
                report_profile: false,
                rng_seed: Some(17),
            },
            Arc::new(RandomMeasure::with_seed(5)),
            None,
            None,
        )
    }

    #[test]
    fn test_schedule_for_returns_best_of_batch() {
        let (sg, metas) = subgraph();
        let scheduler = scheduler(Policy::Random, 4, 8);
        let result = scheduler
            .schedule_for(SubgraphKey(0), &sg, &metas, Target::llvm(0), Priority::Normal)
            .wait()
            .unwrap();
        assert!((0.0..1.0).contains(&result.score));
        assert_eq!(result.schedule.entity, result.entity);
    }

    #[test]
    fn test_profile_policy_feeds_top_k() {
        let (sg, metas) = subgraph();
        let scheduler = scheduler(Policy::Profile, 4, 8);
        scheduler
            .schedule_for(SubgraphKey(0), &sg, &metas, Target::llvm(0), Priority::Normal)
            .wait()
            .unwrap();
        let len = scheduler.top_k_len(SubgraphKey(0));
        assert!(len > 0 && len <= 4, "top-k length {len}");
    }

    #[test]
    fn test_top_k_bounded_across_many_searches() {
        let (sg, metas) = subgraph();
        let scheduler = scheduler(Policy::Profile, 3, 6);
        for _ in 0..10 {
            scheduler
                .schedule_for(SubgraphKey(0), &sg, &metas, Target::llvm(0), Priority::Normal)
                .wait()
                .unwrap();
        }
        assert!(scheduler.top_k_len(SubgraphKey(0)) <= 3);
    }

    #[test]
    fn test_feedback_for_counts_proposals() {
        let (sg, metas) = subgraph();
        let scheduler = scheduler(Policy::Random, 4, 4);
        let result = scheduler
            .schedule_for(SubgraphKey(0), &sg, &metas, Target::llvm(0), Priority::Normal)
            .wait()
            .unwrap();
        scheduler.feedback_for(SubgraphKey(0), &sg, &metas, &result.schedule, 2.5);
        assert_eq!(scheduler.counts(SubgraphKey(0)), 1);
        assert_eq!(scheduler.top_k_len(SubgraphKey(0)), 1);
    }

    #[test]
    fn test_schedule_with_entity_is_synchronous() {
        let (sg, metas) = subgraph();
        let scheduler = scheduler(Policy::Random, 4, 4);
        let entity = ScheduleEntity {
            tile_m: 4,
            tile_n: 4,
            tile_k: 4,
            vector_width: 4,
            unroll: 2,
            fuse: false,
        };
        let realized = scheduler
            .schedule_with_entity(SubgraphKey(0), &sg, &metas, Target::llvm(0), &entity)
            .unwrap();
        assert_eq!(realized.entity, entity);
    }

    #[test]
    fn test_cost_model_replaces_scoring() {
        struct FixedModel;
        impl CostModel for FixedModel {
            fn score(
                &self,
                schedules: &[RealizedSchedule],
                _target: &Target,
                _gflop: f64,
            ) -> Result<Vec<f64>> {
                Ok((0..schedules.len()).map(|i| i as f64).collect())
            }
        }

        let (sg, metas) = subgraph();
        let scheduler = scheduler(Policy::Random, 4, 5);
        scheduler.register_cost_model(Arc::new(FixedModel));
        let result = scheduler
            .schedule_for(SubgraphKey(0), &sg, &metas, Target::llvm(0), Priority::Normal)
            .wait()
            .unwrap();
        // The model scores by batch index, so the last candidate wins.
        assert_eq!(result.score, 4.0);
    }
}
