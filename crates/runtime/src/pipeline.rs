//! The per-task pipeline workers: schedule, build, and evaluate.
//!
//! Each worker walks the task's DAG with a free-set of
//! zero-predecessor nodes, deduplicates work by subgraph tag, polls the
//! finish latch between nodes, and drains its emergency lane ahead of
//! normal work. Successor counters advance only on normal processing;
//! emergency jobs never move the traversal.

use crate::session::Session;
use crate::tables::{BestRecord, BuiltArtifact, FutureEntry, BUILT_QUEUE_CAPACITY};
use anyhow::{Context, Result};
use graphforge_graph::{MultiGraph, SubgraphKey, Target, TensorBuffer};
use graphforge_measure::evaluate_performance;
use graphforge_pool::Priority;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Pause between fruitless sweeps while waiting on an upstream stage.
const IDLE_BACKOFF: Duration = Duration::from_millis(1);

/// Second-stage free set: the `take` keys with the largest current best
/// elapsed time (the worst offenders get retuned first). Keys without a
/// best record are not eligible.
pub(crate) fn slowest_keys(
    multi: &MultiGraph,
    best: &crate::tables::BestTable,
    take: usize,
) -> BTreeSet<SubgraphKey> {
    let mut timed: Vec<(SubgraphKey, f64)> = multi
        .subgraphs
        .keys()
        .filter_map(|&k| best.get(k).map(|b| (k, b.elapsed_ms)))
        .collect();
    timed.sort_by(|a, b| b.1.total_cmp(&a.1));
    timed.into_iter().take(take).map(|(k, _)| k).collect()
}

fn dag_traversal(multi: &MultiGraph) -> (HashMap<SubgraphKey, usize>, BTreeSet<SubgraphKey>) {
    let mut order = HashMap::new();
    let mut free = BTreeSet::new();
    for (&key, attrs) in &multi.attrs {
        order.insert(key, attrs.predecessor_count);
        if attrs.predecessor_count == 0 {
            free.insert(key);
        }
    }
    (order, free)
}

fn advance_successors(
    multi: &MultiGraph,
    key: SubgraphKey,
    order: &mut HashMap<SubgraphKey, usize>,
    update: &mut BTreeSet<SubgraphKey>,
) -> Result<()> {
    let attrs = multi
        .attrs
        .get(&key)
        .with_context(|| format!("can't find attributes of subgraph {key}"))?;
    for &succ in &attrs.successors {
        let count = order
            .get_mut(&succ)
            .with_context(|| format!("missing successor entry {succ}"))?;
        *count = count.saturating_sub(1);
        if *count == 0 {
            update.insert(succ);
        }
    }
    Ok(())
}

impl Session {
    /// Abort a tuning task on an invariant violation: descriptive
    /// message, tuning flag cleared, workers told to stop.
    fn abort_task(&self, task_id: usize, message: &str) {
        tracing::error!(task_id, message, "aborting tuning task");
        for log in [&self.autoschedule_log, &self.build_log, &self.evaluate_log]
            .into_iter()
            .flatten()
        {
            log.line(format!("task {task_id} aborted: {message}"));
        }
        self.in_tuning
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&task_id);
        self.finish.set(task_id, true);
    }

    /// Serve one key from the emergency schedule lane, if any. Returns
    /// true when a key was handled.
    fn drain_emergency_schedule(&self, multi: &MultiGraph) -> bool {
        let Some(key) = self.emergency_schedule_queue.pop() else {
            return false;
        };
        let Ok(subgraph) = multi.subgraph(key) else {
            tracing::warn!(%key, "emergency queue referenced an unknown subgraph");
            return true;
        };
        let future = self.auto_scheduler.schedule_for(
            key,
            subgraph,
            &multi.tensors,
            self.target,
            Priority::Emergency,
        );
        match future.wait_timeout(self.opts.autoschedule_timeout()) {
            Ok(result) => {
                let (schedule, module) = self.function_builder.build_for(
                    result.schedule,
                    self.target,
                    Target::llvm(0),
                    Session::func_name(key),
                    Priority::Emergency,
                );
                self.future_functions.push(key, FutureEntry { schedule, module });
                self.emergency_build_queue.push(key);
            }
            Err(error) => {
                if let Some(log) = &self.autoschedule_log {
                    log.line(format!("can't get emergency schedule for {key}: {error:#}"));
                }
            }
        }
        true
    }

    /// Serve one key from the emergency build lane. Returns true when a
    /// key made progress (a key without a pending future is requeued and
    /// counts as no progress).
    fn drain_emergency_build(&self, task_id: usize) -> bool {
        let Some(key) = self.emergency_build_queue.pop() else {
            return false;
        };
        let Some(entry) = self.future_functions.pop(key) else {
            self.emergency_build_queue.push(key);
            return false;
        };
        match entry.module.wait_timeout(self.opts.build_timeout()) {
            Ok(module) => {
                let name = Session::func_name(key);
                let Some(callable) = module.get_function(&name) else {
                    self.abort_task(task_id, &format!("null callable for subgraph {key}"));
                    return true;
                };
                self.built_functions.push_blocking(
                    key,
                    BuiltArtifact {
                        schedule: entry.schedule,
                        module,
                        callable,
                    },
                    &|| self.finish.get(task_id),
                );
            }
            Err(error) => {
                if let Some(log) = &self.build_log {
                    log.line(format!("can't get emergency build for {key}: {error:#}"));
                }
            }
        }
        true
    }

    /// The schedule worker: §first-stage DAG sweeps and second-stage
    /// retuning of the slowest keys, then an emergency-only wait loop.
    pub(crate) fn run_autoschedule(
        self: &Arc<Self>,
        task_id: usize,
        multi: &Arc<MultiGraph>,
        advance_number: usize,
        first_stage_number: usize,
        second_stage_topk_ratio: f64,
    ) {
        let num_subgraphs = multi.num_subgraphs();
        let second_stage_topk =
            ((num_subgraphs as f64) * second_stage_topk_ratio).ceil() as usize;
        let mut rng = match self.opts.rng_seed {
            Some(seed) => fastrand::Rng::with_seed(seed ^ 0x5eed_5eed),
            None => fastrand::Rng::new(),
        };

        for ad in 0..advance_number {
            if self.finish.get(task_id) {
                return;
            }
            if let Some(log) = &self.autoschedule_log {
                log.line(format!("schedule iteration {ad}"));
            }

            let in_first_stage = ad < first_stage_number
                || !self.cached_all_functions.get(task_id)
                || rng.f64() < self.opts.execution_explore_probability;

            let (mut order, mut free) = if in_first_stage {
                dag_traversal(multi)
            } else {
                // Retune the currently-slowest keys; they are treated as
                // leaves, no DAG traversal.
                let free = slowest_keys(multi, &self.best_functions, second_stage_topk);
                (HashMap::new(), free)
            };

            let mut scheduled_tags: HashSet<String> = HashSet::new();
            let mut schedule_count = 0usize;
            while !free.is_empty() {
                let mut update_set = BTreeSet::new();
                let mut delete_set = BTreeSet::new();
                for &cand in &free {
                    if self.finish.get(task_id) {
                        return;
                    }
                    self.drain_emergency_schedule(multi);

                    let Ok(subgraph) = multi.subgraph(cand) else {
                        self.abort_task(task_id, &format!("can't find subgraph {cand}"));
                        return;
                    };

                    if scheduled_tags.contains(&subgraph.tag) {
                        delete_set.insert(cand);
                        if in_first_stage {
                            if let Err(error) =
                                advance_successors(multi, cand, &mut order, &mut update_set)
                            {
                                self.abort_task(task_id, &format!("{error:#}"));
                                return;
                            }
                        }
                        schedule_count += 1;
                        continue;
                    }

                    let future = self.auto_scheduler.schedule_for(
                        cand,
                        subgraph,
                        &multi.tensors,
                        self.target,
                        Priority::Normal,
                    );
                    match future.wait_timeout(self.opts.autoschedule_timeout()) {
                        Ok(result) => {
                            let (schedule, module) = self.function_builder.build_for(
                                result.schedule,
                                self.target,
                                Target::llvm(0),
                                Session::func_name(cand),
                                Priority::Normal,
                            );
                            if self.future_functions.len(cand) > BUILT_QUEUE_CAPACITY {
                                if let Some(log) = &self.autoschedule_log {
                                    log.line(format!("too many pending schedules for {cand}"));
                                }
                            } else {
                                self.future_functions
                                    .push(cand, FutureEntry { schedule, module });
                            }
                            delete_set.insert(cand);
                            if in_first_stage {
                                if let Err(error) =
                                    advance_successors(multi, cand, &mut order, &mut update_set)
                                {
                                    self.abort_task(task_id, &format!("{error:#}"));
                                    return;
                                }
                            }
                            schedule_count += 1;
                            scheduled_tags.insert(subgraph.tag.clone());
                        }
                        Err(error) => {
                            // Dropped candidate; the node stays in the
                            // free set and is retried next sweep.
                            if let Some(log) = &self.autoschedule_log {
                                log.line(format!("can't get schedule for {cand}: {error:#}"));
                            }
                        }
                    }
                }
                let progressed = !delete_set.is_empty();
                for key in &delete_set {
                    free.remove(key);
                }
                for key in update_set {
                    free.insert(key);
                }
                if !progressed {
                    std::thread::sleep(IDLE_BACKOFF);
                }
            }

            if in_first_stage && schedule_count != num_subgraphs {
                self.abort_task(
                    task_id,
                    &format!("schedule graph number mismatch {schedule_count} vs {num_subgraphs}"),
                );
                return;
            }
            if let Some(log) = &self.autoschedule_log {
                log.line(format!(
                    "scheduled {schedule_count} subgraphs out of {num_subgraphs}"
                ));
            }
        }

        // Iterations done; keep serving emergencies until cancelled.
        loop {
            if self.finish.get(task_id) {
                return;
            }
            if !self.drain_emergency_schedule(multi) {
                std::thread::sleep(IDLE_BACKOFF);
            }
        }
    }

    /// The build worker: resolves module futures per node in DAG order
    /// and feeds the bounded built queue.
    pub(crate) fn run_build(
        self: &Arc<Self>,
        task_id: usize,
        multi: &Arc<MultiGraph>,
        advance_number: usize,
    ) {
        let num_subgraphs = multi.num_subgraphs();
        for ad in 0..advance_number {
            let allow_missing = self.cached_all_functions.get(task_id);
            if self.finish.get(task_id) {
                return;
            }
            if let Some(log) = &self.build_log {
                log.line(format!("build iteration {ad}"));
            }

            let (mut order, mut free) = dag_traversal(multi);
            let mut built_tags: HashSet<String> = HashSet::new();
            let mut build_count = 0usize;
            while !free.is_empty() {
                let mut update_set = BTreeSet::new();
                let mut delete_set = BTreeSet::new();
                let mut progressed = false;
                for &cand in &free {
                    if self.finish.get(task_id) {
                        return;
                    }
                    self.drain_emergency_build(task_id);

                    let Ok(subgraph) = multi.subgraph(cand) else {
                        self.abort_task(task_id, &format!("can't find subgraph {cand}"));
                        return;
                    };

                    let mut advance = |update_set: &mut BTreeSet<SubgraphKey>,
                                       order: &mut HashMap<SubgraphKey, usize>|
                     -> bool {
                        match advance_successors(multi, cand, order, update_set) {
                            Ok(()) => true,
                            Err(error) => {
                                self.abort_task(task_id, &format!("{error:#}"));
                                false
                            }
                        }
                    };

                    if built_tags.contains(&subgraph.tag) {
                        delete_set.insert(cand);
                        if !advance(&mut update_set, &mut order) {
                            return;
                        }
                        build_count += 1;
                        progressed = true;
                        continue;
                    }

                    if let Some(entry) = self.future_functions.pop(cand) {
                        match entry.module.wait_timeout(self.opts.build_timeout()) {
                            Ok(module) => {
                                let name = Session::func_name(cand);
                                let Some(callable) = module.get_function(&name) else {
                                    self.abort_task(
                                        task_id,
                                        &format!("null callable for subgraph {cand}"),
                                    );
                                    return;
                                };
                                let pushed = self.built_functions.push_blocking(
                                    cand,
                                    BuiltArtifact {
                                        schedule: entry.schedule,
                                        module,
                                        callable,
                                    },
                                    &|| self.finish.get(task_id),
                                );
                                if !pushed {
                                    return;
                                }
                                delete_set.insert(cand);
                                if !advance(&mut update_set, &mut order) {
                                    return;
                                }
                                build_count += 1;
                                built_tags.insert(subgraph.tag.clone());
                                progressed = true;
                            }
                            Err(error) => {
                                if let Some(log) = &self.build_log {
                                    log.line(format!("can't get build for {cand}: {error:#}"));
                                }
                                if allow_missing {
                                    delete_set.insert(cand);
                                    if !advance(&mut update_set, &mut order) {
                                        return;
                                    }
                                    progressed = true;
                                }
                            }
                        }
                    } else if allow_missing {
                        delete_set.insert(cand);
                        if !advance(&mut update_set, &mut order) {
                            return;
                        }
                        progressed = true;
                    }
                }
                for key in &delete_set {
                    free.remove(key);
                }
                for key in update_set {
                    free.insert(key);
                }
                if !progressed {
                    std::thread::sleep(IDLE_BACKOFF);
                }
            }

            if !allow_missing && build_count != num_subgraphs {
                self.abort_task(
                    task_id,
                    &format!("build graph number mismatch {build_count} vs {num_subgraphs}"),
                );
                return;
            }
            if let Some(log) = &self.build_log {
                log.line(format!(
                    "built {build_count} subgraphs out of {num_subgraphs}"
                ));
            }
        }

        loop {
            if self.finish.get(task_id) {
                return;
            }
            if !self.drain_emergency_build(task_id) {
                std::thread::sleep(IDLE_BACKOFF);
            }
        }
    }

    /// The evaluate worker: measures built artifacts, feeds scores back
    /// into the autoscheduler, maintains best records, aliases by tag,
    /// and raises emergencies for starved nodes. Sets the cache-all
    /// latch after every full pass.
    pub(crate) fn run_evaluate(self: &Arc<Self>, task_id: usize, multi: &Arc<MultiGraph>) {
        loop {
            let allow_missing = self.cached_all_functions.get(task_id);
            if self.finish.get(task_id) {
                return;
            }

            let mut evaluate_cache: HashMap<String, SubgraphKey> = HashMap::new();
            let mut evaluated_any = false;
            let (mut order, mut free) = dag_traversal(multi);
            while !free.is_empty() {
                if self.finish.get(task_id) {
                    return;
                }
                let mut update_set = BTreeSet::new();
                let mut delete_set = BTreeSet::new();
                let mut progressed = false;
                for &key in &free {
                    let Ok(subgraph) = multi.subgraph(key) else {
                        self.abort_task(task_id, &format!("can't find subgraph {key}"));
                        return;
                    };

                    let mut succ = false;
                    let mut taken = false;
                    if let Some(artifact) = self.built_functions.pop(key) {
                        taken = true;
                        evaluated_any = true;
                        let name = Session::func_name(key);
                        let buffers: Vec<Arc<TensorBuffer>> = artifact
                            .schedule
                            .tensors
                            .iter()
                            .map(|meta| Arc::new(TensorBuffer::zeros(meta.clone())))
                            .collect();
                        let elapsed_ms =
                            evaluate_performance(&artifact.module, &name, &buffers);
                        if let Some(log) = &self.evaluate_log {
                            log.line(format!(
                                "evaluate result for {key} is {elapsed_ms:.4} ms"
                            ));
                        }

                        if elapsed_ms > 0.0 {
                            let gflops = subgraph.gflop / (elapsed_ms / 1e3 + 1e-8);
                            self.auto_scheduler.feedback_for(
                                key,
                                subgraph,
                                &multi.tensors,
                                &artifact.schedule,
                                gflops,
                            );
                            let replaced = self.best_functions.replace_if_better(
                                key,
                                BestRecord {
                                    schedule: artifact.schedule.clone(),
                                    module: artifact.module.clone(),
                                    callable: artifact.callable.clone(),
                                    gflops,
                                    elapsed_ms,
                                },
                            );
                            if replaced {
                                if let Some(log) = &self.evaluate_log {
                                    log.line(format!(
                                        "best function for {key}: {gflops:.4} GFLOPS"
                                    ));
                                }
                            }
                            succ = true;
                            evaluate_cache.insert(subgraph.tag.clone(), key);
                        } else {
                            if let Some(log) = &self.evaluate_log {
                                log.line(format!("can't evaluate function for {key}"));
                            }
                            self.auto_scheduler.feedback_for(
                                key,
                                subgraph,
                                &multi.tensors,
                                &artifact.schedule,
                                0.0,
                            );
                        }
                    }

                    if !succ {
                        if let Some(&repeat) = evaluate_cache.get(&subgraph.tag) {
                            if let Some(best) = self.best_functions.get(repeat) {
                                self.best_functions.force_set(key, best);
                                succ = true;
                            }
                        }
                    }

                    // Consumed an artifact, gained nothing, and nothing
                    // runnable exists: ask for an urgent reschedule.
                    if !succ && taken && !self.best_functions.contains(key) {
                        self.emergency_schedule_queue.push(key);
                    }

                    if succ || allow_missing {
                        delete_set.insert(key);
                        if let Err(error) =
                            advance_successors(multi, key, &mut order, &mut update_set)
                        {
                            self.abort_task(task_id, &format!("{error:#}"));
                            return;
                        }
                        progressed = true;
                    }
                }
                for key in &delete_set {
                    free.remove(key);
                }
                for key in update_set {
                    free.insert(key);
                }
                if !progressed {
                    std::thread::sleep(IDLE_BACKOFF);
                }
            }

            self.cached_all_functions.set(task_id, true);
            // A pass that found nothing to measure means the upstream
            // stages are idle; back off instead of re-walking the DAG.
            if !evaluated_any {
                std::thread::sleep(IDLE_BACKOFF);
            }
        }
    }
}
