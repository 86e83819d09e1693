//! End-to-end pipeline tests: tuning sessions over small graphs with
//! the deterministic random policy.

use anyhow::Result;
use graphforge_autoschedule::Policy;
use graphforge_builder::{Callable, Codegen, Module, NativeCodegen};
use graphforge_graph::{
    ComputeStep, DataType, Graph, NodeSpec, SubgraphKey, Target, TensorBuffer, TensorId,
};
use graphforge_runtime::{Bindings, Session, SessionOptions};
use graphforge_space::RealizedSchedule;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn random_policy_options(seed: u64) -> SessionOptions {
    SessionOptions {
        autoschedule_policy: Policy::Random,
        autoschedule_new_trial: 4,
        autoschedule_parallel: 2,
        build_parallel: 2,
        rng_seed: Some(seed),
        ..SessionOptions::default()
    }
}

/// One matmul node: y = x @ w with x as input and w as weight.
fn singleton_graph() -> (Graph, TensorId, TensorId, TensorId) {
    let mut b = Graph::builder();
    let x = b.tensor("x", &[4, 8], DataType::F32);
    let w = b.tensor("w", &[8, 4], DataType::F32);
    let y = b.tensor("y", &[4, 4], DataType::F32);
    b.add_node(NodeSpec {
        name: "mm".into(),
        steps: vec![ComputeStep::MatMul {
            lhs: x,
            rhs: w,
            dst: y,
        }],
        inputs: vec![x],
        outputs: vec![y],
        weights: vec![w],
        ..NodeSpec::default()
    });
    (b.build(), x, w, y)
}

fn chain_graph() -> Graph {
    let mut b = Graph::builder();
    let x = b.tensor("x", &[4, 8], DataType::F32);
    let w0 = b.tensor("w0", &[8, 8], DataType::F32);
    let h = b.tensor("h", &[4, 8], DataType::F32);
    let w1 = b.tensor("w1", &[8, 2], DataType::F32);
    let y = b.tensor("y", &[4, 2], DataType::F32);
    b.add_node(NodeSpec {
        name: "a".into(),
        steps: vec![ComputeStep::MatMul {
            lhs: x,
            rhs: w0,
            dst: h,
        }],
        inputs: vec![x],
        outputs: vec![h],
        weights: vec![w0],
        ..NodeSpec::default()
    });
    b.add_node(NodeSpec {
        name: "b".into(),
        steps: vec![ComputeStep::MatMul {
            lhs: h,
            rhs: w1,
            dst: y,
        }],
        inputs: vec![h],
        outputs: vec![y],
        weights: vec![w1],
        ..NodeSpec::default()
    });
    b.build()
}

/// Two structurally identical, independent nodes sharing one tag.
fn twin_graph() -> Graph {
    let mut b = Graph::builder();
    let mut nodes = Vec::new();
    for i in 0..2 {
        let x = b.tensor(format!("x{i}"), &[4, 4], DataType::F32);
        let w = b.tensor(format!("w{i}"), &[4, 4], DataType::F32);
        let y = b.tensor(format!("y{i}"), &[4, 4], DataType::F32);
        nodes.push(NodeSpec {
            name: format!("mm{i}"),
            steps: vec![ComputeStep::MatMul {
                lhs: x,
                rhs: w,
                dst: y,
            }],
            inputs: vec![x],
            outputs: vec![y],
            weights: vec![w],
            ..NodeSpec::default()
        });
    }
    for node in nodes {
        b.add_node(node);
    }
    b.build()
}

fn input_binding(graph: &Graph, id: TensorId, values: Vec<f32>) -> Result<(TensorId, Arc<TensorBuffer>)> {
    let meta = graph.meta(id)?.clone();
    Ok((id, Arc::new(TensorBuffer::from_vec(meta, values)?)))
}

fn tune_to_completion(session: &Arc<Session>, task_id: usize, advance_number: usize) -> Result<()> {
    session.begin_tuning(task_id, advance_number, None, advance_number, 0.5)?;
    session.end_tuning(task_id)?;
    assert!(session.is_cached(task_id), "tuning must reach cached-all");
    Ok(())
}

#[test]
fn singleton_graph_converges_and_executes() -> Result<()> {
    let (graph, x, _w, y) = singleton_graph();
    let session = Session::new(Target::llvm(0), random_policy_options(1))?;
    session.initialize_weights(&graph, &[vec![0.5; 32]])?;
    let task_id = session.add_task(&graph)?;
    tune_to_completion(&session, task_id, 1)?;

    // Execute two iterations against live bindings.
    let binding: Bindings =
        HashMap::from([input_binding(&graph, x, vec![1.0; 32])?]);
    session.run(task_id, &[binding.clone(), binding], None, 1)?;

    // y = x @ w = sum over 8 of 1.0 * 0.5
    let out = session.get_data(&[y])?;
    let values = out[0].read();
    assert!(values.iter().all(|v| (v - 4.0).abs() < 1e-5), "{values:?}");
    Ok(())
}

#[test]
fn chain_converges_with_best_for_every_key() -> Result<()> {
    let graph = chain_graph();
    let session = Session::new(Target::llvm(0), random_policy_options(2))?;
    session.initialize_weights(&graph, &[vec![0.1; 64], vec![0.2; 16]])?;
    let task_id = session.add_task(&graph)?;
    tune_to_completion(&session, task_id, 2)?;

    // Both subgraphs must hold a runnable best artifact; the search
    // memory stays bounded by the configured top-K.
    for key in [SubgraphKey(0), SubgraphKey(1)] {
        assert!(session.auto_scheduler().top_k_len(key) <= 20);
    }
    let binding: Bindings = HashMap::from([input_binding(
        &graph,
        TensorId(0),
        vec![1.0; 32],
    )?]);
    session.run(task_id, &[binding], None, 0)?;
    Ok(())
}

#[test]
fn tag_aliasing_covers_twin_subgraphs() -> Result<()> {
    let graph = twin_graph();
    let session = Session::new(Target::llvm(0), random_policy_options(3))?;
    session.initialize_weights(&graph, &[vec![0.25; 16], vec![0.25; 16]])?;
    let task_id = session.add_task(&graph)?;
    tune_to_completion(&session, task_id, 1)?;

    // The second twin never got its own artifact (its tag was already
    // scheduled), so its best is an alias of the first twin's.
    let binding: Bindings = HashMap::from([
        input_binding(&graph, TensorId(0), vec![1.0; 16])?,
        input_binding(&graph, TensorId(3), vec![2.0; 16])?,
    ]);
    session.run(task_id, &[binding], None, 0)?;

    let outs = session.get_data(&[TensorId(2), TensorId(5)])?;
    let first = outs[0].read();
    let second = outs[1].read();
    assert!(first.iter().all(|v| (v - 1.0).abs() < 1e-5), "{first:?}");
    assert!(second.iter().all(|v| (v - 2.0).abs() < 1e-5), "{second:?}");
    Ok(())
}

#[test]
fn reference_round_trip_restores_best_records() -> Result<()> {
    let dir = std::env::temp_dir().join("graphforge-reference-test");
    std::fs::create_dir_all(&dir)?;
    let reference = dir.join(format!("ref-{}.txt", std::process::id()));
    let _ = std::fs::remove_file(&reference);

    let (graph, x, _w, _y) = singleton_graph();
    let recorded_gflops;
    {
        let session = Session::new(Target::llvm(0), random_policy_options(4))?;
        session.initialize_weights(&graph, &[vec![0.5; 32]])?;
        let task_id = session.add_task(&graph)?;
        tune_to_completion(&session, task_id, 1)?;

        let binding: Bindings =
            HashMap::from([input_binding(&graph, x, vec![1.0; 32])?]);
        session.run(task_id, &[binding], Some(&reference), 0)?;

        let content = std::fs::read_to_string(&reference)?;
        let line = content.lines().next().expect("one reference line");
        let fields: Vec<&str> = line.split('|').collect();
        assert_eq!(fields.len(), 4);
        assert_eq!(fields[0], "0");
        recorded_gflops = fields[2].parse::<f64>()?;
        assert!(recorded_gflops > 0.0);
    }

    // A fresh session restores the recorded best without tuning.
    let session = Session::new(Target::llvm(0), random_policy_options(5))?;
    session.initialize_weights(&graph, &[vec![0.5; 32]])?;
    let task_id = session.add_task(&graph)?;
    session.prepare_for_test(task_id, &reference)?;
    assert!(session.is_cached(task_id));

    let binding: Bindings = HashMap::from([input_binding(&graph, x, vec![1.0; 32])?]);
    session.run(task_id, &[binding], Some(&reference), 0)?;
    let content = std::fs::read_to_string(&reference)?;
    let fields: Vec<&str> = content.lines().next().unwrap().split('|').collect();
    let restored_gflops = fields[2].parse::<f64>()?;
    assert!(
        (restored_gflops - recorded_gflops).abs() < 1e-6,
        "restored {restored_gflops} vs recorded {recorded_gflops}"
    );

    std::fs::remove_file(&reference)?;
    Ok(())
}

#[test]
fn training_update_aliases_weight_buffer() -> Result<()> {
    let mut b = Graph::builder();
    let w = b.tensor("w", &[2, 2], DataType::F32);
    let g = b.tensor("g", &[2, 2], DataType::F32);
    let lr = b.tensor("lr", &[1], DataType::F32);
    let u = b.tensor("u", &[2, 2], DataType::F32);
    b.add_node(NodeSpec {
        name: "sgd".into(),
        steps: vec![ComputeStep::Sgd {
            weight: w,
            grad: g,
            lr: Some(lr),
            dst: u,
        }],
        weights: vec![w],
        gradients: vec![g],
        lr: Some(lr),
        updates: vec![u],
        ..NodeSpec::default()
    });
    let graph = b.build();

    let session = Session::new(Target::llvm(0), random_policy_options(9))?;
    session.initialize_weights(&graph, &[vec![1.0; 4]])?;
    let task_id = session.add_task(&graph)?;
    tune_to_completion(&session, task_id, 1)?;

    // Seed a non-zero gradient, then run one update step; the update
    // tensor shares the weight's buffer, so the weight itself moves.
    session.get_data(&[g])?[0].fill_from(&[0.5; 4])?;
    let binding: Bindings = HashMap::from([input_binding(&graph, lr, vec![0.1])?]);
    session.run(task_id, &[binding], None, 0)?;

    let weight = session.get_data(&[w])?;
    let values = weight[0].read();
    assert!(values.iter().all(|v| (v - 0.95).abs() < 1e-5), "{values:?}");
    Ok(())
}

#[test]
fn run_before_tuning_is_rejected() -> Result<()> {
    let (graph, x, _w, _y) = singleton_graph();
    let session = Session::new(Target::llvm(0), random_policy_options(6))?;
    session.initialize_weights(&graph, &[vec![0.5; 32]])?;
    let task_id = session.add_task(&graph)?;

    let binding: Bindings = HashMap::from([input_binding(&graph, x, vec![1.0; 32])?]);
    assert!(session.run(task_id, &[binding], None, 0).is_err());
    assert!(session.run(99, &[], None, 0).is_err());
    Ok(())
}

#[test]
fn cancellation_stops_new_proposals() -> Result<()> {
    let (graph, _x, _w, _y) = singleton_graph();
    let session = Session::new(Target::llvm(0), random_policy_options(7))?;
    session.initialize_weights(&graph, &[vec![0.5; 32]])?;
    let task_id = session.add_task(&graph)?;
    tune_to_completion(&session, task_id, 2)?;
    assert!(!session.is_in_tuning(task_id));

    // After end_tuning joins the workers, the proposal counter must not
    // move again.
    let counts = session.auto_scheduler().counts(SubgraphKey(0));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(session.auto_scheduler().counts(SubgraphKey(0)), counts);
    Ok(())
}

/// Codegen whose first module fails at run time; later compiles fall
/// through to the native backend. Drives the emergency reschedule path.
struct FlakyCodegen {
    native: NativeCodegen,
    remaining_faults: AtomicUsize,
}

impl FlakyCodegen {
    fn new(faults: usize) -> Self {
        Self {
            native: NativeCodegen,
            remaining_faults: AtomicUsize::new(faults),
        }
    }
}

impl Codegen for FlakyCodegen {
    fn compile(&self, schedule: &RealizedSchedule, target: &Target, name: &str) -> Result<Module> {
        let fault = self
            .remaining_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fault {
            let entry: Callable = Arc::new(|_args| anyhow::bail!("injected kernel fault"));
            return Ok(Module::new(name, entry));
        }
        self.native.compile(schedule, target, name)
    }
}

#[test]
fn emergency_path_recovers_from_unrunnable_artifacts() -> Result<()> {
    let (graph, x, _w, _y) = singleton_graph();
    let session = Session::with_components(
        Target::llvm(0),
        random_policy_options(8),
        Arc::new(FlakyCodegen::new(1)),
        None,
    )?;
    session.initialize_weights(&graph, &[vec![0.5; 32]])?;
    let task_id = session.add_task(&graph)?;

    // The first artifact cannot run, so the evaluate worker raises an
    // emergency reschedule; tuning still converges on a working module.
    tune_to_completion(&session, task_id, 1)?;

    let binding: Bindings = HashMap::from([input_binding(&graph, x, vec![1.0; 32])?]);
    session.run(task_id, &[binding], None, 0)?;
    Ok(())
}
