//! Invariants that must hold for every run.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::{json, Value};

use ensemble_core::config::EngineConfig;
use ensemble_core::requirement::Resolution;
use ensemble_core::run::{Run, RunState, StepOutput};
use ensemble_core::traits::RunStore;
use ensemble_engine::{Engine, FnStep, Predicate, StepOutcome, Workflow, WorkflowNode};
use ensemble_store::{MemoryStore, SqliteStore};
use ensemble_test_utils::{answer, call, MockTool, ScriptedInference};

fn assert_paused_iff_pending(run: &Run) {
    assert_eq!(
        run.state == RunState::Paused,
        !run.pending_requirements.is_empty(),
        "state {} with {} pending",
        run.state,
        run.pending_requirements.len()
    );
}

#[tokio::test]
async fn paused_exactly_when_requirements_are_pending() {
    let store = Arc::new(MemoryStore::new());
    let engine = Engine::new(store.clone(), EngineConfig::default());
    let inference = Arc::new(ScriptedInference::new(vec![
        call("approve", json!({})),
        call("approve", json!({})),
        answer("finished"),
    ]));
    engine
        .register(Workflow::from_step(
            engine
                .agent("clerk", inference)
                .with_tool(MockTool::new("approve", "ok").requiring_confirmation()),
        ))
        .unwrap();

    let mut run = engine.start_run("clerk", json!("file it"), None).await.unwrap();
    assert_paused_iff_pending(&run);
    let mut passes = 0;
    while run.state == RunState::Paused {
        passes += 1;
        let resolutions = run
            .pending_requirements
            .iter()
            .map(|r| (r.id.clone(), Resolution::Confirm))
            .collect::<HashMap<_, _>>();
        run = engine.continue_run(&run.run_id, resolutions).await.unwrap();
        assert_paused_iff_pending(&run);
        assert_paused_iff_pending(&store.load_run(&run.run_id).await.unwrap().unwrap());
    }
    assert_eq!(passes, 2);
    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.resolved_requirements.len(), 2);
}

#[tokio::test]
async fn loop_never_exceeds_its_bound() {
    // Always false, always true, and alternating end conditions.
    let patterns: Vec<Box<dyn Fn(u32) -> bool + Send + Sync>> = vec![
        Box::new(|_| false),
        Box::new(|_| true),
        Box::new(|i| i % 2 == 0),
        Box::new(|i| i == 7),
    ];
    let max_iterations = 4;

    for (n, pattern) in patterns.into_iter().enumerate() {
        let engine = Engine::new(Arc::new(MemoryStore::new()), EngineConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let end = Predicate::func(move |b| pattern(b.current_iteration()));
        engine
            .register(Workflow::new(
                "bounded",
                WorkflowNode::repeat(
                    "bounded",
                    vec![WorkflowNode::step(FnStep::from_output("body", move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        StepOutput::success("tick")
                    }))],
                    Some(end),
                    max_iterations,
                ),
            ))
            .unwrap();

        let run = engine.start_run("bounded", Value::Null, None).await.unwrap();
        let iterations = calls.load(Ordering::SeqCst);
        assert!(iterations >= 1, "pattern {n}");
        assert!(iterations <= max_iterations as usize, "pattern {n}: {iterations}");
        assert_eq!(run.state, RunState::Completed);
    }
}

fn jittered(name: &'static str) -> WorkflowNode {
    WorkflowNode::step(FnStep::new(name, move |_input, _ctx| {
        let delay = Duration::from_millis(rand::thread_rng().gen_range(0..5));
        async move {
            tokio::time::sleep(delay).await;
            Ok(StepOutcome::Completed(StepOutput::success(name)))
        }
    }))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn parallel_output_keys_ignore_completion_order() {
    let engine = Engine::new(Arc::new(MemoryStore::new()), EngineConfig::default());
    engine
        .register(Workflow::new(
            "fanout",
            WorkflowNode::parallel("fanout", vec![jittered("a"), jittered("b")]),
        ))
        .unwrap();
    let expected: BTreeSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();

    for _ in 0..50 {
        let run = engine.start_run("fanout", Value::Null, None).await.unwrap();
        let output = run.output.unwrap();
        assert!(output.success);
        let keys: BTreeSet<String> = output
            .content
            .as_object()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        assert_eq!(keys, expected);
        assert_eq!(output.content["a"], json!("a"));
        assert_eq!(output.content["b"], json!("b"));
    }
}

#[tokio::test]
async fn snapshots_round_trip_in_every_state() {
    let store = SqliteStore::in_memory().unwrap();
    let mut run = Run::new("wf", json!({"topic": "rust"}), Default::default());
    store.save_run(&run).await.unwrap();
    assert_eq!(store.load_run(&run.run_id).await.unwrap().unwrap(), run);

    // A paused run, with everything resume needs, produced by a real engine pass.
    let engine = Engine::new(Arc::new(MemoryStore::new()), EngineConfig::default());
    let inference = Arc::new(ScriptedInference::new(vec![call("sign", json!({"doc": 1}))]));
    engine
        .register(Workflow::new(
            "sign",
            vec![
                WorkflowNode::step(FnStep::from_output("prepare", |_| {
                    StepOutput::success("draft").with_state("stage", json!("prepared"))
                })),
                WorkflowNode::step(
                    engine
                        .agent("signer", inference)
                        .with_tool(MockTool::new("sign", "signed").requiring_confirmation()),
                ),
            ],
        ))
        .unwrap();
    let paused = engine.start_run("sign", Value::Null, None).await.unwrap();
    assert_eq!(paused.state, RunState::Paused);
    assert!(!paused.suspended.is_empty());
    store.save_run(&paused).await.unwrap();
    assert_eq!(store.load_run(&paused.run_id).await.unwrap().unwrap(), paused);

    for to in [RunState::Running, RunState::Completed] {
        run.transition(to).unwrap();
        run.output = Some(StepOutput::success("ok"));
        store.save_run(&run).await.unwrap();
        assert_eq!(store.load_run(&run.run_id).await.unwrap().unwrap(), run);
    }
}
