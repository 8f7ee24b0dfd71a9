//! End-to-end runs through the engine, the graph executor and the scheduler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use ensemble_core::config::{EngineConfig, SchedulerConfig};
use ensemble_core::error::EnsembleError;
use ensemble_core::event::EventBus;
use ensemble_core::requirement::REJECTION_RESULT;
use ensemble_core::run::{RunState, StepOutput};
use ensemble_core::schedule::{Schedule, ScheduleRunStatus};
use ensemble_core::traits::ScheduleStore;
use ensemble_core::types::{ContentBlock, RunEvent, SessionId};
use ensemble_engine::{
    Agent, Engine, FieldType, FnStep, InputSchema, Predicate, SchedulePoller, Selection, Selector,
    Step, StepOutcome, Workflow, WorkflowNode,
};
use ensemble_store::{MemoryStore, SqliteStore};
use ensemble_test_utils::{answer, call, temp_db, MockTool, RecordingTrigger, ScriptedInference};

fn engine() -> Engine {
    Engine::new(Arc::new(MemoryStore::new()), EngineConfig::default())
}

fn counting(name: &'static str, calls: Arc<AtomicUsize>) -> WorkflowNode {
    WorkflowNode::step(FnStep::from_output(name, move |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        StepOutput::success(name)
    }))
}

#[tokio::test]
async fn sequence_passes_output_to_next_step() {
    let engine = engine();
    engine
        .register(Workflow::new(
            "pipeline",
            WorkflowNode::sequence(
                "pipeline",
                vec![
                    WorkflowNode::step(FnStep::from_output("a", |_| StepOutput::success("x"))),
                    WorkflowNode::step(FnStep::from_output("b", |input| {
                        let a = input.output("a").map(|o| o.content_text()).unwrap_or_default();
                        StepOutput::success(format!("{}-y", a))
                    })),
                ],
            ),
        ))
        .unwrap();

    let run = engine.start_run("pipeline", Value::Null, None).await.unwrap();

    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.output.as_ref().unwrap().content, json!("x-y"));
    assert_eq!(run.step_outputs.len(), 2);
    assert!(run.pending_requirements.is_empty());
}

#[tokio::test]
async fn rejected_confirmation_completes_normally() {
    let engine = engine();
    let inference = Arc::new(ScriptedInference::new(vec![
        call("deploy", json!({"env": "prod"})),
        answer("deploy skipped"),
    ]));
    let tool = MockTool::new("deploy", "deployed").requiring_confirmation();
    let deploys = tool.counter();
    engine
        .register(Workflow::from_step(
            engine.agent("release", inference.clone()).with_tool(tool),
        ))
        .unwrap();

    let paused = engine.start_run("release", json!("ship it"), None).await.unwrap();
    assert_eq!(paused.state, RunState::Paused);
    assert_eq!(paused.pending_requirements.len(), 1);
    let requirement = &paused.pending_requirements[0];
    assert_eq!(requirement.target.tool_name, "deploy");

    engine
        .reject(&paused.run_id, &requirement.id, None)
        .await
        .unwrap();
    let run = engine
        .continue_run(&paused.run_id, HashMap::new())
        .await
        .unwrap();

    assert_eq!(run.state, RunState::Completed);
    assert!(run.error.is_none());
    assert_eq!(run.output.as_ref().unwrap().content_text(), "deploy skipped");
    assert_eq!(deploys.load(Ordering::SeqCst), 0);
    assert_eq!(run.resolved_requirements.len(), 1);

    let last = inference.requests().pop().unwrap();
    let substituted = last.messages.iter().flat_map(|m| &m.content).any(|block| {
        matches!(block, ContentBlock::ToolResult { content, .. } if content == REJECTION_RESULT)
    });
    assert!(substituted);
}

#[tokio::test]
async fn loop_stops_when_end_condition_holds() {
    let engine = engine();
    let calls = Arc::new(AtomicUsize::new(0));
    engine
        .register(Workflow::new(
            "refine",
            WorkflowNode::repeat(
                "refine",
                vec![counting("draft", calls.clone())],
                Some(Predicate::expr("current_iteration >= 2").unwrap()),
                10,
            ),
        ))
        .unwrap();

    let run = engine.start_run("refine", Value::Null, None).await.unwrap();

    assert_eq!(run.state, RunState::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(run.step_outputs.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn racing_pollers_fire_once() {
    let (_dir, path) = temp_db();
    let store_a = Arc::new(SqliteStore::open(&path).unwrap());
    let store_b = Arc::new(SqliteStore::open(&path).unwrap());

    let mut schedule = Schedule::new("hourly", "0 * * * *", "report");
    schedule.next_run_at = Some(Utc::now() - chrono::Duration::seconds(1));
    store_a.save_schedule(&schedule).await.unwrap();

    let trigger = Arc::new(RecordingTrigger::new().with_delay(Duration::from_millis(50)));
    let bus = Arc::new(EventBus::default());
    let config = SchedulerConfig::default();
    let poller_a = SchedulePoller::new(
        &config,
        store_a.clone(),
        trigger.clone(),
        bus.clone(),
        CancellationToken::new(),
    )
    .with_poller_id("poller-a");
    let poller_b = SchedulePoller::new(
        &config,
        store_b.clone(),
        trigger.clone(),
        bus,
        CancellationToken::new(),
    )
    .with_poller_id("poller-b");

    let now = Utc::now();
    let a = tokio::spawn(async move { poller_a.poll_once(now).await });
    let b = tokio::spawn(async move { poller_b.poll_once(now).await });
    let fired = a.await.unwrap().unwrap() + b.await.unwrap().unwrap();

    assert_eq!(fired, 1);
    assert_eq!(trigger.calls().len(), 1);
    let runs = store_a.list_schedule_runs(&schedule.id).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].attempt, 1);
    assert_eq!(runs[0].status, ScheduleRunStatus::Success);

    let saved = store_b.get_schedule(&schedule.id).await.unwrap().unwrap();
    assert!(saved.locked_by.is_none());
    assert!(saved.next_run_at.unwrap() > now);
}

#[tokio::test]
async fn router_runs_only_the_selected_choice() {
    let engine = engine();
    let a_calls = Arc::new(AtomicUsize::new(0));
    let b_calls = Arc::new(AtomicUsize::new(0));
    engine
        .register(Workflow::new(
            "dispatch",
            WorkflowNode::router(
                "dispatch",
                Selector::func(|_| Selection::from("B")),
                vec![counting("A", a_calls.clone()), counting("B", b_calls.clone())],
            ),
        ))
        .unwrap();

    let run = engine.start_run("dispatch", Value::Null, None).await.unwrap();

    assert_eq!(run.state, RunState::Completed);
    assert_eq!(a_calls.load(Ordering::SeqCst), 0);
    assert_eq!(b_calls.load(Ordering::SeqCst), 1);
    assert_eq!(run.output.unwrap().content, json!("B"));
}

#[tokio::test]
async fn router_expression_reads_input() {
    let engine = engine();
    let a_calls = Arc::new(AtomicUsize::new(0));
    let b_calls = Arc::new(AtomicUsize::new(0));
    engine
        .register(Workflow::new(
            "dispatch",
            WorkflowNode::router(
                "dispatch",
                Selector::expr("input.choice").unwrap(),
                vec![counting("A", a_calls.clone()), counting("B", b_calls.clone())],
            ),
        ))
        .unwrap();

    engine
        .start_run("dispatch", json!({"choice": "A"}), None)
        .await
        .unwrap();

    assert_eq!(a_calls.load(Ordering::SeqCst), 1);
    assert_eq!(b_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn fail_fast_error_keeps_partial_progress() {
    let engine = engine();
    engine
        .register(Workflow::new(
            "brittle",
            WorkflowNode::sequence(
                "brittle",
                vec![
                    WorkflowNode::step(FnStep::from_output("fetch", |_| StepOutput::success("data"))),
                    Step::new(FnStep::new("parse", |_, _| async {
                        Err(EnsembleError::Capability {
                            capability: "parser".into(),
                            message: "bad bytes".into(),
                        })
                    }))
                    .fail_fast()
                    .into(),
                    counting("never", Arc::new(AtomicUsize::new(0))),
                ],
            ),
        ))
        .unwrap();

    let run = engine.start_run("brittle", Value::Null, None).await.unwrap();

    assert_eq!(run.state, RunState::Errored);
    assert!(run.error.as_deref().unwrap().contains("bad bytes"));
    assert_eq!(run.step_outputs.len(), 1);
    assert_eq!(run.output_named("fetch").unwrap().content, json!("data"));
}

#[tokio::test]
async fn input_schema_rejects_before_a_run_exists() {
    let engine = engine();
    engine
        .register(
            Workflow::from_step(FnStep::from_output("greet", |i| {
                StepOutput::success(format!("hi {}", i.message()))
            }))
            .with_input_schema(InputSchema::new().required("message", FieldType::String)),
        )
        .unwrap();
    let session = SessionId::from_str("s-schema");

    let err = engine
        .start_run("greet", json!({"message": 7}), Some(session.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, EnsembleError::Validation(_)));
    assert!(engine.list_runs(&session).await.unwrap().is_empty());

    let run = engine
        .start_run("greet", json!({"message": "bob"}), Some(session.clone()))
        .await
        .unwrap();
    assert_eq!(run.output.unwrap().content_text(), "hi bob");
    assert_eq!(engine.list_runs(&session).await.unwrap().len(), 1);
}

#[tokio::test]
async fn unknown_target_is_a_validation_error() {
    let err = engine()
        .start_run("missing", Value::Null, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EnsembleError::Validation(_)));
}

#[tokio::test]
async fn stream_ends_with_the_terminal_event() {
    let engine = Arc::new(engine());
    engine
        .register(Workflow::new(
            "pair",
            vec![
                WorkflowNode::step(FnStep::from_output("one", |_| StepOutput::success(1))),
                WorkflowNode::step(FnStep::from_output("two", |_| StepOutput::success(2))),
            ],
        ))
        .unwrap();

    let events: Vec<RunEvent> = engine
        .start_run_stream("pair", Value::Null, None)
        .await
        .unwrap()
        .collect()
        .await;

    assert!(matches!(events.first(), Some(RunEvent::RunStarted { .. })));
    assert!(matches!(
        events.last(),
        Some(RunEvent::RunCompleted { success: true, .. })
    ));
    let started: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            RunEvent::StepStarted { name, .. } => Some(name.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec!["one", "two"]);
}

#[tokio::test]
async fn cancelling_an_active_run_is_terminal() {
    let engine = Arc::new(engine());
    engine
        .register(Workflow::from_step(FnStep::new("slow", |_, _| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(StepOutcome::Completed(StepOutput::success("late")))
        })))
        .unwrap();

    let mut stream = engine
        .start_run_stream("slow", Value::Null, None)
        .await
        .unwrap();
    let mut run_id = None;
    while let Some(event) = stream.next().await {
        match event {
            RunEvent::StepStarted { run_id: id, .. } => {
                engine.cancel_run(&id).await.unwrap();
                run_id = Some(id);
            }
            RunEvent::RunCancelled { .. } => break,
            other => assert!(!other.ends_pass(), "unexpected {other:?}"),
        }
    }
    let run_id = run_id.unwrap();

    // The driving task persists the terminal state just before emitting the event.
    let run = engine.get_run(&run_id).await.unwrap();
    assert_eq!(run.state, RunState::Cancelled);

    let err = engine
        .continue_run(&run_id, HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EnsembleError::NotPaused { .. }));
    assert!(matches!(
        engine.cancel_run(&run_id).await,
        Err(EnsembleError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn cancelling_a_paused_run_clears_pending() {
    let engine = engine();
    let inference = Arc::new(ScriptedInference::new(vec![call("wire", json!({}))]));
    engine
        .register(Workflow::from_step(
            Agent::new("treasurer", inference)
                .with_tool(MockTool::new("wire", "sent").requiring_confirmation()),
        ))
        .unwrap();

    let paused = engine.start_run("treasurer", json!("pay"), None).await.unwrap();
    assert_eq!(paused.state, RunState::Paused);

    engine.cancel_run(&paused.run_id).await.unwrap();
    let run = engine.get_run(&paused.run_id).await.unwrap();
    assert_eq!(run.state, RunState::Cancelled);
    assert!(run.pending_requirements.is_empty());
    assert_eq!(run.resolved_requirements.len(), 1);
}

#[tokio::test]
async fn continue_rejects_unknown_and_unpaused_runs() {
    let engine = engine();
    engine
        .register(Workflow::from_step(FnStep::from_output("noop", |_| {
            StepOutput::success(Value::Null)
        })))
        .unwrap();

    let missing = ensemble_core::types::RunId::from_str("nope");
    assert!(matches!(
        engine.continue_run(&missing, HashMap::new()).await,
        Err(EnsembleError::RunNotFound(_))
    ));

    let done = engine.start_run("noop", Value::Null, None).await.unwrap();
    let err = engine
        .continue_run(&done.run_id, HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EnsembleError::NotPaused { ref state, .. } if state == "completed"));
    assert_eq!(
        engine.get_run(&done.run_id).await.unwrap().state,
        RunState::Completed
    );
}
