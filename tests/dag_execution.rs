// tests/dag_execution.rs

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chunkdag::dag::{Dag, DagExecutor, DagNode, NodeState};
use chunkdag::dispatch::DispatchOptions;
use chunkdag::errors::ChunkdagError;
use chunkdag::pipeline::{sync_stage_fn, Pipeline, Stage, StageFn};
use chunkdag::remote::TaskError;
use chunkdag::stage::{StageItem, StageReport};
use chunkdag_test_utils::{init_tracing, CallPlan, RecordingCallback, ScriptedExecutor};
use serde_json::json;

type Log = Arc<Mutex<Vec<String>>>;

fn stage_exec() -> ScriptedExecutor<StageItem, StageReport> {
    ScriptedExecutor::uniform(Duration::from_secs(1))
}

/// A stage function that logs `label` (plus the item, if any) per call.
fn logging_fn(label: &str, log: &Log) -> StageFn {
    let label = label.to_string();
    let log = Arc::clone(log);
    sync_stage_fn(move |item, _config| {
        let entry = match item {
            Some(item) => format!("{label}:{item}"),
            None => label.clone(),
        };
        log.lock().unwrap().push(entry);
        Ok(())
    })
}

fn single_node(name: &str, log: &Log) -> DagNode {
    let stage = Stage::single("run", logging_fn(name, log));
    DagNode::new(name, Pipeline::new(vec![stage], json!({})))
}

fn linear(nodes: Vec<DagNode>) -> Dag {
    let names: Vec<String> = nodes.iter().map(|n| n.name.clone()).collect();
    let mut dag = Dag::new();
    for node in nodes {
        dag.add_node(node).unwrap();
    }
    for pair in names.windows(2) {
        dag.add_dependency(&pair[0], &pair[1]).unwrap();
    }
    dag
}

#[tokio::test(start_paused = true)]
async fn computed_middle_node_is_skipped() {
    init_tracing();
    let log: Log = Arc::default();
    let dag = linear(vec![
        single_node("A", &log),
        single_node("B", &log).with_computed(true),
        single_node("C", &log),
    ]);

    let mut exec = stage_exec();
    let report = DagExecutor::default()
        .execute_dag(&dag, &mut exec)
        .await
        .unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["A", "C"]);
    assert_eq!(report.executed, vec!["A", "C"]);
    assert_eq!(report.skipped, vec!["B"]);
    assert_eq!(report.states["B"], NodeState::Finished);
    assert_eq!(exec.submitted(), 2);
}

#[tokio::test(start_paused = true)]
async fn all_computed_runs_nothing() {
    let log: Log = Arc::default();
    let dag = linear(vec![
        single_node("A", &log).with_computed(true),
        single_node("B", &log).with_computed(true),
        single_node("C", &log).with_computed(true),
    ]);

    let started = tokio::time::Instant::now();
    let mut exec = stage_exec();
    let report = DagExecutor::default()
        .execute_dag(&dag, &mut exec)
        .await
        .unwrap();

    assert!(log.lock().unwrap().is_empty());
    assert!(report.executed.is_empty());
    assert_eq!(report.stages_run, 0);
    assert_eq!(exec.submitted(), 0);
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn cycle_fails_before_any_stage_runs() {
    let log: Log = Arc::default();
    let mut dag = linear(vec![single_node("A", &log), single_node("B", &log)]);
    dag.add_dependency("B", "A").unwrap();

    let mut exec = stage_exec();
    let err = DagExecutor::default()
        .execute_dag(&dag, &mut exec)
        .await
        .unwrap_err();

    assert!(matches!(err, ChunkdagError::DagCycle(_)));
    assert!(log.lock().unwrap().is_empty());
    assert_eq!(exec.submitted(), 0);
}

#[tokio::test(start_paused = true)]
async fn stages_of_a_pipeline_run_in_order() {
    let log: Log = Arc::default();
    let pipeline = Pipeline::new(
        vec![
            Stage::single("init", logging_fn("init", &log)),
            Stage::mappable("write", logging_fn("write", &log), vec![json!(0), json!(1)]),
            Stage::single("finalize", logging_fn("finalize", &log)),
        ],
        json!({}),
    );
    let dag = linear(vec![DagNode::new("arr", pipeline)]);

    let mut exec = stage_exec();
    let report = DagExecutor::default()
        .execute_dag(&dag, &mut exec)
        .await
        .unwrap();

    let log = log.lock().unwrap().clone();
    assert_eq!(log.first().map(String::as_str), Some("init"));
    assert_eq!(log.last().map(String::as_str), Some("finalize"));
    assert_eq!(log.len(), 4);
    assert_eq!(report.stages_run, 3);
    assert_eq!(report.tasks_completed, 4);
}

#[tokio::test(start_paused = true)]
async fn mappable_stages_emit_one_event_per_item() {
    init_tracing();
    let log: Log = Arc::default();
    let items = vec![json!([0, 0]), json!([0, 1]), json!([1, 0])];
    let pipeline = Pipeline::new(
        vec![
            Stage::single("init", logging_fn("init", &log)),
            Stage::mappable("write", logging_fn("write", &log), items),
        ],
        json!({"prefix": "out"}),
    );
    let dag = linear(vec![DagNode::new("arr-001", pipeline)]);
    let recorder = Arc::new(RecordingCallback::new());

    let mut exec = stage_exec();
    DagExecutor::default()
        .with_callback(recorder.clone())
        .execute_dag(&dag, &mut exec)
        .await
        .unwrap();

    let events = recorder.task_ends();
    assert_eq!(events.len(), 3);
    for event in &events {
        assert_eq!(event.array_name, "arr-001");
        assert!(event.function_end_tstamp >= event.function_start_tstamp);
        assert!(event.task_result_tstamp >= event.function_end_tstamp);
    }

    let starts = recorder.starts();
    assert_eq!(starts.len(), 1);
    assert_eq!(starts[0].num_tasks, 4);
    assert_eq!(recorder.ends().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn retried_items_emit_a_single_event() {
    let log: Log = Arc::default();
    let pipeline = Pipeline::new(
        vec![Stage::mappable("write", logging_fn("write", &log), vec![json!(0), json!(1)])],
        json!({}),
    );
    let dag = linear(vec![DagNode::new("arr", pipeline)]);
    let recorder = Arc::new(RecordingCallback::new());

    let mut exec: ScriptedExecutor<StageItem, StageReport> =
        ScriptedExecutor::new(|item: &StageItem, attempt| {
            let plan = CallPlan::after(Duration::from_secs(1));
            if item.as_ref() == Some(&json!(1)) && attempt == 0 {
                plan.failing("Transient", "worker lost")
            } else {
                plan
            }
        });
    DagExecutor::default()
        .with_callback(recorder.clone())
        .execute_dag(&dag, &mut exec)
        .await
        .unwrap();

    assert_eq!(recorder.task_ends().len(), 2);
    assert_eq!(exec.submitted(), 3);
}

#[tokio::test(start_paused = true)]
async fn single_stage_failure_is_not_retried() {
    let calls = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&calls);
    let failing: StageFn = sync_stage_fn(move |_, _| {
        *counter.lock().unwrap() += 1;
        Err(TaskError::new("OSError", "disk full"))
    });
    let dag = linear(vec![DagNode::new(
        "arr",
        Pipeline::new(vec![Stage::single("init", failing)], json!({})),
    )]);

    let mut exec = stage_exec();
    let options = DispatchOptions {
        max_failures: 10,
        ..DispatchOptions::default()
    };
    let err = DagExecutor::new(options)
        .execute_dag(&dag, &mut exec)
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "OSError: disk full");
    assert_eq!(*calls.lock().unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn fatal_stage_failure_stops_downstream_nodes() {
    let log: Log = Arc::default();
    let failing: StageFn = sync_stage_fn(|_, _| Err(TaskError::new("ValueError", "bad")));
    let dag = linear(vec![
        DagNode::new(
            "A",
            Pipeline::new(vec![Stage::mappable("w", failing, vec![json!(0)])], json!({})),
        ),
        single_node("B", &log),
    ]);

    let mut exec = stage_exec();
    let err = DagExecutor::default()
        .execute_dag(&dag, &mut exec)
        .await
        .unwrap_err();

    assert_eq!(err.task_error().map(|e| e.kind.as_str()), Some("ValueError"));
    assert!(log.lock().unwrap().is_empty());
    // Default ceiling of 3: the fourth failure is fatal.
    assert_eq!(exec.submitted(), 4);
}
