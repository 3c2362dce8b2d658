//! End-to-end scenarios across pipelines, graphs and middleware.

use super::{DagPipeline, ParallelConfig, Pipeline};
use crate::core::{FlowResult, Severity};
use crate::errors::FlowError;
use crate::middleware::{
    BackoffStrategy, InMemoryCollector, Instrumentation, Logging, Retry, RetryConfig,
};
use crate::steps::{StepOptions, STEP_ERROR_CATEGORY};
use crate::testing::{
    assert_context_value, assert_error_count, assert_halted, assert_success, ConcurrencyProbe,
    CountingStep, ExecutionLog, FailingStep, RecordingStep, SlowStep,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn text(r: &FlowResult) -> String {
    r.value().as_str().unwrap_or_default().to_string()
}

fn text_pipeline(process: CountingStep) -> Pipeline {
    Pipeline::named("text")
        .step("parse", |r: FlowResult| {
            let trimmed = text(&r).trim().to_string();
            Ok(r.continue_with(trimmed))
        })
        .step("validate", |r: FlowResult| {
            if text(&r).is_empty() {
                Ok(r.halt().with_error("validation", "Input cannot be empty"))
            } else {
                Ok(r)
            }
        })
        .step_handler("count_process", process)
        .step("process", |r: FlowResult| {
            let upper = text(&r).to_uppercase();
            Ok(r.continue_with(format!("Processed: {upper}")))
        })
}

fn cyclic() -> DagPipeline {
    DagPipeline::new()
        .step("a", |r: FlowResult| Ok(r), &["c"])
        .step("b", |r: FlowResult| Ok(r), &["a"])
        .step("c", |r: FlowResult| Ok(r), &["b"])
}

fn append(
    name: &'static str,
) -> impl Fn(FlowResult) -> anyhow::Result<FlowResult> + Send + Sync + 'static {
    move |r: FlowResult| {
        let mut trail = r.value().as_array().cloned().unwrap_or_default();
        trail.push(json!(name));
        Ok(r.continue_with(trail))
    }
}

#[test]
fn test_blank_input_halts_before_process() {
    let process = CountingStep::new("count_process");
    let pipeline = text_pipeline(process.clone());

    let output = pipeline.call(FlowResult::new("   "));

    assert_halted(&output);
    assert_error_count(&output, "validation", 1);
    assert_eq!(output.errors_for("validation")[0].severity(), Severity::Error);
    assert_eq!(output.errors_for("validation")[0].step(), "validate");
    assert_eq!(process.count(), 0);
}

#[test]
fn test_valid_input_is_processed() {
    let process = CountingStep::new("count_process");
    let pipeline = text_pipeline(process.clone());

    let output = pipeline.call(FlowResult::new("  hello  "));

    assert_success(&output);
    assert_eq!(output.value(), &json!("Processed: HELLO"));
    assert_eq!(process.count(), 1);
}

#[test]
fn test_cycle_rejected_everywhere() {
    let pipeline = cyclic();

    assert!(pipeline.sorted_steps().unwrap_err().is_cycle());
    assert!(pipeline.parallel_groups().unwrap_err().is_cycle());

    match pipeline.call(FlowResult::new(0)) {
        Err(FlowError::CircularDependency(cycle)) => {
            assert!(cycle.to_string().starts_with("Circular dependency detected: "));
            assert!(cycle.involves("a") && cycle.involves("b") && cycle.involves("c"));
        }
        other => panic!("expected a cycle error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cycle_rejected_by_parallel_call() {
    let err = cyclic().call_parallel(FlowResult::new(0), 4).await.unwrap_err();
    assert!(err.is_cycle());
}

#[test]
fn test_sorted_steps_are_topologically_valid() {
    let pipeline = DagPipeline::new()
        .step("report", append("report"), &["analyze", "clean"])
        .step("analyze", append("analyze"), &["clean"])
        .step("clean", append("clean"), &["load"])
        .step("load", append("load"), &[])
        .step("audit", append("audit"), &["load"]);

    let order = pipeline.sorted_steps().unwrap();
    assert_eq!(order.len(), 5);
    for (index, name) in order.iter().enumerate() {
        for dep in pipeline.dependencies_of(name).unwrap() {
            let dep_index = order.iter().position(|n| n == dep).unwrap();
            assert!(dep_index < index, "{dep} must run before {name}");
        }
    }
}

#[test]
fn test_wave_grouping() {
    let pipeline = DagPipeline::new()
        .step("d", append("d"), &["b", "c"])
        .step("c", append("c"), &["a"])
        .step("b", append("b"), &["a"])
        .step("a", append("a"), &[]);

    assert_eq!(
        pipeline.parallel_groups().unwrap(),
        vec![vec!["a"], vec!["b", "c"], vec!["d"]]
    );
}

#[test]
fn test_merge_threads_value_through_both_pipelines() {
    let p1 = DagPipeline::named("ingest")
        .step("load", append("load"), &[])
        .step("clean", append("clean"), &["load"]);
    let p2 = DagPipeline::named("analysis")
        .step("analyze", append("analyze"), &["clean"])
        .step("report", append("report"), &["analyze"]);

    // The second half alone refers to a step it does not declare.
    assert!(matches!(
        p2.sorted_steps(),
        Err(FlowError::MissingDependency(_))
    ));

    let merged = p1.merge(&p2);

    assert_eq!(merged.name(), Some("ingest_merged"));
    assert_eq!(
        merged.sorted_steps().unwrap(),
        vec!["load", "clean", "analyze", "report"]
    );

    let output = merged.call(FlowResult::new(json!([]))).unwrap();
    assert_eq!(
        output.value(),
        &json!(["load", "clean", "analyze", "report"])
    );
}

#[test]
fn test_merge_unions_shared_dependencies() {
    let p1 = DagPipeline::new()
        .step("x", append("x"), &[])
        .step("y", append("y"), &[])
        .step("z", append("z"), &["x"]);
    let p2 = DagPipeline::new()
        .step("y", append("y2"), &[])
        .step("z", append("z2"), &["y"]);

    let merged = p1.merge(&p2);

    assert_eq!(merged.declared_steps(), ["x", "y", "z"]);
    assert_eq!(
        merged.dependencies_of("z").unwrap(),
        ["x".to_string(), "y".to_string()]
    );
    let output = merged.call(FlowResult::new(json!([]))).unwrap();
    assert_eq!(output.value(), &json!(["x", "y2", "z2"]));
}

#[test]
fn test_subgraph_runs_only_required_steps() {
    let log = ExecutionLog::new();
    let pipeline = DagPipeline::named("etl")
        .step_handler("load", RecordingStep::new("load", &log), &[])
        .step_handler("clean", RecordingStep::new("clean", &log), &["load"])
        .step_handler("audit", RecordingStep::new("audit", &log), &["load"])
        .step_handler("report", RecordingStep::new("report", &log), &["clean"]);

    let sub = pipeline.subgraph("report").unwrap();
    assert_eq!(sub.name(), Some("etl_subgraph_report"));
    sub.call(FlowResult::new(0)).unwrap();

    assert_eq!(log.entries(), vec!["load", "clean", "report"]);
}

#[tokio::test]
async fn test_parallel_run_matches_serial_context() {
    let pipeline = DagPipeline::new()
        .step("a", |r: FlowResult| Ok(r.with_context("seen", "a")), &[])
        .step("b", |r: FlowResult| Ok(r.with_context("seen", "b")), &["a"])
        .step("c", |r: FlowResult| Ok(r.with_context("seen", "c")), &["a"])
        .step("d", |r: FlowResult| Ok(r.with_context("seen", "d")), &["b", "c"]);

    let output = pipeline
        .call_parallel_with(FlowResult::new("v"), &ParallelConfig::default())
        .await
        .unwrap();

    assert_success(&output);
    assert_eq!(output.value(), &json!("v"));
    assert_context_value(&output, "b_seen", &json!("b"));
    assert_context_value(&output, "c_seen", &json!("c"));
    assert_context_value(&output, "seen", &json!("d"));
    assert_context_value(&output, "b_a_seen", &json!("a"));
}

#[tokio::test]
async fn test_parallel_halt_stops_later_waves_but_not_siblings() {
    let sibling = CountingStep::new("ok");
    let downstream = CountingStep::new("after");

    let pipeline = DagPipeline::new()
        .step("root", |r: FlowResult| Ok(r), &[])
        .step("bad", |_r: FlowResult| Err(anyhow::anyhow!("unreachable host")), &["root"])
        .step_handler("ok", sibling.clone(), &["root"])
        .step_handler("after", downstream.clone(), &["bad", "ok"]);

    let output = pipeline.call_parallel(FlowResult::new(7), 2).await.unwrap();

    assert_halted(&output);
    assert_eq!(output.value(), &json!(7));
    assert_eq!(sibling.count(), 1);
    assert_eq!(downstream.count(), 0);
    assert_error_count(&output, STEP_ERROR_CATEGORY, 1);
    assert_context_value(&output, "bad_failed_step", &json!("bad"));
    assert_context_value(&output, "ok_ok_calls", &json!(1));
}

#[tokio::test]
async fn test_parallel_branches_are_isolated() {
    let pipeline = DagPipeline::new()
        .step("left", |r: FlowResult| Ok(r.with_context("shared", "left")), &[])
        .step(
            "right",
            |r: FlowResult| {
                assert!(r.get_context("shared").is_none());
                Ok(r.with_context("shared", "right"))
            },
            &[],
        );

    let output = pipeline.call_parallel(FlowResult::new(0), 2).await.unwrap();

    assert_context_value(&output, "left_shared", &json!("left"));
    assert_context_value(&output, "right_shared", &json!("right"));
    assert!(output.get_context("shared").is_none());
}

#[tokio::test]
async fn test_max_threads_bounds_wave_concurrency() {
    let probe = ConcurrencyProbe::new();
    let mut pipeline = DagPipeline::new().step("start", |r: FlowResult| Ok(r), &[]);
    for i in 0..6 {
        let name = format!("slow_{i}");
        pipeline = pipeline.step_handler(
            name.clone(),
            SlowStep::with_delay_ms(name, 30).with_probe(&probe),
            &["start"],
        );
    }

    let output = pipeline.call_parallel(FlowResult::new(0), 2).await.unwrap();

    assert_success(&output);
    assert!(probe.peak() <= 2, "peak concurrency was {}", probe.peak());
    assert!(probe.peak() >= 1);
}

#[tokio::test]
async fn test_free_slot_is_reused_before_slow_branch_finishes() {
    let log = ExecutionLog::new();
    let (slow_log, b_log, c_log) = (log.clone(), log.clone(), log.clone());

    let pipeline = DagPipeline::new()
        .step_handler(
            "a",
            move |r: FlowResult| {
                slow_log.record("a_start");
                std::thread::sleep(Duration::from_millis(300));
                slow_log.record("a_end");
                r
            },
            &[],
        )
        .step_handler(
            "b",
            move |r: FlowResult| {
                b_log.record("b");
                r
            },
            &[],
        )
        .step_handler(
            "c",
            move |r: FlowResult| {
                c_log.record("c");
                r
            },
            &[],
        );

    assert_eq!(pipeline.parallel_groups().unwrap(), vec![vec!["a", "b", "c"]]);

    let output = pipeline.call_parallel(FlowResult::new(0), 2).await.unwrap();

    assert_success(&output);
    let c = log.position("c").unwrap();
    let a_end = log.position("a_end").unwrap();
    assert!(c < a_end, "c waited for the slow branch: {:?}", log.entries());
}

#[tokio::test]
async fn test_zero_threads_treated_as_one() {
    let probe = ConcurrencyProbe::new();
    let pipeline = DagPipeline::new()
        .step_handler("a", SlowStep::with_delay_ms("a", 5).with_probe(&probe), &[])
        .step_handler("b", SlowStep::with_delay_ms("b", 5).with_probe(&probe), &[]);

    let output = pipeline.call_parallel(FlowResult::new(0), 0).await.unwrap();

    assert_success(&output);
    assert_eq!(probe.peak(), 1);
}

#[test]
fn test_duration_tracking_through_pipeline() {
    let pipeline = Pipeline::new()
        .step_with("fast", |r: FlowResult| Ok(r), StepOptions::new().track_duration())
        .step_with(
            "slow",
            |r: FlowResult| {
                std::thread::sleep(Duration::from_millis(25));
                Ok(r)
            },
            StepOptions::new().track_duration(),
        );

    let output = pipeline.call(FlowResult::new(0));
    let fast = output.get_context("fast_duration").and_then(Value::as_f64).unwrap();
    let slow = output.get_context("slow_duration").and_then(Value::as_f64).unwrap();

    assert!(fast >= 0.0);
    assert!(slow > fast);
}

#[test]
fn test_error_accumulation_across_steps() {
    let pipeline = Pipeline::new()
        .step("first", |r: FlowResult| Ok(r.with_error("validation", "a")))
        .step("second", |r: FlowResult| Ok(r.with_error("validation", "b")));

    let output = pipeline.call(FlowResult::new(0));
    let messages: Vec<&str> = output.all_errors().map(|e| e.message()).collect();

    assert_eq!(messages, vec!["a", "b"]);
    assert!(output.should_continue());
    assert!(output.is_failure());
}

#[test]
fn test_middleware_stack_on_dag() {
    let collector = Arc::new(InMemoryCollector::new());
    let failing = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let attempts = Arc::clone(&failing);

    let pipeline = DagPipeline::named("stack")
        .use_middleware(Logging::new())
        .use_middleware(Instrumentation::new().with_collector(collector.clone()))
        .use_middleware(Retry::with_config(
            RetryConfig::new()
                .with_max_attempts(3)
                .with_backoff(BackoffStrategy::Constant, Duration::ZERO),
        ))
        .step(
            "fetch",
            move |r: FlowResult| {
                let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if n == 0 {
                    Err(anyhow::anyhow!("timeout"))
                } else {
                    Ok(r.continue_with("payload"))
                }
            },
            &[],
        )
        .step("store", |r: FlowResult| Ok(r), &["fetch"]);

    let output = pipeline.call(FlowResult::new(0)).unwrap();

    assert_success(&output);
    assert_eq!(output.value(), &json!("payload"));
    assert_eq!(failing.load(std::sync::atomic::Ordering::SeqCst), 2);
    assert_eq!(collector.records_for("fetch").len(), 1);
    assert_eq!(collector.records_for("store").len(), 1);
    assert!(output.get_context("store_duration").is_some());
}

#[test]
fn test_retry_exhaustion_halts_pipeline() {
    let downstream = CountingStep::new("after");
    let pipeline = Pipeline::new()
        .use_middleware(Retry::with_config(
            RetryConfig::new()
                .with_max_attempts(2)
                .with_backoff(BackoffStrategy::Constant, Duration::ZERO),
        ))
        .step_handler("broken", FailingStep::new("broken", "down"))
        .step_handler("after", downstream.clone());

    let output = pipeline.call(FlowResult::new(0));

    assert_halted(&output);
    assert_eq!(downstream.count(), 0);
    assert_error_count(&output, "retry_exhausted", 1);
    assert_context_value(&output, "retry_attempts", &json!(2));
}

#[test]
fn test_conditional_steps_in_dag() {
    let pipeline = DagPipeline::new()
        .step("classify", |r: FlowResult| Ok(r.with_context("tier", "free")), &[])
        .step_if(
            "upsell",
            |r: &FlowResult| r.get_context("classify_tier") == Some(&json!("free")),
            |r: FlowResult| Ok(r.with_context("offer", "pro")),
            &["classify"],
        )
        .step_if(
            "renew",
            |r: &FlowResult| r.get_context("classify_tier") == Some(&json!("pro")),
            |r: FlowResult| Ok(r.with_context("offer", "renewal")),
            &["classify"],
        );

    let output = pipeline.call(FlowResult::new(0)).unwrap();

    assert_context_value(&output, "renew_skipped", &json!(true));
    assert_context_value(&output, "offer", &json!("pro"));
}

#[test]
fn test_subpipeline_and_compose_round_trip() {
    let log = ExecutionLog::new();
    let full = Pipeline::named("full")
        .step_handler("a", RecordingStep::new("a", &log))
        .step_handler("b", RecordingStep::new("b", &log))
        .step_handler("c", RecordingStep::new("c", &log));

    let head = full.subpipeline(&["a"]).unwrap();
    let tail = full.subpipeline(&["c", "b"]).unwrap();
    (&head >> &tail).call(FlowResult::new(0));

    assert_eq!(log.entries(), vec!["a", "c", "b"]);
}
