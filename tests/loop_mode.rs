//! Loop Mode Integration Tests
//!
//! Iteration bounds, early termination and failure handling.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use agentflow::core::{OrchestrationError, LOOP_COMPLETED_KEY};
use agentflow::{agent_fn, AgentError, AgentHandler, AgentResult, Event, OrchestrationConfig, OrchestrationMode, State};
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// Increments `count` each iteration and records the calls
fn counter(calls: Arc<AtomicU32>) -> impl AgentHandler + 'static {
    agent_fn(move |ctx, _, state| {
        calls.fetch_add(1, Ordering::SeqCst);
        let count = state.get("count").and_then(|v| v.as_u64()).unwrap_or(0) + 1;
        state.set("count", count);
        Ok(AgentResult::new(json!({"iteration": ctx.iteration(), "count": count})))
    })
}

async fn run(config: &OrchestrationConfig) -> Result<agentflow::Execution, OrchestrationError> {
    agentflow::execute(&CancellationToken::new(), &Event::from_message("refine"), State::new(), config).await
}

#[tokio::test]
async fn test_runs_exactly_max_iterations() {
    let calls = Arc::new(AtomicU32::new(0));
    let config = OrchestrationConfig::builder(OrchestrationMode::Loop)
        .agent("refiner", counter(Arc::clone(&calls)))
        .max_iterations(5)
        .build()
        .unwrap();

    let execution = run(&config).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(execution.result.invocations, 5);
    assert_eq!(execution.result.state.get("count"), Some(json!(5)));
    assert_eq!(execution.result.output, json!({"iteration": 5, "count": 5}));
}

#[tokio::test]
async fn test_predicate_stops_early() {
    let calls = Arc::new(AtomicU32::new(0));
    let config = OrchestrationConfig::builder(OrchestrationMode::Loop)
        .agent("refiner", counter(Arc::clone(&calls)))
        .max_iterations(5)
        .until(|_, iteration| iteration >= 2)
        .build()
        .unwrap();

    let execution = run(&config).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(execution.result.invocations, 2);
    assert_eq!(execution.result.output, json!({"iteration": 2, "count": 2}));
}

#[tokio::test]
async fn test_predicate_sees_threaded_state() {
    let calls = Arc::new(AtomicU32::new(0));
    let config = OrchestrationConfig::builder(OrchestrationMode::Loop)
        .agent("refiner", counter(Arc::clone(&calls)))
        .max_iterations(10)
        .until(|state, _| state.get("count") == Some(json!(3)))
        .build()
        .unwrap();

    run(&config).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_agent_completion_signal() {
    let config = OrchestrationConfig::builder(OrchestrationMode::Loop)
        .agent("refiner", agent_fn(|ctx, _, state| {
            if ctx.iteration() == Some(3) {
                state.set(LOOP_COMPLETED_KEY, true);
            }
            Ok(AgentResult::new(ctx.iteration().unwrap_or_default()))
        }))
        .max_iterations(5)
        .build()
        .unwrap();

    let execution = run(&config).await.unwrap();

    assert_eq!(execution.result.invocations, 3);
    assert_eq!(execution.result.output, json!(3));
}

#[tokio::test]
async fn test_error_aborts_with_last_good_state() {
    let config = OrchestrationConfig::builder(OrchestrationMode::Loop)
        .agent("refiner", agent_fn(|ctx, _, state| {
            let iteration = ctx.iteration().unwrap_or_default();
            if iteration == 3 {
                state.set("count", 99);
                return Err(AgentError::msg("diverged"));
            }
            state.set("count", iteration);
            Ok(AgentResult::empty())
        }))
        .max_iterations(5)
        .build()
        .unwrap();

    let err = run(&config).await.unwrap_err();

    assert_eq!(
        err.to_string(),
        "loop orchestration aborted: agent 'refiner' (iteration 3) failed: diverged"
    );
    assert_eq!(err.partial().unwrap().state.get("count"), Some(json!(2)));
    assert!(matches!(
        err,
        OrchestrationError::AgentFailed {
            iteration: Some(3),
            ..
        }
    ));
}

#[tokio::test]
async fn test_single_iteration_loop() {
    let calls = Arc::new(AtomicU32::new(0));
    let config = OrchestrationConfig::builder(OrchestrationMode::Loop)
        .agent("once", counter(Arc::clone(&calls)))
        .max_iterations(1)
        .build()
        .unwrap();

    let execution = run(&config).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(execution.result.completion_order, vec!["once"]);
}
