//! Collaborative Mode Integration Tests
//!
//! Fan-out, merge determinism, partial failure and deadline handling.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agentflow::core::{AgentOutcome, CollaborativeMerge, OrchestrationError};
use agentflow::domain::PROCESSED_BY_KEY;
use agentflow::{
    agent_fn, execute, AgentContext, AgentError, AgentHandler, AgentResult, Event, OrchestrationConfig,
    OrchestrationMode, State,
};
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Sleeps, then writes one key
struct Writer {
    delay: Duration,
    key: &'static str,
    value: &'static str,
}

#[async_trait]
impl AgentHandler for Writer {
    async fn run(&self, _ctx: &AgentContext, _event: &Event, state: &State) -> Result<AgentResult, AgentError> {
        tokio::time::sleep(self.delay).await;
        state.set(self.key, self.value);
        Ok(AgentResult::new(self.value))
    }
}

/// Ignores cancellation entirely
struct Stubborn;

#[async_trait]
impl AgentHandler for Stubborn {
    async fn run(&self, _ctx: &AgentContext, _event: &Event, state: &State) -> Result<AgentResult, AgentError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        state.set("stubborn", true);
        Ok(AgentResult::empty())
    }
}

/// Waits for cancellation and reports that it saw it
struct Listener {
    seen: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl AgentHandler for Listener {
    async fn run(&self, ctx: &AgentContext, _event: &Event, _state: &State) -> Result<AgentResult, AgentError> {
        tokio::select! {
            _ = ctx.cancelled() => {
                let _ = self.seen.send(ctx.agent().to_string());
                Err(AgentError::Cancelled)
            }
            _ = tokio::time::sleep(Duration::from_secs(3600)) => Ok(AgentResult::empty()),
        }
    }
}

fn writer(delay_ms: u64, key: &'static str, value: &'static str) -> Writer {
    Writer {
        delay: Duration::from_millis(delay_ms),
        key,
        value,
    }
}

#[tokio::test]
async fn test_distinct_keys_are_merged() {
    let config = OrchestrationConfig::builder(OrchestrationMode::Collaborative)
        .agent("a", agent_fn(|_, _, state| {
            state.set("x", 1);
            Ok(AgentResult::new("a done"))
        }))
        .agent("b", agent_fn(|_, _, state| {
            state.set("y", 2);
            Ok(AgentResult::new("b done"))
        }))
        .timeout(Duration::from_secs(2))
        .build()
        .unwrap();

    let execution = execute(&CancellationToken::new(), &Event::from_message("go"), State::new(), &config)
        .await
        .unwrap();

    let snapshot = execution.result.state.snapshot();
    assert_eq!(json!(snapshot.data), json!({"x": 1, "y": 2}));
    assert!(execution.outcome("a").unwrap().is_success());
    assert!(execution.outcome("b").unwrap().is_success());
    assert!(!execution.is_partial());
    assert_eq!(execution.result.output, json!({"a": "a done", "b": "b done"}));
}

#[tokio::test]
async fn test_many_agents_all_keys_present() {
    let keys = ["k0", "k1", "k2", "k3", "k4", "k5"];
    let mut builder = OrchestrationConfig::builder(OrchestrationMode::Collaborative);
    for (i, key) in keys.iter().enumerate() {
        builder = builder.agent(format!("agent{}", i), writer(5 * (6 - i as u64), *key, "set"));
    }
    let config = builder.build().unwrap();

    let execution = execute(&CancellationToken::new(), &Event::from_message("go"), State::new(), &config)
        .await
        .unwrap();

    for key in keys {
        assert_eq!(execution.result.state.get(key), Some(json!("set")), "missing {}", key);
    }
    assert_eq!(execution.result.invocations, 6);
}

#[tokio::test]
async fn test_branches_start_from_isolated_clones() {
    let initial = State::new();
    initial.set("shared", 0);

    let config = OrchestrationConfig::builder(OrchestrationMode::Collaborative)
        .agent("bump", agent_fn(|_, _, state| {
            state.set("shared", 1);
            Ok(AgentResult::empty())
        }))
        .agent("observe", agent_fn(|_, _, state| {
            Ok(AgentResult::new(state.get("shared").unwrap_or_default()))
        }))
        .build()
        .unwrap();

    let execution = execute(&CancellationToken::new(), &Event::from_message("go"), initial.clone(), &config)
        .await
        .unwrap();

    // Neither the caller's state nor the sibling branch sees the write
    assert_eq!(initial.get("shared"), Some(json!(0)));
    assert_eq!(execution.result.output["observe"], json!(0));
    assert_eq!(execution.result.state.get("shared"), Some(json!(1)));
}

#[tokio::test(start_paused = true)]
async fn test_same_key_resolves_by_completion_order() {
    for _ in 0..3 {
        let config = OrchestrationConfig::builder(OrchestrationMode::Collaborative)
            .agent("slow", writer(50, "winner", "slow"))
            .agent("fast", writer(10, "winner", "fast"))
            .build()
            .unwrap();

        let execution = execute(&CancellationToken::new(), &Event::from_message("go"), State::new(), &config)
            .await
            .unwrap();

        // Merged in finishing order, so the last to finish wins
        assert_eq!(execution.result.state.get("winner"), Some(json!("slow")));
        assert_eq!(execution.result.completion_order, vec!["fast", "slow"]);
    }
}

#[tokio::test(start_paused = true)]
async fn test_simultaneous_finish_breaks_ties_by_declaration() {
    let config = OrchestrationConfig::builder(OrchestrationMode::Collaborative)
        .agent("first", writer(20, "winner", "first"))
        .agent("second", writer(20, "winner", "second"))
        .build()
        .unwrap();

    let execution = execute(&CancellationToken::new(), &Event::from_message("go"), State::new(), &config)
        .await
        .unwrap();

    assert_eq!(execution.result.completion_order, vec!["first", "second"]);
    assert_eq!(execution.result.state.get("winner"), Some(json!("second")));
}

#[tokio::test(start_paused = true)]
async fn test_declaration_order_merge() {
    let config = OrchestrationConfig::builder(OrchestrationMode::Collaborative)
        .agent("fast", writer(10, "winner", "fast"))
        .agent("slow", writer(50, "winner", "slow"))
        .merge(CollaborativeMerge::DeclarationOrder)
        .build()
        .unwrap();

    let execution = execute(&CancellationToken::new(), &Event::from_message("go"), State::new(), &config)
        .await
        .unwrap();

    assert_eq!(execution.result.state.get("winner"), Some(json!("slow")));

    let config = OrchestrationConfig::builder(OrchestrationMode::Collaborative)
        .agent("slow", writer(50, "winner", "slow"))
        .agent("fast", writer(10, "winner", "fast"))
        .merge(CollaborativeMerge::DeclarationOrder)
        .build()
        .unwrap();

    let execution = execute(&CancellationToken::new(), &Event::from_message("go"), State::new(), &config)
        .await
        .unwrap();

    assert_eq!(execution.result.state.get("winner"), Some(json!("fast")));
}

#[tokio::test]
async fn test_single_failure_does_not_abort_others() {
    let config = OrchestrationConfig::builder(OrchestrationMode::Collaborative)
        .agent("good", agent_fn(|_, _, state| {
            state.set("good", true);
            Ok(AgentResult::new("ok"))
        }))
        .agent("bad", agent_fn(|_, _, state| {
            state.set("bad", true);
            Err(AgentError::msg("model unavailable"))
        }))
        .build()
        .unwrap();

    let execution = execute(&CancellationToken::new(), &Event::from_message("go"), State::new(), &config)
        .await
        .unwrap();

    assert_eq!(execution.failed_agents(), vec!["bad"]);
    assert_eq!(
        execution.outcome("bad").unwrap().error(),
        Some(&AgentError::msg("model unavailable"))
    );
    assert_eq!(execution.result.state.get("good"), Some(json!(true)));
    // A failed branch's writes are not merged
    assert_eq!(execution.result.state.get("bad"), None);
    assert_eq!(execution.result.output, json!({"good": "ok"}));
}

#[tokio::test]
async fn test_all_agents_failing_is_terminal() {
    let config = OrchestrationConfig::builder(OrchestrationMode::Collaborative)
        .agent("a", agent_fn(|_, _, _| Err(AgentError::msg("first broke"))))
        .agent("b", agent_fn(|_, _, _| Err(AgentError::msg("second broke"))))
        .build()
        .unwrap();

    let err = execute(&CancellationToken::new(), &Event::from_message("go"), State::new(), &config)
        .await
        .unwrap_err();

    let message = err.to_string();
    assert!(message.starts_with("collaborative orchestration failed"), "{}", message);
    assert!(message.contains("a: first broke"), "{}", message);
    assert!(message.contains("b: second broke"), "{}", message);
    assert!(matches!(err, OrchestrationError::AllAgentsFailed { .. }));
    assert_eq!(err.partial().unwrap().agents.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_keeps_completed_results() {
    let config = OrchestrationConfig::builder(OrchestrationMode::Collaborative)
        .agent("quick", writer(10, "quick", "done"))
        .agent("stuck", Stubborn)
        .timeout(Duration::from_secs(1))
        .build()
        .unwrap();

    let execution = execute(&CancellationToken::new(), &Event::from_message("go"), State::new(), &config)
        .await
        .unwrap();

    assert_eq!(execution.result.state.get("quick"), Some(json!("done")));
    assert_eq!(execution.result.state.get("stubborn"), None);

    let stuck = execution.outcome("stuck").unwrap();
    assert_eq!(stuck.status(), "timed_out");
    assert!(execution.result.duration_ms >= 1000);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_signals_running_branches() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let config = OrchestrationConfig::builder(OrchestrationMode::Collaborative)
        .agent("listener", Listener { seen: tx })
        .agent("quick", writer(10, "quick", "done"))
        .timeout(Duration::from_millis(500))
        .build()
        .unwrap();

    let execution = execute(&CancellationToken::new(), &Event::from_message("go"), State::new(), &config)
        .await
        .unwrap();

    assert!(execution.outcome("listener").unwrap().error().unwrap().is_timeout());
    assert_eq!(rx.recv().await.as_deref(), Some("listener"));
}

#[tokio::test(start_paused = true)]
async fn test_caller_cancellation_mid_run() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let config = OrchestrationConfig::builder(OrchestrationMode::Collaborative)
        .agent("one", Listener { seen: tx.clone() })
        .agent("two", Listener { seen: tx })
        .build()
        .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let err = execute(&cancel, &Event::from_message("go"), State::new(), &config)
        .await
        .unwrap_err();

    assert!(err.is_cancelled(), "{}", err);
}

#[tokio::test]
async fn test_already_cancelled_runs_nothing() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let config = OrchestrationConfig::builder(OrchestrationMode::Collaborative)
        .agent("a", agent_fn(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(AgentResult::empty())
        }))
        .build()
        .unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();

    let initial = State::new();
    let err = execute(&cancel, &Event::from_message("go"), initial.clone(), &config)
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestrationError::Cancelled { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(initial.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_max_concurrency_bounds_fan_out() {
    struct Tracked {
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AgentHandler for Tracked {
        async fn run(&self, _ctx: &AgentContext, _event: &Event, _state: &State) -> Result<AgentResult, AgentError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(AgentResult::empty())
        }
    }

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut builder = OrchestrationConfig::builder(OrchestrationMode::Collaborative).max_concurrency(2);
    for i in 0..5 {
        builder = builder.agent(
            format!("worker{}", i),
            Tracked {
                running: Arc::clone(&running),
                peak: Arc::clone(&peak),
            },
        );
    }
    let config = builder.build().unwrap();

    let execution = execute(&CancellationToken::new(), &Event::from_message("go"), State::new(), &config)
        .await
        .unwrap();

    assert_eq!(execution.result.invocations, 5);
    assert_eq!(peak.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_panicking_branch_is_reported() {
    let config = OrchestrationConfig::builder(OrchestrationMode::Collaborative)
        .agent("steady", agent_fn(|_, _, state| {
            state.set("steady", true);
            Ok(AgentResult::empty())
        }))
        .agent("explodes", agent_fn(|_, _, _| panic!("boom")))
        .build()
        .unwrap();

    let execution = execute(&CancellationToken::new(), &Event::from_message("go"), State::new(), &config)
        .await
        .unwrap();

    match execution.outcome("explodes").unwrap() {
        AgentOutcome::Failed {
            error: AgentError::Panicked(message),
            ..
        } => assert_eq!(message, "boom"),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(execution.result.state.get("steady"), Some(json!(true)));
}

#[tokio::test]
async fn test_every_branch_sees_the_same_event() {
    let event = Event::from_message("shared").with_session_id("s-1");
    let expected = event.id().to_string();

    let seen = |_: &AgentContext, event: &Event, _: &State| -> Result<AgentResult, AgentError> {
        Ok(AgentResult::new(format!(
            "{}:{}",
            event.id(),
            event.session_id().unwrap_or_default()
        )))
    };
    let config = OrchestrationConfig::builder(OrchestrationMode::Collaborative)
        .agent("a", agent_fn(seen))
        .agent("b", agent_fn(seen))
        .build()
        .unwrap();

    let execution = execute(&CancellationToken::new(), &event, State::new(), &config)
        .await
        .unwrap();

    let want = json!(format!("{}:s-1", expected));
    assert_eq!(execution.result.output["a"], want);
    assert_eq!(execution.result.output["b"], want);
}

#[tokio::test(start_paused = true)]
async fn test_processed_by_lists_merged_agents() {
    let config = OrchestrationConfig::builder(OrchestrationMode::Collaborative)
        .agent("late", writer(30, "late", "1"))
        .agent("early", writer(5, "early", "1"))
        .build()
        .unwrap();

    let execution = execute(&CancellationToken::new(), &Event::from_message("go"), State::new(), &config)
        .await
        .unwrap();

    assert_eq!(
        execution.result.state.get_meta(PROCESSED_BY_KEY),
        Some("early,late".to_string())
    );
}

#[tokio::test]
async fn test_returned_state_replaces_branch_clone() {
    let initial = State::new();
    initial.set("seed", 0);

    let config = OrchestrationConfig::builder(OrchestrationMode::Collaborative)
        .agent("fresh", agent_fn(|_, _, state| {
            state.set("scratch", true);
            let next = State::new();
            next.set("x", 1);
            Ok(AgentResult::new("fresh").with_state(next))
        }))
        .agent("inplace", agent_fn(|_, _, state| {
            state.set("y", 2);
            Ok(AgentResult::new("inplace"))
        }))
        .merge(CollaborativeMerge::DeclarationOrder)
        .build()
        .unwrap();

    let execution = execute(&CancellationToken::new(), &Event::from_message("go"), initial, &config)
        .await
        .unwrap();

    let merged = &execution.result.state;
    assert_eq!(merged.get("x"), Some(json!(1)));
    assert_eq!(merged.get("y"), Some(json!(2)));
    // Writes to the handed-in clone are superseded by the returned state
    assert_eq!(merged.get("scratch"), None);
    assert_eq!(merged.get("seed"), None);

    let returned = execution
        .outcome("fresh")
        .and_then(AgentOutcome::result)
        .and_then(|r| r.state.as_ref())
        .unwrap();
    assert_eq!(returned.get("x"), Some(json!(1)));
    assert_eq!(returned.get("scratch"), None);
}

#[tokio::test]
async fn test_removed_key_stays_removed() {
    let initial = State::new();
    initial.set("tmp", 1);
    initial.set("kept", 2);

    let config = OrchestrationConfig::builder(OrchestrationMode::Collaborative)
        .agent("cleaner", agent_fn(|_, _, state| {
            state.remove("tmp");
            Ok(AgentResult::empty())
        }))
        .agent("reader", agent_fn(|_, _, state| {
            state.set("saw_tmp", state.get("tmp").is_some());
            Ok(AgentResult::empty())
        }))
        .build()
        .unwrap();

    let execution = execute(&CancellationToken::new(), &Event::from_message("go"), initial, &config)
        .await
        .unwrap();

    let merged = &execution.result.state;
    assert_eq!(merged.get("tmp"), None);
    assert_eq!(merged.get("kept"), Some(json!(2)));
    assert_eq!(merged.get("saw_tmp"), Some(json!(true)));
}
