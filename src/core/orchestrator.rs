//! Main orchestrator for multi-agent execution.
//!
//! Validates the configuration, dispatches to the strategy for the configured
//! mode, enforces the overall deadline and cancellation, and aggregates agent
//! results into one [`Execution`].

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::domain::{AgentResult, Event, MergePolicy, State};

use super::agent::{AgentContext, AgentHandler};
use super::error::{AgentError, ConfigError, OrchestrationError};
use super::hooks::{HookArgs, HookPoint, HookRegistry};
use super::orchestration::{CollaborativeMerge, OrchestrationConfig, OrchestrationMode};
use super::report::{AgentOutcome, AgentOutcomes, AggregatedResult, Execution, PartialRun};
use super::retry::RetryPolicy;

/// State key an agent sets to `true` to end a loop early
pub const LOOP_COMPLETED_KEY: &str = "loop_completed";

/// Runs one validated configuration against events
pub struct Orchestrator {
    config: OrchestrationConfig,
    span: Option<Span>,
}

impl Orchestrator {
    /// Create an orchestrator for a configuration
    pub fn new(config: OrchestrationConfig) -> Self {
        Self { config, span: None }
    }

    /// Parent span for every invocation's logging.
    ///
    /// Without one, invocations attach to whatever span is current.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn config(&self) -> &OrchestrationConfig {
        &self.config
    }

    /// Execute the configured agents against an event.
    ///
    /// `state` is the initial state; the final merged or threaded state is
    /// returned inside the result. An already-cancelled token fails before
    /// any agent is invoked.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        event: &Event,
        state: State,
    ) -> Result<Execution, OrchestrationError> {
        let mode = self.config.mode();
        let span = match &self.span {
            Some(parent) => info_span!(parent: parent, "orchestration", %mode, event_id = %event.id()),
            None => info_span!("orchestration", %mode, event_id = %event.id()),
        };

        self.execute_inner(cancel, event, state).instrument(span).await
    }

    async fn execute_inner(
        &self,
        cancel: &CancellationToken,
        event: &Event,
        state: State,
    ) -> Result<Execution, OrchestrationError> {
        let mode = self.config.mode();
        self.config.validate()?;

        if cancel.is_cancelled() {
            warn!("Cancelled before start, no agent invoked");
            return Err(OrchestrationError::Cancelled { mode });
        }

        // Child token: a timeout cancels our branches, never the caller
        let run_token = cancel.child_token();
        let _guard = run_token.clone().drop_guard();

        let started = Instant::now();
        let run = RunClock {
            started,
            deadline: self.config.timeout().map(|t| started + t),
        };

        info!(
            agents = self.config.agents().len(),
            timeout_ms = self.config.timeout().map(|t| t.as_millis() as u64),
            "Starting orchestration"
        );

        let result = match mode {
            OrchestrationMode::Collaborative => self.run_collaborative(&run_token, run, event, state).await,
            OrchestrationMode::Sequential => self.run_sequential(&run_token, run, event, state).await,
            OrchestrationMode::Loop => self.run_loop(&run_token, run, event, state).await,
        };

        match &result {
            Ok(execution) => info!(
                invocations = execution.result.invocations,
                failed = execution.failed_agents().len(),
                duration_ms = execution.result.duration_ms,
                "Orchestration completed"
            ),
            Err(e) => error!(error = %e, "Orchestration failed"),
        }

        result
    }

    /// Fan out to every agent on an isolated state clone, join on
    /// all-settled or the deadline, then merge the successful branches.
    async fn run_collaborative(
        &self,
        run_token: &CancellationToken,
        run: RunClock,
        event: &Event,
        base: State,
    ) -> Result<Execution, OrchestrationError> {
        let mode = OrchestrationMode::Collaborative;
        let agents = self.config.agents();
        let event = Arc::new(event.clone());
        let semaphore = self.config.max_concurrency().map(|n| Arc::new(Semaphore::new(n)));
        let (tx, mut rx) = mpsc::unbounded_channel::<BranchDone>();

        let mut handles: Vec<Option<JoinHandle<()>>> = Vec::with_capacity(agents.len());
        for (index, entry) in agents.iter().enumerate() {
            let branch = Branch {
                index,
                handler: Arc::clone(&entry.handler),
                ctx: AgentContext::new(entry.name.clone(), mode, run_token.clone()),
                event: Arc::clone(&event),
                state: base.clone(),
                semaphore: semaphore.clone(),
                hooks: self.config.hooks().cloned(),
                retry: self.config.retry_policy(&entry.name).cloned(),
            };
            let span = info_span!("agent", agent = %entry.name);
            handles.push(Some(tokio::spawn(branch.run(tx.clone()).instrument(span))));
        }
        drop(tx);

        debug!(branches = handles.len(), "Dispatched collaborative branches");

        let mut settled: Vec<Option<BranchDone>> = agents.iter().map(|_| None).collect();
        let mut remaining = agents.len();
        let interruption = loop {
            if remaining == 0 {
                break None;
            }
            tokio::select! {
                biased;
                done = rx.recv() => match done {
                    Some(done) => {
                        remaining -= 1;
                        let index = done.index;
                        settled[index] = Some(done);
                    }
                    // Every sender dropped: the unsettled branches panicked
                    None => break None,
                },
                _ = wait_for(run.deadline) => {
                    run_token.cancel();
                    break Some(AgentError::TimedOut { elapsed_ms: run.elapsed_ms() });
                }
                _ = run_token.cancelled() => break Some(AgentError::Cancelled),
            }
        };
        drop(rx);

        let mut outcomes = AgentOutcomes::new();
        let mut completed = Vec::new();
        let mut late = Vec::new();

        for (index, entry) in agents.iter().enumerate() {
            let handle = handles[index].take();
            match settled[index].take() {
                Some(BranchDone {
                    outcome: Ok(mut result),
                    state,
                    finished_at,
                    ..
                }) => {
                    info!(agent = %entry.name, duration_ms = result.duration_ms, "Agent completed");
                    // A returned state replaces the branch clone
                    let state = result.state.take().unwrap_or(state);
                    completed.push((index, finished_at, result, state));
                }
                Some(BranchDone {
                    outcome: Err(error),
                    state,
                    ..
                }) => {
                    warn!(agent = %entry.name, error = %error, "Agent failed");
                    outcomes.insert(
                        entry.name.clone(),
                        AgentOutcome::Failed {
                            error,
                            state: Some(state),
                        },
                    );
                }
                None => {
                    let error = match (&interruption, handle) {
                        (Some(error), handle) => {
                            late.extend(handle);
                            error.clone()
                        }
                        (None, Some(handle)) => AgentError::Panicked(panic_message(handle.await)),
                        (None, None) => AgentError::Panicked("branch lost".to_string()),
                    };
                    warn!(agent = %entry.name, error = %error, "Agent did not settle");
                    outcomes.insert(entry.name.clone(), AgentOutcome::Failed { error, state: None });
                }
            }
        }

        if !late.is_empty() {
            // Late branches are never aborted; wait them out off the caller's path
            let count = late.len();
            tokio::spawn(
                async move {
                    for handle in late {
                        let _ = handle.await;
                    }
                    debug!(count, "Discarded late collaborative branches");
                }
                .in_current_span(),
            );
        }

        if completed.is_empty() {
            let summary = outcomes
                .iter()
                .filter_map(|(name, outcome)| outcome.error().map(|e| format!("{}: {}", name, e)))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(OrchestrationError::AllAgentsFailed {
                mode,
                summary,
                partial: Box::new(PartialRun {
                    state: base,
                    agents: outcomes,
                }),
            });
        }

        match self.config.merge() {
            CollaborativeMerge::CompletionOrder => {
                completed.sort_by_key(|(index, finished_at, _, _)| (*finished_at, *index))
            }
            CollaborativeMerge::DeclarationOrder => completed.sort_by_key(|(index, _, _, _)| *index),
        }

        let merged = base.clone();
        let mut output = Map::new();
        let mut completion_order = Vec::with_capacity(completed.len());

        for (index, _, result, state) in completed {
            let name = &agents[index].name;
            merged.apply(&state.diff(&base), MergePolicy::Overwrite);
            merged.mark_processed_by(name);

            output.insert(name.clone(), result.output.clone());
            completion_order.push(name.clone());
            outcomes.insert(name.clone(), AgentOutcome::Completed(result.with_state(state)));
        }

        debug!(order = ?completion_order, "Merged collaborative branch states");

        Ok(Execution {
            result: AggregatedResult {
                mode,
                output: Value::Object(output),
                state: merged,
                invocations: completion_order.len() as u32,
                completion_order,
                duration_ms: run.elapsed_ms(),
            },
            agents: outcomes,
        })
    }

    /// Run agents one at a time in the configured order, threading one state.
    /// The first failure aborts the pipeline.
    async fn run_sequential(
        &self,
        run_token: &CancellationToken,
        run: RunClock,
        event: &Event,
        state: State,
    ) -> Result<Execution, OrchestrationError> {
        let mode = OrchestrationMode::Sequential;
        let order = self.config.order().ok_or(ConfigError::MissingOrder)?;

        let mut outcomes: AgentOutcomes = order
            .iter()
            .map(|name| (name.clone(), AgentOutcome::NotRun))
            .collect();
        let mut state = state;
        let mut output = Value::Null;
        let mut completion_order = Vec::with_capacity(order.len());

        for (position, name) in order.iter().enumerate() {
            let entry = self
                .config
                .agent(name)
                .ok_or_else(|| ConfigError::UnknownAgentInOrder(name.clone()))?;

            debug!(agent = %name, position, "Executing agent");

            let checkpoint = state.clone();
            let ctx = AgentContext::new(name.clone(), mode, run_token.clone());
            let span = info_span!("agent", agent = %name, position);

            let invocation = Invocation {
                handler: entry.handler.as_ref(),
                ctx: &ctx,
                event,
                state: &state,
                hooks: self.config.hooks().map(|hooks| &**hooks),
                retry: self.config.retry_policy(name),
            };

            match invoke(invocation, run).instrument(span).await
            {
                Ok(mut result) => {
                    if let Some(next) = result.state.take() {
                        state = next;
                    }
                    state.mark_processed_by(name);

                    info!(agent = %name, duration_ms = result.duration_ms, "Agent completed");

                    output = result.output.clone();
                    completion_order.push(name.clone());
                    outcomes.insert(name.clone(), AgentOutcome::Completed(result.with_state(state.clone())));
                }
                Err(error) => {
                    error!(agent = %name, position, error = %error, "Agent failed, aborting pipeline");

                    outcomes.insert(
                        name.clone(),
                        AgentOutcome::Failed {
                            error: error.clone(),
                            state: Some(state),
                        },
                    );
                    return Err(OrchestrationError::AgentFailed {
                        mode,
                        agent: name.clone(),
                        iteration: None,
                        source: error,
                        partial: Box::new(PartialRun {
                            state: checkpoint,
                            agents: outcomes,
                        }),
                    });
                }
            }
        }

        Ok(Execution {
            result: AggregatedResult {
                mode,
                output,
                state,
                invocations: completion_order.len() as u32,
                completion_order,
                duration_ms: run.elapsed_ms(),
            },
            agents: outcomes,
        })
    }

    /// Run the single agent repeatedly until an error, the termination
    /// predicate, the completion flag or `max_iterations`.
    async fn run_loop(
        &self,
        run_token: &CancellationToken,
        run: RunClock,
        event: &Event,
        state: State,
    ) -> Result<Execution, OrchestrationError> {
        let mode = OrchestrationMode::Loop;
        let entry = self.config.agents().first().ok_or(ConfigError::NoAgents)?;
        let name = &entry.name;
        let max_iterations = self
            .config
            .max_iterations()
            .filter(|n| *n >= 1)
            .ok_or(ConfigError::MissingMaxIterations)?;

        let mut state = state;
        let mut last: Option<AgentResult> = None;
        let mut iterations = 0u32;

        for iteration in 1..=max_iterations {
            debug!(agent = %name, iteration, max_iterations, "Executing loop iteration");

            let checkpoint = state.clone();
            let ctx = AgentContext::new(name.clone(), mode, run_token.clone()).with_iteration(iteration);
            let span = info_span!("agent", agent = %name, iteration);

            let invocation = Invocation {
                handler: entry.handler.as_ref(),
                ctx: &ctx,
                event,
                state: &state,
                hooks: self.config.hooks().map(|hooks| &**hooks),
                retry: self.config.retry_policy(name),
            };

            let mut result = match invoke(invocation, run).instrument(span).await {
                Ok(result) => result,
                Err(error) => {
                    error!(agent = %name, iteration, error = %error, "Loop iteration failed");

                    let mut outcomes = AgentOutcomes::new();
                    outcomes.insert(
                        name.clone(),
                        AgentOutcome::Failed {
                            error: error.clone(),
                            state: Some(state),
                        },
                    );
                    return Err(OrchestrationError::AgentFailed {
                        mode,
                        agent: name.clone(),
                        iteration: Some(iteration),
                        source: error,
                        partial: Box::new(PartialRun {
                            state: checkpoint,
                            agents: outcomes,
                        }),
                    });
                }
            };

            if let Some(next) = result.state.take() {
                state = next;
            }
            iterations = iteration;
            last = Some(result);

            if let Some(predicate) = self.config.termination() {
                if predicate(&state, iteration) {
                    info!(agent = %name, iteration, "Termination predicate satisfied, stopping loop");
                    break;
                }
            }

            if state.get(LOOP_COMPLETED_KEY) == Some(Value::Bool(true)) {
                info!(agent = %name, iteration, "Agent signaled completion, stopping loop");
                break;
            }
        }

        if iterations == max_iterations {
            info!(agent = %name, iterations, "Completed maximum iterations");
        }

        state.mark_processed_by(name);

        let last = last.unwrap_or_else(AgentResult::empty);
        let output = last.output.clone();
        let mut outcomes = BTreeMap::new();
        outcomes.insert(name.clone(), AgentOutcome::Completed(last.with_state(state.clone())));

        Ok(Execution {
            result: AggregatedResult {
                mode,
                output,
                state,
                invocations: iterations,
                completion_order: vec![name.clone()],
                duration_ms: run.elapsed_ms(),
            },
            agents: outcomes,
        })
    }
}

/// Execute `config` against an event with a one-off orchestrator
pub async fn execute(
    cancel: &CancellationToken,
    event: &Event,
    state: State,
    config: &OrchestrationConfig,
) -> Result<Execution, OrchestrationError> {
    Orchestrator::new(config.clone())
        .execute(cancel, event, state)
        .await
}

/// Start time and optional deadline of one invocation
#[derive(Debug, Clone, Copy)]
struct RunClock {
    started: Instant,
    deadline: Option<Instant>,
}

impl RunClock {
    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Resolves at the deadline, or never when there is none
async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Invoke one agent in the caller's task, racing it against the deadline and
/// cancellation. Used by the single-threaded modes.
async fn invoke(invocation: Invocation<'_>, run: RunClock) -> Result<AgentResult, AgentError> {
    let ctx = invocation.ctx;
    if run.expired() {
        ctx.cancellation_token().cancel();
        return Err(AgentError::TimedOut {
            elapsed_ms: run.elapsed_ms(),
        });
    }
    if ctx.is_cancelled() {
        return Err(AgentError::Cancelled);
    }

    invocation.run(Some(run)).await
}

/// One agent invocation with its hooks and retry policy
struct Invocation<'a> {
    handler: &'a dyn AgentHandler,
    ctx: &'a AgentContext,
    event: &'a Event,
    state: &'a State,
    hooks: Option<&'a HookRegistry>,
    retry: Option<&'a RetryPolicy>,
}

impl Invocation<'_> {
    /// Before-run hooks, the attempts, then the after-run or error hooks.
    ///
    /// With a clock the attempts race the deadline and cancellation; without
    /// one the caller owns the race.
    async fn run(&self, clock: Option<RunClock>) -> Result<AgentResult, AgentError> {
        if let Err(err) = self.fire(HookPoint::BeforeAgentRun, None, None) {
            let error = AgentError::Failed(format!("before_agent_run {:#}", err));
            let _ = self.fire(HookPoint::AgentError, None, Some(&error));
            return Err(error);
        }

        let outcome = match clock {
            None => self.attempts().await,
            Some(run) => tokio::select! {
                biased;
                outcome = self.attempts() => outcome,
                _ = wait_for(run.deadline) => {
                    self.ctx.cancellation_token().cancel();
                    Err(AgentError::TimedOut { elapsed_ms: run.elapsed_ms() })
                }
                _ = self.ctx.cancelled() => Err(AgentError::Cancelled),
            },
        };

        // Hook failures past this point are logged by the registry only
        let _ = match &outcome {
            Ok(result) => self.fire(HookPoint::AfterAgentRun, Some(result), None),
            Err(error) => self.fire(HookPoint::AgentError, None, Some(error)),
        };

        outcome
    }

    /// Run the handler, re-running failures the retry policy allows.
    /// Each retry starts from the state as it was before the first attempt.
    async fn attempts(&self) -> Result<AgentResult, AgentError> {
        let policy = self.retry.filter(|p| p.max_retries > 0);
        let checkpoint = policy.map(|_| self.state.snapshot());
        let mut retries = 0u32;

        loop {
            let started = Instant::now();
            let outcome = self
                .handler
                .run(self.ctx, self.event, self.state)
                .await
                .map(|r| r.with_duration(started.elapsed().as_millis() as u64));

            let retry = match (policy, &outcome) {
                (Some(policy), Err(error)) if policy.should_retry(retries, error) => Some((policy, error.clone())),
                _ => None,
            };
            let Some((policy, error)) = retry else {
                return outcome;
            };

            retries += 1;
            let delay = policy.delay(retries);
            warn!(
                agent = self.ctx.agent(),
                retry = retries,
                max_retries = policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Agent failed, retrying"
            );

            if let Some(snapshot) = &checkpoint {
                self.state.restore(snapshot.clone());
            }

            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.ctx.cancelled() => return Err(AgentError::Cancelled),
            }
        }
    }

    fn fire(
        &self,
        hook: HookPoint,
        result: Option<&AgentResult>,
        error: Option<&AgentError>,
    ) -> anyhow::Result<()> {
        let Some(hooks) = self.hooks else {
            return Ok(());
        };
        hooks.invoke(&HookArgs {
            hook,
            agent: self.ctx.agent(),
            mode: self.ctx.mode(),
            iteration: self.ctx.iteration(),
            event: self.event,
            state: self.state,
            result,
            error,
        })
    }
}

/// One collaborative branch, moved into its own task
struct Branch {
    index: usize,
    handler: Arc<dyn AgentHandler>,
    ctx: AgentContext,
    event: Arc<Event>,
    state: State,
    semaphore: Option<Arc<Semaphore>>,
    hooks: Option<Arc<HookRegistry>>,
    retry: Option<RetryPolicy>,
}

/// A settled branch reported back to the join point
struct BranchDone {
    index: usize,
    outcome: Result<AgentResult, AgentError>,
    state: State,
    finished_at: Instant,
}

impl Branch {
    async fn run(self, tx: mpsc::UnboundedSender<BranchDone>) {
        let Branch {
            index,
            handler,
            ctx,
            event,
            state,
            semaphore,
            hooks,
            retry,
        } = self;

        let _permit = match semaphore {
            Some(semaphore) => tokio::select! {
                permit = semaphore.acquire_owned() => permit.ok(),
                _ = ctx.cancelled() => {
                    let _ = tx.send(BranchDone {
                        index,
                        outcome: Err(AgentError::Cancelled),
                        state,
                        finished_at: Instant::now(),
                    });
                    return;
                }
            },
            None => None,
        };

        let outcome = Invocation {
            handler: handler.as_ref(),
            ctx: &ctx,
            event: &event,
            state: &state,
            hooks: hooks.as_deref(),
            retry: retry.as_ref(),
        }
        .run(None)
        .await;

        // The receiver is gone once the join point has given up on us
        let _ = tx.send(BranchDone {
            index,
            outcome,
            state,
            finished_at: Instant::now(),
        });
    }
}

fn panic_message(joined: Result<(), JoinError>) -> String {
    match joined {
        Ok(()) => "branch exited without reporting".to_string(),
        Err(err) if err.is_panic() => {
            let payload = err.into_panic();
            if let Some(s) = payload.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            }
        }
        Err(err) => err.to_string(),
    }
}
