//! Lifecycle hooks around agent invocations.
//!
//! A [`HookRegistry`] attached to a configuration is called by the runner
//! before every agent run, after every successful run and whenever an agent
//! fails. Callbacks see the state the agent works on and may mutate it.
//!
//! A failing `BeforeAgentRun` callback fails the agent without running it.
//! Failures of the other hooks are logged and never change the outcome.

use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::domain::{AgentResult, Event, State};

use super::error::AgentError;
use super::orchestration::OrchestrationMode;

/// Point in an agent invocation where callbacks fire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPoint {
    BeforeAgentRun,
    AfterAgentRun,
    AgentError,

    /// Registration only: the callback fires at every point
    All,
}

impl HookPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BeforeAgentRun => "before_agent_run",
            Self::AfterAgentRun => "after_agent_run",
            Self::AgentError => "agent_error",
            Self::All => "all",
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a callback can see about the invocation
#[derive(Debug, Clone, Copy)]
pub struct HookArgs<'a> {
    pub hook: HookPoint,
    pub agent: &'a str,
    pub mode: OrchestrationMode,
    pub iteration: Option<u32>,
    pub event: &'a Event,
    pub state: &'a State,

    /// Set for `AfterAgentRun`
    pub result: Option<&'a AgentResult>,

    /// Set for `AgentError`
    pub error: Option<&'a AgentError>,
}

pub type HookFn = Arc<dyn Fn(&HookArgs<'_>) -> Result<()> + Send + Sync>;

struct Registration {
    name: String,
    hook: HookPoint,
    agent: Option<String>,
    callback: HookFn,
}

impl Registration {
    fn matches(&self, args: &HookArgs<'_>) -> bool {
        (self.hook == HookPoint::All || self.hook == args.hook)
            && self.agent.as_deref().map_or(true, |agent| agent == args.agent)
    }
}

/// Named callbacks keyed by hook point, called in registration order
#[derive(Default)]
pub struct HookRegistry {
    registrations: Vec<Registration>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for every agent.
    ///
    /// A callback already registered under the same name and hook is replaced.
    pub fn register<F>(&mut self, hook: HookPoint, name: impl Into<String>, callback: F)
    where
        F: Fn(&HookArgs<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.insert(hook, name.into(), None, Arc::new(callback));
    }

    /// Register a callback that only fires for one agent
    pub fn register_for<F>(
        &mut self,
        hook: HookPoint,
        name: impl Into<String>,
        agent: impl Into<String>,
        callback: F,
    ) where
        F: Fn(&HookArgs<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.insert(hook, name.into(), Some(agent.into()), Arc::new(callback));
    }

    /// Builder form of [`HookRegistry::register`]
    pub fn with_hook<F>(mut self, hook: HookPoint, name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&HookArgs<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.register(hook, name, callback);
        self
    }

    /// Remove a callback; returns false when nothing was registered
    pub fn unregister(&mut self, hook: HookPoint, name: &str) -> bool {
        let before = self.registrations.len();
        self.registrations
            .retain(|r| !(r.hook == hook && r.name == name));
        before != self.registrations.len()
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    fn insert(&mut self, hook: HookPoint, name: String, agent: Option<String>, callback: HookFn) {
        self.unregister(hook, &name);
        debug!(hook = %hook, callback = %name, "Registered hook");
        self.registrations.push(Registration {
            name,
            hook,
            agent,
            callback,
        });
    }

    /// Run every matching callback.
    ///
    /// All callbacks run even when one fails; the last failure is returned.
    pub fn invoke(&self, args: &HookArgs<'_>) -> Result<()> {
        let mut last_error = None;

        for registration in self.registrations.iter().filter(|r| r.matches(args)) {
            debug!(hook = %args.hook, callback = %registration.name, agent = args.agent, "Running hook");
            if let Err(err) = (registration.callback)(args) {
                error!(hook = %args.hook, callback = %registration.name, error = %format!("{:#}", err), "Hook failed");
                last_error = Some(anyhow!("hook '{}' failed: {:#}", registration.name, err));
            }
        }

        match last_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(
                self.registrations
                    .iter()
                    .map(|r| format!("{}:{}", r.hook, r.name)),
            )
            .finish()
    }
}
