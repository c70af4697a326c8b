//! Command-line interface for agentflow.
//!
//! Provides commands for running orchestration files, validating them and
//! showing the resolved settings.

use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::adapters::{CommandProvider, ModelProvider};
use crate::agents::PromptAgent;
use crate::config::Settings;
use crate::core::{
    AgentDefinition, AgentHandler, AgentOutcome, AgentOutcomes, OrchestrationError, OrchestrationFile,
    Orchestrator, ToolCallPipeline,
};
use crate::domain::{Event, State};

/// agentflow - Multi-agent orchestration runner
#[derive(Parser, Debug)]
#[command(name = "agentflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run an orchestration file
    Run {
        /// Orchestration file (YAML)
        file: PathBuf,

        /// Input file (reads from stdin if not provided)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Read input from stdin
        #[arg(long)]
        stdin: bool,

        /// Provider command overriding the configured one
        #[arg(short, long, env = "AGENTFLOW_PROVIDER")]
        provider: Option<String>,
    },

    /// Check an orchestration file without running it
    Validate {
        /// Orchestration file (YAML)
        file: PathBuf,
    },

    /// Show resolved settings
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let settings = Settings::load()?;

        match self.command {
            Commands::Run {
                file,
                input,
                stdin,
                provider,
            } => run_orchestration(&settings, &file, input, stdin, provider).await,
            Commands::Validate { file } => validate_orchestration(&settings, &file),
            Commands::Config => show_config(&settings),
        }
    }
}

/// Run an orchestration file against the given input
async fn run_orchestration(
    settings: &Settings,
    path: &Path,
    input_file: Option<PathBuf>,
    use_stdin: bool,
    provider_override: Option<String>,
) -> Result<()> {
    let file = OrchestrationFile::from_file(path)?.with_defaults(settings.timeout, settings.max_iterations);

    let input = read_input(input_file, use_stdin)?;

    let default_provider = provider_override.or_else(|| settings.provider.clone());
    let config = file.to_config(|definition| build_agent(settings, definition, default_provider.as_deref()))?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling orchestration");
            ctrl_c.cancel();
        }
    });

    let span = tracing::info_span!("run", orchestration = %file.name);
    let orchestrator = Orchestrator::new(config).with_span(span);
    let event = Event::from_message(input);

    match orchestrator.execute(&cancel, &event, State::new()).await {
        Ok(execution) => {
            println!("{}", execution.result.output_text());

            eprintln!();
            print_agent_summary(&execution.agents);
            eprintln!(
                "[{} completed: {} invocation(s) in {}ms]",
                file.name, execution.result.invocations, execution.result.duration_ms
            );
            Ok(())
        }
        Err(err) => {
            if let Some(partial) = err.partial() {
                print_agent_summary(&partial.agents);
            }
            Err(describe_failure(err, &file.name))
        }
    }
}

fn describe_failure(err: OrchestrationError, name: &str) -> anyhow::Error {
    anyhow::Error::new(err).context(format!("Orchestration '{}' failed", name))
}

/// Resolve one agent definition to a prompt agent
fn build_agent(
    settings: &Settings,
    definition: &AgentDefinition,
    default_provider: Option<&str>,
) -> Result<Arc<dyn AgentHandler>> {
    let command = definition
        .provider
        .as_deref()
        .or(default_provider)
        .context("No model provider configured. Set AGENTFLOW_PROVIDER, pass --provider or add provider.command to .agentflow/config.yaml")?;

    let provider: Arc<dyn ModelProvider> =
        Arc::new(CommandProvider::from_command_line(command)?.with_timeout(settings.provider_timeout));

    Ok(Arc::new(PromptAgent::from_definition(
        definition,
        ToolCallPipeline::new(provider),
    )))
}

/// Read the event input from a file or stdin
fn read_input(input_file: Option<PathBuf>, use_stdin: bool) -> Result<String> {
    let input = if let Some(path) = input_file {
        std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read input file: {}", path.display()))?
    } else if use_stdin || !io::stdin().is_terminal() {
        // Read from stdin if --stdin flag or if stdin is piped
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read from stdin")?;
        buffer
    } else {
        anyhow::bail!("No input provided. Use --input <file> or pipe to stdin");
    };

    if input.trim().is_empty() {
        anyhow::bail!("Input is empty");
    }

    Ok(input)
}

fn print_agent_summary(agents: &AgentOutcomes) {
    eprintln!("{:<24} {:<12} {}", "AGENT", "STATUS", "DETAIL");
    eprintln!("{}", "-".repeat(60));

    for (name, outcome) in agents {
        let detail = match outcome {
            AgentOutcome::Completed(result) => result
                .duration_ms
                .map(|ms| format!("{}ms", ms))
                .unwrap_or_default(),
            AgentOutcome::Failed { error, .. } => error.to_string(),
            AgentOutcome::NotRun => String::new(),
        };
        eprintln!("{:<24} {:<12} {}", name, outcome.status(), detail);
    }
}

/// Parse and validate an orchestration file
fn validate_orchestration(settings: &Settings, path: &Path) -> Result<()> {
    let file = OrchestrationFile::from_file(path)?.with_defaults(settings.timeout, settings.max_iterations);
    file.validate()?;

    println!("{} is valid", path.display());
    println!("  Name: {}", file.name);
    if !file.description.is_empty() {
        println!("  Description: {}", file.description);
    }
    println!("  Mode: {}", file.mode);
    let names: Vec<&str> = file.agents.iter().map(|a| a.name.as_str()).collect();
    println!("  Agents: {}", names.join(", "));
    if let Some(order) = &file.order {
        println!("  Order: {}", order.join(" -> "));
    }

    Ok(())
}

/// Print resolved settings
fn show_config(settings: &Settings) -> Result<()> {
    println!("agentflow settings");
    println!("==================");
    println!();

    match &settings.config_file {
        Some(path) => println!("Config file: {}", path.display()),
        None => println!("Config file: (none found, using defaults)"),
    }
    println!();

    println!("Home: {}", settings.home.display());
    println!(
        "Provider: {}",
        settings.provider.as_deref().unwrap_or("(not configured)")
    );
    println!("Provider timeout: {}s", settings.provider_timeout.as_secs());
    println!("Orchestration timeout: {}s", settings.timeout.as_secs());
    println!("Loop iterations: {}", settings.max_iterations);
    if let Some(level) = &settings.log_level {
        println!("Log level: {}", level);
    }

    Ok(())
}
