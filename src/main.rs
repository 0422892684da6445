// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use quorum_backend::Backend;
use quorum_config::{Config, PlanningModeSetting};
use quorum_core::{
    AgentId, AgentSpec, Orchestrator, PlanningMode, SessionContext, TaskEvent, TaskOptions,
    TaskOutcome,
};
use quorum_limits::{RateLimiterRegistry, SlidingWindow};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Some(cmd) = &cli.command {
        match cmd {
            Commands::ListBackends { json } => return list_backends_cmd(*json),
            Commands::ShowConfig => {
                let config = quorum_config::load(cli.config.as_deref())?;
                println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
                return Ok(());
            }
            // `ask` needs the full roster; it falls through to the task path.
            Commands::Ask { .. } => {}
        }
    }

    let config = quorum_config::load(cli.config.as_deref())?;
    if config.agents.is_empty() {
        anyhow::bail!(
            "no agents configured.\n\
             Add a roster to quorum.yaml, for example:\n\n\
             agents:\n\
             \x20 - id: scout\n\
             \x20   backend: {{ driver: gemini, model: gemini-2.0-flash }}\n\
             \x20 - id: critic\n\
             \x20   backend: {{ driver: openai, model: gpt-4o }}"
        );
    }

    let limits = build_limits(&config);
    let roster = build_roster(&config, &limits)?;
    let orchestrator = Orchestrator::new(Arc::clone(&limits));
    let mut session = SessionContext::new(config.session.keep_last);
    let options = task_options(&config, &cli);

    // `quorum ask "query"` and the bare-positional form share one code path.
    let query = match &cli.command {
        Some(Commands::Ask { query }) => Some(query.clone()),
        _ => cli.query.clone(),
    };
    match query {
        Some(query) => {
            let outcome =
                run_one_task(&orchestrator, &query, &roster, &mut session, options.clone()).await;
            if cli.interactive {
                interactive_loop(&orchestrator, &roster, &mut session, &options).await?;
            }
            if outcome.winner.is_none() {
                std::process::exit(1);
            }
        }
        None => interactive_loop(&orchestrator, &roster, &mut session, &options).await?,
    }
    Ok(())
}

/// One configured agent, reusable across the tasks of a session.
struct RosterEntry {
    id: AgentId,
    backend: Arc<dyn Backend>,
    system_prompt: Option<String>,
}

fn build_roster(
    config: &Config,
    limits: &Arc<RateLimiterRegistry>,
) -> anyhow::Result<Vec<RosterEntry>> {
    let mut roster = Vec::with_capacity(config.agents.len());
    for (i, entry) in config.agents.iter().enumerate() {
        let id = entry
            .id
            .clone()
            .unwrap_or_else(|| format!("agent-{}", i + 1));
        let backend = quorum_backend::from_config(&entry.backend, limits)
            .with_context(|| format!("configuring backend for agent {id:?}"))?;
        roster.push(RosterEntry {
            id: AgentId::from(id.as_str()),
            backend,
            system_prompt: entry.system_prompt.clone(),
        });
    }
    Ok(roster)
}

fn agent_specs(roster: &[RosterEntry]) -> Vec<AgentSpec> {
    roster
        .iter()
        .map(|r| AgentSpec {
            id: r.id.clone(),
            backend: Arc::clone(&r.backend),
            system_prompt: r.system_prompt.clone(),
        })
        .collect()
}

/// Startup-scope windows: the built-in Gemini default, overridden or
/// extended by the config's `rate_limits` table.
fn build_limits(config: &Config) -> Arc<RateLimiterRegistry> {
    let mut windows: HashMap<String, SlidingWindow> = HashMap::new();
    windows.insert("gemini".into(), SlidingWindow::gemini_startup());
    for (class, entry) in &config.rate_limits {
        windows.insert(
            class.clone(),
            SlidingWindow::new(entry.max_requests, entry.window_duration()),
        );
    }
    Arc::new(RateLimiterRegistry::new(windows))
}

fn task_options(config: &Config, cli: &Cli) -> TaskOptions {
    let planning = if cli.no_planning {
        PlanningModeSetting::Off
    } else {
        cli.planning.unwrap_or(config.coordination.planning_mode)
    };
    TaskOptions {
        deadline: cli
            .deadline
            .unwrap_or_else(|| config.coordination.deadline_duration()),
        stability_window: config.coordination.stability_duration(),
        restart_budget: config.coordination.restart_budget,
        planning_mode: match planning {
            PlanningModeSetting::Auto => PlanningMode::Auto,
            PlanningModeSetting::On => PlanningMode::On,
            PlanningModeSetting::Off => PlanningMode::Off,
        },
        chunk_buffer: config.coordination.chunk_buffer,
    }
}

async fn run_one_task(
    orchestrator: &Orchestrator,
    query: &str,
    roster: &[RosterEntry],
    session: &mut SessionContext,
    options: TaskOptions,
) -> TaskOutcome {
    let (tx, rx) = tokio::sync::mpsc::channel(256);
    let renderer = tokio::spawn(render_events(rx));
    let outcome = orchestrator
        .run_task(query, agent_specs(roster), session, options, tx)
        .await;
    let _ = renderer.await;
    outcome
}

async fn interactive_loop(
    orchestrator: &Orchestrator,
    roster: &[RosterEntry],
    session: &mut SessionContext,
    options: &TaskOptions,
) -> anyhow::Result<()> {
    let stdin = io::stdin();
    loop {
        print!("quorum> ");
        io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            return Ok(()); // EOF
        }
        let input = line.trim();
        match input {
            "" => continue,
            "/quit" | "/exit" => return Ok(()),
            "/clear" => {
                session.clear();
                println!("session cleared");
                continue;
            }
            query => {
                let _ = run_one_task(orchestrator, query, roster, session, options.clone()).await;
            }
        }
    }
}

/// Render coordination events as compact terminal lines.  Final-answer
/// chunks stream raw to stdout; everything else is a one-line status note.
async fn render_events(mut rx: tokio::sync::mpsc::Receiver<TaskEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            TaskEvent::AgentStarted { agent } => {
                println!("• {agent} started");
            }
            TaskEvent::AnswerPublished {
                agent,
                version,
                text,
            } => {
                println!("• {agent} published answer v{version}: {}", preview(&text));
            }
            TaskEvent::VoteCast {
                voter,
                target,
                reason,
            } => {
                println!("• {voter} voted for {target}: {}", preview(&reason));
            }
            TaskEvent::AgentFailed { agent, error } => {
                println!("✗ {agent} failed: {error}");
            }
            TaskEvent::WinnerElected { winner, reason } => {
                println!("★ {winner} elected ({reason})\n");
            }
            TaskEvent::FinalChunk { text } => {
                print!("{text}");
                let _ = io::stdout().flush();
            }
            TaskEvent::TaskDone { outcome } => {
                println!();
                tracing::debug!(
                    reason = %outcome.reason,
                    elapsed_ms = outcome.elapsed.as_millis() as u64,
                    "task finished"
                );
            }
            // Working-phase streaming is noise on a plain terminal; surface
            // it through the debug log instead.
            TaskEvent::Content { agent, text } => {
                tracing::debug!(%agent, text, "content");
            }
            TaskEvent::Reasoning { agent, .. } => {
                tracing::trace!(%agent, "reasoning delta");
            }
            TaskEvent::ToolCall { agent, name, .. } => {
                tracing::debug!(%agent, tool = %name, "tool call");
            }
            TaskEvent::ToolResult { agent, .. } => {
                tracing::debug!(%agent, "tool result");
            }
        }
    }
}

fn preview(s: &str) -> String {
    let line = s.lines().next().unwrap_or("");
    if line.chars().count() > 80 {
        format!("{}…", line.chars().take(79).collect::<String>())
    } else {
        line.to_string()
    }
}

fn list_backends_cmd(as_json: bool) -> anyhow::Result<()> {
    let drivers = quorum_backend::list_drivers();

    if as_json {
        #[derive(serde::Serialize)]
        struct DriverJson {
            id: &'static str,
            name: &'static str,
            description: &'static str,
            default_api_key_env: Option<&'static str>,
            default_base_url: Option<&'static str>,
            requires_api_key: bool,
        }
        let rows: Vec<DriverJson> = drivers
            .iter()
            .map(|d| DriverJson {
                id: d.id,
                name: d.name,
                description: d.description,
                default_api_key_env: d.default_api_key_env,
                default_base_url: d.default_base_url,
                requires_api_key: d.requires_api_key,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    let id_w = drivers.iter().map(|d| d.id.len()).max().unwrap_or(10).max(10);
    let name_w = drivers.iter().map(|d| d.name.len()).max().unwrap_or(8).max(8);
    println!("{:<id_w$}  {:<name_w$}  DESCRIPTION", "ID", "NAME");
    println!("{}", "-".repeat(id_w + name_w + 40));
    for d in drivers {
        println!("{:<id_w$}  {:<name_w$}  {}", d.id, d.name, d.description);
    }
    println!("\nSet the API key env var listed by `quorum list-backends --json` for hosted drivers.");
    Ok(())
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
