/// Rankflow: multi-tenant workflow orchestration core
///
/// Command-line entry point. `run` starts worker pools and the cron
/// scheduler; the other subcommands operate on the same backend and exit.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rankflow::{
    backend::ScheduleEntry,
    config::Config,
    events::Event,
    server::{build_app, init_tracing, run_service},
    workflow::{dag, FlowInput},
};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "rankflow", version, about = "Multi-tenant workflow orchestration core")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run worker pools and the cron scheduler until Ctrl-C
    Run,
    /// Submit and inspect flows
    #[command(subcommand)]
    Flow(FlowCommand),
    /// Manage recurring schedules
    #[command(subcommand)]
    Schedule(ScheduleCommand),
    /// Validate workflow definition graphs
    #[command(subcommand)]
    Dag(DagCommand),
    /// Follow events published by any process on this backend
    Events {
        /// Only this tenant's channel; every tenant when omitted
        #[arg(long)]
        tenant: Option<String>,
    },
    /// List registered workflow templates
    Templates,
}

#[derive(Subcommand)]
enum FlowCommand {
    /// Compose a template and enqueue it
    Submit {
        template: String,
        /// Flow input as JSON, e.g. '{"tenantId":"t1","projectId":"p1","domain":"example.com"}'
        #[arg(long)]
        input: String,
        /// Block until every job of the flow is terminal
        #[arg(long)]
        wait: bool,
    },
    /// Show per-queue job counts of a flow
    Status { flow_id: String },
}

#[derive(Subcommand)]
enum ScheduleCommand {
    /// Create or replace a schedule
    Upsert {
        id: String,
        /// 5-field crontab or 6-field (seconds-first) expression
        #[arg(long)]
        cron: String,
        #[arg(long)]
        template: String,
        #[arg(long)]
        input: String,
        #[arg(long, default_value = "UTC")]
        timezone: String,
        #[arg(long)]
        disabled: bool,
    },
    List,
    Remove { id: String },
    /// Fire a schedule once, leaving its cadence untouched
    RunNow { id: String },
}

#[derive(Subcommand)]
enum DagCommand {
    /// Validate a JSON array of {id, dependsOn} nodes
    Validate { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = Config::default();

    match cli.command {
        Command::Run => run_service(config).await,
        Command::Flow(cmd) => flow(config, cmd).await,
        Command::Schedule(cmd) => schedule(config, cmd).await,
        Command::Dag(DagCommand::Validate { file }) => validate_dag(&file),
        Command::Events { tenant } => tail_events(config, tenant).await,
        Command::Templates => {
            let app = build_app(config).await?;
            for name in app.templates.names() {
                let description = app
                    .templates
                    .get(&name)
                    .map(|t| t.description.clone())
                    .unwrap_or_default();
                println!("{name}\t{description}");
            }
            Ok(())
        }
    }
}

fn parse_input(input: &str) -> Result<FlowInput> {
    serde_json::from_str(input).context("--input is not a valid flow input document")
}

async fn flow(config: Config, cmd: FlowCommand) -> Result<()> {
    let app = build_app(config).await?;
    match cmd {
        FlowCommand::Submit {
            template,
            input,
            wait,
        } => {
            let handle = app.composer.submit(&template, &parse_input(&input)?).await?;
            println!("{}", serde_json::to_string_pretty(&handle)?);
            if wait {
                let status = app
                    .engine
                    .wait_until_drained(&handle.flow_id, Duration::from_millis(500), Duration::from_secs(3600))
                    .await?;
                println!("{}", serde_json::to_string_pretty(&status)?);
            }
        }
        FlowCommand::Status { flow_id } => {
            let status = app
                .backend
                .flow_status(&flow_id)
                .await?
                .with_context(|| format!("flow '{flow_id}' not found"))?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }
    Ok(())
}

async fn schedule(config: Config, cmd: ScheduleCommand) -> Result<()> {
    let app = build_app(config).await?;
    let scheduler = &app.scheduler;
    match cmd {
        ScheduleCommand::Upsert {
            id,
            cron,
            template,
            input,
            timezone,
            disabled,
        } => {
            let mut entry = ScheduleEntry::new(id, cron, template, parse_input(&input)?)
                .with_timezone(timezone);
            entry.enabled = !disabled;
            scheduler.upsert_schedule(entry).await?;
        }
        ScheduleCommand::List => {
            for entry in scheduler.list_schedules().await? {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
        ScheduleCommand::Remove { id } => {
            if !scheduler.remove_schedule(&id).await? {
                println!("schedule '{id}' did not exist");
            }
        }
        ScheduleCommand::RunNow { id } => {
            let handle = scheduler.run_now(&id).await?;
            println!("{}", serde_json::to_string_pretty(&handle)?);
        }
    }
    Ok(())
}

async fn tail_events(config: Config, tenant: Option<String>) -> Result<()> {
    let app = build_app(config).await?;
    let print = |event: Event| match serde_json::to_string(&event) {
        Ok(line) => println!("{line}"),
        Err(e) => eprintln!("undisplayable event: {e}"),
    };
    let subscription = match &tenant {
        Some(tenant) => app.events.subscribe(tenant, print),
        None => app.events.subscribe_all(print),
    };
    subscription.start().await?;
    tokio::signal::ctrl_c().await?;
    subscription.stop();
    Ok(())
}

fn validate_dag(file: &Path) -> Result<()> {
    let document = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let parsed = dag::parse_json(&document)?;
    for (depth, stage) in parsed.stages().iter().enumerate() {
        println!("stage {depth}: {}", stage.join(", "));
    }
    Ok(())
}
