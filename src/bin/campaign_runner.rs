//! Rehearse a campaign workflow end to end with dry-run providers.
//!
//! Usage:
//!
//! ```text
//! campaign-runner [--config <path>] [--recover] <workflow> <input.json | inline JSON>
//! campaign-runner [--config <path>] --list
//! ```

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use colored::Colorize;
use std::sync::Arc;
use std::time::Duration;

use campaign_orchestrator::activity::dry_run::{DryRunCalendar, DryRunEmail, DryRunLlm};
use campaign_orchestrator::activity::ActivityInvoker;
use campaign_orchestrator::config::get_settings;
use campaign_orchestrator::telemetry::init_telemetry;
use campaign_orchestrator::workflow::{catalog, RunStatus, WorkflowExecutor, WorkflowRun};

const WAIT_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Parser)]
#[command(name = "campaign-runner", about = "Rehearse a campaign workflow with dry-run providers")]
#[command(version)]
struct Args {
    /// Settings file (YAML); defaults to the usual search locations
    #[arg(short, long)]
    config: Option<String>,

    /// List registered workflows and exit
    #[arg(long, conflicts_with_all = ["recover", "workflow"])]
    list: bool,

    /// Resume unfinished runs from the store before starting a new one
    #[arg(long)]
    recover: bool,

    /// Workflow to start
    #[arg(required_unless_present_any = ["list", "recover"])]
    workflow: Option<String>,

    /// Run input: a JSON file or inline JSON
    #[arg(requires = "workflow")]
    input: Option<String>,
}

fn read_input(raw: &str) -> Result<serde_json::Value> {
    let text = if raw.trim_start().starts_with('{') {
        raw.to_string()
    } else {
        std::fs::read_to_string(raw).with_context(|| format!("failed to read input file {}", raw))?
    };
    serde_json::from_str(&text).context("input is not valid JSON")
}

fn print_run(run: &WorkflowRun) {
    let status = match run.status {
        RunStatus::Succeeded => run.status.to_string().bold().green(),
        RunStatus::Failed => run.status.to_string().bold().red(),
        RunStatus::Cancelled => run.status.to_string().bold().yellow(),
        _ => run.status.to_string().bold(),
    };
    println!("{} {} ({})", "Run".bold(), run.id, run.definition);
    println!("{} {}", "Status:".bold(), status);

    println!("{}", "Attempts:".bold());
    for attempt in &run.attempts {
        let item = attempt.item.map(|i| format!("[{}]", i)).unwrap_or_default();
        let detail = attempt
            .error
            .as_ref()
            .map(|e| format!(" {} {}", e.kind, e.message))
            .unwrap_or_default();
        println!(
            "  {}{} #{} {:?} {}ms{}",
            attempt.step_id, item, attempt.attempt, attempt.outcome, attempt.duration_ms, detail
        );
    }

    if let Some(error) = &run.last_error {
        println!("{} {} {}", "Last error:".bold().red(), error.kind, error.message);
    }

    let outputs = serde_json::to_string_pretty(&run.outputs).unwrap_or_default();
    println!("{}\n{}", "Outputs:".bold(), outputs);
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = get_settings(args.config.as_deref())?;
    init_telemetry(settings.logger.telemetry_config("campaign-runner"))?;

    let store = settings.store.open().await?;
    let invoker = ActivityInvoker::new(
        Arc::new(DryRunLlm::default()),
        Arc::new(DryRunEmail::default()),
        Arc::new(DryRunCalendar::default()),
    )
    .with_model(settings.model.clone());
    let executor = WorkflowExecutor::new(settings.executor.clone(), store, invoker)?;

    for definition in catalog::builtin_definitions()
        .into_iter()
        .chain(settings.workflows.iter().cloned())
    {
        executor.register_definition(definition)?;
    }

    if args.list {
        println!("{}", "Registered workflows".bold().green());
        for name in executor.registry().names() {
            println!("  {}", name);
        }
        return Ok(());
    }

    if args.recover {
        let resumed = executor.recover().await?;
        println!("{} {} run(s)", "Recovered".bold(), resumed.len());
        for run_id in resumed {
            let run = executor.wait_for_run(&run_id, WAIT_TIMEOUT).await?;
            print_run(&run);
        }
        if args.workflow.is_none() {
            executor.shutdown(Duration::from_secs(5)).await;
            return Ok(());
        }
    }

    let workflow = args
        .workflow
        .ok_or_else(|| anyhow!("missing workflow name (try --list)"))?;
    let input = read_input(args.input.as_deref().unwrap_or("{}"))?;

    let run_id = executor.start_workflow(&workflow, input).await?;
    println!("{} {}", "Started run".bold(), run_id);

    let run = tokio::select! {
        run = executor.wait_for_run(&run_id, WAIT_TIMEOUT) => run?,
        _ = tokio::signal::ctrl_c() => {
            executor.cancel_run(&run_id).await?;
            executor.wait_for_run(&run_id, WAIT_TIMEOUT).await?
        }
    };
    print_run(&run);

    executor.shutdown(Duration::from_secs(5)).await;
    if run.status != RunStatus::Succeeded {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_args() {
        let args = Args::try_parse_from([
            "campaign-runner",
            "-c",
            "settings.yaml",
            "outreach_campaign",
            "{\"lead\": {}}",
        ])
        .unwrap();
        assert_eq!(args.config.as_deref(), Some("settings.yaml"));
        assert_eq!(args.workflow.as_deref(), Some("outreach_campaign"));
        assert!(!args.list);

        assert!(Args::try_parse_from(["campaign-runner", "--list"]).unwrap().list);
        assert!(Args::try_parse_from(["campaign-runner", "--recover"]).unwrap().workflow.is_none());
        assert!(Args::try_parse_from(["campaign-runner"]).is_err());
        assert!(Args::try_parse_from(["campaign-runner", "--list", "outreach_campaign"]).is_err());
    }
}
