use anyhow::{Context, Result};
use clap::Parser;
use cmdguard::audit::verify_chain;
use cmdguard::executor::orchestrator::{check_plan, PlanReport, StepCheck};
use cmdguard::executor::{ExecutionStatus, PlanState, StepState};
use cmdguard::ui::{colored_level, create_spinner, spawn_renderer, ConsoleConfirmer, PlanProgress};
use cmdguard::{Config, Plan, Session};
use colored::*;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{AuditAction, Cli, Commands};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let mut config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(mode) = cli.mode {
        config = config.with_mode(mode);
    }

    match &cli.command {
        Commands::Run { plan, json } => run_plan(&cli, config, plan, *json).await,
        Commands::Check { plan, json } => {
            let plan = load_plan(plan)?;
            let checks = check_plan(&config, &plan);
            if *json {
                println!("{}", serde_json::to_string_pretty(&checks)?);
            } else {
                print_checks(&checks);
            }
            Ok(if checks.iter().all(|c| c.valid) {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Undo { to, list } => {
            let mut session = Session::open(config, &cli.session)?;
            if *list {
                print_undo_stack(&session);
                session.close().await?;
                return Ok(ExitCode::SUCCESS);
            }

            let spinner = create_spinner("Undoing...");
            let result = match to {
                Some(step) => session.undo_to(*step).await,
                None => session.undo_last().await.map(|r| vec![r]),
            };
            spinner.finish_and_clear();
            session.close().await?;

            let records = result?;
            for record in &records {
                eprintln!(
                    "{} {} ({})",
                    "↶".green(),
                    record.description,
                    record.inverse_action.describe().dimmed()
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Commit => {
            let mut session = Session::open(config, &cli.session)?;
            let count = session.commit().await;
            session.close().await?;
            eprintln!("{} {} change(s) committed", "✓".green(), count?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Audit {
            action: AuditAction::Verify,
        } => {
            let path = config.audit_log_path();
            let report = verify_chain(&path)?;
            if report.is_intact() {
                eprintln!(
                    "{} {} entries, chain intact ({})",
                    "✓".green(),
                    report.entries,
                    path.display()
                );
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!(
                    "{} chain broken at line {}: {}",
                    "✗".red().bold(),
                    report.first_break.unwrap_or(0),
                    report.reason.as_deref().unwrap_or("unknown")
                );
                Ok(ExitCode::FAILURE)
            }
        }
    }
}

fn init_tracing(debug: bool) {
    let default = if debug { "cmdguard=debug" } else { "cmdguard=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_plan(path: &Path) -> Result<Plan> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read plan {}", path.display()))?;
    Ok(Plan::from_json(&text)?)
}

async fn run_plan(cli: &Cli, config: Config, path: &Path, json: bool) -> Result<ExitCode> {
    let mut plan = load_plan(path)?;
    let mut session = Session::open(config, &cli.session)?;
    eprintln!(
        "{} {} step(s), mode {}",
        "[>]".cyan().bold(),
        plan.step_count(),
        session.mode().to_string().bold()
    );

    let progress = Arc::new(PlanProgress::new(plan.step_count(), "plan"));
    let renderer = spawn_renderer(session.subscribe(), progress.clone());

    let cancel = session.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let confirmer = ConsoleConfirmer::new(cli.yes);
    let result = session.run(&mut plan, &confirmer).await;
    session.close().await?;
    let _ = renderer.await;

    let report = result?;
    progress.finish(&report);
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    Ok(match report.state {
        PlanState::Completed => ExitCode::SUCCESS,
        PlanState::Aborted => ExitCode::FAILURE,
        _ => ExitCode::from(2),
    })
}

fn print_checks(checks: &[StepCheck]) {
    for check in checks {
        let head = format!("{}. {}", check.step.index + 1, check.description);
        match (&check.assessment, &check.reason) {
            (Some(assessment), _) => {
                let confirm = if check.requires_confirmation {
                    " (confirmation required)".yellow().to_string()
                } else {
                    String::new()
                };
                println!("{} [{}]{}", head, colored_level(assessment.level), confirm);
                for warning in &assessment.warnings {
                    println!("   {} {}", "[!]".yellow(), warning);
                }
            }
            (None, reason) => println!(
                "{} [{}] {}",
                head,
                "invalid".red().bold(),
                reason.as_deref().unwrap_or("")
            ),
        }
    }
}

fn print_report(report: &PlanReport) {
    for step in &report.steps {
        let icon = match step.state {
            StepState::Completed => "✓".green(),
            StepState::Skipped => "-".yellow(),
            StepState::Aborted | StepState::Failed => "✗".red(),
            _ => "…".normal(),
        };
        let reversible = if step.state == StepState::Completed && !step.reversible {
            " (non-reversible)".yellow().to_string()
        } else {
            String::new()
        };
        eprintln!(
            "{} {}. {} [{}]{}",
            icon,
            step.step.index + 1,
            step.description,
            step.state,
            reversible
        );
        if let Some(result) = &step.result {
            let output = result.output.trim_end();
            if !output.is_empty() && result.status != ExecutionStatus::Aborted {
                println!("{}", output);
            }
        }
        if let Some(error) = &step.error {
            eprintln!("   {}", error.red());
        }
    }

    if let Some(rollback) = &report.rollback {
        eprintln!("{} {} step(s) rolled back", "↶".yellow(), rollback.undone.len());
        if let Some(error) = &rollback.error {
            eprintln!("   {} {}", "rollback incomplete:".red().bold(), error);
        }
    }
    if report.state == PlanState::AwaitingConfirmation {
        eprintln!(
            "{} plan suspended awaiting confirmation; completed steps stay on the undo stack",
            "…".yellow()
        );
    }
}

fn print_undo_stack(session: &Session) {
    let records = session.undo_records();
    if records.is_empty() {
        eprintln!("nothing to undo in session '{}'", session.name());
        return;
    }
    for record in records.iter().rev() {
        println!(
            "{}  {}  {}",
            record.step_id.to_string().dimmed(),
            record.description,
            record.inverse_action.describe().dimmed()
        );
    }
}
