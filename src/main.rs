use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use agentloop::config::{Config, StoreBackend};
use agentloop::driver::{LoopDriver, ManualInvoker, TickOutcome, TickReport};
use agentloop::monitor::{CompleteAck, StartAck};
use agentloop::rerun::QualitySignals;
use agentloop::selector::Selection;
use agentloop::store::{ExecutionStatus, MemoryStore, ProjectState, StateStore, TaskStore, WorkerStatus, now_ms};

mod cli;

use cli::Cli;
use cli::commands::Commands;

fn setup_logging() -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("agentloop")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("agentloop.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

fn open_store(cli: &Cli, config: &Config) -> Result<Arc<dyn StateStore>> {
    if config.storage.backend == StoreBackend::Memory {
        info!("Using in-memory store; state will not persist");
        return Ok(Arc::new(MemoryStore::new()));
    }

    let store = match cli.store_dir.as_ref().or(config.storage.dir.as_ref()) {
        Some(dir) => TaskStore::open_at(dir).context(format!("Failed to open store at {}", dir.display()))?,
        None => {
            let cwd = std::env::current_dir().context("Failed to get current directory")?;
            TaskStore::open(&cwd).context("Failed to open workspace store")?
        }
    };
    info!("Using store at {}", store.base_dir().display());
    Ok(Arc::new(store))
}

fn read_json(path: &Path) -> Result<serde_json::Value> {
    let content = fs::read_to_string(path).context(format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).context(format!("Failed to parse JSON in {}", path.display()))
}

fn load_signals(path: Option<&PathBuf>) -> Result<QualitySignals> {
    match path {
        Some(path) => {
            let content = fs::read_to_string(path).context(format!("Failed to read {}", path.display()))?;
            Ok(QualitySignals::from_json_str(&content))
        }
        None => Ok(QualitySignals::none()),
    }
}

fn run_application(cli: &Cli, config: &Config) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    let store = open_store(cli, config)?;
    let driver = LoopDriver::from_config(config, store.clone(), Arc::new(ManualInvoker))?;

    match &cli.command {
        Commands::Select { project } => handle_select_command(&driver, project),
        Commands::Start { project, agent } => handle_start_command(&driver, project, agent),
        Commands::Complete {
            project,
            agent,
            status,
            result,
            signals,
        } => handle_complete_command(&driver, project, agent, status, result.as_deref(), signals.as_ref()),
        Commands::Check { project } => handle_check_command(&driver, project),
        Commands::Reset { project, agent } => handle_reset_command(&driver, project, agent.as_deref()),
        Commands::Grade { project } => handle_grade_command(&driver, project),
        Commands::Tick { project, signals } => handle_tick_command(&driver, project, signals.as_ref()),
        Commands::Show { project, json } => handle_show_command(&driver, project, *json, cli.is_verbose()),
        Commands::Projects => handle_projects_command(store.as_ref()),
    }
}

fn handle_select_command(driver: &LoopDriver, project: &str) -> Result<()> {
    match driver.select_next(project)? {
        Selection::Agent { agent_id, reason } => {
            println!("{} {} ({:?})", "Next:".green(), agent_id.bold(), reason);
        }
        selection @ Selection::Blocked { .. } => {
            println!(
                "{} {}",
                "Blocked:".yellow(),
                selection.blocked_reason().unwrap_or_default()
            );
        }
        Selection::Terminal => println!("{}", "Terminal: nothing left to run".cyan()),
    }
    Ok(())
}

fn handle_start_command(driver: &LoopDriver, project: &str, agent: &str) -> Result<()> {
    match driver.start(project, agent)? {
        StartAck::Started { loop_iteration, .. } => {
            println!("{} {} (loop {})", "Started:".green(), agent, loop_iteration);
        }
        StartAck::AlreadyRunning { since, .. } => {
            println!(
                "{} {} has been running for {}s",
                "Already running:".yellow(),
                agent,
                (now_ms() - since) / 1000
            );
        }
    }
    Ok(())
}

fn handle_complete_command(
    driver: &LoopDriver,
    project: &str,
    agent: &str,
    status: &str,
    result: Option<&Path>,
    signals: Option<&PathBuf>,
) -> Result<()> {
    if let Some(path) = result {
        let raw = read_json(path)?;
        let signals = load_signals(signals)?;
        let report = driver.complete_with_result(project, agent, &raw, &signals)?;
        print_report(&report);
        return Ok(());
    }

    match driver.complete(project, agent, WorkerStatus::parse_lenient(status))? {
        CompleteAck::Completed { duration_ms, .. } => {
            println!("{} {} in {}ms", "Completed:".green(), agent, duration_ms);
        }
        CompleteAck::NotRunning => {
            println!("{} {} was not running", "Ignored:".yellow(), agent);
        }
    }
    Ok(())
}

fn handle_check_command(driver: &LoopDriver, project: &str) -> Result<()> {
    let frozen = driver.check_frozen(project)?;
    if frozen.is_empty() {
        println!("{}", "No frozen agents".green());
    }
    for report in frozen {
        println!(
            "{} {} running {}s (timeout {}s, loop {})",
            "Frozen:".red(),
            report.agent_id.bold(),
            report.duration_ms / 1000,
            report.timeout_seconds,
            report.loop_iteration
        );
    }
    Ok(())
}

fn handle_reset_command(driver: &LoopDriver, project: &str, agent: Option<&str>) -> Result<()> {
    let count = driver.reset(project, agent)?;
    println!("{} {} run(s)", "Reset:".cyan(), count);
    Ok(())
}

fn handle_grade_command(driver: &LoopDriver, project: &str) -> Result<()> {
    let grade = driver.grade(project)?;
    let score = format!("{:.2}", grade.score);
    if grade.weak {
        println!("{} {}", "Weak:".red(), score.red());
    } else {
        println!("{} {}", "Score:".green(), score.green());
    }
    for issue in &grade.issues {
        println!("  - {}", issue);
    }
    Ok(())
}

fn handle_tick_command(driver: &LoopDriver, project: &str, signals: Option<&PathBuf>) -> Result<()> {
    let signals = load_signals(signals)?;
    let report = driver.tick(project, &signals)?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &TickReport) {
    let line = match &report.outcome {
        TickOutcome::Terminal => "Terminal: nothing left to run".cyan(),
        TickOutcome::Blocked { agent_id, missing } => {
            format!("Blocked: {} is waiting on {}", agent_id, missing).yellow()
        }
        TickOutcome::Busy { agent_id } => format!("Busy: {} is still running; reset it to retry", agent_id).yellow(),
        TickOutcome::AwaitingCompletion { agent_id } => format!("Dispatched: waiting on {}", agent_id).cyan(),
        TickOutcome::Frozen {
            agent_id,
            duration_ms,
            timeout_seconds,
        } => format!(
            "Frozen: {} running {}s (timeout {}s)",
            agent_id,
            duration_ms / 1000,
            timeout_seconds
        )
        .red(),
        TickOutcome::WorkerBlocked { agent_id } => format!("Worker blocked: {}", agent_id).yellow(),
        TickOutcome::Cancelled { agent_id } => format!("Cancelled: {} was reset", agent_id).yellow(),
        TickOutcome::NotAwaiting { agent_id } => format!("Ignored: not waiting on {}", agent_id).yellow(),
        TickOutcome::Proceeded {
            agent_id,
            loop_count,
            score,
            capped,
        } => {
            let score = score.map(|s| format!("{:.2}", s)).unwrap_or_else(|| "-".to_string());
            let mut line = format!("Proceeded: {} (score {}, loop {})", agent_id, score, loop_count);
            if *capped {
                line.push_str(" [rerun cap reached]");
            }
            line.green()
        }
    };
    println!("{}", line);
    println!("  phase: {}, reruns: {}", report.phase, report.reruns);
}

fn handle_show_command(driver: &LoopDriver, project: &str, json: bool, verbose: bool) -> Result<()> {
    let state = driver.state(project)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&state).context("Failed to serialize state")?);
        return Ok(());
    }
    print_state(&state, verbose);
    Ok(())
}

fn print_state(state: &ProjectState, verbose: bool) {
    println!("{} {}", "Project:".green(), state.project_id.bold());
    println!("  loop:      {}", state.loop_count);
    println!("  phase:     {}", state.driver.phase);
    if let Some(agent) = &state.driver.active_agent {
        println!("  active:    {}", agent);
    }
    println!("  completed: {}", state.completed_steps.join(" -> "));
    if let Some(next) = &state.next_recommended_step {
        println!("  next:      {}", next);
    }
    if let Some(score) = state.latest_score() {
        println!("  score:     {:.2}", score.score);
    }
    println!("  files:     {}", state.files_created.len());
    println!("  weak:      {}", state.weak_reflections.len());

    for (agent, records) in &state.execution_log {
        if let Some(latest) = records.last() {
            let status = match latest.status {
                ExecutionStatus::Running => latest.status.as_str().yellow(),
                ExecutionStatus::Completed => latest.status.as_str().green(),
                ExecutionStatus::Frozen => latest.status.as_str().red(),
                ExecutionStatus::NotStarted => latest.status.as_str().normal(),
            };
            println!("  {:<12} {} ({} record(s))", agent, status, records.len());
        }
    }

    for alert in &state.frozen_agents {
        println!(
            "  {} {} ran {}s past start (timeout {}s)",
            "frozen:".red(),
            alert.agent_id,
            alert.duration_ms / 1000,
            alert.timeout_seconds
        );
    }

    let feedback: Vec<_> = if verbose {
        state.feedback_log.iter().collect()
    } else {
        state.feedback_log.iter().rev().take(5).rev().collect()
    };
    for entry in feedback {
        println!(
            "  [{}] {}{}",
            entry.kind,
            entry.agent_id.as_deref().map(|a| format!("{}: ", a)).unwrap_or_default(),
            entry.message
        );
    }
}

fn handle_projects_command(store: &dyn StateStore) -> Result<()> {
    let projects = store.list_projects()?;
    if projects.is_empty() {
        println!("{}", "No projects".yellow());
    }
    for project in projects {
        match store.read(&project) {
            Ok(state) => println!("{:<24} loop {:<4} {}", project, state.loop_count, state.driver.phase),
            Err(e) => println!("{:<24} {}", project, e.to_string().red()),
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    // Setup logging first
    setup_logging().context("Failed to setup logging")?;

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    info!("Starting with config from: {:?}", cli.config);

    // Run the main application logic
    run_application(&cli, &config).context("Application failed")?;

    Ok(())
}
