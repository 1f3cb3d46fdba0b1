//! # labflow-cli
//!
//! Binary entry point for labflow.
//!
//! This crate provides:
//! - CLI argument parsing using `clap`
//! - Run directories (`<out_dir>/<experiment>/run_<n>/`)
//! - The interactive terminal resolver and the `step.terminal` part type
//! - Offline audit of traces via `labflow retrace` and `labflow events`

mod run_dir;
mod terminal;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use labflow_core::{
    CancelToken, DeferResolver, Experiment, ExperimentConfig, ExperimentManager, PartRegistry,
    RecordedResolver, Replay, ReplayCursor, RunOutcome, TerminationReason, TraceLog,
    TraceRecorder, TraceTail,
};
use labflow_proto::{EventKind, ManualResolution, PartId, Resolution, Resolver, TraceEvent};
use run_dir::RunDir;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufWriter, IsTerminal, stdout};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use terminal::{Console, TerminalResolver, TerminalStep};
use tracing::{debug, info, warn};

/// How often `events --follow` polls the trace.
const FOLLOW_INTERVAL: Duration = Duration::from_millis(500);

/// Color output mode for terminal display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ColorMode {
    /// Automatically detect if stdout is a TTY
    #[default]
    Auto,
    /// Always use colors
    Always,
    /// Never use colors
    Never,
}

impl ColorMode {
    /// Returns true if colors should be used based on mode and terminal detection.
    fn should_use_colors(self) -> bool {
        match self {
            ColorMode::Always => true,
            ColorMode::Never => false,
            ColorMode::Auto => stdout().is_terminal(),
        }
    }
}

/// Output format for `events` and `retrace`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format for programmatic access
    Json,
}

/// ANSI color codes for terminal output.
mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BOLD: &str = "\x1b[1m";
    pub const DIM: &str = "\x1b[2m";
    pub const GREEN: &str = "\x1b[32m";
    pub const YELLOW: &str = "\x1b[33m";
    pub const RED: &str = "\x1b[31m";
    pub const CYAN: &str = "\x1b[36m";
    pub const BLUE: &str = "\x1b[34m";
    pub const MAGENTA: &str = "\x1b[35m";
}

/// labflow - reproducible experiment orchestration
#[derive(Parser, Debug)]
#[command(name = "labflow", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Color output mode (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorMode::Auto, global = true)]
    color: ColorMode,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a new run of an experiment
    Run(RunArgs),

    /// Continue a suspended or interrupted run from its trace
    Resume(ResumeArgs),

    /// Reconstruct a run from its trace without executing anything
    Retrace(RetraceArgs),

    /// Re-execute an experiment, answering decisions from an earlier trace
    Rerun(RerunArgs),

    /// View the events of a trace
    Events(EventsArgs),
}

/// Arguments for the run subcommand.
#[derive(Parser, Debug)]
struct RunArgs {
    /// Experiment configuration (YAML)
    config: PathBuf,

    /// Root directory for run directories (overrides `experiment.out_dir`)
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Never prompt; suspend whenever a decision is needed
    #[arg(long)]
    no_prompt: bool,
}

/// Arguments for the resume subcommand.
#[derive(Parser, Debug)]
struct ResumeArgs {
    /// Experiment configuration (YAML)
    config: PathBuf,

    /// Trace of the run to continue
    trace: PathBuf,

    /// Never prompt; suspend whenever a decision is needed
    #[arg(long)]
    no_prompt: bool,
}

/// Arguments for the retrace subcommand.
#[derive(Parser, Debug)]
struct RetraceArgs {
    /// Experiment configuration (YAML)
    config: PathBuf,

    /// Trace to reconstruct
    trace: PathBuf,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,
}

/// Arguments for the rerun subcommand.
#[derive(Parser, Debug)]
struct RerunArgs {
    /// Experiment configuration (YAML)
    config: PathBuf,

    /// Trace whose recorded decisions are replayed
    old_trace: PathBuf,

    /// Root directory for run directories (overrides `experiment.out_dir`)
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Never prompt once the recorded decisions run out
    #[arg(long)]
    no_prompt: bool,
}

/// Arguments for the events subcommand.
#[derive(Parser, Debug)]
struct EventsArgs {
    /// Trace file to read
    trace: PathBuf,

    /// Show only the last N events
    #[arg(long)]
    last: Option<usize>,

    /// Filter by part (the part and everything nested in it, e.g. "fan")
    #[arg(long)]
    part: Option<String>,

    /// Filter by event kind (e.g. "data_written")
    #[arg(long)]
    kind: Option<String>,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    /// Keep reading as the run appends events
    #[arg(long)]
    follow: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run(args) => run_command(cli.color, args).await,
        Commands::Resume(args) => resume_command(cli.color, args).await,
        Commands::Retrace(args) => retrace_command(cli.color, args),
        Commands::Rerun(args) => rerun_command(cli.color, args).await,
        Commands::Events(args) => events_command(cli.color, args).await,
    }
}

/// Loads and builds an experiment, with `step.terminal` bound to `console`.
fn load_experiment(path: &Path, console: &Console) -> Result<(ExperimentConfig, Arc<Experiment>)> {
    let config = ExperimentConfig::from_file(path)
        .with_context(|| format!("Failed to load experiment from {:?}", path))?;
    let mut registry = PartRegistry::with_builtins();
    TerminalStep::register(&mut registry, console.clone());
    let experiment = Experiment::from_config(&config, &registry)
        .with_context(|| format!("Invalid experiment configuration in {:?}", path))?;
    Ok((config, Arc::new(experiment)))
}

fn resolver_for(console: &Console, no_prompt: bool) -> Box<dyn Resolver + Send> {
    if no_prompt {
        Box::new(DeferResolver)
    } else {
        Box::new(TerminalResolver::new(console.clone()))
    }
}

async fn run_command(color_mode: ColorMode, args: RunArgs) -> Result<()> {
    let console = Console::stdio();
    let (config, experiment) = load_experiment(&args.config, &console)?;
    let resolver = resolver_for(&console, args.no_prompt);

    let out_dir = args.out_dir.unwrap_or_else(|| config.experiment.out_dir.clone());
    let (outcome, _) = start_run(&args.config, &out_dir, experiment, resolver, color_mode).await?;
    exit_with(&outcome)
}

async fn resume_command(color_mode: ColorMode, args: ResumeArgs) -> Result<()> {
    let console = Console::stdio();
    let (_, experiment) = load_experiment(&args.config, &console)?;

    let log = TraceLog::from_file(&args.trace)
        .with_context(|| format!("Failed to read trace {:?}", args.trace))?;
    let replay = Replay::from_log(&log, experiment.initial_store());
    warn_unknown_parts(&replay, &experiment);

    if let ReplayCursor::Finished(reason) = replay.cursor() {
        info!(reason = reason.as_str(), "Run already finished; nothing to resume");
    }

    let recorder = TraceRecorder::append(&args.trace, log.next_sequence())
        .with_context(|| format!("Failed to open trace {:?} for appending", args.trace))?;
    let manager = ExperimentManager::resuming(
        Arc::clone(&experiment),
        replay,
        recorder,
        resolver_for(&console, args.no_prompt),
    );

    let outcome = execute(manager, &args.config, &args.trace, color_mode).await?;
    exit_with(&outcome)
}

async fn rerun_command(color_mode: ColorMode, args: RerunArgs) -> Result<()> {
    let console = Console::stdio();
    let (config, experiment) = load_experiment(&args.config, &console)?;

    let old_log = TraceLog::from_file(&args.old_trace)
        .with_context(|| format!("Failed to read trace {:?}", args.old_trace))?;
    let resolver = RecordedResolver::from_log(&old_log, resolver_for(&console, args.no_prompt));
    info!(
        recorded = resolver.remaining(),
        trace = %args.old_trace.display(),
        "Re-running with recorded decisions"
    );

    let out_dir = args.out_dir.unwrap_or_else(|| config.experiment.out_dir.clone());
    let (outcome, trace) = start_run(
        &args.config,
        &out_dir,
        Arc::clone(&experiment),
        Box::new(resolver),
        color_mode,
    )
    .await?;

    let new_log =
        TraceLog::from_file(&trace).with_context(|| format!("Failed to read trace {:?}", trace))?;
    let old = Replay::from_log(&old_log, experiment.initial_store());
    let new = Replay::from_log(&new_log, experiment.initial_store());
    print_divergence(new.divergence(&old), color_mode.should_use_colors());

    exit_with(&outcome)
}

/// Creates a run directory and runs the experiment from its start.
async fn start_run(
    config_path: &Path,
    out_dir: &Path,
    experiment: Arc<Experiment>,
    resolver: Box<dyn Resolver + Send>,
    color_mode: ColorMode,
) -> Result<(RunOutcome, PathBuf)> {
    let run = RunDir::create(out_dir, experiment.name(), config_path)
        .context("Failed to prepare run directory")?;
    let trace = run.trace_path();
    info!(run = run.index(), path = %run.path().display(), "Starting run");

    let recorder = TraceRecorder::create(&trace)
        .with_context(|| format!("Failed to create trace {:?}", trace))?;
    let manager = ExperimentManager::new(experiment, recorder, resolver);

    let outcome = execute(manager, &run.config_path(), &trace, color_mode).await?;
    Ok((outcome, trace))
}

/// Drives `manager` on a blocking thread until it stops, then prints a summary.
async fn execute(
    mut manager: ExperimentManager<BufWriter<File>>,
    config_path: &Path,
    trace: &Path,
    color_mode: ColorMode,
) -> Result<RunOutcome> {
    let use_colors = color_mode.should_use_colors();
    let cancel = manager.cancel_token();
    install_signal_handlers(&cancel);
    manager.recorder_mut().add_observer(progress_observer(use_colors));

    let started = Instant::now();
    let (manager, result) = tokio::task::spawn_blocking(move || {
        let result = manager.run();
        (manager, result)
    })
    .await
    .context("Run thread panicked")?;
    let outcome = result.context("Run aborted")?;

    print_summary(
        &outcome,
        &RunSummary {
            experiment: manager.experiment().name(),
            config: config_path,
            trace,
            events: manager.recorder().next_sequence(),
            elapsed: started.elapsed(),
        },
        use_colors,
    );
    Ok(outcome)
}

fn exit_with(outcome: &RunOutcome) -> Result<()> {
    let code = outcome.exit_code();
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

/// SIGINT, SIGTERM and SIGHUP stop the run at the next part boundary.
/// A second SIGINT exits at once.
fn install_signal_handlers(cancel: &CancelToken) {
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received (SIGINT), stopping at the next part boundary...");
            token.cancel();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Second interrupt received, exiting");
            std::process::exit(RunOutcome::Interrupted.exit_code());
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        for (kind, name) in [
            (SignalKind::terminate(), "SIGTERM"),
            (SignalKind::hangup(), "SIGHUP"),
        ] {
            match signal(kind) {
                Ok(mut stream) => {
                    let token = cancel.clone();
                    tokio::spawn(async move {
                        if stream.recv().await.is_some() {
                            warn!(signal = name, "Signal received, stopping at the next part boundary...");
                            token.cancel();
                        }
                    });
                }
                Err(e) => warn!(signal = name, error = %e, "Could not install signal handler"),
            }
        }
    }
}

/// Prints one line per started part, decision, failure and resolution.
fn progress_observer(use_colors: bool) -> impl Fn(&TraceEvent) + Send + 'static {
    use colors::*;

    move |event| {
        let line = match &event.kind {
            EventKind::PartStarted { variant, .. } => {
                format!("▶ {} {DIM}({}){RESET}", event.part_id, variant.as_str())
            }
            EventKind::DecisionTaken { route, target } => {
                let target = target.as_ref().map_or("(unresolved)", PartId::as_str);
                format!("◆ {} chose {CYAN}{route}{RESET} → {target}", event.part_id)
            }
            EventKind::ErrorRaised { kind, message } => {
                format!("{RED}✗{RESET} {} {RED}[{kind}]{RESET} {message}", event.part_id)
            }
            EventKind::ManualResolution(ManualResolution::Resolved { choice }) => {
                format!("{GREEN}✓{RESET} {} resolved: {}", event.part_id, describe_choice(choice))
            }
            _ => return,
        };
        let seq = event.sequence_no;
        if use_colors {
            println!("{DIM}[{seq:>4}]{RESET} {line}");
        } else {
            println!("[{seq:>4}] {}", strip_colors(&line));
        }
    }
}

fn strip_colors(text: &str) -> String {
    use colors::*;

    let mut plain = text.to_string();
    for code in [RESET, BOLD, DIM, GREEN, YELLOW, RED, CYAN, BLUE, MAGENTA] {
        plain = plain.replace(code, "");
    }
    plain
}

fn describe_choice(choice: &Resolution) -> String {
    match choice {
        Resolution::Part { part_id } => format!("go to {part_id}"),
        Resolution::LeaveFlow => "leave flow".to_string(),
        Resolution::EndExperiment => "end experiment".to_string(),
    }
}

struct RunSummary<'a> {
    experiment: &'a str,
    config: &'a Path,
    trace: &'a Path,
    events: u64,
    elapsed: Duration,
}

fn print_summary(outcome: &RunOutcome, summary: &RunSummary<'_>, use_colors: bool) {
    use colors::*;

    let (color, icon, label) = match outcome {
        RunOutcome::Terminal(TerminationReason::Completed) => (GREEN, "✓", "Experiment completed"),
        RunOutcome::Terminal(TerminationReason::LeftTopLevel) => {
            (GREEN, "✓", "Experiment left its top level")
        }
        RunOutcome::Terminal(TerminationReason::EndedByResearcher) => {
            (CYAN, "■", "Ended by researcher")
        }
        RunOutcome::Suspended(_) => (YELLOW, "⏸", "Suspended awaiting a decision"),
        RunOutcome::Interrupted => (YELLOW, "⚡", "Interrupted by signal"),
    };

    let mut rows = vec![
        ("Experiment:", summary.experiment.to_string()),
        ("Events:", summary.events.to_string()),
        ("Elapsed:", format!("{:.1}s", summary.elapsed.as_secs_f64())),
        ("Trace:", summary.trace.display().to_string()),
    ];
    if let RunOutcome::Suspended(request) = outcome {
        rows.push(("Part:", request.part_id.to_string()));
        rows.push(("Reason:", format!("[{}] {}", request.kind, request.failure_reason)));
    }
    if !outcome.is_terminal() {
        rows.push((
            "Resume:",
            format!(
                "labflow resume {} {}",
                summary.config.display(),
                summary.trace.display()
            ),
        ));
    }

    let separator = "─".repeat(58);

    if use_colors {
        println!("\n{BOLD}┌{separator}┐{RESET}");
        println!("{BOLD}│{RESET} {color}{BOLD}{icon}{RESET} Run stopped: {color}{label}{RESET}");
        println!("{BOLD}├{separator}┤{RESET}");
        for (name, value) in &rows {
            println!("{BOLD}│{RESET}   {name:<12} {CYAN}{value}{RESET}");
        }
        println!("{BOLD}└{separator}┘{RESET}");
    } else {
        println!("\n+{}+", "-".repeat(58));
        println!("| {icon} Run stopped: {label}");
        println!("+{}+", "-".repeat(58));
        for (name, value) in &rows {
            println!("|   {name:<12} {value}");
        }
        println!("+{}+", "-".repeat(58));
    }
}

fn print_divergence(divergence: Option<(usize, Option<PartId>, Option<PartId>)>, use_colors: bool) {
    use colors::*;

    let describe = |part: &Option<PartId>| {
        part.as_ref()
            .map_or_else(|| "nothing".to_string(), |p| format!("'{p}'"))
    };
    match divergence {
        None => {
            if use_colors {
                println!("{GREEN}✓{RESET} Same path as the earlier run");
            } else {
                println!("Same path as the earlier run");
            }
        }
        Some((index, new, old)) => {
            let message = format!(
                "Paths diverge at part #{}: this run started {}, the earlier run started {}",
                index + 1,
                describe(&new),
                describe(&old)
            );
            if use_colors {
                println!("{YELLOW}⚠{RESET} {message}");
            } else {
                println!("{message}");
            }
        }
    }
}

fn warn_unknown_parts(replay: &Replay, experiment: &Experiment) {
    let unknown: BTreeSet<&PartId> = replay
        .started_parts()
        .filter(|part| !experiment.contains(part))
        .collect();
    for part in unknown {
        warn!(part = %part, "Trace refers to a part the configuration does not define");
    }
}

fn retrace_command(color_mode: ColorMode, args: RetraceArgs) -> Result<()> {
    let use_colors = color_mode.should_use_colors();
    let (_, experiment) = load_experiment(&args.config, &Console::stdio())?;
    let log = TraceLog::from_file(&args.trace)
        .with_context(|| format!("Failed to read trace {:?}", args.trace))?;
    let replay = Replay::from_log(&log, experiment.initial_store());
    warn_unknown_parts(&replay, &experiment);
    let unknown: BTreeSet<String> = replay
        .started_parts()
        .filter(|part| !experiment.contains(part))
        .map(ToString::to_string)
        .collect();

    match args.format {
        OutputFormat::Json => {
            let json = serde_json::json!({
                "experiment": experiment.name(),
                "events": log.len(),
                "malformed_lines": log.malformed().len(),
                "counts": log.counts_by_kind(),
                "path": replay.path().iter().map(ToString::to_string).collect::<Vec<_>>(),
                "status": describe_cursor(replay.cursor()),
                "finished": replay.is_finished(),
                "open_flows": replay.frames().iter().map(PartId::as_str).collect::<Vec<_>>(),
                "discarded_writes": replay.discarded_writes(),
                "unknown_parts": unknown,
                "store": replay.store().to_json(),
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Table => print_retrace(&log, &replay, &unknown, use_colors),
    }
    Ok(())
}

fn print_retrace(log: &TraceLog, replay: &Replay, unknown: &BTreeSet<String>, use_colors: bool) {
    use colors::*;

    let heading = |text: &str| {
        if use_colors {
            println!("\n{BOLD}{text}{RESET}");
        } else {
            println!("\n{text}");
        }
    };

    heading("Path");
    if replay.path().is_empty() {
        println!("  (nothing recorded)");
    }
    for (i, entry) in replay.path().iter().enumerate() {
        if use_colors {
            println!("{DIM}{:>4}{RESET}  {entry}", i + 1);
        } else {
            println!("{:>4}  {entry}", i + 1);
        }
    }

    heading("Status");
    println!("  {}", describe_cursor(replay.cursor()));
    if !replay.frames().is_empty() {
        let open: Vec<_> = replay.frames().iter().map(PartId::as_str).collect();
        println!("  Open flows: {}", open.join(" > "));
    }
    if replay.discarded_writes() > 0 {
        println!(
            "  {} write(s) from an unmerged parallel flow were discarded",
            replay.discarded_writes()
        );
    }
    if !log.malformed().is_empty() {
        println!("  {} malformed line(s) skipped", log.malformed().len());
    }
    for part in unknown {
        if use_colors {
            println!("  {YELLOW}⚠{RESET} '{part}' is not defined in the configuration");
        } else {
            println!("  '{part}' is not defined in the configuration");
        }
    }

    heading("Events");
    for (kind, count) in log.counts_by_kind() {
        println!("  {kind:<18} {count}");
    }

    heading("Data store");
    let store = replay.store();
    if store.is_empty() {
        println!("  (empty)");
    }
    for key in store.keys() {
        if let Some(value) = store.get(key) {
            if use_colors {
                println!("  {CYAN}{key}{RESET} = {value}");
            } else {
                println!("  {key} = {value}");
            }
        }
    }
}

fn describe_cursor(cursor: &ReplayCursor) -> String {
    match cursor {
        ReplayCursor::Fresh => "not started".to_string(),
        ReplayCursor::At(part) => format!("in progress; next part is '{part}'"),
        ReplayCursor::Leave => "in progress; leaving the innermost open flow".to_string(),
        ReplayCursor::Unresolved(part) => {
            format!("in progress; the successor of '{part}' did not resolve")
        }
        ReplayCursor::Failed {
            part,
            kind,
            message,
        } => format!("'{part}' failed [{kind}]: {message}"),
        ReplayCursor::Pending(request) => format!(
            "suspended; '{}' awaits a decision [{}]: {}",
            request.part_id, request.kind, request.failure_reason
        ),
        ReplayCursor::Finished(reason) => format!("finished ({})", reason.as_str()),
    }
}

/// Event filters shared by the one-shot and follow modes.
struct EventFilter<'a> {
    part: Option<PartId>,
    kind: Option<&'a str>,
}

impl EventFilter<'_> {
    fn matches(&self, event: &TraceEvent) -> bool {
        let part_ok = self
            .part
            .as_ref()
            .is_none_or(|p| event.part_id == *p || event.part_id.is_within(p));
        let kind_ok = self.kind.is_none_or(|k| event.kind_name() == k);
        part_ok && kind_ok
    }
}

async fn events_command(color_mode: ColorMode, args: EventsArgs) -> Result<()> {
    use colors::*;

    let use_colors = color_mode.should_use_colors();
    if let Some(kind) = &args.kind
        && !EventKind::NAMES.contains(&kind.as_str())
    {
        bail!(
            "Unknown event kind '{kind}' (expected one of: {})",
            EventKind::NAMES.join(", ")
        );
    }
    let filter = EventFilter {
        part: args.part.as_deref().map(PartId::new),
        kind: args.kind.as_deref(),
    };

    if !args.follow && !args.trace.exists() {
        if use_colors {
            println!("{DIM}No trace found at {}.{RESET}", args.trace.display());
        } else {
            println!("No trace found at {}.", args.trace.display());
        }
        return Ok(());
    }

    let mut tail = TraceTail::new(&args.trace);
    let batch = tail
        .read_new()
        .with_context(|| format!("Failed to read trace {:?}", args.trace))?;
    let mut events: Vec<TraceEvent> = batch.events.into_iter().filter(|e| filter.matches(e)).collect();

    // Apply 'last' after the other filters (last N of the filtered results)
    if let Some(n) = args.last
        && events.len() > n
    {
        events.drain(..events.len() - n);
    }

    if !args.follow {
        if events.is_empty() {
            if use_colors {
                println!("{DIM}No matching events found.{RESET}");
            } else {
                println!("No matching events found.");
            }
            return Ok(());
        }
        match args.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&events)?),
            OutputFormat::Table => {
                print_events_header(use_colors);
                for event in &events {
                    print_event_row(event, use_colors);
                }
                if use_colors {
                    println!("\n{DIM}Total: {} events{RESET}", events.len());
                } else {
                    println!("\nTotal: {} events", events.len());
                }
            }
        }
        return Ok(());
    }

    // Follow mode: one JSON object per line, or table rows as they arrive
    let print = |event: &TraceEvent| -> Result<()> {
        match args.format {
            OutputFormat::Json => println!("{}", serde_json::to_string(event)?),
            OutputFormat::Table => print_event_row(event, use_colors),
        }
        Ok(())
    };
    if args.format == OutputFormat::Table {
        print_events_header(use_colors);
    }
    for event in &events {
        print(event)?;
    }

    debug!(path = %args.trace.display(), "Following trace");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            () = tokio::time::sleep(FOLLOW_INTERVAL) => {
                let batch = tail
                    .read_new()
                    .with_context(|| format!("Failed to read trace {:?}", args.trace))?;
                for event in batch.events.iter().filter(|e| filter.matches(e)) {
                    print(event)?;
                }
            }
        }
    }
    Ok(())
}

fn print_events_header(use_colors: bool) {
    use colors::*;

    if use_colors {
        println!(
            "{BOLD}{DIM}   # │ Time     │ Part                 │ Kind              │ Details{RESET}"
        );
        println!(
            "{DIM}─────┼──────────┼──────────────────────┼───────────────────┼─────────────────────────{RESET}"
        );
    } else {
        println!("   # | Time     | Part                 | Kind              | Details");
        println!(
            "-----|----------|----------------------|-------------------|-------------------------"
        );
    }
}

fn print_event_row(event: &TraceEvent, use_colors: bool) {
    use colors::*;

    let time = chrono::DateTime::parse_from_rfc3339(&event.timestamp)
        .map_or_else(|_| "-".to_string(), |t| t.format("%H:%M:%S").to_string());
    let details = truncate(&describe_event(&event.kind), 60);
    let part = truncate(event.part_id.as_str(), 20);
    let kind = event.kind_name();

    if use_colors {
        let kind_color = kind_color(&event.kind);
        println!(
            "{DIM}{:>4}{RESET} │ {time:<8} │ {part:<20} │ {kind_color}{kind:<17}{RESET} │ {DIM}{details}{RESET}",
            event.sequence_no
        );
    } else {
        println!(
            "{:>4} | {time:<8} | {part:<20} | {kind:<17} | {details}",
            event.sequence_no
        );
    }
}

fn kind_color(kind: &EventKind) -> &'static str {
    use colors::*;
    match kind {
        EventKind::PartStarted { .. } => BLUE,
        EventKind::PartCompleted { .. } => GREEN,
        EventKind::DataWritten { .. } => CYAN,
        EventKind::DecisionTaken { .. } => MAGENTA,
        EventKind::ErrorRaised { .. } => RED,
        EventKind::ManualResolution(_) => YELLOW,
    }
}

fn describe_event(kind: &EventKind) -> String {
    match kind {
        EventKind::PartStarted {
            variant,
            type_name,
            policy,
        } => match policy {
            Some(policy) => format!("{} {type_name} ({})", variant.as_str(), policy.as_str()),
            None => format!("{} {type_name}", variant.as_str()),
        },
        EventKind::PartCompleted { next } => match next {
            Some(next) => format!("next: {next}"),
            None => "next: (unresolved)".to_string(),
        },
        EventKind::DataWritten { key, value } => format!("{key} = {value}"),
        EventKind::DecisionTaken { route, target } => match target {
            Some(target) => format!("{route} -> {target}"),
            None => format!("{route} -> (unresolved)"),
        },
        EventKind::ErrorRaised { kind, message } => format!("[{kind}] {message}"),
        EventKind::ManualResolution(ManualResolution::Pending { kind, reason, .. }) => {
            format!("pending [{kind}] {reason}")
        }
        EventKind::ManualResolution(ManualResolution::Resolved { choice }) => {
            format!("resolved: {}", describe_choice(choice))
        }
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len - 1).collect();
        format!("{kept}…")
    }
}
