//! Converge CLI entrypoint.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use converge::cli::{Cli, Commands, LogFormat, OutputFormatter, StateCommands};
use converge::config::{find_config_file, ConfigParser, ConfigValidator, StackSpec};
use converge::error::Result;
use converge::graph::GraphBuilder;
use converge::planner::Plan;
use converge::reconciler::{store_from_config, ApplyOptions, ApplyReport, ReconcileContext};
use converge::state::STATE_DIR;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_format);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

/// Initializes the logging system. `RUST_LOG` wins over `--verbose`.
fn init_logging(verbose: bool, format: LogFormat) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);
    let spec_path = cli.spec.as_deref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(spec_path, warnings, &formatter),
        Commands::Graph => cmd_graph(spec_path, &formatter),
        Commands::Plan { detailed, target } => cmd_plan(spec_path, detailed, target.as_deref(), &formatter).await,
        Commands::Apply {
            yes,
            target,
            ignore_guardrails,
        } => {
            let options = ApplyOptions {
                target,
                ignore_guardrails,
            };
            cmd_apply(spec_path, yes, &options, &formatter).await
        }
        Commands::Destroy { yes, ignore_guardrails } => {
            let options = ApplyOptions {
                target: None,
                ignore_guardrails,
            };
            cmd_destroy(spec_path, yes, &options, &formatter).await
        }
        Commands::Drift => cmd_drift(spec_path, &formatter).await,
        Commands::State { command } => cmd_state(spec_path, command, &formatter).await,
    }
}

/// Initialize a new project.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing new converge project in: {}", path.display());

    let spec_path = path.join("converge.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && spec_path.exists() {
        eprintln!("Spec file already exists: {}", spec_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&spec_path, include_str!("../templates/converge.yaml"))?;
    eprintln!("Created: {}", spec_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let has_env = existing.lines().any(|l| l.trim() == ".env");
        let has_state = existing.lines().any(|l| l.trim() == state_entry || l.trim() == STATE_DIR);
        if !has_env || !has_state {
            let mut file = std::fs::OpenOptions::new().append(true).open(&gitignore_path)?;
            writeln!(file, "\n# converge")?;
            if !has_env {
                writeln!(file, ".env")?;
            }
            if !has_state {
                writeln!(file, "{state_entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{state_entry}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nProject initialized.");
    eprintln!("Next steps:");
    eprintln!("  1. Copy .env.example to .env and fill in the provider token");
    eprintln!("  2. Replace the placeholder ARNs in converge.yaml");
    eprintln!("  3. Run 'converge validate' to check the spec");
    eprintln!("  4. Run 'converge plan' to see what will change");
    eprintln!("  5. Run 'converge apply' to provision the stack");

    Ok(())
}

/// Validate the spec and its graph.
fn cmd_validate(spec_path: Option<&Path>, show_warnings: bool, formatter: &OutputFormatter) -> Result<()> {
    let (spec, _) = load_spec(spec_path)?;

    let result = ConfigValidator::new().check(&spec);
    println!("{}", formatter.format_validation(&spec, &result, show_warnings));

    ConfigValidator::new().validate(&spec)?;
    GraphBuilder::new().build(&spec)?;
    Ok(())
}

/// Print the dependency levels.
fn cmd_graph(spec_path: Option<&Path>, formatter: &OutputFormatter) -> Result<()> {
    let (spec, _) = load_spec(spec_path)?;
    ConfigValidator::new().validate(&spec)?;
    let graph = GraphBuilder::new().build(&spec)?;
    println!("{}", formatter.format_graph(&graph));
    Ok(())
}

/// Show the change plan.
async fn cmd_plan(
    spec_path: Option<&Path>,
    detailed: bool,
    target: Option<&str>,
    formatter: &OutputFormatter,
) -> Result<()> {
    let ctx = load_context(spec_path).await?;
    let plan = ctx.plan(target).await?;
    println!("{}", formatter.format_plan(&plan, detailed));
    Ok(())
}

/// Apply the change plan.
async fn cmd_apply(
    spec_path: Option<&Path>,
    auto_approve: bool,
    options: &ApplyOptions,
    formatter: &OutputFormatter,
) -> Result<()> {
    let ctx = load_context(spec_path).await?;
    let report = ctx
        .apply(options, |plan| confirm(plan, auto_approve, formatter, "Do you want to apply this plan?"))
        .await?;
    finish(&report, formatter)
}

/// Destroy every tracked resource.
async fn cmd_destroy(
    spec_path: Option<&Path>,
    auto_approve: bool,
    options: &ApplyOptions,
    formatter: &OutputFormatter,
) -> Result<()> {
    let ctx = load_context(spec_path).await?;
    let report = ctx
        .destroy(options, |plan| {
            confirm(plan, auto_approve, formatter, "This will DESTROY every tracked resource. Continue?")
        })
        .await?;
    finish(&report, formatter)
}

/// Check for drift.
async fn cmd_drift(spec_path: Option<&Path>, formatter: &OutputFormatter) -> Result<()> {
    let ctx = load_context(spec_path).await?;
    let report = ctx.check_drift().await?;
    println!("{}", formatter.format_drift(&report));
    Ok(())
}

/// State management commands.
async fn cmd_state(spec_path: Option<&Path>, command: StateCommands, formatter: &OutputFormatter) -> Result<()> {
    let (spec, base_dir) = load_spec(spec_path)?;

    if let StateCommands::Rm { name } = &command {
        let ctx = ReconcileContext::from_spec(spec, &base_dir).await?;
        let removed = ctx.forget(name).await?;
        eprintln!("Removed {} ({}) from state; the provider resource was left in place.", removed.name, removed.physical_id);
        return Ok(());
    }

    let store = store_from_config(&spec.state, &base_dir).await?;
    match command {
        StateCommands::Show => match store.load().await? {
            Some(state) => println!("{}", formatter.format_state(&state)),
            None => eprintln!("No state found."),
        },
        StateCommands::Lock { holder } => {
            let lock = store.acquire_lock(holder.as_deref().unwrap_or("")).await?;
            println!("{}", formatter.format_lock(&lock));
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                match store.get_lock_info().await? {
                    Some(lock) => {
                        warn!("Force-releasing lock {} held by {}", lock.lock_id, lock.holder);
                        store.release_lock(&lock.lock_id).await?;
                        eprintln!("State forcefully unlocked.");
                    }
                    None => eprintln!("State is not locked."),
                }
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                eprintln!("State unlocked.");
            } else {
                eprintln!("Please provide --lock-id or use --force");
            }
        }
        StateCommands::Rm { .. } => {}
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Prints the run outcome and turns action failures into the exit status.
fn finish(report: &ApplyReport, formatter: &OutputFormatter) -> Result<()> {
    println!("{}", formatter.format_apply(report));
    report.failure().map_or(Ok(()), Err)
}

/// Shows the plan and asks for confirmation unless `auto_approve`.
fn confirm(plan: &Plan, auto_approve: bool, formatter: &OutputFormatter, question: &str) -> bool {
    if !formatter.is_json() {
        eprintln!("{}", formatter.format_plan(plan, false));
    }
    if auto_approve {
        return true;
    }

    eprint!("{question} [y/N]: ");
    if std::io::stderr().flush().is_err() {
        return false;
    }

    let mut input = String::new();
    match std::io::stdin().read_line(&mut input) {
        Ok(_) => input.trim().eq_ignore_ascii_case("y"),
        Err(e) => {
            warn!("Failed to read confirmation: {e}");
            false
        }
    }
}

/// Resolves the spec file path.
fn resolve_spec_path(spec_path: Option<&Path>) -> Result<PathBuf> {
    spec_path.map_or_else(|| find_config_file("."), |path| Ok(path.to_path_buf()))
}

/// Loads `.env` and the spec, returning the spec and its directory.
fn load_spec(spec_path: Option<&Path>) -> Result<(StackSpec, PathBuf)> {
    let spec_file = resolve_spec_path(spec_path)?;
    debug!("Loading spec from: {}", spec_file.display());

    let base_dir = spec_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

    let parser = ConfigParser::new().with_base_path(base_dir.clone());
    parser.load_dotenv()?;
    let spec = parser.load_with_env(&spec_file)?;

    Ok((spec, base_dir))
}

/// Builds the reconcile context with Ctrl-C wired to cancellation.
async fn load_context(spec_path: Option<&Path>) -> Result<ReconcileContext> {
    let (spec, base_dir) = load_spec(spec_path)?;
    let ctx = ReconcileContext::from_spec(spec, &base_dir).await?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; finishing in-flight actions");
            on_signal.cancel();
        }
    });

    debug!("{ctx:?}");
    Ok(ctx.with_cancellation(cancel))
}
