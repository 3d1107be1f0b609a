use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use db_infra::config::db::{load_settings, RuntimeEnv, ENVIRONMENT_VAR};
use db_infra::{orchestrate_migration, DbInfraError, MigrationOutcome, MigrationStatus};
use migration::MigrationCommand;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Default, ValueEnum)]
enum Command {
    /// Apply every pending migration
    #[default]
    Up,
    /// List registered migrations and whether they are applied
    Status,
}

impl From<Command> for MigrationCommand {
    fn from(command: Command) -> Self {
        match command {
            Command::Up => MigrationCommand::Up,
            Command::Status => MigrationCommand::Status,
        }
    }
}

#[derive(Parser)]
#[command(name = "migration")]
#[command(about = "Applies pending database migrations")]
struct Args {
    /// Migration command to run
    #[arg(value_enum, default_value_t = Command::Up)]
    command: Command,

    /// Exit successfully without reading configuration or connecting.
    /// Honored even when the other arguments do not parse.
    #[arg(long)]
    dryrun: bool,

    /// Runtime environment; selects appsettings.{ENV}.json
    #[arg(short, long, env = ENVIRONMENT_VAR)]
    env: Option<String>,

    /// Directory containing the appsettings files
    #[arg(long, default_value = ".")]
    config_dir: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("migration=info,db_infra=info,sqlx=warn"));
    tracing_subscriber::fmt()
        .with_writer(std::io::stdout)
        .without_time()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_line_number(false)
        .with_file(false)
        .with_env_filter(filter)
        .init();

    ExitCode::from(run_cli(std::env::args_os().collect()).await)
}

/// Exit code for one invocation: 0 on success, 1 on a failed run, 2 on bad
/// arguments.
async fn run_cli(argv: Vec<OsString>) -> u8 {
    // Checked on the raw arguments so a dryrun succeeds whatever else is passed.
    if argv.iter().skip(1).any(|arg| arg == "--dryrun") {
        info!("dryrun=true; skipping migrations");
        return 0;
    }

    let args = match Args::try_parse_from(argv) {
        Ok(args) => args,
        Err(e) => {
            // --help and --version also land here and are not failures
            let code = if e.use_stderr() { 2 } else { 0 };
            let _ = e.print();
            return code;
        }
    };

    match run(args).await {
        Ok(()) => 0,
        Err(e) => {
            match e.failed_migration() {
                Some(id) => error!(migration_id = %id, "Migration failed: {e}"),
                None => error!("Migration failed: {e}"),
            }
            eprintln!("Migration failed: {e}");
            1
        }
    }
}

async fn run(args: Args) -> Result<(), DbInfraError> {
    let env = match args.env {
        Some(name) => RuntimeEnv::new(name)?,
        None => RuntimeEnv::from_process_env()?,
    };
    let settings = load_settings(&env, &args.config_dir)?;
    info!(env = %env, settings = ?settings, "configuration loaded");

    let registry = migration::registry()?;

    let cancellation_token = CancellationToken::new();
    spawn_ctrl_c_handler(cancellation_token.clone());

    let outcome = orchestrate_migration(
        &settings,
        registry,
        args.command.into(),
        cancellation_token,
    )
    .await?;

    match outcome {
        MigrationOutcome::Migrated(report) => {
            info!(
                applied = report.applied.len(),
                already_applied = report.already_applied,
                elapsed_ms = report.elapsed.as_millis(),
                "migrations complete"
            );
        }
        MigrationOutcome::Status(status) => print_status(&status),
    }
    Ok(())
}

fn spawn_ctrl_c_handler(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("interrupt received; cancelling migration run");
                token.cancel();
            }
            Err(e) => warn!(error = %e, "failed to listen for ctrl-c"),
        }
    });
}

fn print_status(status: &[MigrationStatus]) {
    for s in status {
        match s.applied_on {
            Some(applied_on) => println!(
                "{:>16}  {:<8}  {}  ({})",
                s.id, s.state, s.description, applied_on
            ),
            None => println!("{:>16}  {:<8}  {}", s.id, s.state, s.description),
        }
    }
}
