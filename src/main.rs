mod config;
mod escalate;
mod outcome;
mod proctree;
mod retry;
mod session;
mod signals;
mod watchdog;

use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use outcome::{SupervisionResult, FAILURE_EXIT_CODE};
use retry::{run_attempts, RetrySession};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::Instrument;
use tracing_subscriber::EnvFilter;
use watchdog::Watchdog;

/// Runs a build command under an idle-output watchdog: if the command stays
/// silent for too long its whole process tree is interrupted (then killed if
/// it will not go), and the build is retried.
#[derive(Parser, Debug)]
#[command(name = "build-watchdog", version, about)]
pub struct Cli {
    /// Seconds without any output before the command counts as stalled
    #[arg(value_name = "TIMEOUT_SECS")]
    timeout: u64,

    /// Maximum number of runs when the command keeps stalling
    #[arg(value_name = "MAX_ATTEMPTS")]
    max_attempts: u32,

    /// Command to run, after a literal `--`
    #[arg(value_name = "COMMAND", last = true, required = true)]
    command: Vec<String>,

    /// Config file path (escalation and output tuning)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Extra logging (escalation steps, process table scans)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) {
                let _ = e.print();
                return ExitCode::SUCCESS;
            }
            if is_usage_request(&e) {
                println!("{}", Cli::command().render_usage());
                return ExitCode::SUCCESS;
            }
            // A bad number must not pass for a successful build.
            let _ = e.print();
            return ExitCode::from(FAILURE_EXIT_CODE as u8);
        }
    };

    init_tracing(&cli);
    tracing::debug!(?cli, "parsed CLI arguments");

    let code = run(&cli).instrument(tracing::info_span!("build-watchdog")).await;
    ExitCode::from(u8::try_from(code).unwrap_or(FAILURE_EXIT_CODE as u8))
}

/// Missing tokens or a missing `--` ask for usage. Values that were given
/// but do not parse are errors.
fn is_usage_request(error: &clap::Error) -> bool {
    !matches!(
        error.kind(),
        ErrorKind::ValueValidation | ErrorKind::InvalidValue
    )
}

fn init_tracing(cli: &Cli) {
    let default_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

/// Supervise the command until it succeeds or retries run out; returns the
/// exit code of the last attempt.
async fn run(cli: &Cli) -> i32 {
    let config = match &cli.config {
        Some(path) => config::load_config(path),
        None => config::WatchdogConfig::default(),
    };
    let Some((program, args)) = cli.command.split_first() else {
        tracing::error!("no build command given");
        return FAILURE_EXIT_CODE;
    };

    let timeout = Duration::from_secs(cli.timeout);
    let watchdog = Watchdog::from_config(timeout, &config);
    let mut session = RetrySession::new(timeout, cli.max_attempts);

    let result = run_attempts(&mut session, |_| supervise_attempt(&watchdog, program, args)).await;
    tracing::debug!(
        exit_code = result.exit_code,
        outcome = ?result.outcome,
        attempts = session.current_attempt(),
        "supervision finished"
    );
    result.exit_code
}

async fn supervise_attempt(watchdog: &Watchdog, program: &str, args: &[String]) -> SupervisionResult {
    let spawned = match session::spawn(program, args) {
        Ok(spawned) => spawned,
        Err(e) => {
            tracing::error!(error = %e, "build command invocation failed");
            return SupervisionResult::setup_failure();
        }
    };
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    watchdog.run(spawned, &mut stdout, &mut stderr).await
}
