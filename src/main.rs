mod config;
mod directive;
mod error;
mod executor;
mod verify;

use clap::Parser;
use clap::error::ErrorKind;
use directive::TestCase;
use std::path::PathBuf;
use std::process::ExitCode;
use verify::{Failure, Verdict};

#[derive(Parser)]
#[command(name = "checkrun")]
#[command(about = "Run a tool on a test case and verify its embedded CHECK/EXIT directives")]
#[command(version)]
struct Cli {
    /// Executable under test
    executable: PathBuf,
    /// Test case file, passed to the executable as its only argument
    test_case: PathBuf,
    /// File to redirect to the executable's standard input
    stdin: Option<PathBuf>,
    /// Kill the executable after this many seconds (0 disables the limit)
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,
    /// Match against stdout only instead of merged stdout and stderr
    #[arg(long)]
    separate_stderr: bool,
    /// Log progress to stderr
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            e.exit()
        }
        Err(e) => {
            print!("{}", e.render());
            return ExitCode::FAILURE;
        }
    };

    init_logging(cli.verbose);

    match run(&cli) {
        Ok(Verdict::Pass) => ExitCode::SUCCESS,
        Ok(Verdict::Fail(failure)) => {
            println!("{failure}");
            ExitCode::FAILURE
        }
        Err(e) => {
            println!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: &Cli) -> error::Result<Verdict> {
    // Directives are parsed before anything is spawned so a malformed test
    // case never runs the subject.
    let case = TestCase::load(&cli.test_case)?;

    let file_config = config::load_for(&cli.test_case)?;
    let overrides = config::CliOverrides {
        timeout: cli.timeout,
        separate_stderr: cli.separate_stderr,
    };
    let effective = config::EffectiveConfig::resolve(
        file_config.as_ref().map(|(path, cfg)| (path.as_path(), cfg)),
        &overrides,
    )?;

    let outcome = executor::execute(
        &cli.executable,
        &case.path,
        cli.stdin.as_deref(),
        &effective.exec_options(),
    )?;

    let verdict = verify::verify(&case.directives, &outcome);
    tracing::debug!(
        test_case = %case.path.display(),
        lines = case.lines.len(),
        directives = case.directives.len(),
        expected_exit = case.expected_exit(),
        passed = verdict.passed(),
        "verified"
    );
    if let Verdict::Fail(Failure::CheckNotFound { pattern, .. }) = &verdict {
        tracing::info!(%pattern, "no remaining output line contains the pattern");
    }
    Ok(verdict)
}
