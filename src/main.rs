//! Command-line front end for the codecell runner.

use std::io::{BufReader, Read as _, Write as _};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use codecell::config::RunnerConfig;
use codecell::logging;
use codecell::orchestrator::Orchestrator;
use codecell::protocol::{serialize_message, ErrorKind, JsonlReader, Message, RunResult};

#[derive(Parser, Debug)]
#[command(name = "codecell", about = "Run guest code in a sandboxed worker", version)]
struct Cli {
    /// Source file to run; `-` reads from stdin
    #[arg(conflicts_with = "jsonl")]
    file: Option<PathBuf>,

    /// Serve run messages from stdin as JSON lines, answering with run-done lines
    #[arg(long)]
    jsonl: bool,

    /// Override the run timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Print the result as JSON instead of human-readable text
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    let mut config = RunnerConfig::from_env();
    if let Some(timeout_ms) = cli.timeout_ms {
        config.run_timeout_ms = timeout_ms;
    }
    let orchestrator = Orchestrator::new(config);

    if cli.jsonl {
        return serve_jsonl(&orchestrator);
    }

    let code = read_code(cli.file.as_deref())?;
    let result = run_reporting_errors(&orchestrator, &code);

    if cli.json {
        let line = serialize_message(&Message::run_done(result))
            .context("Failed to serialize run result")?;
        println!("{}", line);
        return Ok(());
    }

    print_human(&result);
    if !result.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

fn read_code(file: Option<&std::path::Path>) -> Result<String> {
    match file {
        Some(path) if path.as_os_str() != "-" => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display())),
        _ => {
            let mut code = String::new();
            std::io::stdin()
                .read_to_string(&mut code)
                .context("Failed to read code from stdin")?;
            Ok(code)
        }
    }
}

/// Long-running mode: one JSON message per stdin line, one run-done line per
/// run on stdout. Malformed lines are logged and skipped.
fn serve_jsonl(orchestrator: &Orchestrator) -> Result<()> {
    info!("Serving run messages from stdin");
    let stdin = std::io::stdin();
    let mut reader = JsonlReader::new(BufReader::new(stdin.lock()));
    let mut stdout = std::io::stdout();

    while let Some(message) = reader
        .next_message_graceful()
        .context("Failed to read from stdin")?
    {
        match message {
            Message::Run { code } => {
                let result = run_reporting_errors(orchestrator, &code);
                let line = serialize_message(&Message::run_done(result))
                    .context("Failed to serialize run result")?;
                writeln!(stdout, "{}", line).context("Failed to write to stdout")?;
                stdout.flush().context("Failed to flush stdout")?;
            }
            other => {
                warn!(message_type = other.type_name(), "Ignoring unexpected message");
            }
        }
    }
    info!("Stdin closed, exiting");
    Ok(())
}

/// Every run yields a result: host-level breakdowns (timeout, crash) are
/// folded into an error result so callers always see a terminal state.
fn run_reporting_errors(orchestrator: &Orchestrator, code: &str) -> RunResult {
    match orchestrator.run(code) {
        Ok(result) => result,
        Err(err) => {
            error!(%err, "Run failed before completing");
            RunResult::Error {
                stdout: Vec::new(),
                stderr: Vec::new(),
                message: err.user_message(),
                kind: ErrorKind::Guest,
            }
        }
    }
}

fn print_human(result: &RunResult) {
    for line in result.stdout() {
        println!("{}", line);
    }
    for line in result.stderr() {
        eprintln!("{}", line);
    }
    match result {
        RunResult::Success { output, .. } => {
            if !output.raw_output.is_empty() {
                println!("{}", output.raw_output);
            }
            if !output.figures.is_empty() {
                eprintln!("({} figure(s) produced)", output.figures.len());
            }
        }
        RunResult::Error { message, kind, .. } => {
            eprintln!("error ({}): {}", kind.as_str(), message);
        }
    }
}
