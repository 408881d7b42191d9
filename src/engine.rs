//! Per-run execution session.
//!
//! Wraps the interpreter with the run lifecycle: prelude evaluation,
//! dependency inference and best-effort install, and mapping guest outcomes
//! onto the wire-level [`RunResult`]. One session serves exactly one run and
//! is then discarded, so no guest state survives between runs.

use std::collections::BTreeSet;
use std::sync::OnceLock;
use std::thread;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::RunnerError;
use crate::interpreter::{FetchPrimitive, GuestError, Interpreter, Value};
use crate::protocol::{ErrorKind, Figure, FigureKind, RunOutput, RunResult};

/// Convenience imports evaluated before user code so common helpers are
/// available without boilerplate. Failures here are an init error, never a
/// guest error.
const PRELUDE: &str = "import plotting\nimport tables\nimport net";

/// Packages shipped with the runtime; anything else triggers an install
/// attempt.
const BUNDLED_PACKAGES: &[&str] = &["plotting", "tables", "net"];

fn import_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*import\s+([A-Za-z_][A-Za-z0-9_]*)").expect("Invalid regex")
    })
}

/// Installs guest packages before a run. Failures are logged and swallowed;
/// a missing package surfaces later as a guest error only if the code
/// actually needs it.
pub trait PackageInstaller: Send + Sync {
    fn install(&self, package: &str) -> Result<(), String>;
}

/// Default installer: bundled packages are already present, everything else
/// is reported as unavailable.
pub struct BundledInstaller;

impl PackageInstaller for BundledInstaller {
    fn install(&self, package: &str) -> Result<(), String> {
        if BUNDLED_PACKAGES.contains(&package) {
            Ok(())
        } else {
            Err(format!("package '{}' is not available", package))
        }
    }
}

/// Scan prelude plus user code for `import` statements.
pub fn inferred_packages(code: &str) -> BTreeSet<String> {
    let mut packages = BTreeSet::new();
    for source in [PRELUDE, code] {
        for capture in import_regex().captures_iter(source) {
            packages.insert(capture[1].to_string());
        }
    }
    packages
}

/// One run of guest code, start to finish.
pub struct ExecutionSession {
    prelude: &'static str,
    installer: Box<dyn PackageInstaller>,
}

impl ExecutionSession {
    pub fn new(installer: Box<dyn PackageInstaller>) -> Self {
        ExecutionSession {
            prelude: PRELUDE,
            installer,
        }
    }

    #[cfg(test)]
    fn with_prelude(prelude: &'static str, installer: Box<dyn PackageInstaller>) -> Self {
        ExecutionSession { prelude, installer }
    }

    /// Run `code` with the given fetch capability and produce the terminal
    /// result. This never returns Err: every failure mode is folded into
    /// [`RunResult::Error`] so the host always gets a run-done message.
    pub fn execute(&self, code: &str, fetch: Box<dyn FetchPrimitive>) -> RunResult {
        self.install_dependencies(code);

        let mut interp = Interpreter::new(fetch);

        if let Err(err) = interp.execute(self.prelude) {
            let init_err = RunnerError::Initialization(err.message().to_string());
            let (stdout, stderr) = interp.take_streams();
            return RunResult::Error {
                stdout,
                stderr,
                message: init_err.user_message(),
                kind: ErrorKind::Init,
            };
        }

        match interp.execute(code) {
            Ok(last) => {
                let output = collect_output(&interp, &last);
                let (stdout, stderr) = interp.take_streams();
                RunResult::Success {
                    stdout,
                    stderr,
                    output,
                }
            }
            Err(err) => {
                let kind = match &err {
                    GuestError::FetchTimeout(_) => ErrorKind::FetchTimeout,
                    GuestError::Exception(_) => ErrorKind::Guest,
                };
                let (stdout, stderr) = interp.take_streams();
                RunResult::Error {
                    stdout,
                    stderr,
                    message: err.message().to_string(),
                    kind,
                }
            }
        }
    }

    /// Best-effort concurrent install of every inferred dependency. A failed
    /// install never fails the run.
    fn install_dependencies(&self, code: &str) {
        let packages = inferred_packages(code);
        if packages.is_empty() {
            return;
        }
        debug!(count = packages.len(), "Installing inferred packages");

        thread::scope(|scope| {
            for package in &packages {
                let installer = &self.installer;
                scope.spawn(move || match installer.install(package) {
                    Ok(()) => info!(package = %package, "Package ready"),
                    Err(reason) => {
                        warn!(package = %package, %reason, "Package install failed, continuing")
                    }
                });
            }
        });
    }
}

/// Raw output comes from the last displayable value; figures come from the
/// final scope in binding order.
fn collect_output(interp: &Interpreter, last: &Value) -> RunOutput {
    let raw_output = if last.is_displayable() {
        last.raw_output()
    } else {
        String::new()
    };

    let figures = interp
        .scope_figures()
        .into_iter()
        .filter_map(|value| match value {
            Value::Plot(data) => Some(Figure {
                kind: FigureKind::Plot,
                data: data.clone(),
            }),
            Value::Markup(data) => Some(Figure {
                kind: FigureKind::Markup,
                data: data.clone(),
            }),
            _ => None,
        })
        .collect();

    RunOutput {
        raw_output,
        figures,
    }
}
