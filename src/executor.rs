//! Runs a model-generated Python snippet against the dataset in an isolated
//! subprocess, capturing stdout and any matplotlib figure it produces.
//!
//! The child runs a fixed wrapper program; everything request-specific (the
//! snippet, the CSV path, the figure save path, the import blacklist, extra
//! bindings) goes in as one JSON document on stdin, and the outcome comes
//! back as one JSON document framed by sentinel lines on stdout. User code is
//! never spliced into the wrapper source, and the serving process never
//! redirects its own stdio.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::{AppConfig, ResourceLimits};
use crate::errors::{Result, SandboxError};

const RESULT_BEGIN: &str = "PROMPTPLOT_RESULT_BEGIN";
const RESULT_END: &str = "PROMPTPLOT_RESULT_END";

/// Fixed wrapper executed by the child interpreter.
///
/// Layout mirrors the request contract: install the import guard, set up a
/// fresh plotting context (Agg backend, dark style, no open figures), load
/// the dataset, swap stdout for a buffer scoped by try/finally, exec the
/// snippet against exactly {data, pd, plt} plus extra bindings, then emit the
/// outcome between sentinels. Snippet faults are caught broadly: anything
/// derived from Exception becomes a failure outcome rather than a crash.
const CHILD_WRAPPER: &str = r#"
import json
import sys
from io import StringIO

_payload = json.load(sys.stdin)

import matplotlib
matplotlib.use("Agg")
import matplotlib.pyplot as plt
plt.style.use("dark_background")
import pandas as pd

data = pd.read_csv(_payload["csv_path"])
_save_path = _payload.get("save_plot_path")

plt.close("all")

# Installed only now: pandas and matplotlib are free to use whatever they
# need internally, the snippet below is not.
import builtins
_BLOCKED = set(_payload.get("blocked_modules", []))
_orig_import = builtins.__import__

def _guarded_import(name, globals=None, locals=None, fromlist=(), level=0):
    if level > 0:
        return _orig_import(name, globals, locals, fromlist, level)
    root = name.split('.')[0]
    if root in _BLOCKED:
        raise ImportError(f"Module '{root}' is not available in this sandbox")
    return _orig_import(name, globals, locals, fromlist, level)

builtins.__import__ = _guarded_import

_captured = StringIO()
_old_stdout = sys.stdout
sys.stdout = _captured

_error = None
_produced_graphic = False
try:
    _globals = {"data": data, "pd": pd, "plt": plt}
    _globals.update(_payload.get("extra_bindings", {}))
    exec(_payload["code"], _globals)
    if _save_path and plt.get_fignums():
        plt.savefig(_save_path)
        _produced_graphic = True
except Exception as _ex:
    _error = f"Error executing code:\n{_ex}"
finally:
    sys.stdout = _old_stdout
    plt.close("all")

print("PROMPTPLOT_RESULT_BEGIN")
print(json.dumps({
    "stdout": _captured.getvalue(),
    "error": _error,
    "produced_graphic": _produced_graphic,
}))
print("PROMPTPLOT_RESULT_END")
"#;

/// One unit of work for the executor.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Snippet to run; may be empty or syntactically invalid.
    pub code: String,
    /// Dataset the child loads under the fixed name `data`.
    pub csv_path: PathBuf,
    /// Where to persist a produced figure, if any.
    pub save_plot_path: Option<PathBuf>,
    /// Extra name bindings merged into the namespace (may shadow defaults).
    pub extra_bindings: serde_json::Map<String, serde_json::Value>,
}

impl RunRequest {
    pub fn new(code: impl Into<String>, csv_path: impl Into<PathBuf>) -> Self {
        Self {
            code: code.into(),
            csv_path: csv_path.into(),
            save_plot_path: None,
            extra_bindings: serde_json::Map::new(),
        }
    }

    pub fn with_save_plot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.save_plot_path = Some(path.into());
        self
    }

    pub fn with_binding(mut self, name: &str, value: serde_json::Value) -> Self {
        self.extra_bindings.insert(name.to_string(), value);
        self
    }
}

#[derive(Debug, Serialize)]
struct ChildPayload<'a> {
    code: &'a str,
    csv_path: String,
    save_plot_path: Option<String>,
    blocked_modules: Vec<&'a str>,
    extra_bindings: &'a serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChildResult {
    stdout: String,
    error: Option<String>,
    produced_graphic: bool,
}

/// Outcome of one execution. The two content states are mutually exclusive
/// by construction, and a graphic can only be reported on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    Success {
        /// Captured stdout, byte-for-byte, trailing newlines included.
        stdout: String,
        /// True when the snippet left a figure open and a save path was
        /// supplied; the figure has then been written to that path.
        produced_graphic: bool,
    },
    Failure {
        /// Human-readable message, `"Error executing code:\n..."`.
        message: String,
    },
}

impl ExecOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, ExecOutcome::Failure { .. })
    }

    pub fn produced_graphic(&self) -> bool {
        matches!(
            self,
            ExecOutcome::Success {
                produced_graphic: true,
                ..
            }
        )
    }

    /// Text shown on the page: the error message in place of stdout on
    /// failure, the captured stdout otherwise.
    pub fn display_text(&self) -> &str {
        match self {
            ExecOutcome::Success { stdout, .. } => stdout,
            ExecOutcome::Failure { message } => message,
        }
    }
}

/// Spawns and supervises the execution subprocess.
#[derive(Debug, Clone)]
pub struct CodeRunner {
    python_path: PathBuf,
    limits: ResourceLimits,
    blocked_modules: Vec<String>,
    timeout: Duration,
}

impl CodeRunner {
    /// Locate `python3` in PATH and take limits, blacklist and deadline from
    /// the application config.
    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        let python_path = which::which("python3")
            .or_else(|_| which::which("python"))
            .map_err(|_| SandboxError::PythonNotFound)?;

        let mut blocked_modules: Vec<String> = cfg.blocked_modules.iter().cloned().collect();
        blocked_modules.sort();

        Ok(Self {
            python_path,
            limits: cfg.limits.clone(),
            blocked_modules,
            timeout: cfg.exec_timeout,
        })
    }

    /// Use an explicit interpreter path (bundled Python, tests).
    pub fn with_python_path(mut self, python_path: PathBuf) -> Self {
        self.python_path = python_path;
        self
    }

    /// Execute one request. Snippet faults come back as a failure
    /// [`ExecOutcome`]; only infrastructure faults (missing interpreter,
    /// spawn failure, timeout, memory kill, corrupt channel) are `Err`.
    pub async fn run(&self, req: &RunRequest) -> Result<ExecOutcome> {
        let payload = ChildPayload {
            code: &req.code,
            csv_path: req.csv_path.to_string_lossy().into_owned(),
            save_plot_path: req
                .save_plot_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            blocked_modules: self.blocked_modules.iter().map(|s| s.as_str()).collect(),
            extra_bindings: &req.extra_bindings,
        };
        let payload_json = serde_json::to_vec(&payload)?;

        let mut cmd = Command::new(&self.python_path);
        cmd.arg("-c")
            .arg(CHILD_WRAPPER)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("PYTHONIOENCODING", "utf-8")
            .env("MPLBACKEND", "Agg")
            .env("OMP_NUM_THREADS", self.limits.max_threads.to_string())
            .env("OPENBLAS_NUM_THREADS", self.limits.max_threads.to_string())
            .env("MKL_NUM_THREADS", self.limits.max_threads.to_string());

        self.apply_resource_limits(&mut cmd);

        let mut child = cmd.spawn()?;
        let pid = child.id();

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload_json).await?;
            stdin.shutdown().await?;
        }

        debug!(timeout = ?self.timeout, "spawned execution subprocess");

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);

                match parse_channel(&stdout) {
                    Ok(outcome) => Ok(outcome),
                    Err(e) if output.status.success() => Err(e),
                    Err(_) => {
                        warn!(status = ?output.status, "execution subprocess died before reporting");
                        Err(classify_abnormal_exit(output.status, &stderr))
                    }
                }
            }
            Ok(Err(e)) => Err(SandboxError::IoError(e)),
            Err(_) => {
                // Deadline expired: take down the whole process group.
                #[cfg(unix)]
                if let Some(pid) = pid {
                    unsafe {
                        libc::kill(-(pid as i32), libc::SIGKILL);
                    }
                }
                Err(SandboxError::Timeout)
            }
        }
    }

    #[cfg(unix)]
    fn apply_resource_limits(&self, cmd: &mut Command) {
        let cpu_seconds = self.limits.cpu_seconds;
        let memory_bytes = self.limits.memory_mb * 1024 * 1024;
        let max_processes = self.limits.max_processes;

        unsafe {
            cmd.pre_exec(move || {
                // New process group so a timeout kill reaps grandchildren too.
                libc::setpgid(0, 0);

                #[cfg(not(target_os = "macos"))]
                {
                    let rlimit = libc::rlimit {
                        rlim_cur: memory_bytes as libc::rlim_t,
                        rlim_max: memory_bytes as libc::rlim_t,
                    };
                    if libc::setrlimit(libc::RLIMIT_AS, &rlimit) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }

                let rlimit = libc::rlimit {
                    rlim_cur: cpu_seconds as libc::rlim_t,
                    rlim_max: cpu_seconds as libc::rlim_t,
                };
                if libc::setrlimit(libc::RLIMIT_CPU, &rlimit) != 0 {
                    return Err(std::io::Error::last_os_error());
                }

                #[cfg(not(target_os = "macos"))]
                {
                    let rlimit = libc::rlimit {
                        rlim_cur: max_processes as libc::rlim_t,
                        rlim_max: max_processes as libc::rlim_t,
                    };
                    if libc::setrlimit(libc::RLIMIT_NPROC, &rlimit) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }

                Ok(())
            });
        }
    }

    #[cfg(not(unix))]
    fn apply_resource_limits(&self, _cmd: &mut Command) {
        // Non-Unix targets rely on the wall-clock timeout only.
    }
}

/// Map an abnormal child exit (no parseable result channel) to a fault.
///
/// A child killed by a signal leaves stderr empty: RLIMIT_CPU delivers
/// SIGXCPU, which counts as the time budget running out, and any other
/// signal is reported as such instead of an empty runtime error.
fn classify_abnormal_exit(status: std::process::ExitStatus, stderr: &str) -> SandboxError {
    if stderr.contains("MemoryError") {
        return SandboxError::MemoryLimitExceeded;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        match status.signal() {
            Some(libc::SIGXCPU) => return SandboxError::Timeout,
            Some(signal) => return SandboxError::ProcessKilled(signal),
            None => {}
        }
    }

    let detail = stderr.trim();
    if detail.is_empty() {
        SandboxError::RuntimeError(status.to_string())
    } else {
        SandboxError::RuntimeError(detail.to_string())
    }
}

/// Extract the framed result document from the child's raw stdout.
///
/// The captured snippet output travels *inside* the JSON document, so the
/// sentinel text itself may appear there verbatim (a snippet is free to
/// print it). The real frame is therefore the first begin sentinel and the
/// last end sentinel.
fn parse_channel(stdout: &str) -> Result<ExecOutcome> {
    let start = stdout
        .find(RESULT_BEGIN)
        .ok_or_else(|| SandboxError::ChannelCorrupt("begin sentinel missing".to_string()))?;
    let end = stdout
        .rfind(RESULT_END)
        .ok_or_else(|| SandboxError::ChannelCorrupt("end sentinel missing".to_string()))?;
    if end < start {
        return Err(SandboxError::ChannelCorrupt(
            "sentinels out of order".to_string(),
        ));
    }

    let json_str = stdout[start + RESULT_BEGIN.len()..end].trim();
    let result: ChildResult = serde_json::from_str(json_str)
        .map_err(|e| SandboxError::ChannelCorrupt(e.to_string()))?;

    Ok(match result.error {
        Some(message) => ExecOutcome::Failure { message },
        None => ExecOutcome::Success {
            stdout: result.stdout,
            produced_graphic: result.produced_graphic,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(json: &str) -> String {
        format!("{RESULT_BEGIN}\n{json}\n{RESULT_END}\n")
    }

    #[test]
    fn channel_success_keeps_stdout_verbatim() {
        let raw = framed(r#"{"stdout": "hi\n", "error": null, "produced_graphic": false}"#);
        let outcome = parse_channel(&raw).unwrap();
        assert_eq!(
            outcome,
            ExecOutcome::Success {
                stdout: "hi\n".to_string(),
                produced_graphic: false,
            }
        );
        assert!(!outcome.is_failure());
        assert_eq!(outcome.display_text(), "hi\n");
    }

    #[test]
    fn channel_failure_maps_to_failure_outcome() {
        let raw = framed(
            r#"{"stdout": "", "error": "Error executing code:\ndivision by zero", "produced_graphic": false}"#,
        );
        let outcome = parse_channel(&raw).unwrap();
        assert!(outcome.is_failure());
        assert!(!outcome.produced_graphic());
        assert!(outcome.display_text().starts_with("Error executing code:"));
        assert!(outcome.display_text().contains("division by zero"));
    }

    #[test]
    fn channel_tolerates_surrounding_noise() {
        let raw = format!(
            "matplotlib warning: something\n{}",
            framed(r#"{"stdout": "42\n", "error": null, "produced_graphic": true}"#)
        );
        let outcome = parse_channel(&raw).unwrap();
        assert!(outcome.produced_graphic());
        assert_eq!(outcome.display_text(), "42\n");
    }

    #[test]
    fn snippet_may_print_the_sentinel_text_itself() {
        // The captured output rides inside the JSON document, so a snippet
        // printing the sentinel strings must not truncate the frame.
        let raw = framed(
            r#"{"stdout": "PROMPTPLOT_RESULT_END\nPROMPTPLOT_RESULT_BEGIN\n", "error": null, "produced_graphic": false}"#,
        );
        let outcome = parse_channel(&raw).unwrap();
        assert_eq!(
            outcome.display_text(),
            "PROMPTPLOT_RESULT_END\nPROMPTPLOT_RESULT_BEGIN\n"
        );
        assert!(!outcome.is_failure());
    }

    #[test]
    fn missing_sentinels_are_channel_corruption() {
        assert!(matches!(
            parse_channel("Traceback (most recent call last): ..."),
            Err(SandboxError::ChannelCorrupt(_))
        ));
        assert!(matches!(
            parse_channel(&format!("{RESULT_BEGIN}\n{{not json}}\n{RESULT_END}")),
            Err(SandboxError::ChannelCorrupt(_))
        ));
        assert!(matches!(
            parse_channel(&format!("{RESULT_END}\nx\n{RESULT_BEGIN}")),
            Err(SandboxError::ChannelCorrupt(_))
        ));
    }

    #[test]
    fn failure_outcome_never_reports_a_graphic() {
        // Even a lying child cannot make a failure carry a graphic: the flag
        // is only read in the success arm.
        let raw = framed(
            r#"{"stdout": "", "error": "Error executing code:\nboom", "produced_graphic": true}"#,
        );
        let outcome = parse_channel(&raw).unwrap();
        assert!(outcome.is_failure());
        assert!(!outcome.produced_graphic());
    }

    #[cfg(unix)]
    #[test]
    fn signal_kills_are_classified() {
        use std::os::unix::process::ExitStatusExt;
        use std::process::ExitStatus;

        // A wait status in the low bits is a terminating signal.
        let cpu_exhausted = ExitStatus::from_raw(libc::SIGXCPU);
        assert!(matches!(
            classify_abnormal_exit(cpu_exhausted, ""),
            SandboxError::Timeout
        ));

        let killed = ExitStatus::from_raw(libc::SIGKILL);
        assert!(matches!(
            classify_abnormal_exit(killed, ""),
            SandboxError::ProcessKilled(sig) if sig == libc::SIGKILL
        ));
    }

    #[cfg(unix)]
    #[test]
    fn plain_crashes_keep_their_stderr_detail() {
        use std::os::unix::process::ExitStatusExt;
        use std::process::ExitStatus;

        let exit_one = ExitStatus::from_raw(1 << 8);

        assert!(matches!(
            classify_abnormal_exit(exit_one, "MemoryError: out of memory"),
            SandboxError::MemoryLimitExceeded
        ));

        match classify_abnormal_exit(exit_one, "Traceback: boom\n") {
            SandboxError::RuntimeError(detail) => assert_eq!(detail, "Traceback: boom"),
            other => panic!("unexpected fault: {other:?}"),
        }

        // Empty stderr still yields a non-empty detail.
        match classify_abnormal_exit(exit_one, "") {
            SandboxError::RuntimeError(detail) => assert!(!detail.is_empty()),
            other => panic!("unexpected fault: {other:?}"),
        }
    }

    #[test]
    fn payload_carries_the_full_request() {
        let req = RunRequest::new("print('hi')", "/tmp/cars.csv")
            .with_save_plot_path("/tmp/graphic.png")
            .with_binding("threshold", serde_json::json!(10_000));

        let blocked = vec!["socket", "subprocess"];
        let payload = ChildPayload {
            code: &req.code,
            csv_path: req.csv_path.to_string_lossy().into_owned(),
            save_plot_path: req
                .save_plot_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            blocked_modules: blocked,
            extra_bindings: &req.extra_bindings,
        };

        let v = serde_json::to_value(&payload).unwrap();
        assert_eq!(v["code"], "print('hi')");
        assert_eq!(v["csv_path"], "/tmp/cars.csv");
        assert_eq!(v["save_plot_path"], "/tmp/graphic.png");
        assert_eq!(v["blocked_modules"][1], "subprocess");
        assert_eq!(v["extra_bindings"]["threshold"], 10_000);
    }

    #[test]
    fn wrapper_sets_up_the_execution_contract() {
        // The wrapper is the isolation boundary; pin its key obligations.
        assert!(CHILD_WRAPPER.contains("json.load(sys.stdin)"));
        assert!(CHILD_WRAPPER.contains(r#"matplotlib.use("Agg")"#));
        assert!(CHILD_WRAPPER.contains(r#"plt.style.use("dark_background")"#));
        assert!(CHILD_WRAPPER.contains(r#"{"data": data, "pd": pd, "plt": plt}"#));
        assert!(CHILD_WRAPPER.contains("except Exception"));
        assert!(CHILD_WRAPPER.contains("Error executing code:"));
        assert!(CHILD_WRAPPER.contains("builtins.__import__ = _guarded_import"));
        // Figure state cleared both before the snippet and on every exit path.
        assert_eq!(CHILD_WRAPPER.matches(r#"plt.close("all")"#).count(), 2);
        assert!(CHILD_WRAPPER.contains(RESULT_BEGIN));
        assert!(CHILD_WRAPPER.contains(RESULT_END));
    }
}
