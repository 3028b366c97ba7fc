use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info};

use crate::error::{PyletError, Result};

/// Resident driver program executed by the interpreter.
const DRIVER: &str = include_str!("driver.py");

/// Base location the runtime is loaded from when nobody supplies one.
pub const DEFAULT_INDEX_URL: &str = "/usr";

/// How long a freshly launched interpreter may take to report ready.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Output of one submitted program.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedRun {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// A loaded interpreter able to run source text with captured output.
#[async_trait]
pub trait Interpreter: Send {
    /// Interpreter version string, for logs
    fn version(&self) -> &str;

    /// Run one program. Errors mean the interpreter itself is unreachable;
    /// faults in the submitted code are reported through the exit code.
    async fn run(&mut self, source: &str) -> Result<CapturedRun>;
}

/// Loads interpreters from a primary location with a fallback.
#[async_trait]
pub trait InterpreterLoader: Send + Sync {
    async fn load_primary(&self, index_url: &str) -> Result<Box<dyn Interpreter>>;

    async fn load_fallback(&self) -> Result<Box<dyn Interpreter>>;
}

#[derive(Debug, Deserialize)]
struct Handshake {
    ready: bool,
    #[serde(default)]
    version: String,
}

#[derive(Serialize)]
struct DriverRequest<'a> {
    code: &'a str,
}

/// CPython child process running the resident driver.
///
/// Requests and replies are single JSON lines on the child's stdin and a
/// private duplicate of its stdout. The child is killed when this is dropped.
pub struct ProcessInterpreter {
    version: String,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    _child: Child,
}

impl ProcessInterpreter {
    pub async fn launch(program: &Path) -> Result<Self> {
        debug!(program = %program.display(), "Launching Python interpreter");

        let mut child = Command::new(program)
            .args(["-I", "-u", "-c", DRIVER])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PyletError::InterpreterLoad(format!(
                    "Failed to launch {}: {}",
                    program.display(),
                    e
                ))
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            PyletError::InterpreterLoad("Interpreter stdin unavailable".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            PyletError::InterpreterLoad("Interpreter stdout unavailable".to_string())
        })?;
        let mut stdout = BufReader::new(stdout).lines();

        let line = tokio::time::timeout(HANDSHAKE_TIMEOUT, stdout.next_line())
            .await
            .map_err(|_| {
                PyletError::InterpreterLoad(format!(
                    "{} did not start within {} seconds",
                    program.display(),
                    HANDSHAKE_TIMEOUT.as_secs()
                ))
            })?
            .map_err(|e| PyletError::InterpreterLoad(format!("Handshake read failed: {}", e)))?
            .ok_or_else(|| {
                PyletError::InterpreterLoad(format!(
                    "{} exited during startup",
                    program.display()
                ))
            })?;

        let handshake: Handshake = serde_json::from_str(&line).map_err(|e| {
            PyletError::InterpreterLoad(format!(
                "Unexpected handshake from {}: {}",
                program.display(),
                e
            ))
        })?;

        if !handshake.ready {
            return Err(PyletError::InterpreterLoad(format!(
                "{} reported not ready",
                program.display()
            )));
        }

        info!(
            program = %program.display(),
            version = %handshake.version,
            "Python interpreter started"
        );

        Ok(Self {
            version: handshake.version,
            stdin,
            stdout,
            _child: child,
        })
    }
}

#[async_trait]
impl Interpreter for ProcessInterpreter {
    fn version(&self) -> &str {
        &self.version
    }

    async fn run(&mut self, source: &str) -> Result<CapturedRun> {
        let mut request = serde_json::to_string(&DriverRequest { code: source })?;
        request.push('\n');

        self.stdin
            .write_all(request.as_bytes())
            .await
            .map_err(|e| PyletError::Interpreter(format!("Failed to submit code: {}", e)))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| PyletError::Interpreter(format!("Failed to submit code: {}", e)))?;

        let reply = self
            .stdout
            .next_line()
            .await
            .map_err(|e| PyletError::Interpreter(format!("Failed to read result: {}", e)))?
            .ok_or_else(|| PyletError::Interpreter("Interpreter exited unexpectedly".to_string()))?;

        serde_json::from_str(&reply)
            .map_err(|e| PyletError::Interpreter(format!("Malformed interpreter reply: {}", e)))
    }
}

/// Launches [`ProcessInterpreter`]s.
///
/// The primary path is the interpreter under the index URL
/// (`<index_url>/bin/python3` for a directory, the path itself otherwise).
/// The fallback is whatever `python3` or `python` is on `PATH`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLoader;

impl ProcessLoader {
    pub fn primary_program(index_url: &str) -> PathBuf {
        let base = Path::new(index_url);
        if base.is_dir() {
            base.join("bin").join("python3")
        } else {
            base.to_path_buf()
        }
    }
}

#[async_trait]
impl InterpreterLoader for ProcessLoader {
    async fn load_primary(&self, index_url: &str) -> Result<Box<dyn Interpreter>> {
        let program = Self::primary_program(index_url);
        Ok(Box::new(ProcessInterpreter::launch(&program).await?))
    }

    async fn load_fallback(&self) -> Result<Box<dyn Interpreter>> {
        let program = which::which("python3")
            .or_else(|_| which::which("python"))
            .map_err(|e| {
                PyletError::InterpreterLoad(format!("No python3 or python on PATH: {}", e))
            })?;
        Ok(Box::new(ProcessInterpreter::launch(&program).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn launch_system_python() -> Option<ProcessInterpreter> {
        let program = which::which("python3").ok()?;
        ProcessInterpreter::launch(&program).await.ok()
    }

    #[test]
    fn test_primary_program_for_directory() {
        let dir = tempfile::tempdir().unwrap();
        let program = ProcessLoader::primary_program(dir.path().to_str().unwrap());
        assert_eq!(program, dir.path().join("bin").join("python3"));
    }

    #[test]
    fn test_primary_program_for_file() {
        let program = ProcessLoader::primary_program("/nonexistent/python3.12");
        assert_eq!(program, PathBuf::from("/nonexistent/python3.12"));
    }

    #[tokio::test]
    async fn test_launch_missing_program_fails() {
        let result = ProcessInterpreter::launch(Path::new("/nonexistent/python3")).await;
        assert!(matches!(result, Err(PyletError::InterpreterLoad(_))));
    }

    #[tokio::test]
    async fn test_print_is_captured() {
        let Some(mut python) = launch_system_python().await else {
            return;
        };
        let run = python.run("print('hi')").await.unwrap();
        assert_eq!(run.exit_code, 0);
        assert_eq!(run.stdout, "hi\n");
        assert_eq!(run.stderr, "");
    }

    #[tokio::test]
    async fn test_system_exit_code() {
        let Some(mut python) = launch_system_python().await else {
            return;
        };
        assert_eq!(python.run("import sys; sys.exit(3)").await.unwrap().exit_code, 3);
        assert_eq!(python.run("import sys; sys.exit()").await.unwrap().exit_code, 0);

        let run = python.run("raise SystemExit('bye')").await.unwrap();
        assert_eq!(run.exit_code, 1);
        assert_eq!(run.stderr, "bye\n");

        let run = python.run("raise SystemExit('3')").await.unwrap();
        assert_eq!(run.exit_code, 1);
        assert_eq!(run.stderr, "3\n");

        let run = python.run("import sys; sys.exit(2.5)").await.unwrap();
        assert_eq!(run.exit_code, 1);
        assert_eq!(run.stderr, "2.5\n");

        assert_eq!(python.run("import sys; sys.exit(True)").await.unwrap().exit_code, 1);
    }

    #[tokio::test]
    async fn test_lone_surrogates_do_not_break_replies() {
        let Some(mut python) = launch_system_python().await else {
            return;
        };
        let run = python.run("print('\\ud800')").await.unwrap();
        assert_eq!(run.exit_code, 0);
        assert!(run.stdout.contains('\u{fffd}'));
        assert!(run.stdout.ends_with('\n'));

        let run = python.run("print('after')").await.unwrap();
        assert_eq!(run.stdout, "after\n");
    }

    #[tokio::test]
    async fn test_exception_traceback() {
        let Some(mut python) = launch_system_python().await else {
            return;
        };
        let run = python.run("raise ValueError('x')").await.unwrap();
        assert_eq!(run.exit_code, 1);
        assert!(run.stderr.contains("Traceback"));
        assert!(run.stderr.contains("ValueError: x"));
    }

    #[tokio::test]
    async fn test_output_does_not_leak_between_runs() {
        let Some(mut python) = launch_system_python().await else {
            return;
        };
        let first = python
            .run("import sys\nprint('one')\nsys.stderr.write('err-one')\nraise RuntimeError('boom')")
            .await
            .unwrap();
        assert_eq!(first.stdout, "one\n");
        assert!(first.stderr.starts_with("err-one"));

        let second = python.run("print('two')").await.unwrap();
        assert_eq!(second.exit_code, 0);
        assert_eq!(second.stdout, "two\n");
        assert_eq!(second.stderr, "");
    }

    #[tokio::test]
    async fn test_namespace_persists_and_fd_writes_stay_off_protocol() {
        let Some(mut python) = launch_system_python().await else {
            return;
        };
        python.run("counter = 41").await.unwrap();
        let run = python
            .run("import os\nos.write(1, b'stray\\n')\nprint(counter + 1)")
            .await
            .unwrap();
        assert_eq!(run.exit_code, 0);
        assert_eq!(run.stdout, "42\n");
    }
}
