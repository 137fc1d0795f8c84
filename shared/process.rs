// ========================================================================================
//                          Invocation of external command-line tools
// ========================================================================================

// PLINK and Rscript are run as child processes. Their stdout/stderr go to files inside the
// caller's working directory rather than pipes, so a chatty tool can never block on a full
// pipe while we poll it for completion.

use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Number of trailing diagnostic lines kept when a tool fails.
const DIAGNOSTIC_TAIL_LINES: usize = 40;

/// A failure reported by, or while driving, an external tool.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("could not launch '{tool}': {source}")]
    Launch {
        tool: String,
        #[source]
        source: io::Error,
    },
    #[error("'{tool}' exited with {status}:\n{diagnostic}")]
    Failed {
        tool: String,
        status: String,
        diagnostic: String,
    },
    #[error("'{tool}' did not finish within {limit:?} and was terminated")]
    TimedOut { tool: String, limit: Duration },
    #[error("I/O error while running '{tool}': {source}")]
    Io {
        tool: String,
        #[source]
        source: io::Error,
    },
}

impl ToolError {
    /// Combined stdout/stderr tail of a failed run, if any.
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            Self::Failed { diagnostic, .. } => Some(diagnostic),
            _ => None,
        }
    }
}

/// Captured result of a successful tool run.
#[derive(Debug)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

/// Describes one invocation: the program, its arguments and where it runs.
pub struct ToolInvocation {
    program: PathBuf,
    args: Vec<String>,
    workdir: PathBuf,
    timeout: Option<Duration>,
}

impl ToolInvocation {
    pub fn new(program: impl Into<PathBuf>, workdir: &Path) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            workdir: workdir.to_path_buf(),
            timeout: None,
        }
    }

    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn path_arg(self, value: &Path) -> Self {
        let text = value.display().to_string();
        self.arg(text)
    }

    pub fn timeout(mut self, limit: Option<Duration>) -> Self {
        self.timeout = limit;
        self
    }

    fn tool_name(&self) -> String {
        self.program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    /// Runs the tool to completion. A non-zero exit status is an error carrying the tool's
    /// own diagnostic output.
    pub fn run(self) -> Result<ToolOutput, ToolError> {
        let tool = self.tool_name();
        let stdout_path = self.workdir.join(format!("{tool}.stdout"));
        let stderr_path = self.workdir.join(format!("{tool}.stderr"));
        let io_err = |source: io::Error| ToolError::Io {
            tool: tool.clone(),
            source,
        };

        log::debug!("Running {}", self);
        let started = Instant::now();
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(File::create(&stdout_path).map_err(io_err)?)
            .stderr(File::create(&stderr_path).map_err(io_err)?)
            .spawn()
            .map_err(|source| ToolError::Launch {
                tool: tool.clone(),
                source,
            })?;

        let status: ExitStatus = loop {
            if let Some(status) = child.try_wait().map_err(io_err)? {
                break status;
            }
            if let Some(limit) = self.timeout {
                if started.elapsed() >= limit {
                    child.kill().map_err(io_err)?;
                    child.wait().map_err(io_err)?;
                    return Err(ToolError::TimedOut { tool, limit });
                }
            }
            thread::sleep(POLL_INTERVAL);
        };

        let stdout = fs::read_to_string(&stdout_path).unwrap_or_default();
        let stderr = fs::read_to_string(&stderr_path).unwrap_or_default();

        if !status.success() {
            return Err(ToolError::Failed {
                tool,
                status: status.to_string(),
                diagnostic: diagnostic_tail(&stdout, &stderr),
            });
        }

        Ok(ToolOutput {
            stdout,
            stderr,
            elapsed: started.elapsed(),
        })
    }
}

impl fmt::Display for ToolInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

fn diagnostic_tail(stdout: &str, stderr: &str) -> String {
    let combined: Vec<&str> = stdout
        .lines()
        .chain(stderr.lines())
        .filter(|line| !line.trim().is_empty())
        .collect();
    let start = combined.len().saturating_sub(DIAGNOSTIC_TAIL_LINES);
    combined[start..].join("\n")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn successful_run_captures_stdout() {
        let dir = tempdir().unwrap();
        let output = ToolInvocation::new("sh", dir.path())
            .arg("-c")
            .arg("echo hello")
            .run()
            .unwrap();
        assert_eq!(output.stdout.trim(), "hello");
        assert!(output.stderr.is_empty());
    }

    #[test]
    fn failing_run_keeps_the_tool_diagnostic() {
        let dir = tempdir().unwrap();
        let err = ToolInvocation::new("sh", dir.path())
            .arg("-c")
            .arg("echo 'Error: No variants remain' >&2; exit 3")
            .run()
            .unwrap_err();
        match &err {
            ToolError::Failed { tool, diagnostic, .. } => {
                assert_eq!(tool, "sh");
                assert!(diagnostic.contains("No variants remain"));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        assert!(err.diagnostic().is_some());
    }

    #[test]
    fn slow_tool_is_terminated() {
        let dir = tempdir().unwrap();
        let err = ToolInvocation::new("sh", dir.path())
            .arg("-c")
            .arg("sleep 5")
            .timeout(Some(Duration::from_millis(200)))
            .run()
            .unwrap_err();
        assert!(matches!(err, ToolError::TimedOut { .. }));
    }

    #[test]
    fn missing_program_is_a_launch_error() {
        let dir = tempdir().unwrap();
        let err = ToolInvocation::new("definitely-not-a-real-tool-xyz", dir.path())
            .run()
            .unwrap_err();
        assert!(matches!(err, ToolError::Launch { .. }));
    }
}
