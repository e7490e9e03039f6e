//! External command execution behind a trait, so routing, QoS, and probe
//! shell-outs can be scripted in tests.
//!
//! Every invocation carries a hard timeout. A timeout or spawn failure is
//! reported as a failed [`CommandOutput`], never an error — callers treat
//! command failure as an observation, not an exception.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

/// Boxed future used by the object-safe async traits in this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Timeout classes per operation kind.
pub const TIMEOUT_READ: Duration = Duration::from_secs(2);
pub const TIMEOUT_APPLY: Duration = Duration::from_secs(5);
pub const TIMEOUT_SLOW: Duration = Duration::from_secs(15);

/// Captured result of one command invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl CommandOutput {
    pub fn ok(&self) -> bool {
        self.status == 0
    }

    /// A synthetic failure (spawn error or timeout).
    fn failed(reason: impl Into<String>) -> Self {
        CommandOutput {
            stdout: String::new(),
            stderr: reason.into(),
            status: -1,
        }
    }
}

/// Executes external commands. Implemented by [`ShellRunner`] in production
/// and [`MockRunner`] in tests.
pub trait SystemCommand: Send + Sync {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [&'a str],
        timeout: Duration,
    ) -> BoxFuture<'a, CommandOutput>;
}

// ── Production runner ───────────────────────────────────────────────

/// Runs commands via `tokio::process` with the given timeout.
#[derive(Debug, Default)]
pub struct ShellRunner;

impl SystemCommand for ShellRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [&'a str],
        timeout: Duration,
    ) -> BoxFuture<'a, CommandOutput> {
        Box::pin(async move {
            let child = tokio::process::Command::new(program).args(args).output();

            match tokio::time::timeout(timeout, child).await {
                Ok(Ok(out)) => CommandOutput {
                    stdout: String::from_utf8_lossy(&out.stdout).trim().to_string(),
                    stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
                    status: out.status.code().unwrap_or(-1),
                },
                Ok(Err(e)) => {
                    tracing::warn!(program, error = %e, "failed to spawn command");
                    CommandOutput::failed(e.to_string())
                }
                Err(_) => {
                    tracing::warn!(program, ?timeout, "command timed out");
                    CommandOutput::failed("timeout")
                }
            }
        })
    }
}

// ── Test double ─────────────────────────────────────────────────────

/// Scripted command runner for tests.
///
/// Rules are substring matchers against the full command line; the first
/// matching rule wins. Unmatched commands succeed with empty output. Every
/// invocation is recorded for assertions.
#[derive(Default)]
pub struct MockRunner {
    rules: Mutex<Vec<(String, CommandOutput)>>,
    calls: Mutex<Vec<String>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond to any command line containing `pattern` with `stdout`.
    pub fn stub(&self, pattern: &str, stdout: &str) {
        self.rules.lock().unwrap().push((
            pattern.to_string(),
            CommandOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
                status: 0,
            },
        ));
    }

    /// Respond to any command line containing `pattern` with a failure.
    pub fn stub_failure(&self, pattern: &str, stderr: &str) {
        self.rules.lock().unwrap().push((
            pattern.to_string(),
            CommandOutput {
                stdout: String::new(),
                stderr: stderr.to_string(),
                status: 1,
            },
        ));
    }

    /// All command lines run so far, oldest first.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Whether any recorded command line contains `pattern`.
    pub fn saw(&self, pattern: &str) -> bool {
        self.calls.lock().unwrap().iter().any(|c| c.contains(pattern))
    }
}

impl SystemCommand for MockRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [&'a str],
        _timeout: Duration,
    ) -> BoxFuture<'a, CommandOutput> {
        let line = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");

        Box::pin(async move {
            self.calls.lock().unwrap().push(line.clone());
            let rules = self.rules.lock().unwrap();
            for (pattern, output) in rules.iter() {
                if line.contains(pattern.as_str()) {
                    return output.clone();
                }
            }
            CommandOutput::default()
        })
    }
}
