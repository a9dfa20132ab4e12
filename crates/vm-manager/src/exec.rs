use std::ffi::OsStr;
use std::future::Future;

use tracing::{debug, warn};

use crate::error::{Result, VmError};

/// The output of a completed command: exit code plus captured streams.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Turn a non-zero exit into an error, carrying stderr for diagnostics.
    pub fn check(self, command: impl Into<String>) -> Result<CmdOutput> {
        if self.success() {
            Ok(self)
        } else {
            Err(VmError::ExecFailed {
                command: command.into(),
                code: self.code,
                stderr: self.stderr,
            })
        }
    }
}

/// Single choke point for privileged shell invocations (`ip`, `genisoimage`,
/// `qemu-system-*`, `qemu-img`). Every subsystem runs external commands
/// through this trait instead of calling `tokio::process::Command` directly,
/// so tests can substitute a fake executor. Consumers are generic over `Exec`
/// (no trait objects) since native async trait methods aren't dyn-safe.
pub trait Exec: Clone + Send + Sync + 'static {
    fn run(&self, program: &str, args: &[&str]) -> impl Future<Output = Result<CmdOutput>> + Send;

    /// Run a command whose failure should be logged and discarded. Used for
    /// idempotent setup steps (spec §4.2, §9) where a prior invocation may
    /// already have put the system in the desired state.
    fn run_ignore_errors(&self, program: &str, args: &[&str]) -> impl Future<Output = ()> + Send {
        async move {
            match self.run(program, args).await {
                Ok(out) if !out.success() => {
                    debug!(program, ?args, code = ?out.code, stderr = %out.stderr, "ignored command failure");
                }
                Err(e) => {
                    debug!(program, ?args, error = %e, "ignored command error");
                }
                Ok(_) => {}
            }
        }
    }
}

/// Default `Exec` backed by real `tokio::process::Command` spawning.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemExec;

impl Exec for SystemExec {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CmdOutput> {
        debug!(program, ?args, "exec");
        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|source| VmError::SpawnFailed {
                command: command_line(program, args),
                source,
            })?;

        Ok(CmdOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

fn command_line(program: &str, args: &[&str]) -> String {
    let mut s = program.to_string();
    for a in args {
        s.push(' ');
        s.push_str(a);
    }
    s
}

/// Spawn a long-running process (QEMU with `-daemonize` still forks and
/// exits quickly, but we run it through the same status-checking path as
/// everything else). Not part of the `Exec` trait because callers need the
/// child's exit status only, never stdout/stderr capture of a daemonizing
/// process.
pub async fn run_to_completion(program: &str, args: &[impl AsRef<OsStr>]) -> Result<()> {
    debug!(program, "spawn");
    let status = tokio::process::Command::new(program)
        .args(args)
        .status()
        .await
        .map_err(|source| VmError::SpawnFailed {
            command: program.to_string(),
            source,
        })?;

    if !status.success() {
        warn!(program, code = ?status.code(), "command exited non-zero");
        return Err(VmError::ExecFailed {
            command: program.to_string(),
            code: status.code(),
            stderr: String::new(),
        });
    }
    Ok(())
}

/// Available under `#[cfg(test)]` for unit tests and under the `test-util`
/// feature for this crate's own `tests/` integration suite.
#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// Records every invocation and returns canned responses keyed by program name.
    #[derive(Clone, Default)]
    pub struct FakeExec {
        inner: Arc<FakeExecState>,
    }

    #[derive(Default)]
    struct FakeExecState {
        calls: Mutex<Vec<(String, Vec<String>)>>,
        responses: Mutex<HashMap<String, CmdOutput>>,
    }

    impl FakeExec {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_response(&self, program: &str, output: CmdOutput) {
            self.inner
                .responses
                .lock()
                .unwrap()
                .insert(program.to_string(), output);
        }

        pub fn calls(&self) -> Vec<(String, Vec<String>)> {
            self.inner.calls.lock().unwrap().clone()
        }
    }

    impl Exec for FakeExec {
        async fn run(&self, program: &str, args: &[&str]) -> Result<CmdOutput> {
            self.inner.calls.lock().unwrap().push((
                program.to_string(),
                args.iter().map(|s| s.to_string()).collect(),
            ));
            Ok(self
                .inner
                .responses
                .lock()
                .unwrap()
                .get(program)
                .cloned()
                .unwrap_or(CmdOutput {
                    code: Some(0),
                    stdout: String::new(),
                    stderr: String::new(),
                }))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn fake_exec_records_calls() {
            let fake = FakeExec::new();
            fake.run("ip", &["link", "add", "foo"]).await.unwrap();
            let calls = fake.calls();
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].0, "ip");
        }

        #[tokio::test]
        async fn run_ignore_errors_swallows_failure() {
            let fake = FakeExec::new();
            fake.set_response(
                "ip",
                CmdOutput {
                    code: Some(1),
                    stdout: String::new(),
                    stderr: "File exists".into(),
                },
            );
            fake.run_ignore_errors("ip", &["link", "add", "foo"]).await;
        }

        #[tokio::test]
        async fn check_converts_nonzero_to_error() {
            let out = CmdOutput {
                code: Some(2),
                stdout: String::new(),
                stderr: "boom".into(),
            };
            let err = out.check("false").unwrap_err();
            assert!(matches!(err, VmError::ExecFailed { .. }));
        }
    }
}
