//! Host process backend.
//!
//! Runs `sh -c <command>` directly on the host. Both pipes are drained while
//! waiting for exit so a chatty command can never block on a full pipe. The
//! whole run (exit plus draining) is bounded by a single deadline; on expiry
//! the process group is killed.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use super::{ExecError, ExecutionBackend};
use crate::task::Task;

/// Hard ceiling for a local run.
pub const LOCAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Output recorded when the command printed nothing on either stream.
pub const LOCAL_NO_OUTPUT: &str = "Command executed successfully (no output)";

#[derive(Debug, Clone)]
pub struct LocalProcessBackend {
    timeout: Duration,
}

impl LocalProcessBackend {
    pub fn new() -> Self {
        Self {
            timeout: LOCAL_TIMEOUT,
        }
    }

    /// Use a different deadline (tests use a short one).
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for LocalProcessBackend {
    fn default() -> Self {
        Self::new()
    }
}

enum Outcome {
    Finished(std::io::Result<(ExitStatus, String, String)>),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl ExecutionBackend for LocalProcessBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn run(&self, task: &Task, cancel: &CancellationToken) -> Result<String, ExecError> {
        tracing::info!(
            task_id = %task.id_str(),
            "Executing task locally (Kubernetes not available)"
        );

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&task.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(ExecError::Spawn)?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let outcome = tokio::select! {
            res = tokio::time::timeout(self.timeout, collect(&mut child, stdout, stderr)) => {
                match res {
                    Ok(finished) => Outcome::Finished(finished),
                    Err(_) => Outcome::TimedOut,
                }
            }
            _ = cancel.cancelled() => Outcome::Cancelled,
        };

        match outcome {
            Outcome::Finished(result) => {
                let (status, stdout, stderr) = result?;
                tracing::debug!(
                    task_id = %task.id_str(),
                    exit_code = ?status.code(),
                    "Local command exited"
                );
                Ok(combine_output(&stdout, &stderr))
            }
            Outcome::TimedOut => {
                tracing::error!(
                    task_id = %task.id_str(),
                    "Command timed out after {} seconds",
                    self.timeout.as_secs()
                );
                terminate(&mut child).await;
                Err(ExecError::Timeout {
                    what: "Command",
                    after: self.timeout,
                })
            }
            Outcome::Cancelled => {
                terminate(&mut child).await;
                Err(ExecError::Cancelled)
            }
        }
    }
}

/// Wait for exit while draining both pipes concurrently.
async fn collect<O, E>(
    child: &mut Child,
    stdout: Option<O>,
    stderr: Option<E>,
) -> std::io::Result<(ExitStatus, String, String)>
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let (status, out, err) = tokio::join!(child.wait(), read_stream(stdout), read_stream(stderr));
    Ok((status?, out?, err?))
}

async fn read_stream<R: AsyncRead + Unpin>(stream: Option<R>) -> std::io::Result<String> {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        stream.read_to_end(&mut buf).await?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Build the recorded output: stdout, then an `Error:` section if stderr had
/// anything, with a placeholder when both were empty.
pub(crate) fn combine_output(stdout: &str, stderr: &str) -> String {
    let mut combined = terminate_lines(stdout);
    let errors = terminate_lines(stderr);
    if !errors.is_empty() {
        combined.push_str("\nError: ");
        combined.push_str(&errors);
    }
    if combined.is_empty() {
        return LOCAL_NO_OUTPUT.to_string();
    }
    combined.trim().to_string()
}

fn terminate_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 1);
    for line in text.lines() {
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Kill the command's whole process group, then reap the child.
async fn terminate(child: &mut Child) {
    kill_process_group(child);
    if let Err(e) = child.kill().await {
        tracing::debug!("Failed to kill timed out command: {}", e);
    }
}

#[cfg(unix)]
fn kill_process_group(child: &Child) {
    // The child leads its own group (process_group(0)), so this also
    // reaches anything `sh -c` started.
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(command: &str) -> Task {
        let mut task = Task::new("t", "o", command);
        task.id = Some("local-test".to_string());
        task
    }

    #[tokio::test]
    async fn echo_output_is_trimmed() {
        let backend = LocalProcessBackend::new();
        let output = backend
            .run(&task("echo hello"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output, "hello");
    }

    #[tokio::test]
    async fn silent_command_gets_placeholder() {
        let backend = LocalProcessBackend::new();
        let output = backend
            .run(&task("true"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output, LOCAL_NO_OUTPUT);
    }

    #[tokio::test]
    async fn stderr_is_appended_as_error_section() {
        let backend = LocalProcessBackend::new();
        let output = backend
            .run(&task("ls /definitely-not-here-4242"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(output.starts_with("Error: "), "got {:?}", output);
        assert!(output.contains("definitely-not-here-4242"));
    }

    #[tokio::test]
    async fn large_output_does_not_deadlock() {
        let backend = LocalProcessBackend::with_timeout(Duration::from_secs(20));
        let output = backend
            .run(&task("seq 1 200000"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(output.starts_with("1\n2\n3"));
        assert!(output.ends_with("200000"));
    }

    #[tokio::test]
    async fn slow_command_times_out_and_is_killed() {
        let backend = LocalProcessBackend::with_timeout(Duration::from_millis(200));
        let started = std::time::Instant::now();
        let err = backend
            .run(&task("sleep 5"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(err.failure_output().contains("timeout"));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn cancellation_stops_the_command() {
        let backend = LocalProcessBackend::new();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let err = backend.run(&task("sleep 5"), &cancel).await.unwrap_err();
        assert!(matches!(err, ExecError::Cancelled));
    }

    #[test]
    fn combine_output_rules() {
        assert_eq!(combine_output("", ""), LOCAL_NO_OUTPUT);
        assert_eq!(combine_output("a\n", ""), "a");
        assert_eq!(combine_output("a", "boom"), "a\n\nError: boom");
        assert_eq!(combine_output("", "boom\n"), "Error: boom");
        assert_eq!(combine_output("  x  \n", ""), "x");
    }
}
