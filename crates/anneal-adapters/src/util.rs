//! Subprocess plumbing for git commands that need the real CLI
//! (anything touching the network or merge machinery).

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub struct CommandOutput {
    /// Missing when the child had to be killed and reaping it failed.
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.map(|s| s.success()).unwrap_or(false)
    }
}

/// Run a command, killing it once `timeout` elapses. Output is drained
/// on separate threads so a chatty child cannot deadlock on a full
/// pipe. Errors are spawn or wait failures; a timeout is a normal
/// outcome reported in the result.
pub fn run_with_timeout(
    command: &mut Command,
    timeout: Duration,
) -> std::io::Result<CommandOutput> {
    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());
    let (status, timed_out) = wait_with_deadline(&mut child, timeout)?;

    Ok(CommandOutput {
        status,
        stdout: collect(stdout),
        stderr: collect(stderr),
        timed_out,
    })
}

fn drain<R: Read + Send + 'static>(stream: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    stream.map(|mut s| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = s.read_to_end(&mut buf);
            buf
        })
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    let bytes = handle.and_then(|h| h.join().ok()).unwrap_or_default();
    String::from_utf8_lossy(&bytes).to_string()
}

fn wait_with_deadline(
    child: &mut Child,
    timeout: Duration,
) -> std::io::Result<(Option<ExitStatus>, bool)> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok((Some(status), false));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            return Ok((child.wait().ok(), true));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_of_quick_command() {
        let mut cmd = Command::new("echo");
        cmd.arg("hello");
        let result = run_with_timeout(&mut cmd, Duration::from_secs(5)).unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[test]
    fn kills_command_that_exceeds_timeout() {
        let mut cmd = Command::new("sleep");
        cmd.arg("10");
        let start = Instant::now();
        let result = run_with_timeout(&mut cmd, Duration::from_millis(200)).unwrap();
        assert!(result.timed_out);
        assert!(!result.success());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let mut cmd = Command::new("definitely-not-a-real-binary-xyz");
        let err = run_with_timeout(&mut cmd, Duration::from_secs(1)).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
