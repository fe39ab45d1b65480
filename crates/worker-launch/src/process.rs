//! Child process helpers: spawning, signalling, exit codes.

use std::collections::HashMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Build a command that shares our stdout/stderr, so the container log
/// shows both processes' raw output.
pub fn command(
    program: &str,
    args: &[String],
    working_dir: Option<&Path>,
    env: &HashMap<String, String>,
) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }
    cmd
}

/// Map an exit status to a shell-style exit code (`128 + signal` when the
/// process was killed by a signal).
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

/// Send `signal` to a running child. No-op once the child has been reaped.
#[cfg(unix)]
pub fn send_signal(child: &mut Child, signal: i32) {
    let Some(pid) = child.id() else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions; the pid belongs to
    // a child we have not reaped yet, so it cannot have been recycled.
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc != 0 {
        debug!(pid, signal, error = %std::io::Error::last_os_error(), "kill failed");
    }
}

#[cfg(not(unix))]
pub fn send_signal(child: &mut Child, _signal: i32) {
    let _ = child.start_kill();
}

/// Ask a child to stop (SIGTERM), then kill it if it is still alive after
/// `grace`. Always reaps.
pub async fn terminate(child: &mut Child, name: &str, grace: Duration) {
    match child.try_wait() {
        Ok(Some(status)) => {
            debug!(%name, code = exit_code(status), "already exited");
            return;
        }
        Ok(None) => {}
        Err(e) => warn!(%name, error = %e, "failed to poll process"),
    }

    #[cfg(unix)]
    send_signal(child, libc::SIGTERM);
    #[cfg(not(unix))]
    send_signal(child, 15);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => info!(%name, code = exit_code(status), "stopped"),
        Ok(Err(e)) => warn!(%name, error = %e, "failed to wait for process"),
        Err(_) => {
            warn!(%name, grace_secs = grace.as_secs(), "did not stop in time, killing");
            if let Err(e) = child.kill().await {
                warn!(%name, error = %e, "kill failed");
            }
        }
    }
}

/// Termination signals the launcher forwards to the foreground handler.
#[cfg(unix)]
pub struct Signals {
    term: tokio::signal::unix::Signal,
    int: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    pub fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self {
            term: signal(SignalKind::terminate())?,
            int: signal(SignalKind::interrupt())?,
        })
    }

    /// Wait for the next SIGTERM or SIGINT and return its number.
    pub async fn recv(&mut self) -> i32 {
        tokio::select! {
            _ = self.term.recv() => libc::SIGTERM,
            _ = self.int.recv() => libc::SIGINT,
        }
    }
}

#[cfg(not(unix))]
pub struct Signals;

#[cfg(not(unix))]
impl Signals {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self)
    }

    pub async fn recv(&mut self) -> i32 {
        let _ = tokio::signal::ctrl_c().await;
        2
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        command(
            "sh",
            &["-c".to_string(), script.to_string()],
            None,
            &HashMap::new(),
        )
    }

    #[tokio::test]
    async fn exit_code_plain() {
        let status = sh("exit 5").status().await.unwrap();
        assert_eq!(exit_code(status), 5);
    }

    #[tokio::test]
    async fn exit_code_from_signal() {
        let status = sh("kill -TERM $$").status().await.unwrap();
        assert_eq!(exit_code(status), 128 + libc::SIGTERM);
    }

    #[tokio::test]
    async fn terminate_stops_sleeping_child() {
        let mut child = sh("sleep 30").spawn().unwrap();
        let started = std::time::Instant::now();
        terminate(&mut child, "sleeper", Duration::from_secs(5)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn terminate_kills_child_ignoring_sigterm() {
        let mut child = sh("trap '' TERM; sleep 30").spawn().unwrap();
        // Give the shell a moment to install its trap.
        tokio::time::sleep(Duration::from_millis(100)).await;
        terminate(&mut child, "stubborn", Duration::from_millis(200)).await;
        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn env_is_passed_through() {
        let mut env = HashMap::new();
        env.insert("WORKER_TEST_VALUE".to_string(), "42".to_string());
        let status = command(
            "sh",
            &["-c".to_string(), "test \"$WORKER_TEST_VALUE\" = 42".to_string()],
            None,
            &env,
        )
        .status()
        .await
        .unwrap();
        assert!(status.success());
    }
}
