//! The two-process startup sequence.

use std::collections::HashMap;
use std::io;
use std::process::ExitStatus;

use thiserror::Error;
use tokio::process::Child;
use tracing::{error, info, warn};
use worker_core::WorkerConfig;
use worker_health::{ReadinessError, ReadinessPolicy, wait_until_ready};

use crate::process::{self, Signals, exit_code};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to start {role} `{program}`: {source}")]
    Spawn {
        role: &'static str,
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("GUI server exited before becoming ready (exit code: {code})")]
    ServerExited { code: i32 },

    #[error(transparent)]
    NotReady(#[from] ReadinessError),

    #[error("received signal {signal} before the GUI server became ready")]
    Interrupted { signal: i32 },

    #[error("failed to resolve current executable: {0}")]
    CurrentExe(#[source] io::Error),

    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] io::Error),

    #[error("failed waiting for {role}: {source}")]
    Wait {
        role: &'static str,
        #[source]
        source: io::Error,
    },
}

enum Event {
    HandlerExited(io::Result<ExitStatus>),
    ServerExited(io::Result<ExitStatus>),
    Signal(i32),
}

pub struct Launcher {
    config: WorkerConfig,
}

impl LaunchError {
    /// Process exit code for a launch that never reached the handler.
    pub fn exit_code(&self) -> i32 {
        match self {
            LaunchError::Interrupted { signal } => 128 + signal,
            _ => 1,
        }
    }
}

impl Launcher {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run the server + handler pair. Returns the handler's exit code.
    ///
    /// Errors are returned only for failures before the handler starts
    /// (spawn failure, server death, readiness timeout, termination signal).
    /// In every error case the server has already been terminated.
    pub async fn run(&self) -> Result<i32, LaunchError> {
        let server_cfg = &self.config.server;
        let address = server_cfg.address();
        let grace = self.config.shutdown.grace_period.as_duration();

        // Install before spawning anything so an early SIGTERM is not lost.
        let mut signals = Signals::install().map_err(LaunchError::Signals)?;

        // ── GUI server (background) ────────────────────────────────

        let mut server = process::command(
            &server_cfg.program,
            &server_cfg.command_args(),
            server_cfg.working_dir.as_deref(),
            &server_cfg.env,
        )
        .spawn()
        .map_err(|source| LaunchError::Spawn {
            role: "server",
            program: server_cfg.program.clone(),
            source,
        })?;
        info!(pid = server.id(), %address, program = %server_cfg.program, "GUI server started");

        // ── Readiness gate ─────────────────────────────────────────

        let policy = ReadinessPolicy::from(&self.config.readiness);
        let ready = tokio::select! {
            result = wait_until_ready(&address, &policy) => result.map_err(LaunchError::from),
            status = server.wait() => Err(match status {
                Ok(status) => LaunchError::ServerExited { code: exit_code(status) },
                Err(source) => LaunchError::Wait { role: "server", source },
            }),
            signal = signals.recv() => Err(LaunchError::Interrupted { signal }),
        };
        if let Err(e) = ready {
            error!(error = %e, "GUI server did not become ready");
            process::terminate(&mut server, "server", grace).await;
            return Err(e);
        }

        // ── Handler (foreground) ───────────────────────────────────

        let mut handler = match self.spawn_handler(&address) {
            Ok(child) => child,
            Err(e) => {
                process::terminate(&mut server, "server", grace).await;
                return Err(e);
            }
        };
        info!(pid = handler.id(), "handler started");

        let mut server_alive = true;
        let code = loop {
            let event = tokio::select! {
                status = handler.wait() => Event::HandlerExited(status),
                status = server.wait(), if server_alive => Event::ServerExited(status),
                signal = signals.recv() => Event::Signal(signal),
            };

            match event {
                Event::HandlerExited(Ok(status)) => {
                    let code = exit_code(status);
                    info!(code, "handler exited");
                    break code;
                }
                Event::HandlerExited(Err(e)) => {
                    error!(error = %e, "failed waiting for handler");
                    break 1;
                }
                Event::ServerExited(status) => {
                    server_alive = false;
                    match status {
                        Ok(status) => error!(
                            code = exit_code(status),
                            "GUI server exited while the handler is running"
                        ),
                        Err(e) => error!(error = %e, "failed waiting for GUI server"),
                    }
                }
                Event::Signal(signal) => {
                    warn!(signal, "forwarding signal to handler");
                    process::send_signal(&mut handler, signal);
                }
            }
        };

        if server_alive {
            process::terminate(&mut server, "server", grace).await;
        }

        Ok(code)
    }

    fn spawn_handler(&self, address: &str) -> Result<Child, LaunchError> {
        let cfg = &self.config.handler;
        let program = match &cfg.program {
            Some(program) => program.clone(),
            None => std::env::current_exe()
                .map_err(LaunchError::CurrentExe)?
                .to_string_lossy()
                .into_owned(),
        };

        let env = handler_env(&cfg.env, address, std::env::var_os("COMFY_URL").is_some());

        process::command(&program, &cfg.args, None, &env)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                role: "handler",
                program,
                source,
            })
    }
}

/// Handler environment: configured vars plus `COMFY_URL` pointing at the
/// server, unless it is already set explicitly.
fn handler_env(
    configured: &HashMap<String, String>,
    address: &str,
    inherited_comfy_url: bool,
) -> HashMap<String, String> {
    let mut env = configured.clone();
    if !inherited_comfy_url && !env.contains_key("COMFY_URL") {
        env.insert("COMFY_URL".to_string(), format!("http://{address}"));
    }
    env
}
