use std::path::Path;

use anyhow::Context;
use tracing::{info, warn};
use worker_core::WorkerConfig;
use worker_health::http_probe;
use worker_launch::{LaunchError, Launcher};

fn load_config(path: Option<&Path>) -> anyhow::Result<WorkerConfig> {
    let config = WorkerConfig::load(path).with_context(|| match path {
        Some(p) => format!("failed to load config {}", p.display()),
        None => "invalid default config".to_string(),
    })?;
    Ok(config)
}

/// Run the server and handler pair; returns the handler's exit code.
pub async fn launch(path: Option<&Path>) -> anyhow::Result<i32> {
    let config = load_config(path)?;
    info!(
        server = %config.server.address(),
        endpoint = %config.readiness.endpoint,
        max_wait = %config.readiness.max_wait,
        "starting worker"
    );

    let code = match Launcher::new(config).run().await {
        Ok(code) => code,
        Err(e @ LaunchError::Interrupted { .. }) => {
            warn!(error = %e, "stopped during startup");
            e.exit_code()
        }
        Err(e) => return Err(e).context("worker failed to start"),
    };
    info!(code, "worker finished");
    Ok(code)
}

pub async fn probe(path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let address = config.server.address();
    let endpoint = &config.readiness.endpoint;

    let result = http_probe(&address, endpoint, config.readiness.probe_timeout.as_duration()).await;
    if !result.is_ready() {
        anyhow::bail!("http://{address}{endpoint}: {result:?}");
    }
    println!("✓ http://{address}{endpoint} is ready");
    Ok(())
}

pub fn print_config(path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(path)?;
    print!("{}", config.to_toml_string()?);
    Ok(())
}
