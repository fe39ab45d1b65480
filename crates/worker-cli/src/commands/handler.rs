use std::path::Path;

use anyhow::Context;
use tracing::info;
use worker_handler::{
    HandlerSettings, JobHandler, JobSource, LocalJobSource, R2Store, RunpodEndpoints,
    RunpodJobSource, run_worker,
};

const LOCAL_TEST_FILE: &str = "test_input.json";

pub async fn handler(test_input: Option<&str>) -> anyhow::Result<()> {
    info!("handler loaded");

    let settings = HandlerSettings::from_env();
    info!(
        comfy_url = %settings.comfy_url,
        workflow = %settings.workflow_path.display(),
        "handler settings"
    );

    let handler = JobHandler::connect(settings)
        .await
        .context("failed to build HTTP client")?;

    if let Some(text) = test_input {
        let source = LocalJobSource::from_json(text).context("--test-input")?;
        return serve(&handler, source).await;
    }

    let local_file = Path::new(LOCAL_TEST_FILE);
    if local_file.is_file() {
        info!(path = %local_file.display(), "running local test job");
        let source = LocalJobSource::from_file(local_file)?;
        return serve(&handler, source).await;
    }

    let endpoints = RunpodEndpoints::from_env()
        .context("not running under the serverless platform; pass --test-input for a local run")?;
    info!(worker_id = %endpoints.worker_id, "connected to job queue");
    let source = RunpodJobSource::new(endpoints).context("failed to build HTTP client")?;
    serve(&handler, source).await
}

async fn serve<J: JobSource>(handler: &JobHandler<R2Store>, source: J) -> anyhow::Result<()> {
    tokio::select! {
        result = run_worker(handler, source) => {
            let completed = result?;
            info!(completed, "job source exhausted");
        }
        signal = shutdown_signal() => {
            info!(signal, "shutting down");
        }
    }
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};
    let (Ok(mut term), Ok(mut int)) = (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) else {
        std::future::pending::<()>().await;
        return "none";
    };
    tokio::select! {
        _ = term.recv() => "SIGTERM",
        _ = int.recv() => "SIGINT",
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "ctrl-c"
}
