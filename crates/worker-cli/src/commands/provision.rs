use std::path::Path;

use anyhow::Context;
use worker_core::Manifest;
use worker_provision::{Provisioner, SystemRunner, plan};

fn load_manifest(path: &Path, root: Option<&Path>) -> anyhow::Result<Manifest> {
    let mut manifest = Manifest::from_file(path)
        .with_context(|| format!("failed to load manifest {}", path.display()))?;
    if let Some(root) = root {
        manifest.framework.root = root.to_path_buf();
    }
    Ok(manifest)
}

pub async fn provision(path: &Path, root: Option<&Path>, dry_run: bool) -> anyhow::Result<()> {
    let manifest = load_manifest(path, root)?;

    if dry_run {
        let steps = plan(&manifest);
        println!("{} steps (root: {})", steps.len(), manifest.framework.root.display());
        for (i, step) in steps.iter().enumerate() {
            println!("{:>4}. {step}", i + 1);
        }
        return Ok(());
    }

    let report = Provisioner::new(SystemRunner)
        .run(&manifest)
        .await
        .context("image build failed")?;

    println!(
        "✓ Installed {} packages, {} plugins, {} models ({:.1} GB), {} files",
        report.packages.len(),
        report.plugins.len(),
        report.models.len(),
        report.total_model_bytes() as f64 / 1_073_741_824.0,
        report.files.len(),
    );
    for model in &report.models {
        println!("  {}  {}", model.sha256, model.path.display());
    }
    Ok(())
}

pub fn verify(path: &Path, root: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let manifest = load_manifest(path, root)?;
    let report = worker_provision::verify(&manifest);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if report.is_ok() {
        println!("✓ {} entries verified", report.checked);
    } else {
        for problem in &report.problems {
            println!("✗ {problem}");
        }
    }

    if !report.is_ok() {
        anyhow::bail!(
            "{} of {} entries failed verification",
            report.problems.len(),
            report.checked
        );
    }
    Ok(())
}
