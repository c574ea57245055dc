use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use gradebox::backend::{DockerBackend, ExecutionBackend};
use gradebox::config::{CliArgs, Config};
use gradebox::controller::Controller;
use gradebox::relay::{LogLine, LogSource};

/// How long output already in flight may keep printing after the job ends
const OUTPUT_GRACE: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let Config {
        backend: backend_config,
        sandbox: sandbox_config,
        job: job_config,
    } = cli.to_config()?;
    let job = job_config.to_job()?;

    let backend: Arc<dyn ExecutionBackend> = Arc::new(
        DockerBackend::connect(&backend_config)
            .await
            .context("Failed to set up docker client")?,
    );
    let controller = Controller::new(Arc::clone(&backend), sandbox_config);
    let shutdown_token = CancellationToken::new();

    // ======= PREPARATION END, EXECUTION START =======

    let (lines_tx, lines_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_lines(lines_rx));

    let ctrl_c = {
        let token = shutdown_token.clone();
        let job_id = job.id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("Ctrl-c received, cancelling job {job_id}...");
                token.cancel();
            }
        })
    };

    // Cancellation still goes through cleanup inside the controller
    let report = controller.run(&job, lines_tx, shutdown_token).await;
    ctrl_c.abort();

    // ===== EXECUTION END, REPORTING ======

    if tokio::time::timeout(OUTPUT_GRACE, printer).await.is_err() {
        log::debug!("Log printer still busy after {OUTPUT_GRACE:?}, dropping remaining output");
    }

    if cli.list {
        list_sandboxes(backend.as_ref()).await;
    }
    if cli.prune {
        match backend.prune().await {
            Ok(pruned) if pruned.is_empty() => log::info!("No stopped sandboxes to prune"),
            Ok(pruned) => {
                let ids: Vec<&str> = pruned.iter().map(|h| h.as_str()).collect();
                log::info!("Pruned sandboxes: {}", ids.join(", "));
            }
            Err(e) => log::error!("Failed to prune sandboxes: {e}"),
        }
    }

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        log::info!(
            "Job {} outcome: {:?}, cleanup: {}",
            report.job_id,
            report.outcome,
            if report.cleanup.leaked() { "leaked" } else { "clean" }
        );
    }

    std::process::exit(report.exit_code());
}

/// Writes sandbox output through as-is, stderr lines to stderr
async fn print_lines(mut lines: mpsc::UnboundedReceiver<LogLine>) {
    while let Some(line) = lines.recv().await {
        let result = match line.source {
            LogSource::Stdout => {
                let mut out = std::io::stdout().lock();
                out.write_all(&line.payload).and_then(|_| out.flush())
            }
            LogSource::Stderr => {
                let mut err = std::io::stderr().lock();
                err.write_all(&line.payload).and_then(|_| err.flush())
            }
        };
        if let Err(e) = result {
            log::warn!("Failed to write sandbox output: {e}");
            break;
        }
    }
}

async fn list_sandboxes(backend: &dyn ExecutionBackend) {
    match backend.list().await {
        Ok(sandboxes) if sandboxes.is_empty() => log::info!("There are no sandboxes on the backend"),
        Ok(sandboxes) => {
            for sandbox in sandboxes {
                log::info!(
                    "Sandbox {} image={} state={} managed={}",
                    sandbox.handle.as_str(),
                    sandbox.image.as_deref().unwrap_or("-"),
                    sandbox.state.as_deref().unwrap_or("-"),
                    sandbox.managed
                );
            }
        }
        Err(e) => log::error!("Failed to list sandboxes: {e}"),
    }
}
