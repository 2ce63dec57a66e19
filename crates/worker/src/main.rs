use anyhow::{bail, Context, Result};
use clap::Parser;
use dispatch_core::api::{ClaimRequest, ClaimResponse, UpdateStatusRequest};
use dispatch_core::model::TaskStatus;
use reqwest::{Client, StatusCode};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dispatch-worker", version, about = "Polling worker for the dispatch queue")]
struct Cli {
    /// Daemon base URL, e.g. http://127.0.0.1:8080
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    daemon_url: String,

    /// Bearer credential: the service-role secret (cloud fleet) or a
    /// personal access token (local machine).
    #[arg(long, env = "DISPATCH_TOKEN")]
    token: String,

    /// Stable worker identifier. If omitted, a random UUID is used.
    #[arg(long)]
    worker_id: Option<String>,

    /// Poll interval when no task is available.
    #[arg(long, default_value_t = 2)]
    poll_interval_seconds: u64,

    /// Only claim tasks of this type.
    #[arg(long)]
    run_type: Option<String>,

    /// Program handed each claimed task. It receives the claim JSON on stdin
    /// and prints the output location as its last stdout line. Without it,
    /// the worker simulates processing.
    #[arg(long)]
    exec: Option<String>,

    /// Simulated processing time when --exec is not given.
    #[arg(long, default_value_t = 1)]
    simulate_seconds: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let worker_id = cli
        .worker_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let client = Client::new();

    info!("worker_id={worker_id} starting; daemon={}", cli.daemon_url);

    loop {
        let task = match claim(&client, &cli, &worker_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                sleep(Duration::from_secs(cli.poll_interval_seconds)).await;
                continue;
            }
            Err(e) => {
                // Transient daemon trouble; back off and retry.
                warn!("claim error: {e:?}");
                sleep(Duration::from_secs(cli.poll_interval_seconds * 2)).await;
                continue;
            }
        };

        info!("claimed task {} ({})", task.task_id, task.task_type);
        match run_task(&cli, &task).await {
            Ok(output_location) => {
                report(
                    &client,
                    &cli,
                    &task.task_id,
                    TaskStatus::Complete,
                    Some(output_location),
                    None,
                )
                .await;
            }
            Err(e) => {
                warn!("task {} execution error: {e:?}", task.task_id);
                report(
                    &client,
                    &cli,
                    &task.task_id,
                    TaskStatus::Failed,
                    None,
                    Some(format!("{e:#}")),
                )
                .await;
            }
        }
    }
}

async fn claim(client: &Client, cli: &Cli, worker_id: &str) -> Result<Option<ClaimResponse>> {
    let req = ClaimRequest {
        worker_id: Some(worker_id.to_string()),
        run_type: cli.run_type.clone(),
        ..Default::default()
    };
    let resp = client
        .post(format!("{}/v1/tasks/claim", cli.daemon_url))
        .bearer_auth(&cli.token)
        .json(&req)
        .send()
        .await
        .context("claim request")?;

    match resp.status() {
        StatusCode::NO_CONTENT => Ok(None),
        // Bad credentials never fix themselves; stop instead of spinning.
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            bail!("daemon rejected credential ({}); fix the token and restart", resp.status())
        }
        s if s.is_success() => Ok(Some(resp.json().await.context("claim decode")?)),
        s => bail!("claim returned {s}"),
    }
}

/// Execute one task: hand it to the configured program, or simulate.
async fn run_task(cli: &Cli, task: &ClaimResponse) -> Result<String> {
    let Some(program) = &cli.exec else {
        sleep(Duration::from_secs(cli.simulate_seconds)).await;
        return Ok(format!("sim://{}", task.task_id));
    };

    let mut child = tokio::process::Command::new(program)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawning {program}"))?;

    let payload = serde_json::to_vec(task)?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(&payload).await.context("writing task to stdin")?;
    }

    let output = child.wait_with_output().await.context("waiting for tool")?;
    if !output.status.success() {
        bail!("{program} exited with {}", output.status);
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
        .with_context(|| format!("{program} printed no output location"))
}

/// Best-effort status report; the daemon treats retries as idempotent.
async fn report(
    client: &Client,
    cli: &Cli,
    task_id: &str,
    status: TaskStatus,
    output_location: Option<String>,
    error_message: Option<String>,
) {
    let req = UpdateStatusRequest {
        task_id: task_id.to_string(),
        status,
        output_location,
        error_message,
    };
    let res = client
        .post(format!("{}/v1/tasks/status", cli.daemon_url))
        .bearer_auth(&cli.token)
        .json(&req)
        .send()
        .await;
    match res {
        Ok(r) if !r.status().is_success() => {
            warn!("status report for {task_id} returned {}", r.status())
        }
        Ok(_) => {}
        Err(e) => warn!("status report for {task_id} failed: {e:?}"),
    }
}
