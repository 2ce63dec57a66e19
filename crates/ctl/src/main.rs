use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

#[derive(Parser, Debug)]
#[command(name = "dispatchctl", version, about = "Operator CLI for the dispatch queue")]
struct Args {
    /// Daemon base URL.
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    daemon: String,

    /// Bearer credential (service-role secret or personal access token).
    #[arg(long, env = "DISPATCH_TOKEN")]
    token: String,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Queue a new task.
    Create {
        #[arg(long)]
        task_type: String,
        #[arg(long)]
        project_id: String,
        /// Inline JSON params.
        #[arg(long, default_value = "{}")]
        params: String,
        #[arg(long)]
        dependant_on: Option<String>,
        #[arg(long)]
        task_id: Option<String>,
    },
    /// Fetch a task's status and output location.
    Get {
        #[arg(long)]
        task_id: String,
    },
    /// Cancel a task (cascades to its orchestrator group).
    Cancel {
        #[arg(long)]
        task_id: String,
    },
    /// Count currently claimable tasks for this credential.
    Count {
        #[arg(long)]
        run_type: Option<String>,
        #[arg(long)]
        include_active: bool,
    },
    /// Explain why candidates are not claimable.
    Explain {
        #[arg(long)]
        run_type: Option<String>,
        #[arg(long)]
        include_active: bool,
    },
    /// Recent-task summary: distributions, timings, recent errors.
    Recent {
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        task_type: Option<String>,
        #[arg(long)]
        hours: Option<u32>,
    },
    /// Service-role provisioning.
    Admin {
        #[command(subcommand)]
        admin: AdminCmd,
    },
}

#[derive(Subcommand, Debug)]
enum AdminCmd {
    User {
        #[arg(long, default_value_t = 0.0)]
        credits: f64,
        #[arg(long)]
        user_id: Option<String>,
        #[arg(long)]
        allow_local: Option<bool>,
        #[arg(long)]
        allow_cloud: Option<bool>,
    },
    Project {
        #[arg(long)]
        user_id: String,
        #[arg(long)]
        project_id: Option<String>,
        #[arg(long)]
        name: Option<String>,
    },
    Token {
        #[arg(long)]
        user_id: String,
        #[arg(long)]
        label: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let client = reqwest::Client::new();

    let (path, body) = match &args.cmd {
        Cmd::Create {
            task_type,
            project_id,
            params,
            dependant_on,
            task_id,
        } => {
            let params: Value =
                serde_json::from_str(params).context("parsing --params as JSON")?;
            (
                "/v1/tasks/create",
                json!({
                    "task_type": task_type,
                    "project_id": project_id,
                    "params": params,
                    "dependant_on": dependant_on,
                    "task_id": task_id,
                }),
            )
        }
        Cmd::Get { task_id } => ("/v1/tasks/output", json!({ "task_id": task_id })),
        Cmd::Cancel { task_id } => (
            "/v1/tasks/status",
            json!({ "task_id": task_id, "status": "Cancelled" }),
        ),
        Cmd::Count {
            run_type,
            include_active,
        } => (
            "/v1/tasks/claim",
            json!({ "dry_run": true, "run_type": run_type, "include_active": include_active }),
        ),
        Cmd::Explain {
            run_type,
            include_active,
        } => (
            "/v1/tasks/explain",
            json!({ "run_type": run_type, "include_active": include_active }),
        ),
        Cmd::Recent {
            limit,
            status,
            task_type,
            hours,
        } => (
            "/v1/tasks/recent",
            json!({ "limit": limit, "status": status, "task_type": task_type, "hours": hours }),
        ),
        Cmd::Admin { admin } => match admin {
            AdminCmd::User {
                credits,
                user_id,
                allow_local,
                allow_cloud,
            } => (
                "/v1/admin/users",
                json!({
                    "credits": credits,
                    "user_id": user_id,
                    "allow_local_processing": allow_local,
                    "allow_cloud_processing": allow_cloud,
                }),
            ),
            AdminCmd::Project {
                user_id,
                project_id,
                name,
            } => (
                "/v1/admin/projects",
                json!({ "user_id": user_id, "project_id": project_id, "name": name }),
            ),
            AdminCmd::Token { user_id, label } => (
                "/v1/admin/tokens",
                json!({ "user_id": user_id, "label": label }),
            ),
        },
    };

    let resp = post(&client, &args.daemon, &args.token, path, body).await?;
    println!("{}", serde_json::to_string_pretty(&resp)?);
    Ok(())
}

async fn post(
    client: &reqwest::Client,
    daemon: &str,
    token: &str,
    path: &str,
    body: Value,
) -> Result<Value> {
    let url = format!("{}{}", daemon.trim_end_matches('/'), path);
    let resp = client
        .post(url)
        .bearer_auth(token)
        .json(&body)
        .send()
        .await
        .context("request")?;

    let status = resp.status();
    if status == reqwest::StatusCode::NO_CONTENT {
        return Ok(json!({ "available": false }));
    }
    let value: Value = resp.json().await.context("decoding response")?;
    if !status.is_success() {
        bail!("{status}: {value}");
    }
    Ok(value)
}
