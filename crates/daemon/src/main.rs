use clap::Parser;
use dispatch_daemon::{api, config::DaemonConfig, db::Db};
use std::net::SocketAddr;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "dispatch-daemon", version, about = "Task queue daemon for media generation workers")]
struct Cli {
    /// Where the HTTP API will listen, e.g. 127.0.0.1:8080
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: String,

    /// SurrealDB endpoint for the embedded store.
    #[arg(long, default_value = "surrealkv://.dispatch/db")]
    db_url: String,

    #[arg(long, default_value = "dispatch")]
    ns: String,

    #[arg(long, default_value = "main")]
    db: String,

    /// Shared secret authenticating the cloud worker fleet.
    #[arg(long, env = "DISPATCH_SERVICE_ROLE_SECRET")]
    service_role_secret: String,

    /// HMAC secret for JWT role-claim verification (optional).
    #[arg(long, env = "DISPATCH_JWT_SECRET")]
    jwt_secret: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_target(false)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = DaemonConfig {
        listen: cli.listen,
        db_url: cli.db_url,
        ns: cli.ns,
        db: cli.db,
        service_role_secret: cli.service_role_secret,
        jwt_secret: cli.jwt_secret,
    };

    let db = Db::connect(&config).await?;
    db.bootstrap_schema().await?;

    let addr: SocketAddr = config.listen.parse()?;
    let app = api::router(api::AppState::new(db, config));

    info!("listening on http://{}", addr);
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    info!("shutdown requested");
}
