use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use taskroute::gateway::http::router;
use taskroute::gateway::{Dispatcher, GatewayConfig, GatewayHttpState, HttpUpstream};
use taskroute::Env;

#[derive(Parser)]
#[command(author, version, about = "Routes analysis tasks to inference models", long_about = None)]
struct Args {
    /// Config file (.toml or .json). Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Dotenv file whose values take precedence over the process environment
    #[arg(long)]
    dotenv: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, env = "TASKROUTE_LISTEN", default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    taskroute::logging::init_tracing(args.json_logs)?;

    let mut config = match &args.config {
        Some(path) => GatewayConfig::from_path(path)?,
        None => GatewayConfig::default(),
    };
    let env = match &args.dotenv {
        Some(path) => Env::process().with_dotenv_file(path)?,
        None => Env::process(),
    };
    config.apply_env(&env)?;
    let credential = config.resolve_credential(&env)?;

    let upstream = Arc::new(HttpUpstream::new()?);
    let dispatcher = Dispatcher::from_config(&config, upstream, credential)?;
    for route in dispatcher.routes().snapshot() {
        tracing::info!(
            task = %route.task,
            model = %route.model,
            temperature = route.temperature,
            timeout_secs = route.timeout.as_secs(),
            max_retries = route.max_retries,
            "route"
        );
    }

    let state = GatewayHttpState::new(dispatcher).with_paths(config.http.clone());
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    tracing::info!(listen = %args.listen, "taskroute-gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
