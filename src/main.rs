use clap::Parser;
use context_runtime::cli::{Cli, Commands};
use context_runtime::{transport, Config, Runtime};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Config::from_env();

    let runtime = match Runtime::new(config) {
        Ok(runtime) => Arc::new(runtime),
        Err(err) => {
            error!("failed to start: {err}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Some(Commands::Serve { host, port }) => run_serve(runtime, host, port).await,
        Some(Commands::Tick) => run_tick(runtime).await,
        Some(Commands::Mcp) | None => run_mcp(runtime).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run_mcp(runtime: Arc<Runtime>) -> anyhow::Result<()> {
    info!("serving the stdio tool-call surface");
    transport::mcp::run(runtime).await?;
    Ok(())
}

async fn run_tick(runtime: Arc<Runtime>) -> anyhow::Result<()> {
    let report = runtime.tick().await;
    info!(
        "tick complete: {} kinds auto-executed, {} enqueued, {} skipped",
        report.auto_executed.len(),
        report.enqueued,
        report.skipped_protected
    );
    Ok(())
}

async fn run_serve(runtime: Arc<Runtime>, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let host = host.unwrap_or_else(|| runtime.config.rest_host.clone());
    let port = port.unwrap_or(runtime.config.rest_port);

    let ticker = transport::rest::spawn_ticker(runtime.clone());
    let router = transport::rest::router(runtime);

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("REST API listening on http://{addr}");

    axum::serve(listener, router)
        .with_graceful_shutdown(transport::rest::shutdown_signal(ticker))
        .await?;

    Ok(())
}
