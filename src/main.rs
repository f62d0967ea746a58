//! Entry point: parses CLI flags, wires the Store/Hub/Analyzer/Proxy/
//! Supervisor/control-surface collaborators together, and owns the single
//! cancellation context for the tool's lifetime.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use a2a_trace::analyzer::Analyzer;
use a2a_trace::cli::Cli;
use a2a_trace::control::{self, ControlState};
use a2a_trace::hub::Hub;
use a2a_trace::model::TraceStatus;
use a2a_trace::proxy::Proxy;
use a2a_trace::store::memory::InMemoryStore;
use a2a_trace::store::sqlite::SqliteStore;
use a2a_trace::store::Store;
use a2a_trace::supervisor::Supervisor;

/// Shutdown grace window for the control-surface listener.
const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // hyper-rustls needs an explicit default crypto provider since rustls 0.23.
    let _ = rustls::crypto::ring::default_provider().install_default();

    if let Err(e) = run(cli).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let store: Arc<dyn Store> = if cli.db.is_empty() {
        Arc::new(InMemoryStore::new())
    } else {
        Arc::new(SqliteStore::open(&cli.db).context("failed to open --db store")?)
    };

    let trace = store
        .create_trace(cli.command.join(" "))
        .await
        .context("failed to create trace")?;
    info!("trace {} started: {}", trace.id, trace.command);

    let hub = Arc::new(Hub::new());
    let analyzer = Arc::new(Analyzer::spawn(store.clone(), hub.clone(), trace.id.clone()));
    let proxy = Proxy::new(store.clone(), hub.clone(), analyzer.handle(), trace.id.clone());

    let shutdown = CancellationToken::new();

    let proxy_task = {
        let proxy = proxy.clone();
        let shutdown = shutdown.clone();
        let port = cli.port;
        tokio::spawn(async move {
            if let Err(e) = proxy.run(port, shutdown).await {
                error!("proxy failed: {e}");
            }
        })
    };

    let control_task = if cli.no_ui {
        None
    } else {
        let state = Arc::new(ControlState {
            store: store.clone(),
            hub: hub.clone(),
            analyzer: analyzer.clone(),
            trace_id: trace.id.clone(),
        });
        let router = control::router(state);
        let ui_port = cli.ui_port();
        let shutdown = shutdown.clone();
        let addr = std::net::SocketAddr::from(([127, 0, 0, 1], ui_port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind control surface on {addr}"))?;
        info!("control surface listening on {addr}");
        Some(tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                error!("control surface failed: {e}");
            }
        }))
    };

    let supervisor = Arc::new(Supervisor::new());
    supervisor
        .start(&cli.command, cli.port)
        .await
        .context("failed to spawn child process")?;

    let exit_code = tokio::select! {
        code = supervisor.wait() => {
            code.unwrap_or(1)
        }
        _ = terminate_signal() => {
            info!("received interrupt, stopping child");
            supervisor.stop(SHUTDOWN_GRACE).await;
            130
        }
    };

    let status = if exit_code == 0 {
        TraceStatus::Completed
    } else {
        TraceStatus::Error
    };
    if let Err(e) = store.update_trace_status(&trace.id, status).await {
        error!("failed to update trace status: {e}");
    }
    hub.broadcast_trace_status(status).await;

    shutdown.cancel();
    let _ = proxy_task.await;
    if let Some(control_task) = control_task {
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, control_task).await;
    }

    std::process::exit(exit_code);
}

/// Resolves once on Ctrl-C or, on unix, a `SIGTERM` — whichever fires first.
async fn terminate_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
