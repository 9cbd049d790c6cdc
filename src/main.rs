//! wg-console main entry point
//!
//! This binary hosts the control plane: CLI parsing, logging setup, startup
//! reconciliation and the administrative HTTP server.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use wg_console::{
    config::Settings,
    firewall::{AccessController, SystemFirewall},
    http::{router, AppState},
    manager::PeerManager,
    reconcile::Reconciler,
    registry::{PeerStatus, Registry},
    telemetry::{unix_now, ObserverHub, Poller},
    wireguard::{ConfigStore, WgBackend, WgTool},
    APP_NAME, VERSION,
};

/// Control plane for a self-hosted WireGuard VPN
#[derive(Parser, Debug)]
#[command(name = APP_NAME, version = VERSION, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Optional settings file (environment variables win)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the control plane daemon
    Serve,

    /// Force one registry -> file -> kernel convergence pass and exit
    Reconcile,

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize structured logging with tracing
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

struct Components {
    state: AppState,
    firewall: Arc<dyn AccessController>,
}

/// Wire up every shared component from the settings
async fn build(settings: Settings) -> anyhow::Result<Components> {
    // The registry is the authoritative plane: without it nothing else may
    // start.
    let registry = Registry::open_with_retry(&settings.registry_path, 5).await?;

    let kernel: Arc<dyn WgBackend> = Arc::new(WgTool::new(settings.interface.clone()));
    let store = Arc::new(ConfigStore::new(settings.config_path.clone()));
    let firewall: Arc<dyn AccessController> = Arc::new(SystemFirewall::new(
        settings.interface.clone(),
        settings.subnet,
        settings.server_address(),
    ));

    let manager = Arc::new(PeerManager::new(
        store.clone(),
        kernel.clone(),
        registry.clone(),
        firewall.clone(),
        settings.clone(),
    ));
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        kernel.clone(),
        registry.clone(),
    ));
    let hub = Arc::new(ObserverHub::new());

    Ok(Components {
        state: AppState {
            registry,
            manager,
            reconciler,
            kernel,
            hub,
            settings: Arc::new(settings),
        },
        firewall,
    })
}

/// Run the CLI command
async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve => {
            info!("Starting {} v{}", APP_NAME, VERSION);
            let settings = Settings::load(cli.config.as_deref())?;
            if settings.session_secret.is_empty() {
                warn!("SESSION_SECRET is not set; the admin surface will reject every request");
            }

            let components = build(settings).await?;
            let state = components.state;
            let firewall = components.firewall;
            let settings = state.settings.clone();

            // Admin bootstrap, first boot only.
            if let Some(hash) = &settings.admin_password_hash {
                state.registry.ensure_admin(&settings.admin_user, hash)?;
            }

            // Force convergence before accepting any administrative action.
            match state.reconciler.run().await {
                Ok(report) => info!(
                    "Startup reconciliation: {} zombies purged, {} peers enforced",
                    report.zombies_purged, report.peers_enforced
                ),
                Err(e) => warn!("Startup reconciliation failed: {}", e),
            }

            // Global filter invariants, then one ACL pass per peer.
            if let Err(e) = firewall.init_global().await {
                warn!("Firewall initialization failed: {}", e);
            }
            let peers = state.registry.list_peers()?;
            for peer in &peers {
                if peer.status == PeerStatus::Active {
                    if let Err(e) = firewall.apply(peer.address, peer.acl_profile).await {
                        warn!("ACL replay failed for '{}': {}", peer.handle, e);
                    }
                }
            }
            info!("Applied ACLs for {} peers", peers.len());

            // Sessions left open by the previous run are stale by definition.
            let closed = state.registry.close_stale_sessions(unix_now())?;
            if closed > 0 {
                info!("Closed {} stale sessions from previous run", closed);
            }

            // Telemetry poller.
            let poller = Poller::new(
                state.registry.clone(),
                state.kernel.clone(),
                state.hub.clone(),
                &settings,
            );
            let poller_handle = tokio::spawn(poller.run());

            // HTTP surface with graceful shutdown.
            let app = router(state);
            info!("Listening on {}", settings.listen_addr);
            let listener = tokio::net::TcpListener::bind(settings.listen_addr).await?;
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await?;

            info!("Shutting down");
            poller_handle.abort();
            Ok(())
        }
        Commands::Reconcile => {
            let settings = Settings::load(cli.config.as_deref())?;
            let components = build(settings).await?;
            let report = components.state.reconciler.run().await?;
            println!(
                "Reconciled: {} zombies purged, {} peers enforced, file rewritten: {}",
                report.zombies_purged, report.peers_enforced, report.file_rewritten
            );
            Ok(())
        }
        Commands::Version => {
            println!("{} v{}", APP_NAME, VERSION);
            Ok(())
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
