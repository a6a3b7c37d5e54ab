// ABOUTME: Supervisor entry point: flag parsing, wiring, and the ordered
// ABOUTME: shutdown sequence (resign, close sessions, stop postgres, exit)

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pgwarden_api::{admin_routes, AdminState};
use pgwarden_core::{Identity, PgConfig, RetryPolicy, StopMode};
use pgwarden_daemon::Daemon;
use pgwarden_dcs::{Dcs, DcsConfig, DcsProxy, EtcdDcs};
use pgwarden_postmaster::Postmaster;

const POSTGRES_PORT: u16 = 5432;
const REPLICATION_USERNAME: &str = "replicator";

#[derive(Parser, Debug)]
#[command(name = "pgwarden", about = "High-availability supervisor for PostgreSQL")]
struct Args {
    /// PostgreSQL data directory
    #[arg(long = "pgdata", env = "PGDATA")]
    pgdata: PathBuf,

    /// Directory for generated config and password files
    #[arg(long = "pgextra", env = "PGEXTRA")]
    pgextra: PathBuf,

    /// Admin username
    #[arg(long = "pguser", env = "PGUSER", default_value = "postgres")]
    pguser: String,

    /// Admin password
    #[arg(long = "pgpassword", env = "PGPASSWORD")]
    pgpassword: String,

    /// Password for the replication user (user is fixed to `replicator`)
    #[arg(long = "pgreplication-user-password", env = "PGREPLICATION_PASSWORD")]
    pgreplication_user_password: String,

    /// Externally reachable hostname of this PostgreSQL server
    #[arg(long = "hostname", env = "HOSTNAME")]
    hostname: String,

    /// Space-separated etcd endpoints
    #[arg(long = "etcd-cluster", env = "ETCD_CLUSTER")]
    etcd_cluster: String,

    /// Cluster prefix in the consensus store
    #[arg(long = "cluster-name", env = "CLUSTER_NAME", default_value = "main")]
    cluster_name: String,

    /// Election session TTL in seconds; also the reconciliation tick
    #[arg(long = "leader-lease", env = "LEADER_LEASE", default_value_t = 10)]
    leader_lease: i64,

    /// Admin HTTP port
    #[arg(long = "admin-port", env = "ADMIN_PORT", default_value_t = 8080)]
    admin_port: u16,

    /// info | debug | warning
    #[arg(long = "log-level", env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn init_tracing(level: &str) {
    let default = match level {
        "debug" => "debug",
        "warning" => "warn",
        _ => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, initiating graceful shutdown"),
        _ = terminate => tracing::info!("Received SIGTERM, initiating graceful shutdown"),
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(&args.log_level);

    match run(args).await {
        Ok(()) => {
            tracing::info!("Graceful shutdown complete");
        }
        Err(e) => {
            tracing::error!("supervisor failed: {:#}", e);
            std::process::exit(1);
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let identity = Identity::generate(&args.hostname);
    tracing::info!(
        instance_id = %identity.instance_id,
        hostname = %identity.hostname,
        cluster = %args.cluster_name,
        "Starting pgwarden"
    );

    let cancel = CancellationToken::new();

    let pg_config = PgConfig {
        data_dir: args.pgdata.clone(),
        extra_dir: args.pgextra.clone(),
        admin_username: args.pguser.clone(),
        admin_password: args.pgpassword.clone(),
        replication_username: REPLICATION_USERNAME.to_string(),
        replication_password: args.pgreplication_user_password.clone(),
        hostname: args.hostname.clone(),
        port: POSTGRES_PORT,
    };
    let postmaster = Arc::new(Postmaster::new(
        pg_config,
        identity.instance_id.clone(),
        cancel.clone(),
    ));

    // Connect to the consensus store, retrying: at cold boot etcd may come
    // up after us.
    let endpoints: Vec<String> = args
        .etcd_cluster
        .split_whitespace()
        .map(str::to_string)
        .collect();
    anyhow::ensure!(!endpoints.is_empty(), "--etcd-cluster must name at least one endpoint");

    let mut dcs_config = DcsConfig::new(endpoints, &args.cluster_name);
    dcs_config.election_ttl_secs = args.leader_lease;

    let connect_retry = RetryPolicy::dcs();
    let dcs = connect_retry
        .run(&cancel, || {
            EtcdDcs::connect(dcs_config.clone(), identity.clone(), &cancel)
        })
        .await
        .context("connecting to the consensus store")?;
    let dcs = Arc::new(dcs);

    dcs.register()
        .await
        .context("registering instance in the consensus store")?;
    dcs.campaign().await;
    tracing::info!("✔︎ Registered and campaigning");

    let proxy = Arc::new(DcsProxy::new(
        dcs.clone(),
        postmaster.clone(),
        RetryPolicy::dcs(),
        cancel.clone(),
    ));

    let daemon = Daemon::new(
        proxy.clone(),
        postmaster.clone(),
        identity.clone(),
        Duration::from_secs(args.leader_lease.max(1) as u64),
        cancel.clone(),
    );

    let tracker = TaskTracker::new();
    let mut daemon_handle = tracker.spawn(async move { daemon.run().await });

    // Admin HTTP surface.
    let admin_state = AdminState {
        proxy: proxy.clone(),
        postmaster: postmaster.clone(),
        shutdown: cancel.clone(),
    };
    let app = admin_routes(admin_state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], args.admin_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding admin endpoint on {}", addr))?;
    tracing::info!("✔︎ Admin endpoint on {}", addr);

    let server_cancel = cancel.clone();
    let _ = tracker.spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("admin server error: {}", e);
        }
    });
    tracker.close();

    // Run until a signal, an admin shutdown, or a daemon abort.
    let daemon_result = tokio::select! {
        _ = wait_for_shutdown_signal() => Ok(()),
        _ = cancel.cancelled() => {
            tracing::info!("Shutdown requested");
            Ok(())
        }
        joined = &mut daemon_handle => match joined {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("daemon task panicked: {}", e);
                Ok(())
            }
        }
    };

    // Ordered shutdown: stop ticking, give up the election, close both
    // sessions, then stop postgres with escalation.
    cancel.cancel();

    if let Err(e) = proxy.disconnect().await {
        tracing::warn!("consensus-store disconnect failed: {}", e);
    }
    if let Err(e) = postmaster.stop(StopMode::Fast).await {
        tracing::warn!("postgres stop during shutdown failed: {}", e);
    }

    match tokio::time::timeout(Duration::from_secs(15), tracker.wait()).await {
        Ok(()) => tracing::info!("All tracked tasks completed"),
        Err(_) => tracing::warn!("Task tracker wait timed out after 15s"),
    }

    daemon_result.map_err(|e| anyhow::anyhow!(e))
}
