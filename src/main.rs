use std::{net::SocketAddr, path::PathBuf, time::Duration};

use chatgate::{
    AppState, build_app,
    auth::TokenIssuer,
    config::GatewayConfig,
    db::DbPool,
    observability,
    secrets::EncryptionKey,
    spawn_idle_sweeper,
};
use clap::Parser;
use tokio_util::task::TaskTracker;

#[derive(Parser, Debug)]
#[command(version, about = "Chatgate access-control gateway", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to config file
    #[arg(short, long, global = true, default_value = "chatgate.toml")]
    config: PathBuf,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Start the gateway server (default)
    Serve,
    /// Run database migrations and exit
    Migrate,
    /// Mint a bearer token signed with the configured secret
    Token {
        #[arg(long)]
        user_id: String,
        #[arg(long)]
        email: String,
        /// Role to embed; repeat for several
        #[arg(long = "role")]
        roles: Vec<String>,
        /// Lifetime in seconds (defaults to auth.jwt.token_ttl_secs)
        #[arg(long)]
        ttl: Option<i64>,
    },
    /// Generate a base64 credential encryption key
    Keygen,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    match args.command {
        Some(Command::Keygen) => {
            println!("{}", EncryptionKey::generate().to_base64());
        }
        Some(Command::Token {
            user_id,
            email,
            roles,
            ttl,
        }) => {
            let config = load_config(&args.config);
            let issuer = TokenIssuer::new(&config.auth.jwt);
            let token = match ttl {
                Some(ttl) => issuer.issue_with_ttl(&user_id, &email, &roles, ttl),
                None => issuer.issue(&user_id, &email, &roles),
            };
            match token {
                Ok(token) => println!("{token}"),
                Err(e) => {
                    eprintln!("Failed to issue token: {e}");
                    std::process::exit(1);
                }
            }
        }
        Some(Command::Migrate) => run_migrations(&args.config).await,
        Some(Command::Serve) | None => run_server(&args.config).await,
    }
}

fn load_config(path: &PathBuf) -> GatewayConfig {
    match GatewayConfig::from_file(path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", path.display(), e);
            std::process::exit(1);
        }
    }
}

async fn run_migrations(config_path: &PathBuf) {
    let config = load_config(config_path);
    let _tracing_guard =
        observability::init_tracing(&config.observability).expect("Failed to initialize tracing");

    if config.database.is_none() {
        eprintln!("No database configured");
        std::process::exit(1);
    }
    let result = match DbPool::from_config(&config.database).await {
        Ok(pool) => pool.run_migrations().await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => tracing::info!("Migrations complete"),
        Err(e) => {
            tracing::error!(error = %e, "Migration failed");
            std::process::exit(1);
        }
    }
}

async fn run_server(config_path: &PathBuf) {
    let config = load_config(config_path);

    // Keep the guard alive for the lifetime of the server
    let _tracing_guard =
        observability::init_tracing(&config.observability).expect("Failed to initialize tracing");

    if let Err(e) = observability::metrics::init_metrics(&config.observability.metrics) {
        tracing::warn!(error = %e, "Failed to initialize metrics: {e}");
    }

    tracing::info!(
        config_file = %config_path.display(),
        "Starting chatgate"
    );

    if !config.server.trusted_proxies.is_configured() && !config.server.host.is_loopback() {
        tracing::warn!(
            "No trusted_proxies configured; forwarded client addresses are ignored and \
             rate limits apply to the connecting peer"
        );
    }

    let state = match AppState::new(config.clone()).await {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %e, "Failed to initialize gateway");
            std::process::exit(1);
        }
    };

    let sweep_interval = config.limits.rate_limit.sweep_interval_secs;
    let sweeper = (config.limits.rate_limit.enabled && sweep_interval > 0).then(|| {
        spawn_idle_sweeper(
            state.rate_limiter.clone(),
            Duration::from_secs(sweep_interval),
        )
    });

    let task_tracker = state.task_tracker.clone();
    let app = build_app(&config, state);

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on http://{}", bind_addr);

    // Graceful shutdown: wait for SIGINT/SIGTERM, then wait for all background tasks
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(task_tracker))
    .await
    .unwrap();

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
}

async fn shutdown_signal(task_tracker: TaskTracker) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, waiting for background tasks to complete...");

    // Close the task tracker to prevent new tasks from being spawned
    task_tracker.close();

    // Pending usage writes release their reservations when they finish
    match tokio::time::timeout(Duration::from_secs(30), task_tracker.wait()).await {
        Ok(()) => tracing::info!("All background tasks completed"),
        Err(_) => tracing::warn!(
            pending = task_tracker.len(),
            "Timed out waiting for background tasks"
        ),
    }
}
