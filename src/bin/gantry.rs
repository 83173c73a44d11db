//! Main entry point for the gantry engine.
//!
//! Subcommands: `serve` (standalone or server profile, from a config
//! file), `sync` (mirror stores), `check-config` (validate and print the
//! profile).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gantry::{
    BuiltinEvaluator, Config, Engine, EngineConfig, ExecutorRegistry, NodeCache, Store, TokenSet,
    config::{EXIT_OK, EXIT_SIGNAL, EXIT_STARTUP},
    events::ChangeStream,
    server::{ApiState, serve},
};

#[derive(Debug, Parser)]
#[command(name = "gantry", about = "Workflow engine with a typed node life cycle")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Run the engine (and the HTTP API with a server profile).
    Serve {
        /// Path to the JSON config file.
        #[arg(long)]
        config: PathBuf,
    },
    /// Mirror all stored nodes between two endpoints.
    Sync {
        /// Source: a database URI or `backup:<dir>`.
        #[arg(long)]
        from: String,
        /// Destination: a database URI or `backup:<dir>`.
        #[arg(long)]
        to: String,
    },
    /// Validate a config file and print its profile.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        CliCommand::Serve { config } => run_serve(config).await,
        CliCommand::Sync { from, to } => run_sync(&from, &to).await,
        CliCommand::CheckConfig { config } => run_check_config(config).await,
    };
    ExitCode::from(code as u8)
}

async fn run_serve(config_path: PathBuf) -> i32 {
    let config = match Config::load(&config_path).await {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "cannot load configuration");
            return EXIT_STARTUP;
        }
    };
    info!(profile = config.profile_name(), "configuration loaded");

    match config {
        Config::Standalone(profile) => {
            serve_engine(profile.engine, None).await
        }
        Config::Server(profile) => {
            let listen = profile.listen.clone();
            let tokens = match TokenSet::load(&profile.auth_token_file).await {
                Ok(tokens) => {
                    if tokens.is_empty() {
                        warn!("token file has no usable entries, all requests will be rejected");
                    }
                    tokens
                }
                Err(err) => {
                    error!(error = %err, "cannot load token file");
                    return EXIT_STARTUP;
                }
            };
            if listen.tls.is_some() {
                warn!("TLS material configured; terminate TLS in front of this listener");
            }
            serve_engine(profile.engine, Some((listen.port, tokens))).await
        }
        Config::Client(profile) => {
            error!(url = %profile.url, "client profile has no server to run; use a client tool");
            EXIT_STARTUP
        }
    }
}

async fn serve_engine(
    options: gantry::EngineOptions,
    http: Option<(u16, TokenSet)>,
) -> i32 {
    let store = match Store::open(&options.database_uri).await {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!(error = %err, uri = %options.database_uri, "cannot open store");
            return EXIT_STARTUP;
        }
    };
    let cache = Arc::new(NodeCache::new());
    // Concrete executor plugins register here when embedding the crate;
    // the stock binary runs with condition tags only.
    let registry = Arc::new(ExecutorRegistry::new(options.host_timeout()));
    let engine_config: EngineConfig = options.engine_config();
    let engine = Arc::new(Engine::new(
        Arc::clone(&store),
        Arc::clone(&cache),
        registry,
        Arc::new(BuiltinEvaluator),
        engine_config,
    ));

    let changes = ChangeStream::start(Arc::clone(&store));

    let server_task = match http {
        Some((port, tokens)) => {
            let listener = match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(listener) => listener,
                Err(err) => {
                    error!(error = %err, port, "cannot bind listener");
                    return EXIT_STARTUP;
                }
            };
            info!(port, "http api listening");
            let state = ApiState {
                store: Arc::clone(&store),
                cache: Arc::clone(&cache),
                handle: engine.handle(),
                changes: changes.sender(),
                tokens: Arc::new(tokens),
            };
            Some(tokio::spawn(async move {
                if let Err(err) = serve(listener, state).await {
                    error!(error = %err, "http server terminated");
                }
            }))
        }
        None => None,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut engine_task = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run(shutdown_rx).await })
    };

    info!("gantry running, press Ctrl+C to stop");
    let signalled = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            result.is_ok()
        }
        joined = &mut engine_task => {
            if let Some(task) = server_task {
                task.abort();
            }
            changes.abort();
            return match joined {
                Ok(Ok(())) => EXIT_OK,
                Ok(Err(err)) => {
                    error!(error = %err, "engine terminated with error");
                    EXIT_STARTUP
                }
                Err(err) => {
                    error!(error = %err, "engine task panicked");
                    EXIT_STARTUP
                }
            };
        }
    };

    let _ = shutdown_tx.send(true);
    if let Some(task) = server_task {
        task.abort();
    }
    changes.abort();
    match engine_task.await {
        Ok(Ok(())) => {
            if signalled {
                EXIT_SIGNAL
            } else {
                EXIT_OK
            }
        }
        Ok(Err(err)) => {
            error!(error = %err, "engine terminated with error");
            EXIT_STARTUP
        }
        Err(err) => {
            error!(error = %err, "engine task panicked");
            EXIT_STARTUP
        }
    }
}

async fn run_sync(from: &str, to: &str) -> i32 {
    match gantry::sync::copy(from, to).await {
        Ok(count) => {
            info!(count, "copied stored nodes");
            EXIT_OK
        }
        Err(err) => {
            error!(src = %err.src, dst = %err.dst, cause = %err.cause, "sync failed");
            EXIT_STARTUP
        }
    }
}

async fn run_check_config(path: PathBuf) -> i32 {
    match Config::load(&path).await {
        Ok(config) => {
            println!("{}", config.profile_name());
            EXIT_OK
        }
        Err(err) => {
            error!(error = %err, "invalid configuration");
            EXIT_STARTUP
        }
    }
}
