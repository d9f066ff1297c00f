//! relay-rs server binary
//!
//! Loads the configuration, wires the actors and front-ends together,
//! and supervises everything until a shutdown signal. Exit codes:
//! 0 clean shutdown, 1 configuration error, 2 runtime failure.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};

use relay_rs::api::{self, ApiState};
use relay_rs::conf::Conf;
use relay_rs::conn::ConnRegistry;
use relay_rs::hls::{HlsConfig, HlsServer};
use relay_rs::metrics;
use relay_rs::path::{manager, CommandLauncher, PathSettings};
use relay_rs::playback::PlaybackServer;
use relay_rs::routine::RoutinePool;
use relay_rs::segmenter::SegmenterConfig;
use relay_rs::server::{RelayServer, ServerConfig};
use relay_rs::web::{self, WebState};

#[derive(Parser, Debug)]
#[command(name = "relay-rs", version, about = "Multi-protocol live media relay")]
struct Args {
    /// Path to the configuration file
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let conf = match Conf::load(&args.config) {
        Ok(conf) => conf,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return ExitCode::from(1);
        }
    };
    if args.check {
        println!("configuration OK");
        return ExitCode::SUCCESS;
    }

    init_logging(&conf.log_level);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "Runtime startup failed");
            return ExitCode::from(2);
        }
    };
    match runtime.block_on(run(conf)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Runtime failure");
            ExitCode::from(2)
        }
    }
}

fn init_logging(level: &str) {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string())),
        )
        .compact()
        .init();
}

async fn run(conf: Conf) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "relay-rs starting");

    let metrics = metrics::new();
    let pool = RoutinePool::new();
    let conns = ConnRegistry::new();

    // Any server hitting a fatal error cancels the pool and leaves the
    // error here for the exit code.
    let fatal: Arc<Mutex<Option<anyhow::Error>>> = Arc::new(Mutex::new(None));

    let settings = PathSettings {
        reader_buffer: conf.reader_buffer,
        overflow_threshold: conf.overflow_threshold,
        segmenter: SegmenterConfig {
            target_duration: conf.segment_duration(),
            window: conf.segment_window,
        },
        record_dir: conf.record_dir.clone(),
    };
    let path_manager = manager::spawn(
        conf.clone(),
        settings,
        Arc::new(CommandLauncher),
        None,
        metrics.clone(),
        &pool,
    );

    // Native relay front.
    {
        let server = RelayServer::new(
            ServerConfig::from_conf(&conf),
            path_manager.clone(),
            conns.clone(),
            metrics.clone(),
        );
        let conn_pool = pool.clone();
        let fatal = fatal.clone();
        pool.add(move |_| async move {
            if let Err(e) = server.run(&conn_pool).await {
                *fatal.lock().unwrap() = Some(e);
                conn_pool.cancel();
            }
        });
    }

    // Media HTTP front: adaptive-segment + browser + playback.
    {
        let hls = HlsServer::new(
            path_manager.clone(),
            HlsConfig::from_conf(&conf),
            &pool,
            metrics.clone(),
        );
        let playback = PlaybackServer::new(path_manager.clone(), conf.record_dir.clone());
        let state = Arc::new(WebState {
            manager: path_manager.clone(),
            hls,
            playback,
            conns: conns.clone(),
            pool: pool.clone(),
            metrics: metrics.clone(),
        });
        let addr: std::net::SocketAddr = conf.http_address.parse()?;
        let router = web::router(state);
        let serve_pool = pool.clone();
        let fatal = fatal.clone();
        pool.add(move |_| async move {
            if let Err(e) = api::serve(addr, router, &serve_pool).await {
                *fatal.lock().unwrap() = Some(e);
                serve_pool.cancel();
            }
        });
    }

    // Admin API.
    {
        let state = Arc::new(ApiState {
            manager: path_manager.clone(),
            conns: conns.clone(),
            metrics: metrics.clone(),
        });
        let addr: std::net::SocketAddr = conf.api_address.parse()?;
        let router = api::router(state);
        let serve_pool = pool.clone();
        let fatal = fatal.clone();
        pool.add(move |_| async move {
            if let Err(e) = api::serve(addr, router, &serve_pool).await {
                *fatal.lock().unwrap() = Some(e);
                serve_pool.cancel();
            }
        });
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
        _ = pool.token().cancelled() => {}
    }

    pool.cancel();
    let grace = conf.shutdown_grace() * 2;
    if tokio::time::timeout(grace, pool.wait()).await.is_err() {
        warn!(grace_secs = grace.as_secs(), "Shutdown grace exceeded");
    }

    let fatal = fatal.lock().unwrap().take();
    match fatal {
        Some(e) => Err(e),
        None => {
            info!("relay-rs stopped");
            Ok(())
        }
    }
}
