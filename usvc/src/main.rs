use std::{fmt::Debug, path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};
use usvc_core::{
    config::{port_from_env, ServerConfig},
    http::HttpHandler,
    metrics::LogReporter,
    orchestrator::WorkerPool,
};
use usvc_services::{http::relocate, serve, serve_threaded, ServeError};

use crate::echo::EchoService;

mod echo;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path of the config file, TOML or JSON
    #[clap(short, long, value_parser)]
    config: Option<PathBuf>,
    /// Listening port; defaults to the config file, then $PORT, then 8080
    #[clap(short, long)]
    port: Option<u16>,
    /// Run accept loops and sessions on this many threads
    #[clap(long)]
    io_threads: Option<usize>,
    /// Run the handler on this many dedicated threads
    #[clap(long)]
    handler_threads: Option<usize>,
    /// Log per-connection metrics as JSON lines
    #[clap(long)]
    metrics: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig {
            port: port_from_env(),
            ..Default::default()
        },
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(threads) = args.io_threads {
        config.io_threads = threads.max(1);
    }
    if let Some(threads) = args.handler_threads {
        config.handler_threads = threads;
    }
    let reporter = args.metrics.then_some(LogReporter);

    if config.handler_threads == 0 {
        run(&config, EchoService, reporter)?;
        return Ok(());
    }

    let pool = Arc::new(WorkerPool::new(config.handler_threads, &config.runtime)?);
    info!("{} handler threads started", pool.threads());
    run(&config, relocate(pool.clone(), EchoService), reporter)?;
    if let Ok(pool) = Arc::try_unwrap(pool) {
        pool.join();
    }
    Ok(())
}

fn run<H>(config: &ServerConfig, handler: H, reporter: Option<LogReporter>) -> Result<(), ServeError>
where
    H: HttpHandler + Clone + Send + Sync + 'static,
    H::Error: Debug + 'static,
{
    if config.io_threads > 1 {
        serve_threaded(config, move |_| (handler.clone(), reporter))
    } else {
        serve(config, handler, reporter)
    }
}
