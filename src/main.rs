//! recast - replay captured HTTP traffic against a target service

use clap::Parser;
use recast::capture::{BlockingTrafficSource, FileTrafficSource, TrafficSource};
use recast::config::{ReplayerArgs, ReplayerConfig};
use recast::output::{JsonLinesSink, ResultSink};
use recast::replay::{DefaultRetryPolicy, ReplayEngine};
use recast::transform::{
    AuthTransform, HeaderRewriteTransformFactory, IdentityTransformFactory,
    RequestTransformFactory, StaticAuthTransform,
};
use recast::{ReplayError, Result};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    if let Err(e) = run() {
        eprintln!("recast failed: {e}");
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn run() -> Result<()> {
    let args = ReplayerArgs::parse();

    let log_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    let config = ReplayerConfig::from_args(&args);
    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(e);
    }

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = args.worker_threads {
        builder.worker_threads(workers);
    }
    let runtime = builder
        .build()
        .map_err(|e| ReplayError::Config(format!("failed to create runtime: {e}")))?;

    runtime.block_on(run_replay(args, config))
}

async fn run_replay(args: ReplayerArgs, config: ReplayerConfig) -> Result<()> {
    let source: Arc<dyn TrafficSource> = match args.input_path() {
        Some(path) => Arc::new(FileTrafficSource::open(&path).await?),
        None => Arc::new(FileTrafficSource::new(
            "stdin",
            Box::new(tokio::io::stdin()),
        )),
    };
    let gate = Arc::new(BlockingTrafficSource::new(
        source,
        config.buffer_window_ms as i64,
    ));

    let sink: Arc<dyn ResultSink> = match args.output_path() {
        Some(path) => {
            let file = tokio::fs::File::create(&path).await.map_err(|e| {
                ReplayError::Sink(format!("failed to create {}: {e}", path.display()))
            })?;
            Arc::new(JsonLinesSink::new(Box::new(file)))
        }
        None => Arc::new(JsonLinesSink::new(Box::new(tokio::io::stdout()))),
    };

    let transform: Arc<dyn RequestTransformFactory> =
        if config.host_rewrite.is_some() || config.auth_header.is_some() {
            let auth: Option<Box<dyn AuthTransform>> = config
                .auth_header
                .clone()
                .map(|value| Box::new(StaticAuthTransform::new(value)) as Box<dyn AuthTransform>);
            Arc::new(HeaderRewriteTransformFactory::new(
                config.host_rewrite.clone(),
                auth,
            ))
        } else {
            Arc::new(IdentityTransformFactory)
        };

    let engine = Arc::new(ReplayEngine::new(
        config,
        gate,
        sink,
        transform,
        Arc::new(DefaultRetryPolicy),
    )?);

    // Ctrl-C triggers the orderly shutdown path: drain, flush, summary.
    {
        let engine = engine.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received; shutting down");
                engine.shutdown();
            }
        });
    }

    let stats = engine.run().await?;
    info!(
        succeeded = stats.transactions_succeeded,
        failed = stats.transactions_failed,
        expired = stats.transactions_expired,
        "Done"
    );
    Ok(())
}
