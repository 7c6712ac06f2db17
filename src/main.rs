use anyhow::{Context, Result};
use clap::Parser;
use log::{info, LevelFilter};
use tokio_util::sync::CancellationToken;
use content_engine::api::ContentEngine;
use content_engine::config::Config;
use content_engine::data_structures::CliArgs;

#[tokio::main]
async fn main() -> Result<()> {

    let args = CliArgs::parse();
    let mut config = Config::new(args.config.clone());
    if let Some(key) = args.signing_key {
        config.storage.signing_key = Some(key);
    }

    init_logging(&config);

    if !config.is_enabled() {
        info!("Content engine is disabled in config. Exiting.");
        return Ok(());
    }

    let engine = ContentEngine::from_config(&config)
        .await
        .context("could not start content engine")?;
    let jobs = engine.jobs();

    if args.once {
        info!("Draining job queue once");
        jobs.drain_once().await;
        info!("Queue drained, exiting");
        return Ok(());
    }

    info!(
        "Starting content engine worker (queue poll every {} ms)",
        config.jobs.poll_interval_ms()
    );
    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            signal_token.cancel();
        }
    });

    jobs.run_worker_loop(shutdown).await;
    info!("Content engine stopped");
    Ok(())
}

fn init_logging(config: &Config) {

    let (path, level) = if let Some(log_config) = &config.log {
        let level = if log_config.debug { LevelFilter::Debug } else { LevelFilter::Info };
        (log_config.path.clone(), level)
    } else {
        ("".to_string(), LevelFilter::Info)
    };

    if !path.is_empty() {
        simple_logging::log_to_file(path, level).unwrap();
    } else {
        simple_logging::log_to_stderr(level);
    }
}
