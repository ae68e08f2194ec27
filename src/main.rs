use std::time::Duration;

use actix_web::web;
use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use pocrun::config::{CliArgs, CliCommand, Config};
use pocrun::engine::{Engine, EngineSettings};
use pocrun::job::PoCJob;
use pocrun::reaper::reaper;
use pocrun::sandbox::create_sandbox_runner;
use pocrun::staging;
use pocrun::web_server::build_server;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let config = cli.to_config().context("Failed to load configuration")?;
    let settings = EngineSettings::from_config(&config)?;

    staging::prepare_root(&settings.staging_root)?;
    if let Err(e) = staging::sweep_stale(&settings.staging_root) {
        log::error!("Failed to sweep staging root: {e}");
    }

    let runner = create_sandbox_runner(&config.engine)?;
    let engine = Engine::new(settings, runner)?;

    match cli.command {
        CliCommand::Serve => serve(config, engine).await,
        CliCommand::Run {
            language,
            source,
            archive,
            timeout,
        } => {
            let source = std::fs::read_to_string(&source)
                .with_context(|| format!("Failed to read source file {}", source.display()))?;
            let mut job = PoCJob::new(language, source);
            if let Some(archive) = archive {
                job = job.with_archive(archive);
            }
            if let Some(secs) = timeout {
                job = job.with_timeout(secs);
            }

            let result = engine.execute(&job).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
    }
}

async fn serve(config: Config, engine: Engine) -> anyhow::Result<()> {
    let Config {
        server: server_config,
        engine: engine_config,
        ..
    } = config;

    let shutdown_token = CancellationToken::new();
    let reaper_task = tokio::spawn(reaper(
        engine.runner(),
        Duration::from_secs(engine_config.reap_interval_secs.max(1)),
        shutdown_token.clone(),
    ));

    let server = build_server(server_config, web::Data::new(engine))
        .context("Failed to build server")?;
    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // ===== WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {:?}", res_server);
        }
    }

    // 1. Shutdown actix-web server gracefully, letting in-flight jobs finish
    server_handle.stop(true).await;

    // 2. Stop the reaper
    shutdown_token.cancel();
    if let Err(e) = reaper_task.await {
        log::error!("Reaper task failed: {e:?}");
    }

    log::info!("Shutdown complete");
    Ok(())
}
