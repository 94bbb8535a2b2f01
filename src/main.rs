use anyhow::Result;
use clap::Parser;
use quest_pipeline::{
    app,
    config::{AppConfig, Args, Command, StoreBackend},
    handlers::AppState,
    services::{disk_store::DiskStore, pipeline::{Pipeline, open_store}},
};
use std::{io::ErrorKind, process::ExitCode};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    quest_pipeline::init_logging();

    let args = Args::parse();
    let cfg = AppConfig::from_env_and_args(&args)?;
    tracing::info!(command = ?args.command, "starting with config: {:?}", cfg);

    match args.command {
        Command::Migrate => {
            if cfg.store == StoreBackend::Memory {
                tracing::info!("memory store has no schema; nothing to migrate");
                return Ok(ExitCode::SUCCESS);
            }
            let store = DiskStore::open(&cfg.database_url, &cfg.storage_dir, &cfg.bucket).await?;
            store.migrate().await?;
            tracing::info!("database migration complete");
            Ok(ExitCode::SUCCESS)
        }
        Command::Ingest => {
            let pipeline = Pipeline::from_config(&cfg, open_store(&cfg).await?)?;
            let report = pipeline.ingest().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(if report.failed() == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Analytics => {
            let pipeline = Pipeline::from_config(&cfg, open_store(&cfg).await?)?;
            let report = pipeline.analytics().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Serve => {
            let pipeline = Pipeline::from_config(&cfg, open_store(&cfg).await?)?;
            serve(&cfg, AppState::new(pipeline)).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn serve(cfg: &AppConfig, state: AppState) -> Result<()> {
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app(state)).await?;
    Ok(())
}
