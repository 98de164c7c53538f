use std::sync::Arc;

use clap::Parser;

use crate::{
    error::ServiceError,
    search::{pgvector::PgVectorStore, SearchService},
    tool::{SearchVectorTool, ToolSet},
};

pub mod config;
pub mod embedding;
pub mod error;
pub mod files;
pub mod search;
pub mod services;
pub mod tool;

#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    #[clap(
        default_value = "config.toml",
        help = "Path to config file",
        env = "CONFIG_PATH"
    )]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = config::Config::load(&args.config)?;
    log::info!("Start with: {:#?}", config);

    // a model that cannot be loaded is fatal, nothing is served without it
    let model_config = config.model.clone();
    let encoder =
        tokio::task::spawn_blocking(move || embedding::Encoder::load(&model_config)).await??;

    let store = PgVectorStore::new(&config.store);
    match store.verify_schema(encoder.dimension()).await {
        // only the dimension is checkable; a same-sized model swap shows up here
        Ok(()) => log::info!(
            "Datastore {}:{}/{} table {} matches {} dimensions of model {}",
            config.store.host,
            config.store.port,
            config.store.database,
            config.store.table,
            encoder.dimension(),
            encoder.model_name()
        ),
        Err(e @ ServiceError::Connection(_)) if !config.store.require_on_startup => {
            log::warn!(
                "Datastore not reachable at startup, schema not verified against model {}: {}",
                encoder.model_name(),
                e
            );
        }
        Err(e) => return Err(e.into()),
    }

    let service = Arc::new(SearchService::new(encoder, store, config.search.clone()));

    let mut tool_set = ToolSet::default();
    tool_set.add_tool(SearchVectorTool::new(service.clone()));
    if config.files.enabled {
        let root = Arc::new(files::FileRoot::new(&config.files)?);
        log::info!("File tools rooted at {}", root.root().display());
        files::add_file_tools(&mut tool_set, root);
    }
    log::info!("Tools: {:?}", tool_set);

    let listener = tokio::net::TcpListener::bind(&config.addr).await?;
    log::info!("Listening on http://{}", config.addr);
    if let Err(e) = axum::serve(listener, services::routes(service, tool_set))
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        log::error!("Server error: {}", e);
    } else {
        log::warn!("Server exit");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    log::info!("Shutdown signal received");
}
