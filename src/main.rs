use std::sync::Arc;

use color_eyre::eyre::WrapErr;
use songdl::config;
use songdl::downloader::DownloadService;
use songdl::postprocess::{LyricsProcessor, MetadataProcessor, PostProcessor};
use songdl::router::create_router;
use songdl::source::{ApiMediaSource, MediaSource};
use tracing_subscriber::EnvFilter;

async fn shutdown_signal(service: DownloadService) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
        return;
    }
    tracing::info!("Received Ctrl-C, stopping downloads...");
    service.stop();
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    color_eyre::install()?;

    let config = config::config();
    let downloader_config = config.downloader_config();

    // create download directory
    let download_dir = config.storage.download_path();
    if !download_dir.exists() {
        tracing::info!("Directory '{}' does not exist, creating...", download_dir.display());
        tokio::fs::create_dir_all(&download_dir)
            .await
            .wrap_err_with(|| format!("Failed to create {}", download_dir.display()))?;
    }

    let source: Arc<dyn MediaSource> = Arc::new(ApiMediaSource::new(config.api_url.clone()));
    let processors: Vec<Arc<dyn PostProcessor>> = vec![
        Arc::new(LyricsProcessor::new(source.clone(), config.storage.lyrics_path())),
        Arc::new(MetadataProcessor::new(download_dir.clone())),
    ];
    let service = DownloadService::new(downloader_config, source, processors)
        .wrap_err("Failed to start the download service")?;

    if config.storage.resume_partial {
        let handles = service
            .resume_partial_downloads()
            .await
            .wrap_err("Failed to resume partial downloads")?;
        tracing::info!("Resumed {} partial downloads", handles.len());
    }

    let app = create_router(service.clone());
    let listener = tokio::net::TcpListener::bind(&config.host)
        .await
        .wrap_err_with(|| format!("Failed to bind {}", config.host))?;
    tracing::info!("Listening on: {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(service.clone()))
        .await?;

    service.shutdown().await;
    Ok(())
}
