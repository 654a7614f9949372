use std::sync::Arc;

use anyhow::{Context, bail};
use sqlx::postgres::PgPoolOptions;

use mediaguard::analysis::MediaAnalyzer;
use mediaguard::classifier::HttpClassifier;
use mediaguard::config::EngineConfig;
use mediaguard::coordinator::AlbumCoordinator;
use mediaguard::dispatch::{LogSink, VerdictSink, WebhookSink};
use mediaguard::ffmpeg::FfmpegExtractor;
use mediaguard::logging;
use mediaguard::models::GuildMediaPolicy;
use mediaguard::policy::{PgPolicyStore, PolicyStore, StaticPolicyStore};
use mediaguard::routes::{self, AppState};
use mediaguard::sampler::VideoSampler;
use mediaguard::scoring::ScoringEngine;
use mediaguard::storage::{HttpMediaSource, LocalMediaSource, MediaSource};

fn media_source(config: &EngineConfig) -> anyhow::Result<Arc<dyn MediaSource>> {
    if let Some(root) = &config.local_storage_path {
        tracing::info!(root = %root.display(), "using local media storage");
        return Ok(Arc::new(LocalMediaSource::new(root)));
    }
    if let Some(base_url) = &config.media_base_url {
        tracing::info!(base_url = %base_url, "using remote media storage");
        return Ok(Arc::new(HttpMediaSource::new(
            base_url.clone(),
            config.media_api_token.clone(),
        )?));
    }
    bail!("either LOCAL_STORAGE_PATH or MEDIA_BASE_URL must be set")
}

async fn policy_store(config: &EngineConfig) -> anyhow::Result<Arc<dyn PolicyStore>> {
    if let Some(database_url) = &config.database_url {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("failed to connect to database")?;
        tracing::info!("reading media policies from postgres");
        return Ok(Arc::new(PgPolicyStore::new(pool)));
    }
    if let Some(path) = &config.policy_file {
        let store = StaticPolicyStore::from_json_file(path)
            .with_context(|| format!("failed to load policy file {}", path.display()))?;
        tracing::info!(path = %path.display(), "reading media policies from file");
        return Ok(Arc::new(store));
    }
    tracing::warn!("no policy source configured, every chat uses the default policy");
    Ok(Arc::new(StaticPolicyStore::with_default(
        GuildMediaPolicy::default(),
    )))
}

fn verdict_sink(config: &EngineConfig) -> anyhow::Result<Arc<dyn VerdictSink>> {
    match &config.action_webhook_url {
        Some(url) => Ok(Arc::new(WebhookSink::new(url.clone())?)),
        None => {
            tracing::warn!("ACTION_WEBHOOK_URL not set, verdicts are only logged");
            Ok(Arc::new(LogSink))
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::from_env();
    logging::init(config.log_format, &config.log_level)?;

    let classifier_url = config
        .classifier_url
        .clone()
        .context("CLASSIFIER_URL must be set")?;
    let classifier = HttpClassifier::new(
        classifier_url,
        config.classifier_api_key.clone(),
        config.classify_timeout,
    )?;

    let extractor = Arc::new(FfmpegExtractor::new(config.ffmpeg_threads));
    let analyzer = MediaAnalyzer::new(
        media_source(&config)?,
        VideoSampler::new(extractor, config.frame_prefetch),
        ScoringEngine::new(Arc::new(classifier), config.classify_timeout),
        config.limits,
        config.scratch_dir.clone(),
    );

    let coordinator = AlbumCoordinator::new(
        Arc::new(analyzer),
        policy_store(&config).await?,
        verdict_sink(&config)?,
        config.debounce,
    );

    let app = routes::router(AppState {
        coordinator: coordinator.clone(),
    });

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;

    tracing::info!(
        addr = %addr,
        debounce_ms = config.debounce.as_millis() as u64,
        frame_prefetch = config.frame_prefetch,
        "listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server failed")?;

    coordinator.shutdown().await;
    tracing::info!("shut down");
    Ok(())
}
