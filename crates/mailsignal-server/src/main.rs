mod app;
mod config;
mod core;

use std::sync::Arc;

use anyhow::{Context, Result};
use app::AppState;
use config::Config;
use crate::core::{
    AnalyticsSink, HttpSink, LogSink, MemoryCache, Pipeline, run_cache_pruner,
    run_http_server, run_sink_flusher,
};
use mailsignal_helpers::{logging, shutdown};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let log_target = logging::init_logging(
        "mailsignal_server=info,tower_http=info,tokio=warn",
        "MAILSIGNAL_LOG",
        "mailsignal-server",
    );

    let config = Config::load().context("failed to load configuration")?;
    let shutdown_token = CancellationToken::new();

    let cache = Arc::new(MemoryCache::new(config.cache.ttl));
    let sink: Arc<dyn AnalyticsSink> = match config.sink.write_key.as_deref() {
        Some(write_key) => Arc::new(
            HttpSink::new(write_key, &config.sink)
                .context("failed to build analytics sink")?,
        ),
        None => {
            warn!("sink.write_key not set, analytics calls are only logged");
            Arc::new(LogSink)
        }
    };

    let pipeline = Arc::new(Pipeline::new(&config.events, cache.clone(), sink.clone()));
    let state = AppState { pipeline, shutdown: shutdown_token.clone() };

    info!(
        "server starting: listen={}, log={}, sink={}, event_types={}, cache_ttl={}",
        config.listen,
        log_target,
        if config.sink.enabled() { config.sink.endpoint.as_str() } else { "log" },
        config.events.event_types.len(),
        humantime::format_duration(config.cache.ttl)
    );

    tokio::spawn(shutdown::listen_shutdown(shutdown_token.clone()));
    tokio::spawn(run_cache_pruner(
        cache,
        config.cache.prune_interval,
        shutdown_token.clone(),
    ));
    // In-flight requests wait on sink uploads, so the flusher outlives the server.
    let flusher_stop = CancellationToken::new();
    let flusher = tokio::spawn(run_sink_flusher(
        sink.clone(),
        config.sink.flush_interval,
        flusher_stop.clone(),
    ));

    let served = run_http_server(&config.listen, config.max_payload_bytes, state).await;

    // Whatever the last requests buffered still goes out.
    match sink.flush().await {
        Ok(()) => info!("sink flushed on shutdown"),
        Err(err) => warn!("final sink flush failed: error={err}"),
    }
    flusher_stop.cancel();
    if let Err(err) = flusher.await {
        warn!("sink flusher task failed: error={err}");
    }

    served
}
