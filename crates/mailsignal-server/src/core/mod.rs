mod cache;
mod classifier;
mod dispatcher;
mod pipeline;
mod reconciler;
mod server;
mod sink;

pub use cache::{MemoryCache, run_cache_pruner};
pub use pipeline::Pipeline;
pub use server::run_http_server;
pub use sink::{AnalyticsSink, HttpSink, LogSink, run_sink_flusher};
