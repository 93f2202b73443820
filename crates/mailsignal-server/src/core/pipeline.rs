use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use super::cache::{CacheError, MetadataCache};
use super::classifier::{EventClassifier, Rejections};
use super::dispatcher::{DispatchError, Dispatcher};
use super::reconciler::Reconciler;
use super::sink::AnalyticsSink;
use crate::config::EventsConfig;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// What one batch amounted to.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub batch_id: String,
    pub received: usize,
    pub classified: usize,
    pub rejections: Rejections,
    pub dropped: usize,
    pub new_message_ids: usize,
    pub identify_calls: usize,
    pub track_calls: usize,
    pub unmapped: usize,
}

/// Counters accumulated over the life of the process.
#[derive(Debug, Default)]
pub struct PipelineStats {
    batches: AtomicU64,
    failed_batches: AtomicU64,
    events_received: AtomicU64,
    events_classified: AtomicU64,
    events_rejected: AtomicU64,
    events_dropped: AtomicU64,
    identify_calls: AtomicU64,
    track_calls: AtomicU64,
    unmapped_tracks: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub batches: u64,
    pub failed_batches: u64,
    pub events_received: u64,
    pub events_classified: u64,
    pub events_rejected: u64,
    pub events_dropped: u64,
    pub identify_calls: u64,
    pub track_calls: u64,
    pub unmapped_tracks: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            batches: load(&self.batches),
            failed_batches: load(&self.failed_batches),
            events_received: load(&self.events_received),
            events_classified: load(&self.events_classified),
            events_rejected: load(&self.events_rejected),
            events_dropped: load(&self.events_dropped),
            identify_calls: load(&self.identify_calls),
            track_calls: load(&self.track_calls),
            unmapped_tracks: load(&self.unmapped_tracks),
        }
    }

    fn record_classified(
        &self,
        received: usize,
        classified: usize,
        rejected: usize
    ) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.events_received.fetch_add(received as u64, Ordering::Relaxed);
        self.events_classified.fetch_add(classified as u64, Ordering::Relaxed);
        self.events_rejected.fetch_add(rejected as u64, Ordering::Relaxed);
    }

    fn record_outcome(
        &self,
        outcome: &Result<BatchReport, PipelineError>
    ) {
        match outcome {
            Ok(report) => {
                self.events_dropped.fetch_add(report.dropped as u64, Ordering::Relaxed);
                self.identify_calls.fetch_add(report.identify_calls as u64, Ordering::Relaxed);
                self.track_calls.fetch_add(report.track_calls as u64, Ordering::Relaxed);
                self.unmapped_tracks.fetch_add(report.unmapped as u64, Ordering::Relaxed);
            }
            Err(_) => {
                self.failed_batches.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// classify -> cache write -> augment -> identify -> track, in that order.
pub struct Pipeline {
    classifier: EventClassifier,
    reconciler: Reconciler,
    dispatcher: Dispatcher,
    cache: Arc<dyn MetadataCache>,
    sink: Arc<dyn AnalyticsSink>,
    stats: PipelineStats,
}

impl Pipeline {
    pub fn new(
        events: &EventsConfig,
        cache: Arc<dyn MetadataCache>,
        sink: Arc<dyn AnalyticsSink>
    ) -> Self {
        Self {
            classifier: EventClassifier::new(events),
            reconciler: Reconciler::new(events.important_fields.clone()),
            dispatcher: Dispatcher::new(events.track_event_names.clone()),
            cache,
            sink,
            stats: PipelineStats::default(),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub async fn process_batch(
        &self,
        raw_events: &[Value]
    ) -> Result<BatchReport, PipelineError> {
        let batch_id = Uuid::now_v7().to_string();
        let span = info_span!("batch", batch_id = %batch_id);

        let outcome = self.run(batch_id, raw_events).instrument(span.clone()).await;
        self.stats.record_outcome(&outcome);

        span.in_scope(|| match &outcome {
            Ok(report) => info!(
                "batch processed: received={}, classified={}, rejected={}, dropped={}, new_message_ids={}, identify_calls={}, track_calls={}, unmapped={}",
                report.received,
                report.classified,
                report.rejections.total(),
                report.dropped,
                report.new_message_ids,
                report.identify_calls,
                report.track_calls,
                report.unmapped
            ),
            Err(err) => warn!("batch failed: error={err}"),
        });

        outcome
    }

    async fn run(
        &self,
        batch_id: String,
        raw_events: &[Value]
    ) -> Result<BatchReport, PipelineError> {
        let classified = self.classifier.classify(raw_events);
        let rejections = classified.rejections;
        let classified_count = classified.events.len();
        self.stats.record_classified(raw_events.len(), classified_count, rejections.total());

        let reconciled =
            self.reconciler.reconcile(classified.events, self.cache.as_ref()).await?;
        let dispatched = self.dispatcher.dispatch(&reconciled, &self.sink).await?;

        Ok(BatchReport {
            batch_id,
            received: raw_events.len(),
            classified: classified_count,
            rejections,
            dropped: reconciled.dropped,
            new_message_ids: reconciled.new_message_ids.len(),
            identify_calls: dispatched.identify_calls,
            track_calls: dispatched.track_calls,
            unmapped: dispatched.unmapped,
        })
    }
}
