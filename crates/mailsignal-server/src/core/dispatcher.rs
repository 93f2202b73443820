use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use mailsignal_proto::{
    CanonicalEvent, EventType, FIELD_MESSAGE_ID, FIELD_TAGS, Identify, OutboundCall, Track,
    Traits
};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::reconciler::ReconcileResult;
use super::sink::{AnalyticsSink, SinkError};

const META_USER_ID: &str = "userId";
const TRAIT_EMAIL: &str = "email";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPhase {
    Identify,
    Track,
}

impl fmt::Display for DispatchPhase {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>
    ) -> fmt::Result {
        match self {
            Self::Identify => f.write_str("identify"),
            Self::Track => f.write_str("track"),
        }
    }
}

/// Every call of a phase has resolved and at least one failed.
#[derive(Debug, Clone, Error)]
#[error("{phase} phase failed: failed={failed}, total={total}, first={first}")]
pub struct DispatchError {
    pub phase: DispatchPhase,
    pub failed: usize,
    pub total: usize,
    #[source]
    pub first: SinkError,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub identify_calls: usize,
    pub track_calls: usize,
    pub unmapped: usize,
}

/// Turns reconciled events into identify and track calls.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    track_event_names: BTreeMap<EventType, String>,
}

impl Dispatcher {
    pub fn new(track_event_names: BTreeMap<EventType, String>) -> Self {
        Self { track_event_names }
    }

    pub async fn dispatch(
        &self,
        reconciled: &ReconcileResult,
        sink: &Arc<dyn AnalyticsSink>
    ) -> Result<DispatchReport, DispatchError> {
        let identifies = self.identify_calls(reconciled);
        let identify_calls = fan_out(DispatchPhase::Identify, sink, identifies).await?;

        let (tracks, unmapped) = self.track_calls(&reconciled.whole_events);
        let track_calls = fan_out(DispatchPhase::Track, sink, tracks).await?;

        debug!(
            "batch dispatched: identify_calls={}, track_calls={}, unmapped={}",
            identify_calls, track_calls, unmapped
        );
        Ok(DispatchReport { identify_calls, track_calls, unmapped })
    }

    /// One identify per message id first seen in this batch.
    fn identify_calls(
        &self,
        reconciled: &ReconcileResult
    ) -> Vec<OutboundCall> {
        let mut seen = HashSet::new();

        reconciled
            .rcpt_to_events
            .iter()
            .filter(|event| {
                event.message_id().is_some_and(|id| {
                    reconciled.new_message_ids.contains(id) && seen.insert(id.to_string())
                })
            })
            .filter_map(|event| {
                let user_id = identity(event)?;
                Some(OutboundCall::Identify(Identify {
                    user_id,
                    traits: recipient_traits(event),
                }))
            })
            .collect()
    }

    fn track_calls(
        &self,
        whole_events: &[CanonicalEvent]
    ) -> (Vec<OutboundCall>, usize) {
        let mut calls = Vec::with_capacity(whole_events.len());
        let mut unmapped = 0usize;

        for event in whole_events {
            let kind = event.event_type();
            if kind.is_structural() {
                continue;
            }

            let Some(name) = self.track_event_names.get(&kind) else {
                warn!(
                    "no outbound event name, track skipped: type={}, message_id={}",
                    kind,
                    event.message_id().unwrap_or("-")
                );
                unmapped += 1;
                continue;
            };
            let Some(user_id) = identity(event) else {
                continue;
            };

            let traits = recipient_traits(event);
            calls.push(OutboundCall::Track(Track {
                user_id,
                event: name.clone(),
                properties: track_properties(event, traits),
                context: track_context(event),
            }));
        }

        (calls, unmapped)
    }
}

/// `rcpt_meta.userId` when the sender supplied one, otherwise the address.
fn identity(event: &CanonicalEvent) -> Option<String> {
    event
        .rcpt_meta()
        .and_then(|meta| meta.get(META_USER_ID))
        .and_then(Value::as_str)
        .filter(|user_id| !user_id.is_empty())
        .or_else(|| event.rcpt_to())
        .map(str::to_string)
}

/// `{email}` overlaid with `rcpt_meta`, then `tags`.
pub fn recipient_traits(event: &CanonicalEvent) -> Traits {
    let mut traits = Traits::new();
    if let Some(rcpt_to) = event.rcpt_to() {
        traits.insert(TRAIT_EMAIL.to_string(), Value::String(rcpt_to.to_string()));
    }
    if let Some(meta) = event.rcpt_meta() {
        traits.extend(meta.iter().map(|(key, value)| (key.clone(), value.clone())));
    }
    if let Some(tags) = event.field(FIELD_TAGS) {
        traits.insert(FIELD_TAGS.to_string(), tags.clone());
    }
    traits
}

fn track_properties(
    event: &CanonicalEvent,
    traits: Traits
) -> Map<String, Value> {
    let mut properties = Map::new();
    properties.insert("traits".to_string(), Value::Object(traits));
    copy_string(event, FIELD_MESSAGE_ID, "email_id", &mut properties);
    copy_string(event, "subject", "email_subject", &mut properties);
    copy_string(event, "target_link_url", "link_url", &mut properties);
    properties
}

fn track_context(event: &CanonicalEvent) -> Map<String, Value> {
    let mut context = Map::new();
    copy_string(event, "ip_address", "ip", &mut context);
    copy_string(event, "user_agent", "user_agent", &mut context);
    context
}

fn copy_string(
    event: &CanonicalEvent,
    from: &str,
    to: &str,
    target: &mut Map<String, Value>
) {
    if let Some(value) = event.str_field(from).filter(|value| !value.is_empty()) {
        target.insert(to.to_string(), Value::String(value.to_string()));
    }
}

/// Issues every call concurrently and waits for all of them.
async fn fan_out(
    phase: DispatchPhase,
    sink: &Arc<dyn AnalyticsSink>,
    calls: Vec<OutboundCall>
) -> Result<usize, DispatchError> {
    let total = calls.len();
    let mut tasks = JoinSet::new();

    for call in calls {
        let sink = sink.clone();
        tasks.spawn(async move {
            match call {
                OutboundCall::Identify(identify) => sink.identify(identify).await,
                OutboundCall::Track(track) => sink.track(track).await,
            }
        });
    }

    let mut failed = 0usize;
    let mut first: Option<SinkError> = None;
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined.unwrap_or_else(|err| Err(SinkError::Aborted(err.to_string())));
        if let Err(err) = outcome {
            warn!("sink call failed: phase={}, error={}", phase, err);
            failed += 1;
            first.get_or_insert(err);
        }
    }

    match first {
        None => Ok(total),
        Some(first) => Err(DispatchError { phase, failed, total, first }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use mailsignal_proto::CanonicalEvent;
    use serde_json::{Value, json};

    use super::{DispatchPhase, Dispatcher, recipient_traits};
    use crate::config::EventsConfig;
    use crate::core::reconciler::ReconcileResult;
    use crate::core::sink::AnalyticsSink;
    use crate::core::sink::testing::RecordingSink;

    fn event(body: Value) -> CanonicalEvent {
        CanonicalEvent::from_object(body.as_object().cloned().unwrap()).unwrap()
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(EventsConfig::default().track_event_names)
    }

    fn reconciled(
        events: Vec<CanonicalEvent>,
        new_ids: &[&str]
    ) -> ReconcileResult {
        let rcpt_to_events: Vec<CanonicalEvent> =
            events.iter().filter(|event| event.has_identity()).cloned().collect();
        ReconcileResult {
            whole_events: events,
            new_message_ids: new_ids.iter().map(|id| id.to_string()).collect::<HashSet<_>>(),
            rcpt_to_events,
            dropped: 0,
        }
    }

    #[test]
    fn traits_merge_email_meta_and_tags() {
        let traits = recipient_traits(&event(json!({
            "type": "delivery",
            "rcpt_to": "a@x.com",
            "rcpt_meta": {"plan": "pro", "userId": "u-9"},
            "tags": ["welcome", "drip"]
        })));

        assert_eq!(
            Value::Object(traits),
            json!({
                "email": "a@x.com",
                "plan": "pro",
                "userId": "u-9",
                "tags": ["welcome", "drip"]
            })
        );
    }

    #[tokio::test]
    async fn identifies_new_messages_once_and_tracks_lifecycle_events() {
        let recorder = Arc::new(RecordingSink::default());
        let sink: Arc<dyn AnalyticsSink> = recorder.clone();

        let batch = reconciled(
            vec![
                event(json!({"type": "reception", "message_id": "M1", "rcpt_to": "a@x.com"})),
                event(json!({"type": "injection", "message_id": "M1", "rcpt_to": "a@x.com"})),
                event(json!({
                    "type": "click",
                    "message_id": "M1",
                    "rcpt_to": "a@x.com",
                    "rcpt_meta": {"userId": "u-1"},
                    "subject": "Hello",
                    "target_link_url": "https://x.com/a",
                    "ip_address": "10.0.0.1",
                    "user_agent": "curl/8"
                })),
            ],
            &["M1"],
        );

        let report = dispatcher().dispatch(&batch, &sink).await.unwrap();
        assert_eq!(report.identify_calls, 1);
        assert_eq!(report.track_calls, 1);
        assert_eq!(report.unmapped, 0);

        let identifies = recorder.identifies();
        assert_eq!(identifies[0].user_id, "a@x.com");

        let tracks = recorder.tracks();
        assert_eq!(tracks[0].user_id, "u-1");
        assert_eq!(tracks[0].event, "Email Link Clicked");
        assert_eq!(tracks[0].properties["email_id"], "M1");
        assert_eq!(tracks[0].properties["email_subject"], "Hello");
        assert_eq!(tracks[0].properties["link_url"], "https://x.com/a");
        assert_eq!(tracks[0].properties["traits"]["email"], "a@x.com");
        assert_eq!(Value::Object(tracks[0].context.clone()), json!({"ip": "10.0.0.1", "user_agent": "curl/8"}));
    }

    #[tokio::test]
    async fn known_messages_are_not_identified_again() {
        let recorder = Arc::new(RecordingSink::default());
        let sink: Arc<dyn AnalyticsSink> = recorder.clone();

        let batch = reconciled(
            vec![event(json!({"type": "open", "message_id": "M1", "rcpt_to": "a@x.com"}))],
            &[],
        );

        let report = dispatcher().dispatch(&batch, &sink).await.unwrap();
        assert_eq!(report.identify_calls, 0);
        assert_eq!(report.track_calls, 1);
        assert!(recorder.identifies().is_empty());
        assert!(recorder.tracks()[0].context.is_empty());
    }

    #[tokio::test]
    async fn identify_prefers_user_id_and_falls_back_to_recipient() {
        let recorder = Arc::new(RecordingSink::default());
        let sink: Arc<dyn AnalyticsSink> = recorder.clone();

        let batch = reconciled(
            vec![
                event(json!({
                    "type": "reception",
                    "message_id": "M1",
                    "rcpt_to": "a@x.com",
                    "rcpt_meta": {"userId": "u-7"}
                })),
                event(json!({
                    "type": "reception",
                    "message_id": "M2",
                    "rcpt_to": "b@x.com",
                    "rcpt_meta": {"plan": "free"}
                })),
            ],
            &["M1", "M2"],
        );

        let report = dispatcher().dispatch(&batch, &sink).await.unwrap();
        assert_eq!(report.identify_calls, 2);

        let mut identifies = recorder.identifies();
        identifies.sort_by(|left, right| left.user_id.cmp(&right.user_id));
        assert_eq!(identifies[0].user_id, "b@x.com");
        assert_eq!(identifies[0].traits["email"], "b@x.com");
        assert_eq!(identifies[1].user_id, "u-7");
        assert_eq!(identifies[1].traits["email"], "a@x.com");
    }

    #[tokio::test]
    async fn unmapped_types_are_counted_not_sent() {
        let recorder = Arc::new(RecordingSink::default());
        let sink: Arc<dyn AnalyticsSink> = recorder.clone();

        let mut names = EventsConfig::default().track_event_names;
        names.remove(&mailsignal_proto::EventType::Open);
        let dispatcher = Dispatcher::new(names);

        let batch = reconciled(
            vec![
                event(json!({"type": "open", "message_id": "M1", "rcpt_to": "a@x.com"})),
                event(json!({"type": "delivery", "message_id": "M1", "rcpt_to": "a@x.com"})),
            ],
            &[],
        );

        let report = dispatcher.dispatch(&batch, &sink).await.unwrap();
        assert_eq!(report.unmapped, 1);
        assert_eq!(report.track_calls, 1);
        assert_eq!(recorder.tracks()[0].event, "Email Delivered");
    }

    #[tokio::test]
    async fn identify_failure_skips_track_phase() {
        let recorder = Arc::new(RecordingSink::failing_identify());
        let sink: Arc<dyn AnalyticsSink> = recorder.clone();

        let batch = reconciled(
            vec![
                event(json!({"type": "delivery", "message_id": "M1", "rcpt_to": "a@x.com"})),
                event(json!({"type": "delivery", "message_id": "M2", "rcpt_to": "b@x.com"})),
            ],
            &["M1", "M2"],
        );

        let err = dispatcher().dispatch(&batch, &sink).await.unwrap_err();
        assert_eq!(err.phase, DispatchPhase::Identify);
        assert_eq!(err.failed, 2);
        assert_eq!(err.total, 2);
        assert_eq!(recorder.identifies().len(), 2);
        assert!(recorder.tracks().is_empty());
    }

    #[tokio::test]
    async fn track_failure_waits_for_siblings() {
        let recorder = Arc::new(RecordingSink::failing_track());
        let sink: Arc<dyn AnalyticsSink> = recorder.clone();

        let batch = reconciled(
            vec![
                event(json!({"type": "open", "message_id": "M1", "rcpt_to": "a@x.com"})),
                event(json!({"type": "click", "message_id": "M1", "rcpt_to": "a@x.com"})),
                event(json!({"type": "delivery", "message_id": "M1", "rcpt_to": "a@x.com"})),
            ],
            &[],
        );

        let err = dispatcher().dispatch(&batch, &sink).await.unwrap_err();
        assert_eq!(err.phase, DispatchPhase::Track);
        assert_eq!(err.failed, 3);
        assert_eq!(recorder.tracks().len(), 3);
        assert!(err.to_string().contains("track refused"));
    }
}
