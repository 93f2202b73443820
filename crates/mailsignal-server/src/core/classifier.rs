use std::collections::BTreeSet;

use mailsignal_proto::{CanonicalEvent, EventType, ProtoError, unwrap_event};
use serde::Serialize;
use serde_json::Value;
use tracing::trace;

use crate::config::EventsConfig;

/// Why a raw event did not survive classification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Rejections {
    pub unrecognized: usize,
    pub ambiguous: usize,
    pub malformed: usize,
    pub uninteresting_type: usize,
    pub uninteresting_subtype: usize,
}

impl Rejections {
    pub fn total(&self) -> usize {
        self.unrecognized
            + self.ambiguous
            + self.malformed
            + self.uninteresting_type
            + self.uninteresting_subtype
    }

    fn record(
        &mut self,
        err: &ProtoError
    ) {
        match err {
            ProtoError::NotAnObject
            | ProtoError::MissingRoot(_)
            | ProtoError::NoEventClass => self.unrecognized += 1,
            ProtoError::AmbiguousEventClass(_) => self.ambiguous += 1,
            ProtoError::ClassNotAnObject(_) | ProtoError::MissingType => {
                self.malformed += 1
            }
            ProtoError::UnknownEventType(_) => self.uninteresting_type += 1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Classified {
    pub events: Vec<CanonicalEvent>,
    pub rejections: Rejections,
}

/// Unwraps provider events and keeps the ones worth forwarding.
#[derive(Debug, Clone)]
pub struct EventClassifier {
    envelope_root: Option<String>,
    event_classes: Vec<String>,
    event_types: BTreeSet<EventType>,
    complaint_event_type: EventType,
    complaint_subtypes: BTreeSet<String>,
}

impl EventClassifier {
    pub fn new(config: &EventsConfig) -> Self {
        Self {
            envelope_root: config.envelope_root.clone(),
            event_classes: config.event_classes.clone(),
            event_types: config.event_types.clone(),
            complaint_event_type: config.complaint_event_type,
            complaint_subtypes: config.complaint_subtypes.clone(),
        }
    }

    /// Filters and unwraps a batch, keeping input order.
    pub fn classify(
        &self,
        raw_events: &[Value]
    ) -> Classified {
        let mut classified = Classified {
            events: Vec::with_capacity(raw_events.len()),
            rejections: Rejections::default(),
        };

        for (index, raw) in raw_events.iter().enumerate() {
            let event = match unwrap_event(
                raw,
                self.envelope_root.as_deref(),
                &self.event_classes
            ) {
                Ok((_, event)) => event,
                Err(err) => {
                    trace!("event skipped: index={}, reason={}", index, err);
                    classified.rejections.record(&err);
                    continue;
                }
            };

            if !self.event_types.contains(&event.event_type()) {
                trace!(
                    "event skipped: index={}, reason=uninteresting type {}",
                    index,
                    event.event_type()
                );
                classified.rejections.uninteresting_type += 1;
                continue;
            }

            if !self.subtype_is_interesting(&event) {
                trace!(
                    "event skipped: index={}, reason=uninteresting {} subtype {}",
                    index,
                    event.event_type(),
                    event.fbtype().unwrap_or("-")
                );
                classified.rejections.uninteresting_subtype += 1;
                continue;
            }

            classified.events.push(event);
        }

        classified
    }

    fn subtype_is_interesting(
        &self,
        event: &CanonicalEvent
    ) -> bool {
        if event.event_type() != self.complaint_event_type {
            return true;
        }

        event
            .fbtype()
            .is_some_and(|fbtype| self.complaint_subtypes.contains(fbtype))
    }
}
