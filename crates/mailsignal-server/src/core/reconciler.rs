use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap, HashSet};

use mailsignal_proto::{CanonicalEvent, MetadataRecord};
use tracing::{debug, info, warn};

use super::cache::{CacheError, MetadataCache};

#[derive(Debug, Clone, Default)]
pub struct ReconcileResult {
    /// Events carrying a recipient, original or restored, in input order.
    pub whole_events: Vec<CanonicalEvent>,
    /// Message ids this batch introduced to the cache.
    pub new_message_ids: HashSet<String>,
    /// Events that arrived with a recipient, before any augmentation.
    pub rcpt_to_events: Vec<CanonicalEvent>,
    /// Events dropped because no recipient could be restored.
    pub dropped: usize,
}

/// Restores recipient metadata on events that arrive without it.
///
/// Events carrying `rcpt_to` seed the message id map; every event missing
/// an important field is then completed from it where possible.
#[derive(Debug, Clone)]
pub struct Reconciler {
    important_fields: Vec<String>,
}

impl Reconciler {
    pub fn new(important_fields: Vec<String>) -> Self {
        Self { important_fields }
    }

    pub async fn reconcile(
        &self,
        events: Vec<CanonicalEvent>,
        cache: &dyn MetadataCache
    ) -> Result<ReconcileResult, CacheError> {
        let rcpt_to_events: Vec<CanonicalEvent> =
            events.iter().filter(|event| event.has_identity()).cloned().collect();
        debug!(
            "events partitioned: with_rcpt_to={}, anonymous={}",
            rcpt_to_events.len(),
            events.len() - rcpt_to_events.len()
        );

        let id_map = self.build_message_id_map(&rcpt_to_events);
        let new_message_ids = cache.put_many(id_map).await?;
        debug!("message ids cached: new={}", new_message_ids.len());

        let mut events = events;
        self.augment(&mut events, cache).await?;

        let total = events.len();
        let whole_events: Vec<CanonicalEvent> =
            events.into_iter().filter(CanonicalEvent::has_identity).collect();
        let dropped = total - whole_events.len();
        if dropped > 0 {
            // Usually lifecycle events for messages injected before we
            // started listening.
            info!(
                "events dropped without rcpt_to: dropped={}, kept={}",
                dropped,
                whole_events.len()
            );
        }

        Ok(ReconcileResult { whole_events, new_message_ids, rcpt_to_events, dropped })
    }

    /// Projects events onto the important fields, keyed by message id.
    ///
    /// Fields carried by a later event for the same id replace earlier ones.
    fn build_message_id_map(
        &self,
        rcpt_to_events: &[CanonicalEvent]
    ) -> HashMap<String, MetadataRecord> {
        let mut id_map: HashMap<String, MetadataRecord> = HashMap::new();

        for event in rcpt_to_events {
            let Some(message_id) = event.message_id() else {
                debug!(
                    "event with rcpt_to but no message_id not cached: type={}",
                    event.event_type()
                );
                continue;
            };

            let record = event.project(&self.important_fields);
            match id_map.entry(message_id.to_string()) {
                Entry::Occupied(mut slot) => {
                    if slot.get().rcpt_to() != record.rcpt_to() {
                        warn!(
                            "conflicting rcpt_to within batch, keeping last: message_id={}, previous={}, current={}",
                            message_id,
                            slot.get().rcpt_to().unwrap_or("-"),
                            record.rcpt_to().unwrap_or("-")
                        );
                    }
                    slot.get_mut().overlay(record);
                }
                Entry::Vacant(slot) => {
                    slot.insert(record);
                }
            }
        }

        id_map
    }

    async fn augment(
        &self,
        events: &mut [CanonicalEvent],
        cache: &dyn MetadataCache
    ) -> Result<(), CacheError> {
        let fixup_ids: BTreeSet<String> = events
            .iter()
            .filter(|event| event.missing_any(&self.important_fields))
            .filter_map(|event| event.message_id().map(str::to_string))
            .collect();
        if fixup_ids.is_empty() {
            return Ok(());
        }

        let fixup_ids: Vec<String> = fixup_ids.into_iter().collect();
        let cached = cache.get_many(&fixup_ids).await?;

        let mut fixed = 0usize;
        let mut unknown = 0usize;
        for event in events.iter_mut() {
            if !event.missing_any(&self.important_fields) {
                continue;
            }

            match event.message_id().and_then(|id| cached.get(id)) {
                Some(record) => {
                    let added = event.merge_missing(record);
                    debug!(
                        "event augmented: type={}, message_id={}, fields_added={}",
                        event.event_type(),
                        event.message_id().unwrap_or("-"),
                        added
                    );
                    fixed += 1;
                }
                None => unknown += 1,
            }
        }

        debug!("events augmented from cache: fixed={}", fixed);
        if unknown > 0 {
            warn!("events without cached metadata: count={}", unknown);
        }

        Ok(())
    }
}
