use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

mod outbound;

pub use outbound::{Identify, OutboundBatch, OutboundCall, OutboundMessage, Track, Traits};

pub const FIELD_TYPE: &str = "type";
pub const FIELD_MESSAGE_ID: &str = "message_id";
pub const FIELD_RCPT_TO: &str = "rcpt_to";
pub const FIELD_RCPT_META: &str = "rcpt_meta";
pub const FIELD_TAGS: &str = "tags";
pub const FIELD_FBTYPE: &str = "fbtype";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtoError {
    #[error("event is not a json object")]
    NotAnObject,
    #[error("event has no `{0}` root")]
    MissingRoot(String),
    #[error("event carries no known event class")]
    NoEventClass,
    #[error("event carries several event classes: {}", .0.join(","))]
    AmbiguousEventClass(Vec<String>),
    #[error("event class `{0}` is not a json object")]
    ClassNotAnObject(String),
    #[error("event has no string `type` field")]
    MissingType,
    #[error("unknown event type: {0}")]
    UnknownEventType(String),
}

/// Provider event types this bridge knows how to reason about.
///
/// Anything else arriving on the webhook is treated as uninteresting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Reception,
    Injection,
    Delivery,
    Inband,
    OutOfBand,
    Bounce,
    Delay,
    Tempfail,
    PolicyRejection,
    Feedback,
    SpamComplaint,
    Open,
    Click,
    ListUnsubscribe,
    LinkUnsubscribe,
}

impl EventType {
    pub const ALL: [EventType; 15] = [
        Self::Reception,
        Self::Injection,
        Self::Delivery,
        Self::Inband,
        Self::OutOfBand,
        Self::Bounce,
        Self::Delay,
        Self::Tempfail,
        Self::PolicyRejection,
        Self::Feedback,
        Self::SpamComplaint,
        Self::Open,
        Self::Click,
        Self::ListUnsubscribe,
        Self::LinkUnsubscribe,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reception => "reception",
            Self::Injection => "injection",
            Self::Delivery => "delivery",
            Self::Inband => "inband",
            Self::OutOfBand => "out_of_band",
            Self::Bounce => "bounce",
            Self::Delay => "delay",
            Self::Tempfail => "tempfail",
            Self::PolicyRejection => "policy_rejection",
            Self::Feedback => "feedback",
            Self::SpamComplaint => "spam_complaint",
            Self::Open => "open",
            Self::Click => "click",
            Self::ListUnsubscribe => "list_unsubscribe",
            Self::LinkUnsubscribe => "link_unsubscribe",
        }
    }

    /// Injection/reception events only seed the recipient map; they are
    /// never tracked themselves.
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::Reception | Self::Injection)
    }
}

impl fmt::Display for EventType {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ProtoError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| ProtoError::UnknownEventType(value.to_string()))
    }
}

/// Subset of event fields cached per message id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataRecord(Map<String, Value>);

impl MetadataRecord {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    pub fn get(
        &self,
        field: &str
    ) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn rcpt_to(&self) -> Option<&str> {
        self.0.get(FIELD_RCPT_TO).and_then(Value::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Replaces fields present in `newer` and keeps the rest.
    pub fn overlay(
        &mut self,
        newer: MetadataRecord
    ) {
        self.0.extend(newer.0.into_iter().filter(|(_, value)| is_present(value)));
    }
}

/// Null and empty strings count as absent.
fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(text) => !text.is_empty(),
        _ => true,
    }
}

/// An event with its provider envelope removed.
///
/// The full object is kept so fields outside the important set (subject,
/// click target, user agent...) remain available downstream.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalEvent {
    kind: EventType,
    fields: Map<String, Value>,
}

impl CanonicalEvent {
    pub fn from_object(fields: Map<String, Value>) -> Result<Self, ProtoError> {
        let kind = fields
            .get(FIELD_TYPE)
            .and_then(Value::as_str)
            .ok_or(ProtoError::MissingType)?
            .parse()?;
        Ok(Self { kind, fields })
    }

    pub fn event_type(&self) -> EventType {
        self.kind
    }

    pub fn field(
        &self,
        name: &str
    ) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn str_field(
        &self,
        name: &str
    ) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// True when `name` holds something other than null or an empty string.
    pub fn has_field(
        &self,
        name: &str
    ) -> bool {
        self.fields.get(name).is_some_and(is_present)
    }

    pub fn message_id(&self) -> Option<&str> {
        self.str_field(FIELD_MESSAGE_ID).filter(|id| !id.is_empty())
    }

    pub fn rcpt_to(&self) -> Option<&str> {
        self.str_field(FIELD_RCPT_TO).filter(|rcpt| !rcpt.is_empty())
    }

    pub fn rcpt_meta(&self) -> Option<&Map<String, Value>> {
        self.fields.get(FIELD_RCPT_META).and_then(Value::as_object)
    }

    pub fn tags(&self) -> Option<&Vec<Value>> {
        self.fields.get(FIELD_TAGS).and_then(Value::as_array)
    }

    pub fn fbtype(&self) -> Option<&str> {
        self.str_field(FIELD_FBTYPE)
    }

    /// True when the event carries a usable recipient address.
    pub fn has_identity(&self) -> bool {
        self.rcpt_to().is_some()
    }

    pub fn missing_any(
        &self,
        fields: &[String]
    ) -> bool {
        fields.iter().any(|name| !self.has_field(name))
    }

    pub fn project(
        &self,
        fields: &[String]
    ) -> MetadataRecord {
        let picked = fields
            .iter()
            .filter_map(|name| {
                self.fields
                    .get(name)
                    .filter(|value| is_present(value))
                    .map(|value| (name.clone(), value.clone()))
            })
            .collect();
        MetadataRecord(picked)
    }

    /// Copies record fields the event does not already carry.
    ///
    /// Returns how many fields were added.
    pub fn merge_missing(
        &mut self,
        record: &MetadataRecord
    ) -> usize {
        let mut added = 0;
        for (name, value) in record.iter() {
            if !self.has_field(name) {
                self.fields.insert(name.clone(), value.clone());
                added += 1;
            }
        }
        added
    }

    pub fn as_object(&self) -> &Map<String, Value> {
        &self.fields
    }
}

/// Removes the provider wrapping from a raw webhook event.
///
/// With a `root` the event must look like `{root: {class: {...}}}`,
/// otherwise `{class: {...}}`. Exactly one of `classes` may be present.
/// Returns the matched class name alongside the event.
pub fn unwrap_event<'c>(
    raw: &Value,
    root: Option<&str>,
    classes: &'c [String]
) -> Result<(&'c str, CanonicalEvent), ProtoError> {
    let outer = raw.as_object().ok_or(ProtoError::NotAnObject)?;
    let container = match root {
        Some(root) => outer
            .get(root)
            .and_then(Value::as_object)
            .ok_or_else(|| ProtoError::MissingRoot(root.to_string()))?,
        None => outer,
    };

    let mut present =
        classes.iter().filter(|class| container.contains_key(class.as_str()));
    let class = present.next().ok_or(ProtoError::NoEventClass)?;
    let extra: Vec<String> = present.cloned().collect();
    if !extra.is_empty() {
        let mut all = vec![class.clone()];
        all.extend(extra);
        return Err(ProtoError::AmbiguousEventClass(all));
    }

    let body = container
        .get(class.as_str())
        .and_then(Value::as_object)
        .ok_or_else(|| ProtoError::ClassNotAnObject(class.clone()))?;

    let event = CanonicalEvent::from_object(body.clone())?;
    Ok((class.as_str(), event))
}
