use serde::Serialize;
use serde_json::{Map, Value};

pub type Traits = Map<String, Value>;

/// Binds a user id to profile traits.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identify {
    pub user_id: String,
    pub traits: Traits,
}

/// Records a named occurrence for a user id.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub user_id: String,
    pub event: String,
    pub properties: Map<String, Value>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundCall {
    Identify(Identify),
    Track(Track),
}

/// One entry of a batch upload; `messageId` lets the sink drop replays.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    #[serde(flatten)]
    pub call: OutboundCall,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundBatch {
    pub batch: Vec<OutboundMessage>,
}
