//! Channel registry and payload normalization.
//!
//! The set of domain channels is closed and known at startup; lifecycle
//! channels are reserved names the connection manager publishes on and are
//! never accepted from the broker. Normalization is tolerant: missing ids
//! fall back to per-channel defaults and malformed payloads are droppable,
//! never an error.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const CHANNEL_TRANSACTIONS: &str = "transactions:new";
pub const CHANNEL_TOKENS: &str = "tokens:updated";
pub const CHANNEL_PAIRS: &str = "pairs:updated";
pub const CHANNEL_METRICS: &str = "metrics:updated";

/// Every domain channel the upstream subscription covers.
pub const DOMAIN_CHANNELS: [&str; 4] = [
    CHANNEL_TRANSACTIONS,
    CHANNEL_TOKENS,
    CHANNEL_PAIRS,
    CHANNEL_METRICS,
];

/// Reserved prefix keeping lifecycle names disjoint from domain names.
pub const LIFECYCLE_PREFIX: &str = "lifecycle:";

pub const LIFECYCLE_CONNECTED: &str = "lifecycle:connected";
pub const LIFECYCLE_DISCONNECTED: &str = "lifecycle:disconnected";
pub const LIFECYCLE_ERROR: &str = "lifecycle:error";
pub const LIFECYCLE_SUSPENDED: &str = "lifecycle:suspended";

pub const LIFECYCLE_CHANNELS: [&str; 4] = [
    LIFECYCLE_CONNECTED,
    LIFECYCLE_DISCONNECTED,
    LIFECYCLE_ERROR,
    LIFECYCLE_SUSPENDED,
];

/// Entity id used when a payload carries nothing identifying.
const FALLBACK_ENTITY_ID: &str = "unknown";

/// Entity id for process-wide metrics events.
const GLOBAL_METRICS_ENTITY_ID: &str = "global";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Transaction,
    Token,
    Pair,
    Metric,
    Unknown,
}

/// Uniform event shape delivered to clients. `entity_type`, `entity_id`
/// and `timestamp` are always present; the remaining payload fields ride
/// along flattened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedPayload {
    #[serde(rename = "entityType")]
    pub entity_type: EntityType,
    #[serde(rename = "entityId")]
    pub entity_id: String,
    pub timestamp: i64,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Normalize a raw broker payload for the given channel.
///
/// Returns `None` for payloads that are not JSON objects; those are
/// droppable and the caller logs and moves on. Unknown channel names pass
/// through with only the generic envelope fields filled in.
pub fn normalize(channel: &str, raw: &Value) -> Option<NormalizedPayload> {
    let mut fields = raw.as_object()?.clone();

    let timestamp = fields
        .get("timestamp")
        .and_then(Value::as_i64)
        .unwrap_or_else(|| Utc::now().timestamp_millis());

    let (entity_type, entity_id) = match channel {
        CHANNEL_TRANSACTIONS => (
            EntityType::Transaction,
            first_string(&fields, &["id", "transactionId", "txHash"])
                .unwrap_or_else(|| FALLBACK_ENTITY_ID.to_string()),
        ),
        CHANNEL_TOKENS => (
            EntityType::Token,
            first_string(&fields, &["id", "address"])
                .unwrap_or_else(|| FALLBACK_ENTITY_ID.to_string()),
        ),
        CHANNEL_PAIRS => (
            EntityType::Pair,
            first_string(&fields, &["id", "pairAddress"])
                .unwrap_or_else(|| FALLBACK_ENTITY_ID.to_string()),
        ),
        CHANNEL_METRICS => {
            fields
                .entry("metricType")
                .or_insert_with(|| Value::String("unknown".to_string()));
            (
                EntityType::Metric,
                first_string(&fields, &["id"])
                    .unwrap_or_else(|| GLOBAL_METRICS_ENTITY_ID.to_string()),
            )
        }
        _ => (
            EntityType::Unknown,
            first_string(&fields, &["id"])
                .unwrap_or_else(|| FALLBACK_ENTITY_ID.to_string()),
        ),
    };

    // The envelope owns these keys; leaving copies in the flattened
    // remainder would produce duplicate keys on serialization.
    for reserved in ["entityType", "entityId", "timestamp"] {
        fields.remove(reserved);
    }

    Some(NormalizedPayload {
        entity_type,
        entity_id,
        timestamp,
        fields,
    })
}

fn first_string(fields: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| fields.get(*key).and_then(Value::as_str).map(str::to_string))
}
