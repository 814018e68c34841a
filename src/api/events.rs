use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

/// Audit category carrying alarm events.
pub const ALARM_CATEGORY: &str = "ALARM";

/// A discrete audit event as returned by the audit endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AuditEvent {
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub router: String,
    #[serde(default)]
    pub node: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// Alarm shape returned by the legacy alarm-history endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct LegacyAlarm {
    #[serde(default)]
    pub node: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub process: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub event: Option<String>,
}

impl LegacyAlarm {
    /// Normalizes the legacy alarm into the audit event shape.
    ///
    /// Absent attributes become JSON nulls and are dropped with the other
    /// null fields before writing.
    pub fn into_event(self, router: &str) -> AuditEvent {
        let mut data = Map::with_capacity(7);
        let mut put = |key: &str, value: Option<String>| {
            data.insert(key.to_string(), value.map_or(Value::Null, Value::String));
        };

        put("uuid", self.id);
        put("process", self.process);
        put("source", self.source);
        put("category", self.category);
        put("severity", self.severity);
        put("type", self.event);
        put("message", self.message);

        AuditEvent {
            kind: "alarm".to_string(),
            router: router.to_string(),
            node: self.node,
            timestamp: self.time,
            data,
        }
    }
}
