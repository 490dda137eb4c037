use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Identity and metadata of the container that emitted a log line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// A single log line as delivered by the inbound source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub container: ContainerInfo,
    #[serde(rename = "data", alias = "payload")]
    pub payload: String,
    #[serde(default = "Utc::now")]
    pub time: DateTime<Utc>,
    #[serde(default = "default_source")]
    pub source: String,
}

fn default_source() -> String {
    "stdout".to_string()
}

impl LogRecord {
    /// Matches `^[[:space:]]*$`. POSIX space includes the vertical tab,
    /// which `is_ascii_whitespace` does not.
    pub fn is_blank(&self) -> bool {
        self.payload
            .bytes()
            .all(|b| b.is_ascii_whitespace() || b == 0x0b)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        if key.is_empty() {
            return None;
        }
        self.container.labels.get(key).map(String::as_str)
    }
}

/// The fixed set of fields sent downstream for every record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRecord {
    pub tag: String,
    pub time: DateTime<Utc>,
    pub fields: BTreeMap<String, String>,
}

impl OutboundRecord {
    pub fn new(tag: String, record: &LogRecord) -> Self {
        let fields = BTreeMap::from([
            ("log".to_string(), record.payload.clone()),
            ("container_id".to_string(), record.container.id.clone()),
            ("container_name".to_string(), record.container.name.clone()),
            ("source".to_string(), record.source.clone()),
        ]);
        Self {
            tag,
            time: record.time,
            fields,
        }
    }
}

#[cfg(test)]
pub(crate) fn test_record(payload: &str) -> LogRecord {
    LogRecord {
        container: ContainerInfo {
            id: "abc123".to_string(),
            name: "web".to_string(),
            hostname: "abc123host".to_string(),
            labels: HashMap::from([("svc".to_string(), "api".to_string())]),
        },
        payload: payload.to_string(),
        time: DateTime::from_timestamp(1_700_000_000, 250_000_000).unwrap_or_default(),
        source: "stdout".to_string(),
    }
}
