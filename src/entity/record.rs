use crate::core::{DbError, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle tag of an entity.
///
/// `New` becomes `Persistent` after the first successful write. A remove
/// request turns `Persistent` into `PendingRemoval` (then `Removed` once the
/// delete lands) and `New` into `Abandoned`, which never touches the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PersistenceState {
    New,
    Persistent,
    PendingRemoval,
    Removed,
    Abandoned,
}

impl PersistenceState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Removed | Self::Abandoned)
    }
}

impl fmt::Display for PersistenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::New => "new",
            Self::Persistent => "persistent",
            Self::PendingRemoval => "pendingRemoval",
            Self::Removed => "removed",
            Self::Abandoned => "abandoned",
        };
        write!(f, "{label}")
    }
}

/// Serialized shape of an entity.
///
/// `schema_version` is informational on read: decoders overwrite it with the
/// owning cache's version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRecord<I> {
    pub id: Uuid,
    #[serde(default)]
    pub schema_version: u32,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved: Option<DateTime<Utc>>,
    pub item: I,
    pub persistence_state: PersistenceState,
    pub version: u64,
}

impl<I: Serialize> EntityRecord<I> {
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| DbError::ExecutionError(format!("Failed to encode entity: {}", e)))
    }
}

impl<T: DeserializeOwned> EntityRecord<T> {
    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| DbError::Decoding(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        my_int: i64,
    }

    #[test]
    fn test_record_shape() {
        let id = Uuid::new_v4();
        let record = EntityRecord {
            id,
            schema_version: 2,
            created: Utc::now(),
            saved: None,
            item: Sample { my_int: 10 },
            persistence_state: PersistenceState::Persistent,
            version: 1,
        };

        let value: serde_json::Value = serde_json::from_slice(&record.encode().unwrap()).unwrap();
        assert_eq!(value["id"], json!(id.to_string()));
        assert_eq!(value["schemaVersion"], json!(2));
        assert_eq!(value["persistenceState"], json!("persistent"));
        assert_eq!(value["item"]["my_int"], json!(10));
        assert!(value.get("saved").is_none());
    }

    #[test]
    fn test_missing_required_field_is_decoding_error() {
        let data = json!({
            "id": Uuid::new_v4().to_string(),
            "created": Utc::now().to_rfc3339(),
            "item": { "my_int": 1 },
            "version": 3
        });
        let err = EntityRecord::<Sample>::decode(data.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, DbError::Decoding(message) if message.contains("persistenceState")));
    }

    #[test]
    fn test_schema_version_is_optional() {
        let data = json!({
            "id": Uuid::new_v4().to_string(),
            "created": Utc::now().to_rfc3339(),
            "saved": Utc::now().to_rfc3339(),
            "item": { "my_int": 1 },
            "persistenceState": "persistent",
            "version": 3
        });
        let record = EntityRecord::<Sample>::decode(data.to_string().as_bytes()).unwrap();
        assert_eq!(record.schema_version, 0);
        assert!(record.saved.is_some());
        assert_eq!(record.version, 3);
    }

    #[test]
    fn test_garbage_is_decoding_error() {
        let err = EntityRecord::<Sample>::decode(b"not json").unwrap_err();
        assert!(matches!(err, DbError::Decoding(_)));
    }
}
