//! Newtype wrappers for identifiers to ensure type safety.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new id from a string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a new random id.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Get the inner string reference.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner string.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_id!(
    /// Marketplace node id of a provider.
    ProviderId
);

string_id!(
    /// Identifier of an agreement negotiated with one provider.
    AgreementId
);

string_id!(
    /// Identifier of a live activity (remote execution context).
    ActivityId
);

string_id!(
    /// Identifier the reporting backend assigns to one benchmark run.
    RunId
);

/// Serde adapter for a [`RunId`] the backend expects as a JSON number.
///
/// Ids that are canonical unsigned integers are written as numbers, anything
/// else as a string. Both forms are accepted when reading.
pub mod numeric_run_id {
    use super::RunId;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Wire {
        Number(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(id: &RunId, serializer: S) -> Result<S::Ok, S::Error> {
        match id.as_str().parse::<u64>() {
            Ok(n) if n.to_string() == id.as_str() => serializer.serialize_u64(n),
            _ => serializer.serialize_str(id.as_str()),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<RunId, D::Error> {
        Ok(match Wire::deserialize(deserializer)? {
            Wire::Number(n) => RunId::new(n.to_string()),
            Wire::Text(s) => RunId::new(s),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_unique() {
        let id1 = ActivityId::generate();
        let id2 = ActivityId::generate();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_id_display() {
        let id = ProviderId::new("0xabc");
        assert_eq!(format!("{}", id), "0xabc");
    }

    #[test]
    fn test_id_serializes_as_plain_string() {
        let id = RunId::new("42");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"42\"");
    }

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Envelope {
        #[serde(with = "numeric_run_id")]
        task_id: RunId,
    }

    #[test]
    fn test_numeric_run_id_written_as_number() {
        let value = serde_json::to_value(Envelope { task_id: RunId::new("42") }).unwrap();
        assert_eq!(value, serde_json::json!({"task_id": 42}));
    }

    #[test]
    fn test_non_canonical_run_id_stays_a_string() {
        for id in ["abc", "007", "-3"] {
            let value = serde_json::to_value(Envelope { task_id: RunId::new(id) }).unwrap();
            assert_eq!(value["task_id"], id);
        }
    }

    #[test]
    fn test_numeric_run_id_reads_both_forms() {
        let number: Envelope = serde_json::from_str(r#"{"task_id": 42}"#).unwrap();
        let text: Envelope = serde_json::from_str(r#"{"task_id": "run-1"}"#).unwrap();
        assert_eq!(number.task_id, RunId::new("42"));
        assert_eq!(text.task_id, RunId::new("run-1"));
    }
}
