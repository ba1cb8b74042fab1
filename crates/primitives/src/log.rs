//! Entries of the shared block log.
//!
//! An entry is a flat map of string fields. The field names are part of the
//! wire format and shared with every other node reading the log.

use std::collections::HashMap;

pub const FIELD_PAYLOAD_ID: &str = "payload_id";
pub const FIELD_EXECUTION_PAYLOAD: &str = "execution_payload";
pub const FIELD_SENDER_INSTANCE_ID: &str = "sender_instance_id";
/// Nanoseconds since the unix epoch at which the entry was appended.
pub const FIELD_TIMESTAMP: &str = "timestamp";

/// Position of an entry in the log, assigned by the store on append.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(String);

impl EntryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A finalized block as announced by the leader that built it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub id: EntryId,
    pub payload_id: String,
    pub encoded_payload: String,
    pub sender_instance_id: String,
    pub enqueued_at_nanos: u64,
}

#[derive(Debug, thiserror::Error)]
#[error("log entry `{id}` is malformed: {reason}")]
pub struct MalformedEntry {
    pub id: EntryId,
    pub reason: String,
}

impl LogEntry {
    /// Reads an entry from the raw fields the store returned for `id`.
    ///
    /// The payload, its id, and the sender are required; a missing or
    /// unparsable timestamp is tolerated and read as zero.
    pub fn from_fields(id: EntryId, fields: &HashMap<String, String>) -> Result<Self, MalformedEntry> {
        let required = |name: &str| match fields.get(name) {
            Some(value) if !value.is_empty() => Ok(value.clone()),
            Some(_) => Err(MalformedEntry {
                id: id.clone(),
                reason: format!("field `{name}` is empty"),
            }),
            None => Err(MalformedEntry {
                id: id.clone(),
                reason: format!("field `{name}` is missing"),
            }),
        };

        Ok(Self {
            payload_id: required(FIELD_PAYLOAD_ID)?,
            encoded_payload: required(FIELD_EXECUTION_PAYLOAD)?,
            sender_instance_id: required(FIELD_SENDER_INSTANCE_ID)?,
            enqueued_at_nanos: fields
                .get(FIELD_TIMESTAMP)
                .and_then(|ts| ts.parse().ok())
                .unwrap_or_default(),
            id,
        })
    }

    /// The fields to append for a block built by `sender_instance_id`.
    pub fn to_fields(
        payload_id: &str,
        encoded_payload: &str,
        sender_instance_id: &str,
        enqueued_at_nanos: u64,
    ) -> Vec<(&'static str, String)> {
        vec![
            (FIELD_PAYLOAD_ID, payload_id.to_owned()),
            (FIELD_EXECUTION_PAYLOAD, encoded_payload.to_owned()),
            (FIELD_TIMESTAMP, enqueued_at_nanos.to_string()),
            (FIELD_SENDER_INSTANCE_ID, sender_instance_id.to_owned()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{EntryId, FIELD_EXECUTION_PAYLOAD, LogEntry};

    fn fields() -> HashMap<String, String> {
        LogEntry::to_fields("0x01", "AAEC", "node-a", 42)
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v))
            .collect()
    }

    #[test]
    fn published_fields_read_back_as_an_entry() {
        let entry = LogEntry::from_fields(EntryId::new("1-0"), &fields()).unwrap();
        assert_eq!(entry.payload_id, "0x01");
        assert_eq!(entry.encoded_payload, "AAEC");
        assert_eq!(entry.sender_instance_id, "node-a");
        assert_eq!(entry.enqueued_at_nanos, 42);
    }

    #[test]
    fn entry_without_payload_is_malformed() {
        let mut fields = fields();
        fields.remove(FIELD_EXECUTION_PAYLOAD);
        let error = LogEntry::from_fields(EntryId::new("7-0"), &fields).unwrap_err();
        assert_eq!(error.id.as_str(), "7-0");
        assert!(error.reason.contains("execution_payload"));
    }

    #[test]
    fn entry_with_empty_payload_is_malformed() {
        let mut fields = fields();
        fields.insert(FIELD_EXECUTION_PAYLOAD.to_owned(), String::new());
        assert!(LogEntry::from_fields(EntryId::new("7-0"), &fields).is_err());
    }
}
