//! Core domain model for carelog: entity catalogue and dataset row types.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "carelog-core";

/// Entity types with a raw-record prefix and a derived dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Patient,
    Provider,
    Message,
    Video,
    Conversation,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Patient,
        EntityKind::Provider,
        EntityKind::Message,
        EntityKind::Video,
        EntityKind::Conversation,
    ];

    /// Storage prefix the raw records of this entity live under.
    ///
    /// Patients and providers are listed directly; the remaining kinds are
    /// webhook events filed under their dot-separated event type rewritten
    /// as a path.
    pub const fn raw_prefix(self) -> &'static str {
        match self {
            EntityKind::Patient => "patients",
            EntityKind::Provider => "providers",
            EntityKind::Message => "conversation/message/created",
            EntityKind::Video => "appointment/completed",
            EntityKind::Conversation => "conversation/created",
        }
    }

    /// Object key of the derived dataset in the analytics bucket.
    pub const fn dataset_key(self) -> &'static str {
        match self {
            EntityKind::Patient => "patients.ndjson",
            EntityKind::Provider => "providers.ndjson",
            EntityKind::Message => "messages.ndjson",
            EntityKind::Video => "videos.ndjson",
            EntityKind::Conversation => "conversations.ndjson",
        }
    }

    /// Whether the raw-record key stem is the dataset identifier.
    ///
    /// Conversations are the exception: their raw records are keyed by the
    /// creation event's id while the dataset is keyed by the conversation
    /// id nested in the payload, so a key-stem diff cannot stand in for
    /// the row-id diff there.
    pub const fn raw_key_matches_row_id(self) -> bool {
        !matches!(self, EntityKind::Conversation)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            EntityKind::Patient => "patient",
            EntityKind::Provider => "provider",
            EntityKind::Message => "message",
            EntityKind::Video => "video",
            EntityKind::Conversation => "conversation",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contract a dataset row type fulfils so the materializer can load, diff
/// and append it generically.
pub trait TabularRow: Serialize + DeserializeOwned + Send {
    /// Object key of the dataset this row belongs to.
    const DATASET_KEY: &'static str;

    /// Identifier column value; unique across the dataset.
    fn row_id(&self) -> &str;
}

/// One patient, flattened. `medical_records` is attached after projection
/// from a secondary per-patient lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientRow {
    pub id: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub date_of_birth: Option<String>,
    #[serde(default)]
    pub sex: Option<String>,
    #[serde(default)]
    pub medical_records: u64,
}

impl TabularRow for PatientRow {
    const DATASET_KEY: &'static str = EntityKind::Patient.dataset_key();

    fn row_id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRow {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
}

impl TabularRow for ProviderRow {
    const DATASET_KEY: &'static str = EntityKind::Provider.dataset_key();

    fn row_id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: String,
    pub created_at: String,
    pub author_id: String,
    pub author_type: String,
    pub conversation_id: String,
}

impl TabularRow for MessageRow {
    const DATASET_KEY: &'static str = EntityKind::Message.dataset_key();

    fn row_id(&self) -> &str {
        &self.id
    }
}

/// One completed video appointment. `finish_at` is the completion event's
/// envelope timestamp, not a payload field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoRow {
    pub id: String,
    pub start_at: String,
    pub patient: String,
    pub provider: String,
    pub finish_at: String,
}

impl TabularRow for VideoRow {
    const DATASET_KEY: &'static str = EntityKind::Video.dataset_key();

    fn row_id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRow {
    pub conversation_id: String,
    pub patient_id: String,
}

impl TabularRow for ConversationRow {
    const DATASET_KEY: &'static str = EntityKind::Conversation.dataset_key();

    fn row_id(&self) -> &str {
        &self.conversation_id
    }
}

/// Row of the standalone medical-records snapshot artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MedicalRecordsRow {
    pub id: String,
    pub medical_records: u64,
}
