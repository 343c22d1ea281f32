//! Projections from raw upstream records into flat dataset rows.
//!
//! Each function takes one raw JSON record and either returns the narrow
//! row shape for its entity or reports which required field was missing.
//! Upstream data is adversarially incomplete (a message may reference a
//! deleted author, a conversation may have no patients), so a failed
//! projection is an expected per-record outcome the caller logs and skips,
//! never a batch-level error.

use carelog_core::{ConversationRow, MessageRow, PatientRow, ProviderRow, VideoRow};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "carelog-extract";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProjectionError {
    #[error("missing required field {pointer}")]
    MissingField { pointer: &'static str },
}

fn required_str(raw: &JsonValue, pointer: &'static str) -> Result<String, ProjectionError> {
    raw.pointer(pointer)
        .and_then(JsonValue::as_str)
        .map(str::to_string)
        .ok_or(ProjectionError::MissingField { pointer })
}

fn optional_str(raw: &JsonValue, pointer: &str) -> Option<String> {
    raw.pointer(pointer)
        .and_then(JsonValue::as_str)
        .map(str::to_string)
}

/// Patient demographics. Only the id is required; demographic fields stay
/// empty when the upstream record omits them. `medical_records` starts at
/// zero and is filled in by the enrichment lookup.
pub fn patient_row(raw: &JsonValue) -> Result<PatientRow, ProjectionError> {
    Ok(PatientRow {
        id: required_str(raw, "/id")?,
        created_at: optional_str(raw, "/created_at"),
        date_of_birth: optional_str(raw, "/date_of_birth"),
        sex: optional_str(raw, "/sex"),
        medical_records: 0,
    })
}

pub fn provider_row(raw: &JsonValue) -> Result<ProviderRow, ProjectionError> {
    Ok(ProviderRow {
        id: required_str(raw, "/id")?,
        title: optional_str(raw, "/title"),
    })
}

/// Message-created event. Author and conversation references are required;
/// a record whose linked author was deleted drops out here.
pub fn message_row(raw: &JsonValue) -> Result<MessageRow, ProjectionError> {
    Ok(MessageRow {
        id: required_str(raw, "/id")?,
        created_at: required_str(raw, "/created_at")?,
        author_id: required_str(raw, "/data/author/id")?,
        author_type: required_str(raw, "/data/author/type")?,
        conversation_id: required_str(raw, "/data/conversation_id")?,
    })
}

/// Appointment-completed event. `finish_at` is deliberately the envelope's
/// `created_at`: the completion event fires when the appointment ends.
pub fn video_row(raw: &JsonValue) -> Result<VideoRow, ProjectionError> {
    Ok(VideoRow {
        id: required_str(raw, "/id")?,
        start_at: required_str(raw, "/data/start_at")?,
        patient: required_str(raw, "/data/patient/id")?,
        provider: required_str(raw, "/data/provider/id")?,
        finish_at: required_str(raw, "/created_at")?,
    })
}

/// Conversation-created event. Group conversations list several patients;
/// only the first is kept.
pub fn conversation_row(raw: &JsonValue) -> Result<ConversationRow, ProjectionError> {
    Ok(ConversationRow {
        conversation_id: required_str(raw, "/data/id")?,
        patient_id: required_str(raw, "/data/patients/0/id")?,
    })
}
