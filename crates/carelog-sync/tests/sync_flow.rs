//! End-to-end pipeline behavior against scripted upstream responses and
//! in-memory stores.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use carelog_core::{
    ConversationRow, EntityKind, MedicalRecordsRow, MessageRow, PatientRow, ProviderRow, VideoRow,
};
use carelog_storage::{
    ApiTransport, BlobStore, FetchError, MemoryBlobStore, CHECKPOINT_KEY, DEFAULT_EPOCH,
};
use carelog_sync::{Materializer, SyncConfig, SyncPipeline, MEDICAL_RECORDS_KEY};
use serde_json::{json, Value as JsonValue};
use tokio::sync::Mutex;

#[derive(Clone)]
enum Scripted {
    Json(JsonValue),
    Garbage,
}

/// Serves registered responses per URL, repeating the last one once the
/// script runs out, so re-runs see the same upstream state.
#[derive(Default)]
struct ScriptedTransport {
    responses: Mutex<HashMap<String, (usize, Vec<Scripted>)>>,
}

impl ScriptedTransport {
    async fn respond(&self, url: &str, body: JsonValue) {
        self.script(url, Scripted::Json(body)).await;
    }

    async fn respond_garbage(&self, url: &str) {
        self.script(url, Scripted::Garbage).await;
    }

    async fn script(&self, url: &str, response: Scripted) {
        self.responses
            .lock()
            .await
            .entry(url.to_string())
            .or_insert_with(|| (0, Vec::new()))
            .1
            .push(response);
    }
}

#[async_trait]
impl ApiTransport for ScriptedTransport {
    async fn get_json(&self, url: &str) -> Result<JsonValue, FetchError> {
        let mut responses = self.responses.lock().await;
        let (served, scripted) = responses
            .get_mut(url)
            .unwrap_or_else(|| panic!("unexpected request: {url}"));
        let index = (*served).min(scripted.len() - 1);
        *served += 1;
        match scripted[index].clone() {
            Scripted::Json(body) => Ok(body),
            Scripted::Garbage => Err(FetchError::Decode {
                url: url.to_string(),
                source: serde_json::from_str::<JsonValue>("<html>gone</html>").unwrap_err(),
            }),
        }
    }
}

const BASE: &str = "https://api.test/v1/server";

fn test_config() -> SyncConfig {
    SyncConfig {
        api_base_url: BASE.to_string(),
        api_key: "test-key".to_string(),
        data_dir: PathBuf::from("/unused"),
        raw_bucket: "raw".to_string(),
        analytics_bucket: "analytics".to_string(),
        http_timeout_secs: 5,
        scheduler_enabled: false,
        sync_cron: "0 6 * * *".to_string(),
    }
}

fn page(records: JsonValue, has_more: bool, next_cursor: Option<&str>) -> JsonValue {
    json!({"data": records, "has_more": has_more, "next_cursor": next_cursor})
}

async fn load_rows<T: serde::de::DeserializeOwned>(store: &MemoryBlobStore, key: &str) -> Vec<T> {
    let bytes = store.get(key).await.expect("dataset object");
    String::from_utf8(bytes)
        .expect("utf-8 dataset")
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).expect("dataset row"))
        .collect()
}

/// Cold start: no checkpoint, no datasets, a three-page feed and small
/// entity listings. One run must persist every raw record exactly once,
/// advance the checkpoint to the global maximum and materialize every
/// dataset, then a re-run against unchanged upstream state must change
/// nothing.
#[tokio::test]
async fn bootstrap_run_then_rerun_is_stable() {
    let transport = Arc::new(ScriptedTransport::default());
    let raw = Arc::new(MemoryBlobStore::new());
    let analytics = Arc::new(MemoryBlobStore::new());

    let events_url = format!("{BASE}/webhook_events?created_at_gt={DEFAULT_EPOCH}");
    transport
        .respond(
            &events_url,
            page(
                json!([
                    {
                        "id": "evt_m1",
                        "type": "conversation.message.created",
                        "created_at": "2023-04-02T10:00:00",
                        "data": {
                            "author": {"id": "pat_1", "type": "patient"},
                            "conversation_id": "conv_1"
                        }
                    },
                    {
                        "id": "evt_v1",
                        "type": "appointment.completed",
                        "created_at": "2023-04-02T11:00:00",
                        "data": {
                            "start_at": "2023-04-02T10:30:00",
                            "patient": {"id": "pat_1"},
                            "provider": {"id": "prov_1"}
                        }
                    }
                ]),
                true,
                Some("c1"),
            ),
        )
        .await;
    transport
        .respond(
            &format!("{events_url}&cursor=c1"),
            page(
                json!([
                    {
                        "id": "evt_c1",
                        "type": "conversation.created",
                        "created_at": "2023-04-03T09:00:00.500Z",
                        "data": {"id": "conv_1", "patients": [{"id": "pat_1"}]}
                    },
                    {
                        "id": "evt_c2",
                        "type": "conversation.created",
                        "created_at": "2023-04-01T07:00:00",
                        "data": {"id": "conv_2", "patients": [{"id": "pat_2"}]}
                    }
                ]),
                true,
                Some("c2"),
            ),
        )
        .await;
    transport
        .respond(
            &format!("{events_url}&cursor=c2"),
            page(
                json!([
                    {
                        "id": "evt_m2",
                        "type": "conversation.message.created",
                        "created_at": "2023-04-02T12:00:00",
                        "data": {
                            "author": {"id": "prov_1", "type": "provider"},
                            "conversation_id": "conv_2"
                        }
                    },
                    {
                        "id": "evt_v2",
                        "type": "appointment.completed",
                        "created_at": "2023-04-02T13:00:00",
                        "data": {
                            "start_at": "2023-04-02T12:30:00",
                            "patient": {"id": "pat_2"},
                            "provider": {"id": "prov_1"}
                        }
                    }
                ]),
                false,
                None,
            ),
        )
        .await;

    let patients_url = format!("{BASE}/patients");
    transport
        .respond(
            &patients_url,
            page(
                json!([{"id": "pat_1", "created_at": "2023-01-01T08:00:00", "date_of_birth": "1990-05-04", "sex": "FEMALE"}]),
                true,
                Some("p1"),
            ),
        )
        .await;
    transport
        .respond(
            &format!("{patients_url}?cursor=p1"),
            page(json!([{"id": "pat_2", "sex": "MALE"}]), false, None),
        )
        .await;
    transport
        .respond(
            &format!("{BASE}/providers"),
            page(json!([{"id": "prov_1", "title": "Dr."}]), false, None),
        )
        .await;

    // pat_1's enrichment body is unusable (deleted patient); pat_2's works.
    transport
        .respond_garbage(&format!("{BASE}/patients/pat_1/medical_data"))
        .await;
    transport
        .respond(
            &format!("{BASE}/patients/pat_2/medical_data"),
            json!({"total_count": 5}),
        )
        .await;

    let pipeline = SyncPipeline::with_components(
        test_config(),
        transport.clone(),
        raw.clone(),
        analytics.clone(),
    );

    let summary = pipeline.run_once().await.expect("bootstrap run");
    assert_eq!(summary.events, 6);
    assert_eq!(summary.patients_listed, 2);
    assert_eq!(summary.providers_listed, 1);
    assert_eq!(summary.checkpoint, "2023-04-03T09:00:00");
    assert_eq!(
        raw.get(CHECKPOINT_KEY).await.expect("checkpoint"),
        b"2023-04-03T09:00:00"
    );

    // Every event landed under its type path, exactly once.
    assert_eq!(raw.list("conversation/message/created").await.unwrap().len(), 2);
    assert_eq!(raw.list("appointment/completed").await.unwrap().len(), 2);
    assert_eq!(raw.list("conversation/created").await.unwrap().len(), 2);
    assert_eq!(raw.list("patients").await.unwrap().len(), 2);
    assert_eq!(raw.list("providers").await.unwrap().len(), 1);

    let patients: Vec<PatientRow> = load_rows(&analytics, "patients.ndjson").await;
    assert_eq!(patients.len(), 2);
    let pat_1 = patients.iter().find(|p| p.id == "pat_1").expect("pat_1");
    assert_eq!(pat_1.medical_records, 0);
    assert_eq!(pat_1.date_of_birth.as_deref(), Some("1990-05-04"));
    let pat_2 = patients.iter().find(|p| p.id == "pat_2").expect("pat_2");
    assert_eq!(pat_2.medical_records, 5);

    let providers: Vec<ProviderRow> = load_rows(&analytics, "providers.ndjson").await;
    assert_eq!(providers.len(), 1);
    assert_eq!(providers[0].title.as_deref(), Some("Dr."));

    let messages: Vec<MessageRow> = load_rows(&analytics, "messages.ndjson").await;
    assert_eq!(messages.len(), 2);

    let videos: Vec<VideoRow> = load_rows(&analytics, "videos.ndjson").await;
    let video = videos.iter().find(|v| v.id == "evt_v1").expect("evt_v1");
    assert_eq!(video.start_at, "2023-04-02T10:30:00");
    assert_eq!(video.finish_at, "2023-04-02T11:00:00");

    let conversations: Vec<ConversationRow> = load_rows(&analytics, "conversations.ndjson").await;
    assert_eq!(conversations.len(), 2);

    let counts: Vec<MedicalRecordsRow> = load_rows(&analytics, MEDICAL_RECORDS_KEY).await;
    assert_eq!(counts.len(), 2);

    // Second run: the feed has nothing new past the advanced checkpoint;
    // listings re-serve the same pages. Nothing may change.
    transport
        .respond(
            &format!("{BASE}/webhook_events?created_at_gt=2023-04-03T09:00:00"),
            page(json!([]), false, None),
        )
        .await;

    let second = pipeline.run_once().await.expect("second run");
    assert_eq!(second.events, 0);
    assert_eq!(second.checkpoint, "2023-04-03T09:00:00");
    assert!(second.datasets.iter().all(|d| d.rows_appended == 0));

    let patients_after: Vec<PatientRow> = load_rows(&analytics, "patients.ndjson").await;
    assert_eq!(patients_after, patients);
}

/// Rows already materialized are never refetched, rewritten or reordered;
/// only unseen ids are appended, after the existing rows.
#[tokio::test]
async fn materialize_appends_only_unseen_ids() {
    let transport = ScriptedTransport::default();
    let raw = MemoryBlobStore::new();
    let analytics = MemoryBlobStore::new();

    raw.put("providers/prov_1.json", br#"{"id":"prov_1","title":"Changed Upstream"}"#)
        .await
        .expect("seed raw");
    raw.put("providers/prov_2.json", br#"{"id":"prov_2","title":"RN"}"#)
        .await
        .expect("seed raw");
    analytics
        .put(
            "providers.ndjson",
            br#"{"id":"prov_1","title":"As First Materialized"}
"#,
        )
        .await
        .expect("seed dataset");

    let config = test_config();
    let api = api_config(&config);
    let materializer = Materializer::new(&transport, &raw, &analytics, &api);
    let outcome = materializer
        .materialize(EntityKind::Provider)
        .await
        .expect("materialize");
    assert_eq!(outcome.rows_before, 1);
    assert_eq!(outcome.rows_appended, 1);
    assert_eq!(outcome.records_dropped, 0);

    let rows: Vec<ProviderRow> = load_rows(&analytics, "providers.ndjson").await;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].id, "prov_1");
    assert_eq!(rows[0].title.as_deref(), Some("As First Materialized"));
    assert_eq!(rows[1].id, "prov_2");
}

/// A raw record missing a required nested field is excluded from the
/// dataset while the rest of the batch goes through.
#[tokio::test]
async fn malformed_records_are_dropped_not_fatal() {
    let transport = ScriptedTransport::default();
    let raw = MemoryBlobStore::new();
    let analytics = MemoryBlobStore::new();

    raw.put(
        "conversation/message/created/evt_bad.json",
        br#"{"id":"evt_bad","created_at":"2023-04-02T10:00:00","data":{"author":{"type":"patient"},"conversation_id":"conv_1"}}"#,
    )
    .await
    .expect("seed raw");
    raw.put(
        "conversation/message/created/evt_good.json",
        br#"{"id":"evt_good","created_at":"2023-04-02T10:05:00","data":{"author":{"id":"pat_1","type":"patient"},"conversation_id":"conv_1"}}"#,
    )
    .await
    .expect("seed raw");

    let config = test_config();
    let api = api_config(&config);
    let materializer = Materializer::new(&transport, &raw, &analytics, &api);
    let outcome = materializer
        .materialize(EntityKind::Message)
        .await
        .expect("materialize");
    assert_eq!(outcome.rows_appended, 1);
    assert_eq!(outcome.records_dropped, 1);

    let rows: Vec<MessageRow> = load_rows(&analytics, "messages.ndjson").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, "evt_good");
}

/// An unparsable enrichment body for one patient yields a zero count for
/// that row without aborting the patients that follow.
#[tokio::test]
async fn enrichment_failure_degrades_to_zero() {
    let transport = ScriptedTransport::default();
    let raw = MemoryBlobStore::new();
    let analytics = MemoryBlobStore::new();

    raw.put("patients/pat_a.json", br#"{"id":"pat_a"}"#)
        .await
        .expect("seed raw");
    raw.put("patients/pat_b.json", br#"{"id":"pat_b"}"#)
        .await
        .expect("seed raw");
    transport
        .respond_garbage(&format!("{BASE}/patients/pat_a/medical_data"))
        .await;
    transport
        .respond(
            &format!("{BASE}/patients/pat_b/medical_data"),
            json!({"total_count": 9}),
        )
        .await;

    let config = test_config();
    let api = api_config(&config);
    let materializer = Materializer::new(&transport, &raw, &analytics, &api);
    let outcome = materializer
        .materialize(EntityKind::Patient)
        .await
        .expect("materialize");
    assert_eq!(outcome.rows_appended, 2);

    let rows: Vec<PatientRow> = load_rows(&analytics, "patients.ndjson").await;
    let pat_a = rows.iter().find(|p| p.id == "pat_a").expect("pat_a");
    let pat_b = rows.iter().find(|p| p.id == "pat_b").expect("pat_b");
    assert_eq!(pat_a.medical_records, 0);
    assert_eq!(pat_b.medical_records, 9);
}

/// Conversation raw records are keyed by their creation event's id, not by
/// the conversation id the dataset is keyed on. The diff must still hold
/// on the identifier column: rows already materialized are not appended
/// again, and two events for the same conversation yield one row.
#[tokio::test]
async fn conversations_dedup_on_conversation_id_not_event_id() {
    let transport = ScriptedTransport::default();
    let raw = MemoryBlobStore::new();
    let analytics = MemoryBlobStore::new();

    raw.put(
        "conversation/created/evt_a.json",
        br#"{"id":"evt_a","data":{"id":"conv_1","patients":[{"id":"pat_1"}]}}"#,
    )
    .await
    .expect("seed raw");
    raw.put(
        "conversation/created/evt_b.json",
        br#"{"id":"evt_b","data":{"id":"conv_1","patients":[{"id":"pat_1"}]}}"#,
    )
    .await
    .expect("seed raw");
    raw.put(
        "conversation/created/evt_c.json",
        br#"{"id":"evt_c","data":{"id":"conv_2","patients":[{"id":"pat_2"}]}}"#,
    )
    .await
    .expect("seed raw");
    analytics
        .put(
            "conversations.ndjson",
            br#"{"conversation_id":"conv_1","patient_id":"pat_1"}
"#,
        )
        .await
        .expect("seed dataset");

    let config = test_config();
    let api = api_config(&config);
    let materializer = Materializer::new(&transport, &raw, &analytics, &api);
    let outcome = materializer
        .materialize(EntityKind::Conversation)
        .await
        .expect("materialize");
    assert_eq!(outcome.rows_before, 1);
    assert_eq!(outcome.rows_appended, 1);

    let rows: Vec<ConversationRow> = load_rows(&analytics, "conversations.ndjson").await;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].conversation_id, "conv_1");
    assert_eq!(rows[1].conversation_id, "conv_2");

    // A re-run over the same raw records appends nothing.
    let rerun = materializer
        .materialize(EntityKind::Conversation)
        .await
        .expect("re-materialize");
    assert_eq!(rerun.rows_appended, 0);
    let rows_after: Vec<ConversationRow> = load_rows(&analytics, "conversations.ndjson").await;
    assert_eq!(rows_after, rows);
}

/// The raw listing must be drained across truncated pages before diffing:
/// every stored record makes it into the dataset even when the listing
/// pages are tiny.
#[tokio::test]
async fn truncated_raw_listing_is_fully_drained_before_diffing() {
    let transport = ScriptedTransport::default();
    let raw = MemoryBlobStore::with_list_page_size(2);
    let analytics = MemoryBlobStore::new();

    for i in 0..7 {
        raw.put(
            &format!("conversation/created/evt_{i}.json"),
            format!(
                r#"{{"id":"evt_{i}","data":{{"id":"conv_{i}","patients":[{{"id":"pat_{i}"}}]}}}}"#
            )
            .as_bytes(),
        )
        .await
        .expect("seed raw");
    }

    let config = test_config();
    let api = api_config(&config);
    let materializer = Materializer::new(&transport, &raw, &analytics, &api);
    let outcome = materializer
        .materialize(EntityKind::Conversation)
        .await
        .expect("materialize");
    assert_eq!(outcome.rows_appended, 7);

    let rows: Vec<ConversationRow> = load_rows(&analytics, "conversations.ndjson").await;
    assert_eq!(rows.len(), 7);
}

fn api_config(config: &SyncConfig) -> carelog_storage::ApiConfig {
    carelog_storage::ApiConfig {
        base_url: config.api_base_url.clone(),
        api_key: config.api_key.clone(),
        timeout: Duration::from_secs(config.http_timeout_secs),
    }
}
