//! Sync pipeline: incremental feed ingestion and dataset materialization.
//!
//! Two independent cycles share the raw bucket. Ingestion walks the
//! upstream pagination and persists every record verbatim, advancing a
//! durable checkpoint for the webhook-event feed. Materialization lists
//! the accumulated raw records, diffs them against the derived datasets by
//! id and appends only the unseen ones. The cycles are not transactionally
//! linked: a crash between them re-processes already-stored records on the
//! next run (idempotent by key), never loses any.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use carelog_core::{
    ConversationRow, EntityKind, MedicalRecordsRow, MessageRow, PatientRow, ProviderRow,
    TabularRow, VideoRow,
};
use carelog_extract::ProjectionError;
use carelog_storage::{
    format_timestamp, parse_timestamp, ApiClient, ApiConfig, ApiTransport, BlobStore,
    CheckpointStore, FetchError, FsBlobStore, StorageError,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "carelog-sync";

const EVENTS_ENDPOINT: &str = "webhook_events";
const PATIENTS_ENDPOINT: &str = "patients";
const PROVIDERS_ENDPOINT: &str = "providers";

const DATA_FIELD: &str = "data";
const COUNT_FIELD: &str = "total_count";

/// Object key of the standalone medical-records snapshot.
pub const MEDICAL_RECORDS_KEY: &str = "medical_records/medical_records.json";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_base_url: String,
    pub api_key: String,
    pub data_dir: PathBuf,
    pub raw_bucket: String,
    pub analytics_bucket: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            api_base_url: std::env::var("CARELOG_API_BASE_URL")
                .unwrap_or_else(|_| "https://api.careplatform.example/v1/server".to_string()),
            api_key: std::env::var("CARELOG_API_KEY").unwrap_or_default(),
            data_dir: std::env::var("CARELOG_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            raw_bucket: std::env::var("CARELOG_RAW_BUCKET")
                .unwrap_or_else(|_| "carelog".to_string()),
            analytics_bucket: std::env::var("CARELOG_ANALYTICS_BUCKET")
                .unwrap_or_else(|_| "carelog-analytics".to_string()),
            http_timeout_secs: std::env::var("CARELOG_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            scheduler_enabled: std::env::var("CARELOG_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("CARELOG_SYNC_CRON")
                .unwrap_or_else(|_| "0 6 * * *".to_string()),
        }
    }

    fn api_config(&self) -> ApiConfig {
        ApiConfig {
            base_url: self.api_base_url.clone(),
            api_key: self.api_key.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
        }
    }
}

#[derive(Debug, Error)]
pub enum WalkError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("response field {field:?} missing at {url}")]
    MissingField { field: String, url: String },
}

impl WalkError {
    /// True when the upstream answered but the body was not the expected
    /// shape. Single-shot callers may substitute a default for these;
    /// transport failures are never recoverable locally.
    pub fn is_decode(&self) -> bool {
        matches!(
            self,
            WalkError::Fetch(FetchError::Decode { .. }) | WalkError::MissingField { .. }
        )
    }
}

/// Separator used to append `cursor=` to the walked URL: `Fresh` starts a
/// query string, `Append` extends one the caller already built (e.g. a
/// `created_at_gt` filter).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorSep {
    Fresh,
    Append,
}

impl CursorSep {
    fn as_char(self) -> char {
        match self {
            CursorSep::Fresh => '?',
            CursorSep::Append => '&',
        }
    }
}

/// Where walked pages are persisted as they arrive. With a fixed `entity`
/// prefix, records are keyed `<entity>/<id>.json`; without one, each
/// record's dot-separated `type` field decides its sub-path.
pub struct PageSink<'a> {
    pub store: &'a dyn BlobStore,
    pub entity: Option<&'a str>,
}

/// Cursor-following traversal of one upstream paginated endpoint.
pub struct Walker<'a> {
    transport: &'a dyn ApiTransport,
}

impl<'a> Walker<'a> {
    pub fn new(transport: &'a dyn ApiTransport) -> Self {
        Self { transport }
    }

    /// Single GET without pagination, returning the extracted response
    /// field. Decode failures propagate; recovery is the caller's policy.
    pub async fn lookup(&self, url: &str, field: &str) -> Result<JsonValue, WalkError> {
        let body = self.transport.get_json(url).await?;
        body.get(field)
            .cloned()
            .ok_or_else(|| WalkError::MissingField {
                field: field.to_string(),
                url: url.to_string(),
            })
    }

    /// Follows `has_more`/`next_cursor` from `url` and returns every
    /// extracted record in server-delivered order. When a sink is given,
    /// each page is persisted before the next page is requested, bounding
    /// loss on a mid-walk failure to the in-flight page.
    pub async fn walk(
        &self,
        url: &str,
        sep: CursorSep,
        field: &str,
        sink: Option<&PageSink<'_>>,
    ) -> Result<Vec<JsonValue>, WalkError> {
        let mut collected = Vec::new();
        let mut body = self.transport.get_json(url).await?;
        loop {
            let page = records_field(&body, field, url)?;
            if let Some(sink) = sink {
                persist_page(sink, &page).await?;
            }
            let has_more = body
                .get("has_more")
                .and_then(JsonValue::as_bool)
                .unwrap_or(false);
            collected.extend(page);
            if !has_more {
                break;
            }
            let cursor = cursor_token(&body, url)?;
            debug!(%cursor, url, "following pagination cursor");
            let next_url = format!("{url}{}cursor={cursor}", sep.as_char());
            body = self.transport.get_json(&next_url).await?;
        }
        Ok(collected)
    }
}

fn records_field(
    body: &JsonValue,
    field: &str,
    url: &str,
) -> Result<Vec<JsonValue>, WalkError> {
    body.get(field)
        .and_then(JsonValue::as_array)
        .cloned()
        .ok_or_else(|| WalkError::MissingField {
            field: field.to_string(),
            url: url.to_string(),
        })
}

fn cursor_token(body: &JsonValue, url: &str) -> Result<String, WalkError> {
    match body.get("next_cursor") {
        Some(JsonValue::String(token)) => Ok(token.clone()),
        Some(JsonValue::Number(token)) => Ok(token.to_string()),
        _ => Err(WalkError::MissingField {
            field: "next_cursor".to_string(),
            url: url.to_string(),
        }),
    }
}

async fn persist_page(sink: &PageSink<'_>, records: &[JsonValue]) -> Result<(), WalkError> {
    for record in records {
        let Some(id) = record.get("id").and_then(JsonValue::as_str) else {
            warn!("skipping record without id during persist");
            continue;
        };
        let key = match sink.entity {
            Some(entity) => format!("{entity}/{id}.json"),
            None => {
                let Some(event_type) = record.get("type").and_then(JsonValue::as_str) else {
                    warn!(id, "skipping record without type during persist");
                    continue;
                };
                format!("{}/{id}.json", event_type.replace('.', "/"))
            }
        };
        let written = sink
            .store
            .put_if_absent(&key, record.to_string().as_bytes())
            .await?;
        if !written {
            debug!(key, "raw record already stored");
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedIngest {
    pub records: usize,
    pub checkpoint: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub events: usize,
    pub checkpoint: String,
    pub patients_listed: usize,
    pub providers_listed: usize,
}

/// Pulls upstream records into the raw bucket.
pub struct Ingestor<'a> {
    transport: &'a dyn ApiTransport,
    raw: &'a dyn BlobStore,
    api: &'a ApiConfig,
}

impl<'a> Ingestor<'a> {
    pub fn new(
        transport: &'a dyn ApiTransport,
        raw: &'a dyn BlobStore,
        api: &'a ApiConfig,
    ) -> Self {
        Self {
            transport,
            raw,
            api,
        }
    }

    /// Incremental webhook-event pull bounded below by the stored
    /// checkpoint. The checkpoint advances to the maximum `created_at`
    /// across the whole batch (pages are not globally sorted), or stays
    /// untouched when the batch is empty.
    pub async fn ingest_events(&self) -> Result<FeedIngest> {
        let checkpoint = CheckpointStore::new(self.raw);
        let since = checkpoint
            .read()
            .await
            .context("reading feed checkpoint")?;
        let url = format!(
            "{}?created_at_gt={}",
            self.api.endpoint(EVENTS_ENDPOINT),
            since
        );

        let walker = Walker::new(self.transport);
        let sink = PageSink {
            store: self.raw,
            entity: None,
        };
        let events = walker
            .walk(&url, CursorSep::Append, DATA_FIELD, Some(&sink))
            .await
            .context("walking webhook events feed")?;

        let mut max_created: Option<NaiveDateTime> = None;
        for event in &events {
            let Some(created_at) = event.get("created_at").and_then(JsonValue::as_str) else {
                warn!("webhook event without created_at; ignored for checkpoint");
                continue;
            };
            match parse_timestamp(created_at) {
                Some(ts) => max_created = Some(max_created.map_or(ts, |cur| cur.max(ts))),
                None => warn!(created_at, "unparsable created_at on webhook event"),
            }
        }

        let checkpoint_value = match max_created {
            Some(ts) => {
                let stamp = format_timestamp(ts);
                checkpoint
                    .write(&stamp)
                    .await
                    .context("advancing feed checkpoint")?;
                info!(checkpoint = %stamp, events = events.len(), "advanced feed checkpoint");
                stamp
            }
            None => since,
        };

        Ok(FeedIngest {
            records: events.len(),
            checkpoint: checkpoint_value,
        })
    }

    /// Full listing walk for small entity collections. Re-listing every
    /// run is cheap at this volume; new-record discovery happens
    /// downstream by id-diffing, not here.
    pub async fn ingest_listing(&self, endpoint: &str, entity: &str) -> Result<usize> {
        let url = self.api.endpoint(endpoint);
        let walker = Walker::new(self.transport);
        let sink = PageSink {
            store: self.raw,
            entity: Some(entity),
        };
        let records = walker
            .walk(&url, CursorSep::Fresh, DATA_FIELD, Some(&sink))
            .await
            .with_context(|| format!("walking {endpoint} listing"))?;
        info!(entity, listed = records.len(), "full listing walk complete");
        Ok(records.len())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MaterializeOutcome {
    pub entity: EntityKind,
    pub rows_before: usize,
    pub rows_appended: usize,
    pub records_dropped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MaterializeSummary {
    pub datasets: Vec<MaterializeOutcome>,
    pub medical_records_rows: usize,
}

/// Merge-appends new raw records into the derived datasets.
pub struct Materializer<'a> {
    transport: &'a dyn ApiTransport,
    raw: &'a dyn BlobStore,
    analytics: &'a dyn BlobStore,
    api: &'a ApiConfig,
}

impl<'a> Materializer<'a> {
    pub fn new(
        transport: &'a dyn ApiTransport,
        raw: &'a dyn BlobStore,
        analytics: &'a dyn BlobStore,
        api: &'a ApiConfig,
    ) -> Self {
        Self {
            transport,
            raw,
            analytics,
            api,
        }
    }

    pub async fn materialize(&self, kind: EntityKind) -> Result<MaterializeOutcome> {
        match kind {
            EntityKind::Patient => {
                self.materialize_rows::<PatientRow>(kind, carelog_extract::patient_row)
                    .await
            }
            EntityKind::Provider => {
                self.materialize_rows::<ProviderRow>(kind, carelog_extract::provider_row)
                    .await
            }
            EntityKind::Message => {
                self.materialize_rows::<MessageRow>(kind, carelog_extract::message_row)
                    .await
            }
            EntityKind::Video => {
                self.materialize_rows::<VideoRow>(kind, carelog_extract::video_row)
                    .await
            }
            EntityKind::Conversation => {
                self.materialize_rows::<ConversationRow>(kind, carelog_extract::conversation_row)
                    .await
            }
        }
    }

    async fn materialize_rows<T: TabularRow + RowEnrichment>(
        &self,
        kind: EntityKind,
        project: fn(&JsonValue) -> Result<T, ProjectionError>,
    ) -> Result<MaterializeOutcome> {
        let (mut rows, base_missing) = self.load_dataset::<T>().await?;
        let rows_before = rows.len();
        let mut seen: HashSet<String> = rows.iter().map(|row| row.row_id().to_string()).collect();

        let mut appended = 0usize;
        let mut dropped = 0usize;
        for key in self.candidate_keys(kind, &seen).await? {
            let raw = self.fetch_raw(&key).await?;
            match project(&raw) {
                Ok(mut row) => {
                    // The authoritative dedup is on the projected row id:
                    // for conversations the key stem is the creation
                    // event's id, not the identifier column.
                    if !seen.insert(row.row_id().to_string()) {
                        continue;
                    }
                    row.enrich(self).await?;
                    rows.push(row);
                    appended += 1;
                }
                Err(err) => {
                    warn!(key, %err, "dropping raw record from dataset");
                    dropped += 1;
                }
            }
        }

        self.persist_dataset(&rows, appended, base_missing).await?;
        info!(entity = %kind, appended, dropped, "materialized dataset");
        Ok(MaterializeOutcome {
            entity: kind,
            rows_before,
            rows_appended: appended,
            records_dropped: dropped,
        })
    }

    /// Full snapshot of medical-record counts for every stored patient,
    /// rebuilt from scratch each run.
    pub async fn write_medical_records_artifact(&self) -> Result<usize> {
        let keys = self
            .raw
            .list(EntityKind::Patient.raw_prefix())
            .await
            .context("listing raw patient records")?;

        let mut rows = Vec::with_capacity(keys.len());
        for key in &keys {
            let id = key_id(key).to_string();
            let medical_records = self.medical_records_count(&id).await?;
            rows.push(MedicalRecordsRow {
                id,
                medical_records,
            });
        }

        self.analytics
            .put(MEDICAL_RECORDS_KEY, &encode_dataset(&rows)?)
            .await
            .context("writing medical records artifact")?;
        info!(patients = rows.len(), "saved medical records artifact");
        Ok(rows.len())
    }

    async fn load_dataset<T: TabularRow>(&self) -> Result<(Vec<T>, bool)> {
        match self.analytics.get(T::DATASET_KEY).await {
            Ok(bytes) => {
                let rows = decode_dataset(&bytes)
                    .with_context(|| format!("decoding dataset {}", T::DATASET_KEY))?;
                Ok((rows, false))
            }
            Err(StorageError::NotFound { .. }) => {
                info!(dataset = T::DATASET_KEY, "no base dataset yet; bootstrapping empty");
                Ok((Vec::new(), true))
            }
            Err(err) => {
                Err(err).with_context(|| format!("loading dataset {}", T::DATASET_KEY))
            }
        }
    }

    /// Drained raw listing under the entity prefix, in listing order.
    /// Where the key stem is the row id, keys already in the dataset are
    /// filtered out here so their records are never refetched; otherwise
    /// every key stays a candidate and the row-id dedup decides.
    async fn candidate_keys(
        &self,
        kind: EntityKind,
        existing: &HashSet<String>,
    ) -> Result<Vec<String>> {
        let keys = self
            .raw
            .list(kind.raw_prefix())
            .await
            .with_context(|| format!("listing raw {kind} records"))?;
        if !kind.raw_key_matches_row_id() {
            return Ok(keys);
        }
        Ok(keys
            .into_iter()
            .filter(|key| !existing.contains(key_id(key)))
            .collect())
    }

    async fn fetch_raw(&self, key: &str) -> Result<JsonValue> {
        let bytes = self
            .raw
            .get(key)
            .await
            .with_context(|| format!("fetching raw record {key}"))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parsing raw record {key}"))
    }

    async fn persist_dataset<T: TabularRow>(
        &self,
        rows: &[T],
        appended: usize,
        base_missing: bool,
    ) -> Result<()> {
        // Nothing new and a base already exists: skip rewriting the
        // object. A missing base is still persisted so the dataset exists
        // after the first run even when empty.
        if appended == 0 && !base_missing {
            return Ok(());
        }
        self.analytics
            .put(T::DATASET_KEY, &encode_dataset(rows)?)
            .await
            .with_context(|| format!("writing dataset {}", T::DATASET_KEY))
    }

    async fn medical_records_count(&self, patient_id: &str) -> Result<u64> {
        let url = self
            .api
            .endpoint(&format!("{PATIENTS_ENDPOINT}/{patient_id}/medical_data"));
        let walker = Walker::new(self.transport);
        match walker.lookup(&url, COUNT_FIELD).await {
            Ok(value) => Ok(value.as_u64().unwrap_or(0)),
            Err(err) if err.is_decode() => {
                debug!(patient_id, "medical data lookup unparsable; patient was probably deleted");
                Ok(0)
            }
            Err(err) => {
                Err(err).with_context(|| format!("fetching medical data count for {patient_id}"))
            }
        }
    }
}

/// Post-projection hook run on each row before it is appended. Most rows
/// need nothing; patients attach their medical-records count here.
#[async_trait]
trait RowEnrichment: Sized + Send {
    async fn enrich(&mut self, _materializer: &Materializer<'_>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl RowEnrichment for PatientRow {
    async fn enrich(&mut self, materializer: &Materializer<'_>) -> Result<()> {
        self.medical_records = materializer.medical_records_count(&self.id).await?;
        Ok(())
    }
}

impl RowEnrichment for ProviderRow {}
impl RowEnrichment for MessageRow {}
impl RowEnrichment for VideoRow {}
impl RowEnrichment for ConversationRow {}

/// Id stem of a raw-record key (`patients/pat_1.json` -> `pat_1`).
fn key_id(key: &str) -> &str {
    let name = key.rsplit('/').next().unwrap_or(key);
    name.strip_suffix(".json").unwrap_or(name)
}

fn decode_dataset<T: DeserializeOwned>(bytes: &[u8]) -> Result<Vec<T>> {
    let text = std::str::from_utf8(bytes).context("dataset is not valid utf-8")?;
    let mut rows = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        rows.push(serde_json::from_str(line).context("decoding dataset row")?);
    }
    Ok(rows)
}

fn encode_dataset<T: Serialize>(rows: &[T]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut out, row).context("encoding dataset row")?;
        out.push(b'\n');
    }
    Ok(out)
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub events: usize,
    pub checkpoint: String,
    pub patients_listed: usize,
    pub providers_listed: usize,
    pub datasets: Vec<MaterializeOutcome>,
    pub medical_records_rows: usize,
}

/// One-run orchestration over both cycles. Holds the storage backends and
/// the upstream transport; components borrow them per run, so a pipeline
/// carries no run state of its own.
pub struct SyncPipeline {
    config: SyncConfig,
    api: ApiConfig,
    transport: Arc<dyn ApiTransport>,
    raw: Arc<dyn BlobStore>,
    analytics: Arc<dyn BlobStore>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let api = config.api_config();
        let transport: Arc<dyn ApiTransport> = Arc::new(ApiClient::new(&api)?);
        let raw: Arc<dyn BlobStore> =
            Arc::new(FsBlobStore::new(config.data_dir.join(&config.raw_bucket)));
        let analytics: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(
            config.data_dir.join(&config.analytics_bucket),
        ));
        Ok(Self {
            config,
            api,
            transport,
            raw,
            analytics,
        })
    }

    /// Bring-your-own-backend constructor, used by tests and by callers
    /// that already hold store handles.
    pub fn with_components(
        config: SyncConfig,
        transport: Arc<dyn ApiTransport>,
        raw: Arc<dyn BlobStore>,
        analytics: Arc<dyn BlobStore>,
    ) -> Self {
        let api = config.api_config();
        Self {
            config,
            api,
            transport,
            raw,
            analytics,
        }
    }

    pub async fn ingest_once(&self) -> Result<IngestOutcome> {
        let ingestor = Ingestor::new(self.transport.as_ref(), self.raw.as_ref(), &self.api);
        let feed = ingestor.ingest_events().await?;
        let patients_listed = ingestor
            .ingest_listing(PATIENTS_ENDPOINT, EntityKind::Patient.raw_prefix())
            .await?;
        let providers_listed = ingestor
            .ingest_listing(PROVIDERS_ENDPOINT, EntityKind::Provider.raw_prefix())
            .await?;
        Ok(IngestOutcome {
            events: feed.records,
            checkpoint: feed.checkpoint,
            patients_listed,
            providers_listed,
        })
    }

    pub async fn materialize_once(&self) -> Result<MaterializeSummary> {
        let materializer = Materializer::new(
            self.transport.as_ref(),
            self.raw.as_ref(),
            self.analytics.as_ref(),
            &self.api,
        );
        let mut datasets = Vec::with_capacity(EntityKind::ALL.len());
        for kind in EntityKind::ALL {
            datasets.push(materializer.materialize(kind).await?);
        }
        let medical_records_rows = materializer.write_medical_records_artifact().await?;
        Ok(MaterializeSummary {
            datasets,
            medical_records_rows,
        })
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, "starting sync run");

        let ingest = self.ingest_once().await?;
        let materialize = self.materialize_once().await?;

        let finished_at = Utc::now();
        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            events: ingest.events,
            checkpoint: ingest.checkpoint,
            patients_listed: ingest.patients_listed,
            providers_listed: ingest.providers_listed,
            datasets: materialize.datasets,
            medical_records_rows: materialize.medical_records_rows,
        })
    }

    /// In-process cron trigger, env-gated and off by default. A `try_lock`
    /// gate skips a tick while the previous run is still in flight, which
    /// keeps the at-most-one-run-per-feed assumption intact.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let gate = Arc::new(Mutex::new(()));
        let pipeline = Arc::clone(self);
        let cron = self.config.sync_cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let pipeline = Arc::clone(&pipeline);
            let gate = Arc::clone(&gate);
            Box::pin(async move {
                let Ok(_guard) = gate.try_lock() else {
                    warn!("previous sync run still in flight; skipping this trigger");
                    return;
                };
                match pipeline.run_once().await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        events = summary.events,
                        "scheduled sync run complete"
                    ),
                    Err(err) => {
                        tracing::error!(error = %format!("{err:#}"), "scheduled sync run failed")
                    }
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let pipeline = SyncPipeline::new(config)?;
    pipeline.run_once().await
}
