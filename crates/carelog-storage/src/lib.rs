//! Object storage, feed checkpoint and HTTP transport for carelog.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "carelog-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {key}")]
    NotFound { key: String },
    #[error("storage io failure for {key}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("object {key} is not valid utf-8")]
    Utf8 {
        key: String,
        #[source]
        source: std::string::FromUtf8Error,
    },
}

fn io_err(key: &str, source: std::io::Error) -> StorageError {
    StorageError::Io {
        key: key.to_string(),
        source,
    }
}

/// One page of a truncated listing.
#[derive(Debug, Clone)]
pub struct ListPage {
    pub keys: Vec<String>,
    pub next_token: Option<String>,
}

/// Key/value object storage. The system of record for raw records,
/// the feed checkpoint and derived datasets.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Unconditional overwrite.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;

    /// First-write-wins write for immutable raw records. Returns `false`
    /// when the key already existed and nothing was written.
    async fn put_if_absent(&self, key: &str, bytes: &[u8]) -> Result<bool, StorageError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// One page of keys under `prefix`, continuing from `token`.
    async fn list_page(
        &self,
        prefix: &str,
        token: Option<&str>,
    ) -> Result<ListPage, StorageError>;

    /// All keys under `prefix`, draining `list_page` until the listing is
    /// no longer truncated. Consumers that diff against this listing must
    /// use the drained form: a partial list reads as "already seen" and
    /// silently drops records.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self.list_page(prefix, token.as_deref()).await?;
            keys.extend(page.keys);
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(keys)
    }
}

/// In-memory store used in tests. The listing page size is configurable so
/// truncated-listing behavior can be exercised.
#[derive(Debug)]
pub struct MemoryBlobStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    list_page_size: usize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::with_list_page_size(1000)
    }

    pub fn with_list_page_size(list_page_size: usize) -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            list_page_size: list_page_size.max(1),
        }
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.objects
            .lock()
            .await
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, bytes: &[u8]) -> Result<bool, StorageError> {
        let mut objects = self.objects.lock().await;
        if objects.contains_key(key) {
            return Ok(false);
        }
        objects.insert(key.to_string(), bytes.to_vec());
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })
    }

    async fn list_page(
        &self,
        prefix: &str,
        token: Option<&str>,
    ) -> Result<ListPage, StorageError> {
        let objects = self.objects.lock().await;
        let matching: Vec<&String> = objects
            .keys()
            .filter(|key| key.starts_with(prefix))
            .filter(|key| token.map_or(true, |t| key.as_str() > t))
            .collect();
        let truncated = matching.len() > self.list_page_size;
        let keys: Vec<String> = matching
            .into_iter()
            .take(self.list_page_size)
            .cloned()
            .collect();
        let next_token = if truncated { keys.last().cloned() } else { None };
        Ok(ListPage { keys, next_token })
    }
}

/// Directory-rooted store. Keys map to relative paths; writes go through a
/// temp file and an atomic rename so a crashed write never leaves a torn
/// object behind.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    async fn write_temp(&self, key: &str, bytes: &[u8]) -> Result<PathBuf, StorageError> {
        let path = self.object_path(key);
        let parent = path.parent().expect("object path always has a parent");
        fs::create_dir_all(parent)
            .await
            .map_err(|source| io_err(key, source))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|source| io_err(key, source))?;
        file.write_all(bytes)
            .await
            .map_err(|source| io_err(key, source))?;
        file.flush()
            .await
            .map_err(|source| io_err(key, source))?;
        drop(file);
        Ok(temp_path)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let temp_path = self.write_temp(key, bytes).await?;
        match fs::rename(&temp_path, self.object_path(key)).await {
            Ok(()) => Ok(()),
            Err(source) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(io_err(key, source))
            }
        }
    }

    async fn put_if_absent(&self, key: &str, bytes: &[u8]) -> Result<bool, StorageError> {
        let path = self.object_path(key);
        if fs::try_exists(&path)
            .await
            .map_err(|source| io_err(key, source))?
        {
            return Ok(false);
        }

        let temp_path = self.write_temp(key, bytes).await?;
        match fs::rename(&temp_path, &path).await {
            Ok(()) => Ok(true),
            Err(source) if source.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(false)
            }
            Err(source) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(io_err(key, source))
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        match fs::read(self.object_path(key)).await {
            Ok(bytes) => Ok(bytes),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound {
                    key: key.to_string(),
                })
            }
            Err(source) => Err(io_err(key, source)),
        }
    }

    async fn list_page(
        &self,
        prefix: &str,
        _token: Option<&str>,
    ) -> Result<ListPage, StorageError> {
        let base = self.root.join(prefix);
        if !fs::try_exists(&base)
            .await
            .map_err(|source| io_err(prefix, source))?
        {
            return Ok(ListPage {
                keys: Vec::new(),
                next_token: None,
            });
        }

        let mut keys = Vec::new();
        let mut pending = vec![base];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir)
                .await
                .map_err(|source| io_err(prefix, source))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|source| io_err(prefix, source))?
            {
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|source| io_err(prefix, source))?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                    continue;
                }
                // In-flight temp files are not objects.
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                    keys.push(
                        rel.to_string_lossy()
                            .replace(std::path::MAIN_SEPARATOR, "/"),
                    );
                }
            }
        }
        keys.sort();
        Ok(ListPage {
            keys,
            next_token: None,
        })
    }
}

pub const CHECKPOINT_KEY: &str = "max_date.txt";

/// Watermark a fresh deployment starts from.
pub const DEFAULT_EPOCH: &str = "2020-01-01T00:00:00";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Parses an upstream ISO-8601 timestamp, ignoring fractional seconds and a
/// trailing `Z`.
pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let trimmed = value.trim().trim_end_matches('Z');
    let seconds = trimmed.split('.').next().unwrap_or(trimmed);
    NaiveDateTime::parse_from_str(seconds, TIMESTAMP_FORMAT).ok()
}

pub fn format_timestamp(value: NaiveDateTime) -> String {
    value.format(TIMESTAMP_FORMAT).to_string()
}

/// Durable "process only records created after this instant" watermark for
/// one feed. Read once at run start, overwritten once at run end.
pub struct CheckpointStore<'a> {
    store: &'a dyn BlobStore,
    key: String,
}

impl<'a> CheckpointStore<'a> {
    pub fn new(store: &'a dyn BlobStore) -> Self {
        Self::with_key(store, CHECKPOINT_KEY)
    }

    pub fn with_key(store: &'a dyn BlobStore, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    /// Current watermark. A missing checkpoint object is first-run
    /// bootstrap, not an error: the default epoch is persisted and
    /// returned so later runs take the ordinary read path.
    pub async fn read(&self) -> Result<String, StorageError> {
        match self.store.get(&self.key).await {
            Ok(bytes) => {
                let text = String::from_utf8(bytes).map_err(|source| StorageError::Utf8 {
                    key: self.key.clone(),
                    source,
                })?;
                Ok(text.trim().to_string())
            }
            Err(StorageError::NotFound { .. }) => {
                debug!(key = %self.key, "no checkpoint yet; bootstrapping to default epoch");
                self.store.put(&self.key, DEFAULT_EPOCH.as_bytes()).await?;
                Ok(DEFAULT_EPOCH.to_string())
            }
            Err(err) => Err(err),
        }
    }

    pub async fn write(&self, timestamp: &str) -> Result<(), StorageError> {
        self.store.put(&self.key, timestamp.as_bytes()).await
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("unparsable response body from {url}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// GET-a-JSON-document seam between the sync engine and the upstream API,
/// so tests can script responses without a network.
#[async_trait]
pub trait ApiTransport: Send + Sync {
    async fn get_json(&self, url: &str) -> Result<JsonValue, FetchError>;
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl ApiConfig {
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// Bearer-authenticated JSON client for the upstream API.
#[derive(Debug)]
pub struct ApiClient {
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(config: &ApiConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
            .context("building authorization header")?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ApiTransport for ApiClient {
    async fn get_json(&self, url: &str) -> Result<JsonValue, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
            url: final_url,
            source,
        })
    }
}
