//! Local key-value persistence + timeout-bounded HTTP transport for tccard.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tccard-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing value for key {key}: {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("key-value store lock poisoned")]
    Poisoned,
}

/// Synchronous string key-value store, the local-storage stand-in.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Outer `Err` is an I/O failure; inner `Err` is a stored value that no longer parses.
pub fn load_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<Result<T, serde_json::Error>>, StoreError> {
    Ok(store.get(key)?.map(|text| serde_json::from_str(&text)))
}

pub fn save_json<T: Serialize>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let text = serde_json::to_string(value).map_err(|source| StoreError::Serialization {
        key: key.to_string(),
        source,
    })?;
    store.put(key, &text)
}

#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }
}

/// One JSON file per key under `root`, replaced via temp-file + atomic rename.
#[derive(Debug, Clone)]
pub struct FileKeyValueStore {
    root: PathBuf,
}

impl FileKeyValueStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Readable prefix plus a hash suffix so `a:b` and `a_b` never share a file.
    pub fn file_name_for_key(key: &str) -> String {
        let readable = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .take(64)
            .collect::<String>();
        let hash = Self::sha256_hex(key.as_bytes());
        format!("{readable}.{}.json", &hash[..12])
    }

    pub fn path_for_key(&self, key: &str) -> PathBuf {
        self.root.join(Self::file_name_for_key(key))
    }

    fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
        move |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for_key(key);
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Self::io_err(&path)(err)),
        }
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root).map_err(Self::io_err(&self.root))?;
        let path = self.path_for_key(key);
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), value.len()));

        let write_temp = || -> std::io::Result<()> {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)?;
            file.write_all(value.as_bytes())?;
            file.sync_all()
        };
        if let Err(err) = write_temp() {
            let _ = fs::remove_file(&temp_path);
            return Err(Self::io_err(&temp_path)(err));
        }

        if let Err(err) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            return Err(Self::io_err(&path)(err));
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for_key(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Self::io_err(&path)(err)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Any non-2xx answer from a lookup endpoint is treated as transient.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_success() {
        RetryDisposition::NonRetryable
    } else {
        RetryDisposition::Retryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_builder() || err.is_redirect() {
        RetryDisposition::NonRetryable
    } else {
        RetryDisposition::Retryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Bound on a single attempt, body included.
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5000),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub attempts: usize,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Timeout(_) => RetryDisposition::Retryable,
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::Retryable),
        }
    }
}

#[derive(Debug, Error)]
#[error("{source} (after {attempts} attempt(s))")]
pub struct FetchFailure {
    pub attempts: usize,
    #[source]
    pub source: FetchError,
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            timeout: config.timeout,
            backoff: config.backoff,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// Await a request + body read, dropping it (and the connection) on timeout.
    async fn bounded(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<(StatusCode, String, Vec<u8>), FetchError> {
        let exchange = async {
            let resp = request.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let body = resp.bytes().await?.to_vec();
            Ok::<_, reqwest::Error>((status, final_url, body))
        };
        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(parts)) => Ok(parts),
            Ok(Err(err)) => Err(FetchError::Request(err)),
            Err(_) => Err(FetchError::Timeout(self.timeout)),
        }
    }

    /// One GET attempt; non-2xx is an error.
    pub async fn get_once(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let (status, final_url, body) = self.bounded(self.client.get(url)).await?;
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        Ok(FetchedResponse {
            status,
            final_url,
            body,
            attempts: 1,
        })
    }

    /// GET with per-attempt timeout and exponential backoff between transient failures.
    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchFailure> {
        let span = info_span!("http_fetch", url);
        async {
            let mut attempt = 0usize;
            loop {
                match self.get_once(url).await {
                    Ok(mut resp) => {
                        resp.attempts = attempt + 1;
                        return Ok(resp);
                    }
                    Err(err) => {
                        let retryable = err.disposition() == RetryDisposition::Retryable;
                        if retryable && attempt < self.backoff.max_retries {
                            let delay = self.backoff.delay_for_attempt(attempt);
                            debug!(attempt, ?delay, error = %err, "transient fetch failure, backing off");
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(FetchFailure {
                            attempts: attempt + 1,
                            source: err,
                        });
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Single bounded POST of a JSON body. Callers own any retry policy.
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<FetchedResponse, FetchError> {
        let (status, final_url, body) = self.bounded(self.client.post(url).json(body)).await?;
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        Ok(FetchedResponse {
            status,
            final_url,
            body,
            attempts: 1,
        })
    }

    /// Single bounded GET with extra query pairs.
    pub async fn get_with_query(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let (status, final_url, body) = self.bounded(self.client.get(url).query(query)).await?;
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        Ok(FetchedResponse {
            status,
            final_url,
            body,
            attempts: 1,
        })
    }
}
