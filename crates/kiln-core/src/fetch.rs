//! Artifact fetching and verification.
//!
//! Artifacts are cached content-addressed by their SHA-256 digest: fetching
//! the same (url, digest) pair twice returns the cached file without a
//! second network operation. Verification happens before the artifact
//! enters the cache, so a hash mismatch can never reach a build stage.
//!
//! The network itself sits behind the [`ArtifactSource`] seam; production
//! uses [`HttpSource`], tests substitute scripted sources.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use kiln_schema::Sha256Digest;

/// Failure modes of a single artifact fetch.
#[derive(Error, Debug)]
pub enum FetchError {
    /// The source was unreachable or returned an error status.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Local filesystem failure while writing or verifying.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The fetched bytes did not match the declared digest.
    #[error("hash mismatch for {url}: expected {expected}, got {actual}")]
    HashMismatch {
        /// URL the artifact was fetched from.
        url: String,
        /// Digest the descriptor declared.
        expected: String,
        /// Digest of the bytes actually received.
        actual: String,
    },

    /// The fetch exceeded the caller-supplied timeout.
    #[error("fetch of {url} timed out after {}s", timeout.as_secs())]
    Timeout {
        /// URL the fetch was reading from.
        url: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },
}

/// Retrieves raw bytes from a URL into a local file.
///
/// The trait is the engine's only path to the network; everything above it
/// (caching, verification, locking) is source-agnostic.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Fetch `url` into `dest`, overwriting any existing file.
    async fn get(&self, url: &str, dest: &Path) -> Result<(), FetchError>;
}

/// HTTP(S) artifact source backed by a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    /// Create a source over an existing client (connection pool shared
    /// across all fetches in a run).
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ArtifactSource for HttpSource {
    async fn get(&self, url: &str, dest: &Path) -> Result<(), FetchError> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, crate::USER_AGENT)
            .send()
            .await?
            .error_for_status()?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;

        Ok(())
    }
}

/// Content-addressed artifact fetcher with per-digest in-flight locking.
pub struct Fetcher {
    source: Arc<dyn ArtifactSource>,
    cache_dir: PathBuf,
    timeout: Option<Duration>,
    inflight: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher")
            .field("cache_dir", &self.cache_dir)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Fetcher {
    /// Create a fetcher writing into `cache_dir`.
    ///
    /// `timeout` bounds every individual network operation; `None` waits
    /// indefinitely.
    pub fn new(
        source: Arc<dyn ArtifactSource>,
        cache_dir: impl Into<PathBuf>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            source,
            cache_dir: cache_dir.into(),
            timeout,
            inflight: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Fetch a pinned artifact, returning the cached local path.
    ///
    /// A cache hit performs no network operation. Two concurrent fetches of
    /// the same digest serialize on a per-digest lock; the second waits and
    /// then reuses the first's result.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::HashMismatch`] when the received bytes do not
    /// match `digest`; nothing enters the cache in that case.
    pub async fn fetch(&self, url: &str, digest: &Sha256Digest) -> Result<PathBuf, FetchError> {
        let cached = self.cache_dir.join(digest.as_str());
        if cached.exists() {
            tracing::debug!(%url, digest = %digest, "artifact cache hit");
            return Ok(cached);
        }

        let lock = self.key_lock(digest.as_str()).await;
        let _guard = lock.lock().await;

        // Another task may have completed the fetch while we waited.
        if cached.exists() {
            return Ok(cached);
        }

        let partial = self.cache_dir.join(format!("{digest}.part"));
        self.get_bounded(url, &partial).await?;

        let actual = hash_file(&partial)?;
        if actual != digest.as_str() {
            std::fs::remove_file(&partial).ok();
            return Err(FetchError::HashMismatch {
                url: url.to_string(),
                expected: digest.as_str().to_string(),
                actual,
            });
        }

        std::fs::rename(&partial, &cached)?;
        Ok(cached)
    }

    /// Fetch an unpinned artifact (a `--head` source) under a caller-chosen
    /// cache key, skipping hash verification.
    ///
    /// Head sources track a moving branch, so the fetch always goes to the
    /// network and overwrites the previous snapshot.
    pub async fn fetch_unverified(&self, url: &str, key: &str) -> Result<PathBuf, FetchError> {
        let dest = self.cache_dir.join(key);

        let lock = self.key_lock(key).await;
        let _guard = lock.lock().await;

        self.get_bounded(url, &dest).await?;
        Ok(dest)
    }

    async fn get_bounded(&self, url: &str, dest: &Path) -> Result<(), FetchError> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.source.get(url, dest))
                .await
                .map_err(|_| {
                    std::fs::remove_file(dest).ok();
                    FetchError::Timeout {
                        url: url.to_string(),
                        timeout: limit,
                    }
                })?,
            None => self.source.get(url, dest).await,
        }
    }

    async fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inflight.lock().await;
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// SHA-256 of a file's contents, streamed in fixed-size chunks.
fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}
