//! Remote store collaborator: receives archive chunks and reports the
//! checksum of what it stored.

use crate::builder::sha256_hex;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

/// Failure reported by a remote store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// The store cannot be reached at all; the upload should park.
    #[error("remote unavailable: {0}")]
    Unavailable(String),
    /// Worth retrying after a backoff.
    #[error("transient remote failure: {0}")]
    Transient(String),
    #[error("remote credentials expired")]
    AuthExpired,
    /// Permanent refusal; retrying will not help.
    #[error("remote rejected request: {0}")]
    Rejected(String),
}

/// What the store reports after finalizing an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteReceipt {
    pub remote_path: String,
    pub remote_checksum: String,
}

/// Destination for archive uploads.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Store `bytes` at `offset` of `destination`. Re-sending a chunk must be
    /// harmless.
    async fn put_chunk(
        &self,
        destination: &str,
        offset: u64,
        bytes: &[u8],
        token: &str,
    ) -> Result<(), RemoteError>;

    /// Seal `destination` at `size` bytes and return the store's own checksum
    /// of the stored object.
    async fn finalize(
        &self,
        destination: &str,
        size: u64,
        token: &str,
    ) -> Result<RemoteReceipt, RemoteError>;
}

/// A directory (local disk, network mount) acting as the object store.
///
/// Chunks land in `<root>/<destination>.part`; finalize truncates the part
/// file to the archive size, renames it into place and hashes the result.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, destination: &str) -> Result<PathBuf, RemoteError> {
        let relative = Path::new(destination);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if destination.is_empty() || !safe {
            return Err(RemoteError::Rejected(format!(
                "invalid destination {:?}",
                destination
            )));
        }
        Ok(self.root.join(relative))
    }

    fn part_path(object: &Path) -> PathBuf {
        let mut part = object.as_os_str().to_owned();
        part.push(".part");
        PathBuf::from(part)
    }

    async fn ensure_root(&self) -> Result<(), RemoteError> {
        match tokio::fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(RemoteError::Rejected(format!(
                "{} is not a directory",
                self.root.display()
            ))),
            // Missing or forbidden root: misconfigured, not offline.
            Err(e) if matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            ) =>
            {
                Err(RemoteError::Rejected(format!(
                    "remote root {}: {}",
                    self.root.display(),
                    e
                )))
            }
            Err(e) => Err(RemoteError::Unavailable(format!(
                "{}: {}",
                self.root.display(),
                e
            ))),
        }
    }
}

fn io_transient(e: std::io::Error) -> RemoteError {
    RemoteError::Transient(e.to_string())
}

#[async_trait]
impl RemoteStore for DirectoryStore {
    async fn put_chunk(
        &self,
        destination: &str,
        offset: u64,
        bytes: &[u8],
        _token: &str,
    ) -> Result<(), RemoteError> {
        self.ensure_root().await?;
        let object = self.object_path(destination)?;
        if let Some(parent) = object.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_transient)?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(Self::part_path(&object))
            .await
            .map_err(io_transient)?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(io_transient)?;
        file.write_all(bytes).await.map_err(io_transient)?;
        file.sync_data().await.map_err(io_transient)?;
        Ok(())
    }

    async fn finalize(
        &self,
        destination: &str,
        size: u64,
        _token: &str,
    ) -> Result<RemoteReceipt, RemoteError> {
        self.ensure_root().await?;
        let object = self.object_path(destination)?;
        let part = Self::part_path(&object);

        if tokio::fs::try_exists(&part).await.map_err(io_transient)? {
            let file = tokio::fs::OpenOptions::new()
                .write(true)
                .open(&part)
                .await
                .map_err(io_transient)?;
            file.set_len(size).await.map_err(io_transient)?;
            file.sync_all().await.map_err(io_transient)?;
            tokio::fs::rename(&part, &object)
                .await
                .map_err(io_transient)?;
        } else if !tokio::fs::try_exists(&object).await.map_err(io_transient)? {
            return Err(RemoteError::Rejected(format!(
                "nothing was uploaded to {}",
                destination
            )));
        }

        let stored = tokio::fs::read(&object).await.map_err(io_transient)?;
        Ok(RemoteReceipt {
            remote_path: destination.to_string(),
            remote_checksum: sha256_hex(&stored),
        })
    }
}

/// HTTP object store speaking a minimal chunk/finalize protocol:
///
/// - `PUT {base}/{destination}?offset=N` with the chunk as body
/// - `POST {base}/{destination}?finalize=true&size=N` returning a
///   `RemoteReceipt` as JSON
#[derive(Debug, Clone)]
pub struct HttpStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn url(&self, destination: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            destination.trim_start_matches('/')
        )
    }
}

fn map_send_error(e: reqwest::Error) -> RemoteError {
    if e.is_connect() {
        RemoteError::Unavailable(e.to_string())
    } else {
        RemoteError::Transient(e.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let detail = format!("{} {}", status, body.trim());
    if status == reqwest::StatusCode::UNAUTHORIZED {
        Err(RemoteError::AuthExpired)
    } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Err(RemoteError::Transient(detail))
    } else {
        Err(RemoteError::Rejected(detail))
    }
}

#[async_trait]
impl RemoteStore for HttpStore {
    async fn put_chunk(
        &self,
        destination: &str,
        offset: u64,
        bytes: &[u8],
        token: &str,
    ) -> Result<(), RemoteError> {
        let response = self
            .client
            .put(self.url(destination))
            .query(&[("offset", offset)])
            .bearer_auth(token)
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(map_send_error)?;
        check_status(response).await?;
        Ok(())
    }

    async fn finalize(
        &self,
        destination: &str,
        size: u64,
        token: &str,
    ) -> Result<RemoteReceipt, RemoteError> {
        let response = self
            .client
            .post(self.url(destination))
            .query(&[("finalize", "true".to_string()), ("size", size.to_string())])
            .bearer_auth(token)
            .send()
            .await
            .map_err(map_send_error)?;
        let response = check_status(response).await?;
        response
            .json::<RemoteReceipt>()
            .await
            .map_err(|e| RemoteError::Transient(format!("unreadable finalize response: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;
    use axum::extract::{Path as UrlPath, Query, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::put;
    use axum::{Json, Router};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_directory_store_assembles_chunks_out_of_order() {
        let dir = TempDir::new().unwrap();
        let store = DirectoryStore::new(dir.path());

        store.put_chunk("archives/j1.marc", 4, b"5678", "").await.unwrap();
        store.put_chunk("archives/j1.marc", 0, b"1234", "").await.unwrap();
        store.put_chunk("archives/j1.marc", 8, b"9", "").await.unwrap();
        let receipt = store.finalize("archives/j1.marc", 9, "").await.unwrap();

        let stored = std::fs::read(dir.path().join("archives/j1.marc")).unwrap();
        assert_eq!(stored, b"123456789");
        assert_eq!(receipt.remote_path, "archives/j1.marc");
        assert_eq!(receipt.remote_checksum, sha256_hex(b"123456789"));
        assert!(!dir.path().join("archives/j1.marc.part").exists());
    }

    #[tokio::test]
    async fn test_directory_store_finalize_truncates_and_is_repeatable() {
        let dir = TempDir::new().unwrap();
        let store = DirectoryStore::new(dir.path());

        store.put_chunk("j.marc", 0, b"longer-old-data", "").await.unwrap();
        store.put_chunk("j.marc", 0, b"new", "").await.unwrap();
        let first = store.finalize("j.marc", 3, "").await.unwrap();
        let again = store.finalize("j.marc", 3, "").await.unwrap();

        assert_eq!(first.remote_checksum, sha256_hex(b"new"));
        assert_eq!(first, again);
    }

    #[tokio::test]
    async fn test_directory_store_errors() {
        let dir = TempDir::new().unwrap();
        let store = DirectoryStore::new(dir.path());
        assert!(matches!(
            store.put_chunk("../escape.marc", 0, b"x", "").await,
            Err(RemoteError::Rejected(_))
        ));
        assert!(matches!(
            store.finalize("never-sent.marc", 1, "").await,
            Err(RemoteError::Rejected(_))
        ));

        let missing = DirectoryStore::new(dir.path().join("not-created"));
        assert!(matches!(
            missing.put_chunk("a.marc", 0, b"x", "").await,
            Err(RemoteError::Rejected(_))
        ));
        assert!(matches!(
            missing.finalize("a.marc", 1, "").await,
            Err(RemoteError::Rejected(_))
        ));
    }

    #[derive(Default)]
    struct FakeServer {
        objects: Mutex<HashMap<String, Vec<u8>>>,
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map_or(false, |v| v == "Bearer good-token")
    }

    async fn put_object(
        State(server): State<Arc<FakeServer>>,
        UrlPath(dest): UrlPath<String>,
        Query(query): Query<HashMap<String, String>>,
        headers: HeaderMap,
        body: Bytes,
    ) -> StatusCode {
        if !authorized(&headers) {
            return StatusCode::UNAUTHORIZED;
        }
        let offset: usize = match query.get("offset").and_then(|o| o.parse().ok()) {
            Some(offset) => offset,
            None => return StatusCode::BAD_REQUEST,
        };
        let mut objects = server.objects.lock().unwrap();
        let object = objects.entry(dest).or_default();
        if object.len() < offset + body.len() {
            object.resize(offset + body.len(), 0);
        }
        object[offset..offset + body.len()].copy_from_slice(&body);
        StatusCode::OK
    }

    async fn finalize_object(
        State(server): State<Arc<FakeServer>>,
        UrlPath(dest): UrlPath<String>,
        Query(query): Query<HashMap<String, String>>,
        headers: HeaderMap,
    ) -> Result<Json<RemoteReceipt>, StatusCode> {
        if !authorized(&headers) {
            return Err(StatusCode::UNAUTHORIZED);
        }
        let size: usize = query
            .get("size")
            .and_then(|s| s.parse().ok())
            .ok_or(StatusCode::BAD_REQUEST)?;
        let mut objects = server.objects.lock().unwrap();
        let object = objects.get_mut(&dest).ok_or(StatusCode::NOT_FOUND)?;
        object.truncate(size);
        Ok(Json(RemoteReceipt {
            remote_path: dest,
            remote_checksum: sha256_hex(object),
        }))
    }

    async fn spawn_fake_server() -> (String, Arc<FakeServer>) {
        let server = Arc::new(FakeServer::default());
        let app = Router::new()
            .route("/*dest", put(put_object).post(finalize_object))
            .with_state(server.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/store/", addr), server)
    }

    #[tokio::test]
    async fn test_http_store_round_trip() {
        let (base, server) = spawn_fake_server().await;
        let store = HttpStore::new(base);

        store
            .put_chunk("archives/j1.marc", 3, b"def", "good-token")
            .await
            .unwrap();
        store
            .put_chunk("archives/j1.marc", 0, b"abc", "good-token")
            .await
            .unwrap();
        let receipt = store
            .finalize("archives/j1.marc", 6, "good-token")
            .await
            .unwrap();

        assert_eq!(receipt.remote_path, "store/archives/j1.marc");
        assert_eq!(receipt.remote_checksum, sha256_hex(b"abcdef"));
        assert_eq!(
            server.objects.lock().unwrap()["store/archives/j1.marc"],
            b"abcdef".to_vec()
        );
    }

    #[tokio::test]
    async fn test_http_store_maps_unauthorized_to_auth_expired() {
        let (base, _server) = spawn_fake_server().await;
        let store = HttpStore::new(base);

        let err = store
            .put_chunk("a.marc", 0, b"x", "stale-token")
            .await
            .unwrap_err();
        assert_eq!(err, RemoteError::AuthExpired);

        let err = store.finalize("missing.marc", 1, "good-token").await.unwrap_err();
        assert!(matches!(err, RemoteError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_http_store_unreachable_is_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let store = HttpStore::new(format!("http://{}", addr));
        let err = store.put_chunk("a.marc", 0, b"x", "t").await.unwrap_err();
        assert!(matches!(err, RemoteError::Unavailable(_)));
    }
}
