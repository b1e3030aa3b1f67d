//! Dropbox API client.

use reqwest::{header, Body, Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

use meldanya_common::{Error, Result};

use crate::oauth::TokenManager;

/// Dropbox RPC endpoint base URL.
const API_BASE: &str = "https://api.dropboxapi.com/2";
/// Dropbox content (upload) endpoint base URL.
const CONTENT_BASE: &str = "https://content.dropboxapi.com/2";

/// Largest file sent in a single upload request.
pub const SINGLE_UPLOAD_LIMIT: u64 = 150 * 1024 * 1024;
/// Chunk size for upload sessions.
pub const SESSION_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Metadata of a Dropbox file.
#[derive(Debug, Clone, Deserialize)]
pub struct FileMetadata {
    /// File name.
    pub name: String,
    /// Display path.
    #[serde(default)]
    pub path_display: Option<String>,
    /// Size in bytes.
    #[serde(default)]
    pub size: u64,
}

/// Metadata of a Dropbox folder.
#[derive(Debug, Clone, Deserialize)]
pub struct FolderMetadata {
    /// Folder name.
    pub name: String,
    /// Display path.
    #[serde(default)]
    pub path_display: Option<String>,
}

/// A listing entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = ".tag", rename_all = "lowercase")]
pub enum Entry {
    /// A regular file.
    File(FileMetadata),
    /// A folder.
    Folder(FolderMetadata),
    /// A deleted entry (only returned when asked for).
    Deleted {
        /// Entry name.
        name: String,
    },
}

#[derive(Debug, Deserialize)]
struct CreateFolderResponse {
    metadata: FolderMetadata,
}

#[derive(Debug, Deserialize)]
struct ListFolderResponse {
    entries: Vec<Entry>,
    cursor: String,
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct UploadSessionStart {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    error_summary: String,
}

#[derive(Debug, Serialize)]
struct CommitInfo<'a> {
    path: &'a str,
    mode: &'static str,
    autorename: bool,
    mute: bool,
}

impl<'a> CommitInfo<'a> {
    fn add(path: &'a str) -> Self {
        Self {
            path,
            mode: "add",
            autorename: false,
            mute: true,
        }
    }
}

#[derive(Debug, Serialize)]
struct Cursor<'a> {
    session_id: &'a str,
    offset: u64,
}

/// Dropbox API client.
pub struct DropboxClient {
    http: Client,
    token_manager: Arc<TokenManager>,
}

impl DropboxClient {
    /// Create a new Dropbox client.
    pub fn new(token_manager: Arc<TokenManager>) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("meldanya-backup/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            token_manager,
        })
    }

    async fn auth_header(&self) -> Result<String> {
        let token = self.token_manager.get_access_token().await?;
        Ok(format!("Bearer {}", token))
    }

    /// Call an RPC endpoint with a JSON body.
    async fn rpc<T: DeserializeOwned>(&self, endpoint: &str, body: serde_json::Value) -> Result<T> {
        let url = format!("{}/{}", API_BASE, endpoint);
        let auth = self.auth_header().await?;

        let response = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, auth)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Request to {} failed: {}", endpoint, e)))?;

        handle_response(response).await
    }

    /// Call a content endpoint with arguments in the `Dropbox-API-Arg` header.
    async fn content<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        arg: serde_json::Value,
        body: Body,
        length: u64,
    ) -> Result<T> {
        let url = format!("{}/{}", CONTENT_BASE, endpoint);
        let auth = self.auth_header().await?;

        let response = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, auth)
            .header("Dropbox-API-Arg", header_safe_json(&arg)?)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(header::CONTENT_LENGTH, length)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Request to {} failed: {}", endpoint, e)))?;

        handle_response(response).await
    }

    /// Create a folder at `path`.
    ///
    /// # Errors
    /// - `Error::AlreadyExists` when something already exists at `path`
    pub async fn create_folder(&self, path: &str) -> Result<FolderMetadata> {
        let response: CreateFolderResponse = self
            .rpc(
                "files/create_folder_v2",
                serde_json::json!({ "path": path, "autorename": false }),
            )
            .await?;
        Ok(response.metadata)
    }

    /// List the direct children of `path` (`""` for the root).
    pub async fn list_folder(&self, path: &str) -> Result<Vec<Entry>> {
        let mut response: ListFolderResponse = self
            .rpc(
                "files/list_folder",
                serde_json::json!({ "path": path, "recursive": false }),
            )
            .await?;
        let mut entries = std::mem::take(&mut response.entries);

        while response.has_more {
            response = self
                .rpc(
                    "files/list_folder/continue",
                    serde_json::json!({ "cursor": response.cursor }),
                )
                .await?;
            entries.append(&mut response.entries);
        }

        Ok(entries)
    }

    /// Upload the local file at `local` to `path`.
    ///
    /// Files above [`SINGLE_UPLOAD_LIMIT`] go through an upload session.
    pub async fn upload(&self, local: &Path, path: &str) -> Result<FileMetadata> {
        let total_size = tokio::fs::metadata(local).await?.len();

        if total_size <= SINGLE_UPLOAD_LIMIT {
            let file = tokio::fs::File::open(local).await?;
            let body = Body::wrap_stream(ReaderStream::new(file));
            let arg = serde_json::to_value(CommitInfo::add(path))?;
            self.content("files/upload", arg, body, total_size).await
        } else {
            self.upload_session(local, path, total_size).await
        }
    }

    async fn upload_session(&self, local: &Path, path: &str, total_size: u64) -> Result<FileMetadata> {
        let mut file = tokio::fs::File::open(local).await?;

        let first = read_chunk(&mut file).await?;
        let mut offset = first.len() as u64;
        let session: UploadSessionStart = self
            .content(
                "files/upload_session/start",
                serde_json::json!({ "close": false }),
                Body::from(first),
                offset,
            )
            .await?;
        debug!(session = %session.session_id, total_size, "Started upload session");

        loop {
            let chunk = read_chunk(&mut file).await?;
            let length = chunk.len() as u64;
            let step = session_step(offset, length, total_size)?;
            let cursor = Cursor {
                session_id: &session.session_id,
                offset,
            };

            if step == SessionStep::Finish {
                let arg = serde_json::json!({
                    "cursor": cursor,
                    "commit": CommitInfo::add(path),
                });
                return self
                    .content("files/upload_session/finish", arg, Body::from(chunk), length)
                    .await;
            }

            let arg = serde_json::json!({ "cursor": cursor, "close": false });
            let _: Option<serde_json::Value> = self
                .content("files/upload_session/append_v2", arg, Body::from(chunk), length)
                .await?;
            offset += length;
        }
    }

    /// Delete the file or folder at `path`, including folder contents.
    pub async fn delete(&self, path: &str) -> Result<()> {
        let _: serde_json::Value = self
            .rpc("files/delete_v2", serde_json::json!({ "path": path }))
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionStep {
    Append,
    Finish,
}

/// What to do with a chunk of `length` bytes read at `offset`.
///
/// A file that ends early (it shrank after its size was taken) is an
/// error rather than an endless run of empty appends.
fn session_step(offset: u64, length: u64, total_size: u64) -> Result<SessionStep> {
    if offset + length >= total_size {
        Ok(SessionStep::Finish)
    } else if length == 0 {
        Err(Error::Storage(format!(
            "File ended at byte {} of {} during upload",
            offset, total_size
        )))
    } else {
        Ok(SessionStep::Append)
    }
}

/// Read up to one session chunk from `file`.
async fn read_chunk(file: &mut tokio::fs::File) -> Result<Vec<u8>> {
    let mut chunk = Vec::with_capacity(SESSION_CHUNK_SIZE as usize);
    file.take(SESSION_CHUNK_SIZE).read_to_end(&mut chunk).await?;
    Ok(chunk)
}

/// Serialize `value` as JSON that is safe to send in an HTTP header.
///
/// Non-ASCII characters are written as `\uXXXX` escapes.
pub fn header_safe_json(value: &serde_json::Value) -> Result<String> {
    let json = serde_json::to_string(value)?;
    let mut escaped = String::with_capacity(json.len());
    for c in json.chars() {
        if c.is_ascii() {
            escaped.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                escaped.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    Ok(escaped)
}

/// Map a Dropbox response onto our error type.
async fn handle_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| Error::Network(format!("Failed to read response: {}", e)))?;

    if status.is_success() {
        // Some endpoints answer with `null`.
        let body = if body.trim().is_empty() { "null" } else { body.as_str() };
        return serde_json::from_str(body)
            .map_err(|e| Error::Network(format!("Failed to parse response: {}", e)));
    }

    let summary = serde_json::from_str::<ApiError>(&body)
        .map(|e| e.error_summary)
        .unwrap_or(body);

    Err(match status {
        StatusCode::CONFLICT if summary.contains("conflict") => Error::AlreadyExists(summary),
        StatusCode::CONFLICT if summary.contains("not_found") => Error::NotFound(summary),
        StatusCode::UNAUTHORIZED => Error::Authentication(format!("Invalid or expired token: {}", summary)),
        StatusCode::FORBIDDEN => Error::PermissionDenied(summary),
        _ => Error::Network(format!("API error: {} - {}", status, summary)),
    })
}
