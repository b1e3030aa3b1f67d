//! Google Drive v3 client, limited to what backups need: folders under a
//! parent, uploads streamed from disk, and deletion.

use chrono::{DateTime, Utc};
use reqwest::{header, Body, Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

use meldanya_common::{Error, Result};

use crate::oauth::TokenManager;

const API_BASE: &str = "https://www.googleapis.com/drive/v3";
const UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";

/// Files below this size are sent in one multipart request.
pub const MULTIPART_LIMIT: u64 = 5 * 1024 * 1024;

/// Resumable upload chunk size. Drive wants multiples of 256 KiB.
pub const CHUNK_SIZE: u64 = 8 * 256 * 1024;

/// MIME type Drive uses for folders.
pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

const FILE_FIELDS: &str = "id,name,mimeType,size,createdTime";
const MULTIPART_BOUNDARY: &str = "meldanya-backup-part";

/// A Drive file or folder.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    /// Decimal string, absent for folders.
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub created_time: Option<DateTime<Utc>>,
}

impl DriveFile {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }

    pub fn size_bytes(&self) -> Option<u64> {
        self.size.as_ref().and_then(|s| s.parse().ok())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

/// Google Drive API client.
pub struct DriveClient {
    http: Client,
    token_manager: Arc<TokenManager>,
}

impl DriveClient {
    /// Create a new Drive client.
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

    /// Authorize and send `request`, failing on transport errors only.
    async fn send(&self, request: RequestBuilder, action: &str) -> Result<Response> {
        let token = self.token_manager.get_access_token().await?;
        request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to {}: {}", action, e)))
    }

    /// Send `request` and parse a successful JSON answer.
    async fn call<T: DeserializeOwned>(&self, request: RequestBuilder, action: &str) -> Result<T> {
        let response = check_status(self.send(request, action).await?).await?;
        response
            .json()
            .await
            .map_err(|e| Error::Network(format!("Failed to parse response: {}", e)))
    }

    /// Create a folder named `name` inside `parent_id`.
    pub async fn create_folder(&self, name: &str, parent_id: &str) -> Result<DriveFile> {
        let metadata = serde_json::json!({
            "name": name,
            "mimeType": FOLDER_MIME_TYPE,
            "parents": [parent_id],
        });
        let request = self
            .http
            .post(format!("{}/files", API_BASE))
            .query(&[("fields", FILE_FIELDS)])
            .json(&metadata);

        self.call(request, "create folder").await
    }

    /// Every non-trashed child of `parent_id`, following pagination.
    pub async fn list_children(&self, parent_id: &str) -> Result<Vec<DriveFile>> {
        let query = children_query(parent_id);
        let fields = format!("files({}),nextPageToken", FILE_FIELDS);
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self.http.get(format!("{}/files", API_BASE)).query(&[
                ("q", query.as_str()),
                ("fields", fields.as_str()),
                ("pageSize", "1000"),
            ]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let page: FileList = self.call(request, "list folder").await?;
            files.extend(page.files);

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => return Ok(files),
            }
        }
    }

    /// The child of `parent_id` called `name`, if any.
    ///
    /// `parent_id` may be `root` for the top of the user's Drive.
    pub async fn find_child(&self, name: &str, parent_id: &str) -> Result<Option<DriveFile>> {
        let query = format!(
            "name = '{}' and {}",
            escape_query(name),
            children_query(parent_id)
        );
        let fields = format!("files({})", FILE_FIELDS);
        let request = self.http.get(format!("{}/files", API_BASE)).query(&[
            ("q", query.as_str()),
            ("fields", fields.as_str()),
            ("pageSize", "1"),
        ]);

        let list: FileList = self.call(request, "look up file").await?;
        Ok(list.files.into_iter().next())
    }

    /// Upload `local` as `name` into `parent_id`.
    ///
    /// Small files go in one multipart request. Larger ones use a resumable
    /// session and are streamed from disk chunk by chunk.
    pub async fn upload(&self, local: &Path, name: &str, parent_id: &str) -> Result<DriveFile> {
        let total_size = tokio::fs::metadata(local).await?.len();
        let metadata = serde_json::json!({
            "name": name,
            "parents": [parent_id],
            "mimeType": "application/octet-stream",
        });

        if total_size < MULTIPART_LIMIT {
            let data = tokio::fs::read(local).await?;
            let request = self
                .http
                .post(format!("{}/files", UPLOAD_BASE))
                .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)])
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/related; boundary={}", MULTIPART_BOUNDARY),
                )
                .body(multipart_body(&metadata, &data)?);
            return self.call(request, "upload file").await;
        }

        let session = self.start_session(&metadata, total_size).await?;
        debug!(name, total_size, "Started resumable upload");

        let mut offset = 0;
        while offset < total_size {
            let length = CHUNK_SIZE.min(total_size - offset);
            let mut file = tokio::fs::File::open(local).await?;
            file.seek(SeekFrom::Start(offset)).await?;
            let chunk = file.take(length);

            let request = self
                .http
                .put(&session)
                .header(header::CONTENT_LENGTH, length)
                .header(header::CONTENT_RANGE, content_range(offset, length, total_size))
                .body(Body::wrap_stream(ReaderStream::new(chunk)));
            let response = self.send(request, "upload chunk").await?;

            // 308: the session wants the next chunk.
            if response.status() == StatusCode::PERMANENT_REDIRECT {
                offset += length;
                continue;
            }
            return check_status(response)
                .await?
                .json()
                .await
                .map_err(|e| Error::Network(format!("Failed to parse upload response: {}", e)));
        }

        Err(Error::Storage(format!(
            "Upload of {} ended before Drive confirmed it",
            name
        )))
    }

    /// Open a resumable session, returning its upload URI.
    async fn start_session(&self, metadata: &serde_json::Value, total_size: u64) -> Result<String> {
        let request = self
            .http
            .post(format!("{}/files", UPLOAD_BASE))
            .query(&[("uploadType", "resumable"), ("fields", FILE_FIELDS)])
            .header("X-Upload-Content-Type", "application/octet-stream")
            .header("X-Upload-Content-Length", total_size)
            .json(metadata);
        let response = check_status(self.send(request, "start upload").await?).await?;

        response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| Error::Network("Upload session has no location".to_string()))
    }

    /// Delete a file or folder. Folder contents go with it.
    pub async fn delete(&self, file_id: &str) -> Result<()> {
        let request = self.http.delete(format!("{}/files/{}", API_BASE, file_id));
        check_status(self.send(request, "delete file").await?).await?;
        Ok(())
    }
}

/// Query matching the non-trashed children of `parent_id`.
fn children_query(parent_id: &str) -> String {
    format!("'{}' in parents and trashed = false", escape_query(parent_id))
}

/// Escape a string literal for a Drive search query.
fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn content_range(offset: u64, length: u64, total_size: u64) -> String {
    format!("bytes {}-{}/{}", offset, offset + length - 1, total_size)
}

/// `multipart/related` body: JSON metadata, then the file content.
fn multipart_body(metadata: &serde_json::Value, data: &[u8]) -> Result<Vec<u8>> {
    let metadata = serde_json::to_vec(metadata)?;
    let mut body = Vec::with_capacity(data.len() + metadata.len() + 192);

    body.extend_from_slice(format!("--{}\r\n", MULTIPART_BOUNDARY).as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(&metadata);
    body.extend_from_slice(format!("\r\n--{}\r\n", MULTIPART_BOUNDARY).as_bytes());
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{}--", MULTIPART_BOUNDARY).as_bytes());

    Ok(body)
}

/// Pass successful responses through, map the rest onto our error type.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = error_message(&body);
    Err(match status {
        StatusCode::NOT_FOUND => Error::NotFound(message),
        StatusCode::UNAUTHORIZED => Error::Authentication(format!("Invalid or expired token: {}", message)),
        StatusCode::FORBIDDEN => Error::PermissionDenied(message),
        _ => Error::Network(format!("API error: {} - {}", status, message)),
    })
}

/// The `error.message` of a Drive error body, or the body itself.
fn error_message(body: &str) -> String {
    serde_json::from_str::<ErrorBody>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_deserialization() {
        let json = r#"{
            "files": [
                {
                    "id": "1AbC",
                    "name": "2024-05-01T0300",
                    "mimeType": "application/vnd.google-apps.folder",
                    "createdTime": "2024-05-01T03:00:12.345Z"
                },
                {
                    "id": "2DeF",
                    "name": "home.tgz",
                    "mimeType": "application/octet-stream",
                    "size": "2048"
                }
            ],
            "nextPageToken": "page-2"
        }"#;

        let list: FileList = serde_json::from_str(json).unwrap();
        assert_eq!(list.files.len(), 2);
        assert!(list.files[0].is_folder());
        assert!(list.files[0].created_time.is_some());
        assert_eq!(list.files[0].size_bytes(), None);
        assert!(!list.files[1].is_folder());
        assert_eq!(list.files[1].size_bytes(), Some(2048));
        assert_eq!(list.next_page_token.as_deref(), Some("page-2"));
    }

    #[test]
    fn test_queries_escape_literals() {
        assert_eq!(escape_query("plain"), "plain");
        assert_eq!(escape_query("it's"), "it\\'s");
        assert_eq!(escape_query("a\\b"), "a\\\\b");
        assert_eq!(children_query("root"), "'root' in parents and trashed = false");
    }

    #[test]
    fn test_content_range() {
        assert_eq!(content_range(0, CHUNK_SIZE, 5_000_000), "bytes 0-2097151/5000000");
        assert_eq!(
            content_range(CHUNK_SIZE * 2, 10, CHUNK_SIZE * 2 + 10),
            "bytes 4194304-4194313/4194314"
        );
    }

    #[test]
    fn test_multipart_body_layout() {
        let metadata = serde_json::json!({ "name": "a.tgz", "parents": ["p"] });
        let body = multipart_body(&metadata, b"DATA").unwrap();
        let text = String::from_utf8(body).unwrap();

        let expected = format!(
            "--{b}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{m}\r\n--{b}\r\n\
             Content-Type: application/octet-stream\r\n\r\nDATA\r\n--{b}--",
            b = MULTIPART_BOUNDARY,
            m = serde_json::to_string(&metadata).unwrap()
        );
        assert_eq!(text, expected);
    }

    #[test]
    fn test_error_message() {
        let body = r#"{"error": {"code": 404, "message": "File not found: xyz."}}"#;
        assert_eq!(error_message(body), "File not found: xyz.");
        assert_eq!(error_message("Bad Gateway"), "Bad Gateway");
    }

    #[test]
    fn test_chunk_size_is_multiple_of_256k() {
        assert_eq!(CHUNK_SIZE % (256 * 1024), 0);
        assert!(CHUNK_SIZE <= MULTIPART_LIMIT);
    }
}
