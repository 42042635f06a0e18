//! Google Drive adapter (appDataFolder)
//!
//! Drive offers no If-Match on uploads, so the file `version` doubles as the
//! concurrency token: a conditional write re-reads the metadata and refuses to
//! patch when the version moved.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{
    error_for, http_client, json_body, ProviderAdapter, ProviderError, RemoteMetadata,
    TokenProvider, WriteReceipt, BUNDLE_MIME,
};
use crate::sync::models::DEFAULT_FILE_NAME;

pub const GOOGLE_API_BASE_URL: &str = "https://www.googleapis.com";
pub const GOOGLE_PROVIDER_ID: &str = "google";

const FILE_FIELDS: &str = "id,name,modifiedTime,version";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    modified_time: Option<DateTime<Utc>>,

    /// int64 serialized as a string by the API
    version: Option<serde_json::Value>,
}

impl DriveFile {
    fn version_token(&self) -> Option<String> {
        match &self.version {
            Some(serde_json::Value::String(v)) => Some(v.clone()),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }

    fn metadata(&self) -> RemoteMetadata {
        RemoteMetadata {
            exists: true,
            last_modified: self.modified_time,
            concurrency_token: self.version_token(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DriveFileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

/// Google Drive adapter
pub struct GoogleDriveAdapter {
    client: reqwest::Client,
    base_url: String,
    file_name: String,
    tokens: Arc<dyn TokenProvider>,
    /// Access token (cached in memory)
    access_token: Arc<RwLock<Option<String>>>,
}

impl GoogleDriveAdapter {
    pub fn new(tokens: Arc<dyn TokenProvider>) -> Result<Self, ProviderError> {
        Self::with_base_url(tokens, GOOGLE_API_BASE_URL, DEFAULT_FILE_NAME)
    }

    /// Adapter talking to `base_url` instead of the public API
    pub fn with_base_url(
        tokens: Arc<dyn TokenProvider>,
        base_url: &str,
        file_name: &str,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client()?,
            base_url: super::base_url(base_url)?,
            file_name: file_name.to_string(),
            tokens,
            access_token: Arc::new(RwLock::new(None)),
        })
    }

    async fn token(&self) -> Result<String, ProviderError> {
        self.access_token
            .read()
            .await
            .clone()
            .ok_or(ProviderError::NotAuthenticated)
    }

    /// Locate the bundle in appDataFolder by name
    async fn find_file(&self) -> Result<Option<DriveFile>, ProviderError> {
        let token = self.token().await?;
        let query = format!("name='{}' and trashed=false", self.file_name.replace('\'', "\\'"));
        let fields = format!("files({})", FILE_FIELDS);

        let response = self
            .client
            .get(format!("{}/drive/v3/files", self.base_url))
            .bearer_auth(token)
            .query(&[
                ("spaces", "appDataFolder"),
                ("q", query.as_str()),
                ("fields", fields.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_for(response).await);
        }

        let list: DriveFileList = json_body(response).await?;
        Ok(list.files.into_iter().next())
    }

    /// multipart/related body: JSON metadata part followed by the bundle
    fn multipart_body(metadata: &serde_json::Value, content: &str) -> (String, String) {
        let boundary = format!("ac_sync_{}", uuid::Uuid::new_v4().simple());
        let body = format!(
            "--{b}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{meta}\r\n--{b}\r\nContent-Type: {mime}\r\n\r\n{content}\r\n--{b}--",
            b = boundary,
            meta = metadata,
            mime = BUNDLE_MIME,
            content = content,
        );
        (boundary, body)
    }
}

#[async_trait]
impl ProviderAdapter for GoogleDriveAdapter {
    fn id(&self) -> &str {
        GOOGLE_PROVIDER_ID
    }

    async fn authenticate(&self) -> Result<String, ProviderError> {
        let token = self.tokens.access_token().await?;
        *self.access_token.write().await = Some(token.clone());
        Ok(token)
    }

    async fn sign_out(&self) {
        *self.access_token.write().await = None;
    }

    async fn fetch_metadata(&self) -> Result<Option<RemoteMetadata>, ProviderError> {
        Ok(self.find_file().await?.map(|f| f.metadata()))
    }

    async fn fetch_content(&self) -> Result<Option<String>, ProviderError> {
        let Some(file) = self.find_file().await? else {
            return Ok(None);
        };

        let response = self
            .client
            .get(format!("{}/drive/v3/files/{}", self.base_url, file.id))
            .bearer_auth(self.token().await?)
            .query(&[("alt", "media")])
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(error_for(response).await);
        }

        Ok(Some(response.text().await?))
    }

    async fn write(
        &self,
        content: &str,
        expected_token: Option<&str>,
    ) -> Result<WriteReceipt, ProviderError> {
        // 1. Re-read metadata, verify the version
        let existing = self.find_file().await?;
        if let Some(expected) = expected_token {
            let current = existing.as_ref().and_then(|f| f.version_token());
            if current.as_deref() != Some(expected) {
                log::warn!(
                    "Google Drive version moved (expected {}, found {:?})",
                    expected,
                    current
                );
                return Err(ProviderError::ConcurrencyConflict);
            }
        }

        // 2. Create or update
        let token = self.token().await?;
        let request = match &existing {
            Some(file) => {
                let (boundary, body) =
                    Self::multipart_body(&serde_json::json!({ "name": self.file_name }), content);
                self.client
                    .patch(format!("{}/upload/drive/v3/files/{}", self.base_url, file.id))
                    .header(
                        reqwest::header::CONTENT_TYPE,
                        format!("multipart/related; boundary={}", boundary),
                    )
                    .body(body)
            }
            None => {
                let (boundary, body) = Self::multipart_body(
                    &serde_json::json!({ "name": self.file_name, "parents": ["appDataFolder"] }),
                    content,
                );
                self.client
                    .post(format!("{}/upload/drive/v3/files", self.base_url))
                    .header(
                        reqwest::header::CONTENT_TYPE,
                        format!("multipart/related; boundary={}", boundary),
                    )
                    .body(body)
            }
        };

        let response = request
            .bearer_auth(token)
            .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_for(response).await);
        }

        // 3. New version becomes the token
        let file: DriveFile = json_body(response).await?;
        log::debug!("Google Drive bundle written (file {})", file.id);
        Ok(WriteReceipt {
            concurrency_token: file.version_token(),
            last_modified: file.modified_time.or_else(|| Some(Utc::now())),
        })
    }

    async fn delete(&self) -> Result<(), ProviderError> {
        let Some(file) = self.find_file().await? else {
            return Ok(());
        };

        let response = self
            .client
            .delete(format!("{}/drive/v3/files/{}", self.base_url, file.id))
            .bearer_auth(self.token().await?)
            .send()
            .await?;

        if response.status().is_success() || response.status() == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(error_for(response).await)
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::provider::StaticToken;
    use mockito::{Matcher, Server};

    const LIST_ONE: &str = r#"{
        "files": [
            { "id": "file-1", "name": "ac-backup.json.enc", "modifiedTime": "2025-01-02T03:04:05.000Z", "version": "17" }
        ]
    }"#;

    async fn adapter(server: &Server) -> GoogleDriveAdapter {
        let adapter = GoogleDriveAdapter::with_base_url(
            Arc::new(StaticToken::new("g-token")),
            &server.url(),
            DEFAULT_FILE_NAME,
        )
        .unwrap();
        adapter.authenticate().await.unwrap();
        adapter
    }

    fn list_query() -> Matcher {
        Matcher::AllOf(vec![
            Matcher::UrlEncoded("spaces".into(), "appDataFolder".into()),
            Matcher::UrlEncoded(
                "q".into(),
                "name='ac-backup.json.enc' and trashed=false".into(),
            ),
        ])
    }

    #[tokio::test]
    async fn test_requires_authentication() {
        let server = Server::new_async().await;
        let adapter = GoogleDriveAdapter::with_base_url(
            Arc::new(StaticToken::new("g-token")),
            &server.url(),
            DEFAULT_FILE_NAME,
        )
        .unwrap();

        assert_eq!(adapter.fetch_metadata().await, Err(ProviderError::NotAuthenticated));
    }

    #[tokio::test]
    async fn test_fetch_metadata_uses_version_token() {
        let mut server = Server::new_async().await;
        let list = server
            .mock("GET", "/drive/v3/files")
            .match_query(list_query())
            .match_header("authorization", "Bearer g-token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(LIST_ONE)
            .create_async()
            .await;

        let meta = adapter(&server).await.fetch_metadata().await.unwrap().unwrap();
        assert!(meta.exists);
        assert_eq!(meta.concurrency_token.as_deref(), Some("17"));
        assert_eq!(
            meta.last_modified.unwrap().to_rfc3339(),
            "2025-01-02T03:04:05+00:00"
        );
        list.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_metadata_absent() {
        let mut server = Server::new_async().await;
        let _list = server
            .mock("GET", "/drive/v3/files")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{ "files": [] }"#)
            .create_async()
            .await;

        let adapter = adapter(&server).await;
        assert_eq!(adapter.fetch_metadata().await.unwrap(), None);
        assert_eq!(adapter.fetch_content().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fetch_content() {
        let mut server = Server::new_async().await;
        let _list = server
            .mock("GET", "/drive/v3/files")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(LIST_ONE)
            .create_async()
            .await;
        let media = server
            .mock("GET", "/drive/v3/files/file-1")
            .match_query(Matcher::UrlEncoded("alt".into(), "media".into()))
            .with_status(200)
            .with_body(r#"{"version":1}"#)
            .create_async()
            .await;

        let content = adapter(&server).await.fetch_content().await.unwrap();
        assert_eq!(content.as_deref(), Some(r#"{"version":1}"#));
        media.assert_async().await;
    }

    #[tokio::test]
    async fn test_write_creates_when_absent() {
        let mut server = Server::new_async().await;
        let _list = server
            .mock("GET", "/drive/v3/files")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{ "files": [] }"#)
            .create_async()
            .await;
        let create = server
            .mock("POST", "/upload/drive/v3/files")
            .match_query(Matcher::UrlEncoded("uploadType".into(), "multipart".into()))
            .match_header(
                "content-type",
                Matcher::Regex("^multipart/related; boundary=".into()),
            )
            .match_body(Matcher::Regex("appDataFolder".into()))
            .with_status(200)
            .with_body(r#"{ "id": "file-9", "modifiedTime": "2025-02-01T00:00:00Z", "version": "1" }"#)
            .create_async()
            .await;

        let receipt = adapter(&server).await.write("{}", None).await.unwrap();
        assert_eq!(receipt.concurrency_token.as_deref(), Some("1"));
        create.assert_async().await;
    }

    #[tokio::test]
    async fn test_conditional_write_patches_matching_version() {
        let mut server = Server::new_async().await;
        let _list = server
            .mock("GET", "/drive/v3/files")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(LIST_ONE)
            .create_async()
            .await;
        let patch = server
            .mock("PATCH", "/upload/drive/v3/files/file-1")
            .match_query(Matcher::Any)
            .match_body(Matcher::Regex("ciphertext-here".into()))
            .with_status(200)
            .with_body(r#"{ "id": "file-1", "modifiedTime": "2025-02-01T00:00:00Z", "version": "18" }"#)
            .create_async()
            .await;

        let receipt = adapter(&server)
            .await
            .write("ciphertext-here", Some("17"))
            .await
            .unwrap();
        assert_eq!(receipt.concurrency_token.as_deref(), Some("18"));
        patch.assert_async().await;
    }

    #[tokio::test]
    async fn test_conditional_write_rejects_stale_version() {
        let mut server = Server::new_async().await;
        let _list = server
            .mock("GET", "/drive/v3/files")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(LIST_ONE)
            .create_async()
            .await;
        let patch = server
            .mock("PATCH", "/upload/drive/v3/files/file-1")
            .match_query(Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let result = adapter(&server).await.write("{}", Some("16")).await;
        assert_eq!(result, Err(ProviderError::ConcurrencyConflict));
        patch.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let mut server = Server::new_async().await;
        let _list = server
            .mock("GET", "/drive/v3/files")
            .match_query(Matcher::Any)
            .with_status(401)
            .create_async()
            .await;

        let result = adapter(&server).await.fetch_metadata().await;
        assert_eq!(result, Err(ProviderError::AuthExpired));
    }

    #[tokio::test]
    async fn test_rate_limit_carries_retry_after() {
        let mut server = Server::new_async().await;
        let _list = server
            .mock("GET", "/drive/v3/files")
            .match_query(Matcher::Any)
            .with_status(429)
            .with_header("retry-after", "60")
            .create_async()
            .await;

        let result = adapter(&server).await.fetch_metadata().await;
        assert_eq!(
            result,
            Err(ProviderError::RateLimited {
                retry_after: Some(std::time::Duration::from_secs(60))
            })
        );
    }
}
