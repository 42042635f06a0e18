//! OneDrive adapter (Microsoft Graph App Folder)
//!
//! The item `eTag` is the concurrency token; conditional writes send it as
//! `If-Match` and Graph answers 412 when the item changed in between.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{
    error_for, http_client, json_body, ProviderAdapter, ProviderError, RemoteMetadata,
    TokenProvider, WriteReceipt, BUNDLE_MIME,
};
use crate::sync::models::DEFAULT_FILE_NAME;

pub const GRAPH_API_BASE_URL: &str = "https://graph.microsoft.com/v1.0";
pub const ONEDRIVE_PROVIDER_ID: &str = "onedrive";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveItem {
    e_tag: Option<String>,
    last_modified_date_time: Option<DateTime<Utc>>,
    file_system_info: Option<FileSystemInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileSystemInfo {
    last_modified_date_time: Option<DateTime<Utc>>,
}

impl DriveItem {
    fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.last_modified_date_time.or_else(|| {
            self.file_system_info
                .as_ref()
                .and_then(|info| info.last_modified_date_time)
        })
    }
}

/// OneDrive adapter
pub struct OneDriveAdapter {
    client: reqwest::Client,
    base_url: String,
    file_name: String,
    tokens: Arc<dyn TokenProvider>,
    access_token: Arc<RwLock<Option<String>>>,
}

impl OneDriveAdapter {
    pub fn new(tokens: Arc<dyn TokenProvider>) -> Result<Self, ProviderError> {
        Self::with_base_url(tokens, GRAPH_API_BASE_URL, DEFAULT_FILE_NAME)
    }

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

    fn item_url(&self) -> String {
        format!(
            "{}/me/drive/special/approot:/{}",
            self.base_url,
            urlencoding::encode(&self.file_name)
        )
    }

    fn content_url(&self) -> String {
        format!("{}:/content", self.item_url())
    }
}

#[async_trait]
impl ProviderAdapter for OneDriveAdapter {
    fn id(&self) -> &str {
        ONEDRIVE_PROVIDER_ID
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
        let response = self
            .client
            .get(self.item_url())
            .bearer_auth(self.token().await?)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(error_for(response).await);
        }

        let item: DriveItem = json_body(response).await?;
        Ok(Some(RemoteMetadata {
            exists: true,
            last_modified: item.last_modified(),
            concurrency_token: item.e_tag,
        }))
    }

    async fn fetch_content(&self) -> Result<Option<String>, ProviderError> {
        let response = self
            .client
            .get(self.content_url())
            .bearer_auth(self.token().await?)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
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
        let mut request = self
            .client
            .put(self.content_url())
            .bearer_auth(self.token().await?)
            .header(reqwest::header::CONTENT_TYPE, BUNDLE_MIME)
            .body(content.to_string());

        if let Some(etag) = expected_token {
            request = request.header(reqwest::header::IF_MATCH, etag);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let err = error_for(response).await;
            if err == ProviderError::ConcurrencyConflict {
                log::warn!("OneDrive rejected write: eTag changed");
            }
            return Err(err);
        }

        let item: DriveItem = json_body(response).await?;
        Ok(WriteReceipt {
            concurrency_token: item.e_tag.clone(),
            last_modified: item.last_modified().or_else(|| Some(Utc::now())),
        })
    }

    async fn delete(&self) -> Result<(), ProviderError> {
        let response = self
            .client
            .delete(self.item_url())
            .bearer_auth(self.token().await?)
            .send()
            .await?;

        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
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
    use mockito::Server;

    const ITEM_PATH: &str = "/me/drive/special/approot:/ac-backup.json.enc";
    const CONTENT_PATH: &str = "/me/drive/special/approot:/ac-backup.json.enc:/content";

    async fn adapter(server: &Server) -> OneDriveAdapter {
        let adapter = OneDriveAdapter::with_base_url(
            Arc::new(StaticToken::new("ms-token")),
            &server.url(),
            DEFAULT_FILE_NAME,
        )
        .unwrap();
        adapter.authenticate().await.unwrap();
        adapter
    }

    #[tokio::test]
    async fn test_fetch_metadata() {
        let mut server = Server::new_async().await;
        let meta = server
            .mock("GET", ITEM_PATH)
            .match_header("authorization", "Bearer ms-token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{ "eTag": "\"{ABC},3\"", "lastModifiedDateTime": "2025-03-04T05:06:07Z" }"#)
            .create_async()
            .await;

        let result = adapter(&server).await.fetch_metadata().await.unwrap().unwrap();
        assert_eq!(result.concurrency_token.as_deref(), Some("\"{ABC},3\""));
        assert_eq!(result.last_modified_ms(), 1_741_064_767_000);
        meta.assert_async().await;
    }

    #[tokio::test]
    async fn test_missing_item_is_none() {
        let mut server = Server::new_async().await;
        let _meta = server.mock("GET", ITEM_PATH).with_status(404).create_async().await;
        let _content = server.mock("GET", CONTENT_PATH).with_status(404).create_async().await;
        let _delete = server.mock("DELETE", ITEM_PATH).with_status(404).create_async().await;

        let adapter = adapter(&server).await;
        assert_eq!(adapter.fetch_metadata().await.unwrap(), None);
        assert_eq!(adapter.fetch_content().await.unwrap(), None);
        assert!(adapter.delete().await.is_ok());
    }

    #[tokio::test]
    async fn test_conditional_put_sends_if_match() {
        let mut server = Server::new_async().await;
        let put = server
            .mock("PUT", CONTENT_PATH)
            .match_header("if-match", "etag-1")
            .match_header("content-type", "application/json")
            .match_body("bundle-text")
            .with_status(200)
            .with_body(r#"{ "eTag": "etag-2", "lastModifiedDateTime": "2025-03-04T05:06:08Z" }"#)
            .create_async()
            .await;

        let receipt = adapter(&server)
            .await
            .write("bundle-text", Some("etag-1"))
            .await
            .unwrap();
        assert_eq!(receipt.concurrency_token.as_deref(), Some("etag-2"));
        put.assert_async().await;
    }

    #[tokio::test]
    async fn test_precondition_failed_is_conflict() {
        let mut server = Server::new_async().await;
        let _put = server
            .mock("PUT", CONTENT_PATH)
            .with_status(412)
            .create_async()
            .await;

        let result = adapter(&server).await.write("{}", Some("stale")).await;
        assert_eq!(result, Err(ProviderError::ConcurrencyConflict));
    }

    #[tokio::test]
    async fn test_forbidden_is_auth_expired() {
        let mut server = Server::new_async().await;
        let _meta = server.mock("GET", ITEM_PATH).with_status(403).create_async().await;

        let result = adapter(&server).await.fetch_metadata().await;
        assert_eq!(result, Err(ProviderError::AuthExpired));
    }

    #[tokio::test]
    async fn test_server_error_is_network_failure() {
        let mut server = Server::new_async().await;
        let _content = server
            .mock("GET", CONTENT_PATH)
            .with_status(503)
            .with_body("unavailable")
            .create_async()
            .await;

        let result = adapter(&server).await.fetch_content().await;
        assert!(matches!(result, Err(ProviderError::NetworkFailure(msg)) if msg.contains("unavailable")));
    }

    #[tokio::test]
    async fn test_sign_out_clears_token() {
        let server = Server::new_async().await;
        let adapter = adapter(&server).await;
        adapter.sign_out().await;
        assert_eq!(adapter.fetch_metadata().await, Err(ProviderError::NotAuthenticated));
    }
}
