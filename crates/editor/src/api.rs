//! Document persistence, compile and backup endpoints.
//!
//! [`DocumentService`] is the seam the editor session talks through;
//! [`HttpDocumentApi`] implements it against the backend REST API using
//! [`reqwest`].

use std::time::Duration;

use async_trait::async_trait;
use quire_core::types::{Timestamp, VersionId};
use serde::{Deserialize, Serialize};

/// Metadata of one saved version of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRef {
    pub version_id: VersionId,
    pub filename: String,
    /// Size in bytes.
    pub size: u64,
    pub modified_at: Timestamp,
}

/// Response of a successful `PUT` of document content.
#[derive(Debug, Clone, Deserialize)]
pub struct SavedDocument {
    pub content: String,
    /// Version created by this save, when the server made a backup.
    #[serde(default)]
    pub version_id: Option<VersionId>,
}

#[derive(Deserialize)]
struct ContentBody {
    content: String,
}

/// Errors from the document REST layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The HTTP request itself failed (network, DNS, TLS, timeout).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server returned a non-2xx status code.
    #[error("API error ({status}): {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },
}

/// Backend operations a document session depends on.
#[async_trait]
pub trait DocumentService: Send + Sync + 'static {
    /// Current persisted content.
    async fn load(&self, document_id: &str) -> Result<String, ApiError>;

    /// Persist `content`, optionally keeping the previous version as a
    /// backup.
    async fn save(
        &self,
        document_id: &str,
        content: &str,
        create_backup: bool,
    ) -> Result<SavedDocument, ApiError>;

    /// Ask the server to compile the document. Only acknowledges the
    /// request; the outcome arrives on the push channel.
    async fn compile(&self, document_id: &str, engine: &str) -> Result<(), ApiError>;

    /// Saved versions, newest first.
    async fn list_backups(&self, document_id: &str) -> Result<Vec<BackupRef>, ApiError>;

    /// Content of one saved version.
    async fn fetch_backup(&self, document_id: &str, version_id: &str)
        -> Result<String, ApiError>;
}

/// HTTP client for the document endpoints.
pub struct HttpDocumentApi {
    client: reqwest::Client,
    api_url: String,
}

impl HttpDocumentApi {
    /// Create a client for `api_url` (e.g. `http://host:8000`) with a
    /// per-request timeout.
    pub fn new(api_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, api_url))
    }

    /// Create a client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn document_url(&self, document_id: &str) -> String {
        format!("{}/api/documents/{}", self.api_url, document_id)
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or an [`ApiError::Api`] carrying the
    /// status and body text on failure.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ApiError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    async fn check_status(response: reqwest::Response) -> Result<(), ApiError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentService for HttpDocumentApi {
    async fn load(&self, document_id: &str) -> Result<String, ApiError> {
        let response = self.client.get(self.document_url(document_id)).send().await?;
        let body: ContentBody = Self::parse_response(response).await?;
        Ok(body.content)
    }

    async fn save(
        &self,
        document_id: &str,
        content: &str,
        create_backup: bool,
    ) -> Result<SavedDocument, ApiError> {
        let body = serde_json::json!({
            "content": content,
            "create_backup": create_backup,
        });
        let response = self
            .client
            .put(self.document_url(document_id))
            .json(&body)
            .send()
            .await?;
        Self::parse_response(response).await
    }

    async fn compile(&self, document_id: &str, engine: &str) -> Result<(), ApiError> {
        let body = serde_json::json!({ "engine": engine });
        let response = self
            .client
            .post(format!("{}/compile", self.document_url(document_id)))
            .json(&body)
            .send()
            .await?;
        Self::check_status(response).await
    }

    async fn list_backups(&self, document_id: &str) -> Result<Vec<BackupRef>, ApiError> {
        let response = self
            .client
            .get(format!("{}/backups", self.document_url(document_id)))
            .send()
            .await?;
        Self::parse_response(response).await
    }

    async fn fetch_backup(
        &self,
        document_id: &str,
        version_id: &str,
    ) -> Result<String, ApiError> {
        let response = self
            .client
            .get(format!(
                "{}/backups/{}",
                self.document_url(document_id),
                version_id
            ))
            .send()
            .await?;
        let body: ContentBody = Self::parse_response(response).await?;
        Ok(body.content)
    }
}
