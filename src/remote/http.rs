//! JSON-over-HTTPS implementation of [`DriveClient`]

use super::client::{
    BulkPage, DriveClient, DriveError, DriveResult, RemoteItem, UploadSessionId,
};
use crate::shared::{NodeId, SyncTime};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

/// Envelope wrapping every successful drive response.
#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    #[serde(default)]
    description: String,
}

/// Drive client talking to the HTTP API. Token refresh is the embedder's
/// concern; this client only attaches the bearer token it was given.
pub struct HttpDriveClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpDriveClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.http.get(self.url(path)).bearer_auth(&self.token)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http.post(self.url(path)).bearer_auth(&self.token)
    }

    fn delete(&self, path: &str) -> reqwest::RequestBuilder {
        self.http.delete(self.url(path)).bearer_auth(&self.token)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> DriveResult<T> {
        let response = request
            .send()
            .await
            .map_err(|err| DriveError::network(err.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|err| DriveError::network(err.to_string()))?;

        if let Ok(envelope) = serde_json::from_slice::<ErrorEnvelope>(&body) {
            debug!(status, code = %envelope.error.code, "Drive request failed");
            return Err(DriveError {
                status,
                code: envelope.error.code,
                description: envelope.error.description,
            });
        }
        if !(200..300).contains(&status) {
            return Err(DriveError {
                status,
                code: "http_error".into(),
                description: format!("unexpected status {status}"),
            });
        }
        serde_json::from_slice::<DataEnvelope<T>>(&body)
            .map(|envelope| envelope.data)
            .map_err(|err| DriveError {
                status,
                code: "bad_envelope".into(),
                description: err.to_string(),
            })
    }

    /// Like `send_json`, for endpoints whose success body carries nothing
    /// the engine needs (some return an empty body).
    async fn send_empty(&self, request: reqwest::RequestBuilder) -> DriveResult<()> {
        let response = request
            .send()
            .await
            .map_err(|err| DriveError::network(err.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|err| DriveError::network(err.to_string()))?;
        if let Ok(envelope) = serde_json::from_slice::<ErrorEnvelope>(&body) {
            return Err(DriveError {
                status,
                code: envelope.error.code,
                description: envelope.error.description,
            });
        }
        if !(200..300).contains(&status) {
            return Err(DriveError {
                status,
                code: "http_error".into(),
                description: format!("unexpected status {status}"),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct SessionBody {
    id: String,
}

#[async_trait]
impl DriveClient for HttpDriveClient {
    async fn get_item(&self, id: &NodeId) -> DriveResult<RemoteItem> {
        self.send_json(self.get(&format!("/files/{id}"))).await
    }

    async fn list_children(
        &self,
        dir_id: &NodeId,
        page: u32,
        per_page: u32,
    ) -> DriveResult<Vec<RemoteItem>> {
        self.send_json(
            self.get(&format!("/files/{dir_id}/files"))
                .query(&[("page", page), ("per_page", per_page)]),
        )
        .await
    }

    async fn create_dir(&self, parent_id: &NodeId, name: &str) -> DriveResult<RemoteItem> {
        self.send_json(
            self.post(&format!("/files/{parent_id}/directory"))
                .json(&json!({ "name": name })),
        )
        .await
    }

    async fn copy_to_dir(
        &self,
        id: &NodeId,
        destination_id: &NodeId,
        name: &str,
    ) -> DriveResult<RemoteItem> {
        self.send_json(
            self.post(&format!("/files/{id}/copy"))
                .json(&json!({ "destination_id": destination_id, "name": name })),
        )
        .await
    }

    async fn move_item(&self, id: &NodeId, destination_id: &NodeId, name: &str) -> DriveResult<()> {
        self.send_empty(
            self.post(&format!("/files/{id}/move"))
                .json(&json!({ "destination_id": destination_id, "name": name })),
        )
        .await
    }

    async fn rename_item(&self, id: &NodeId, name: &str) -> DriveResult<()> {
        self.send_empty(
            self.post(&format!("/files/{id}/rename"))
                .json(&json!({ "name": name })),
        )
        .await
    }

    async fn delete_item(&self, id: &NodeId) -> DriveResult<()> {
        self.send_empty(self.delete(&format!("/files/{id}"))).await
    }

    async fn upload_small(
        &self,
        parent_id: &NodeId,
        name: &str,
        mtime: SyncTime,
        data: Vec<u8>,
    ) -> DriveResult<RemoteItem> {
        self.send_json(
            self.post("/upload")
                .query(&[
                    ("parent_id", parent_id.as_str()),
                    ("name", name),
                    ("mtime", &mtime.to_string()),
                    ("size", &data.len().to_string()),
                ])
                .body(data),
        )
        .await
    }

    async fn upload_session_start(
        &self,
        parent_id: &NodeId,
        name: &str,
        size: i64,
        mtime: SyncTime,
    ) -> DriveResult<UploadSessionId> {
        let body: SessionBody = self
            .send_json(self.post("/upload_session/start").json(&json!({
                "parent_id": parent_id,
                "name": name,
                "size": size,
                "mtime": mtime,
            })))
            .await?;
        Ok(UploadSessionId(body.id))
    }

    async fn upload_chunk(
        &self,
        session: &UploadSessionId,
        index: u64,
        data: Vec<u8>,
    ) -> DriveResult<()> {
        self.send_empty(
            self.post(&format!("/upload_session/{}/chunk/{index}", session.0))
                .body(data),
        )
        .await
    }

    async fn upload_session_finish(&self, session: &UploadSessionId) -> DriveResult<RemoteItem> {
        self.send_json(self.post(&format!("/upload_session/{}/finish", session.0)))
            .await
    }

    async fn upload_session_cancel(&self, session: &UploadSessionId) -> DriveResult<()> {
        self.send_empty(self.delete(&format!("/upload_session/{}", session.0)))
            .await
    }

    async fn download(&self, id: &NodeId) -> DriveResult<Vec<u8>> {
        let response = self
            .get(&format!("/files/{id}/download"))
            .send()
            .await
            .map_err(|err| DriveError::network(err.to_string()))?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(DriveError {
                status,
                code: "download_failed".into(),
                description: format!("unexpected status {status}"),
            });
        }
        response
            .bytes()
            .await
            .map(|bytes| bytes.to_vec())
            .map_err(|err| DriveError::network(err.to_string()))
    }

    async fn bulk_listing(&self, cursor: Option<&str>) -> DriveResult<BulkPage> {
        let mut request = self.get("/files/listing").query(&[("format", "csv")]);
        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor)]);
        }
        self.send_json(request).await
    }
}
