use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header, Client, Url};
use serde::Deserialize;
use tracing::debug;

use parley_media::{RecordingSink, SinkError};
use parley_shared::CallId;

#[derive(Deserialize)]
struct UploadResponse {
    location: String,
}

/// Uploads finished recording segments to the server's recording store.
pub struct HttpRecordingSink {
    base: Url,
    http: Client,
}

impl HttpRecordingSink {
    pub fn new(server_url: &str) -> Result<Self, SinkError> {
        let base = Url::parse(server_url).map_err(|e| SinkError::Rejected(e.to_string()))?;
        Ok(Self {
            base,
            http: Client::new(),
        })
    }
}

#[async_trait]
impl RecordingSink for HttpRecordingSink {
    async fn upload(
        &self,
        call_id: &CallId,
        offset: Duration,
        data: Bytes,
    ) -> Result<String, SinkError> {
        let mut url = self
            .base
            .join(&format!("/v1/recordings/{call_id}"))
            .map_err(|e| SinkError::Rejected(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("offset_ms", &offset.as_millis().to_string());
        let size = data.len();

        let response = self
            .http
            .put(url)
            .header(header::CONTENT_TYPE, "audio/wav")
            .body(data)
            .send()
            .await
            .map_err(|e| SinkError::Unreachable(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(SinkError::Unreachable(format!("HTTP {status}")));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SinkError::Rejected(format!("HTTP {status}: {text}")));
        }

        let body: UploadResponse = response
            .json()
            .await
            .map_err(|e| SinkError::Rejected(e.to_string()))?;
        debug!(
            call = %call_id,
            offset_ms = offset.as_millis() as u64,
            size,
            location = %body.location,
            "Recording segment stored"
        );
        Ok(body.location)
    }
}
