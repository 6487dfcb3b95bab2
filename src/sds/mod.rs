// Client for the data hub's sequential data store (types, streams, values)

pub mod error;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::auth::TokenManager;
use crate::readings::TemperatureReading;

pub use error::SdsError;
pub use types::{SdsStream, SdsType};

/// Metadata + data operations for one tenant/namespace. Every call is
/// authorized through the shared [`TokenManager`].
pub struct SdsClient {
    client: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenManager>,
}

impl SdsClient {
    pub fn new(
        resource: &str,
        api_version: &str,
        tenant_id: &str,
        namespace_id: &str,
        tokens: Arc<TokenManager>,
        timeout: Duration,
    ) -> Result<Self, SdsError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let base_url = format!(
            "{}/api/{}/Tenants/{}/Namespaces/{}",
            resource.trim_end_matches('/'),
            api_version,
            urlencoding::encode(tenant_id),
            urlencoding::encode(namespace_id)
        );

        Ok(Self {
            client,
            base_url,
            tokens,
        })
    }

    fn type_url(&self, type_id: &str) -> String {
        format!("{}/Types/{}", self.base_url, urlencoding::encode(type_id))
    }

    fn stream_url(&self, stream_id: &str) -> String {
        format!("{}/Streams/{}", self.base_url, urlencoding::encode(stream_id))
    }

    fn data_url(&self, stream_id: &str) -> String {
        format!("{}/Data", self.stream_url(stream_id))
    }

    /// Authorize, send, and map error statuses.
    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, SdsError> {
        let request = self.tokens.authorize(request).await?.build()?;
        let method = request.method().to_string();
        let url = request.url().to_string();
        debug!("{} {}", method, url);

        let res = self.client.execute(request).await?;
        let status = res.status();

        if status == StatusCode::NOT_FOUND {
            return Err(SdsError::NotFound { url });
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(SdsError::Status {
                method,
                url,
                status: status.as_u16(),
                body,
            });
        }

        Ok(res)
    }

    async fn execute_json<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T, SdsError> {
        Ok(self.execute(request).await?.json().await?)
    }

    // Metadata

    pub async fn get_or_create_type(&self, sds_type: &SdsType) -> Result<SdsType, SdsError> {
        let request = self.client.post(self.type_url(&sds_type.id)).json(sds_type);
        self.execute_json(request).await
    }

    pub async fn get_type(&self, type_id: &str) -> Result<SdsType, SdsError> {
        self.execute_json(self.client.get(self.type_url(type_id))).await
    }

    pub async fn delete_type(&self, type_id: &str) -> Result<(), SdsError> {
        self.execute(self.client.delete(self.type_url(type_id))).await?;
        Ok(())
    }

    pub async fn get_or_create_stream(&self, stream: &SdsStream) -> Result<SdsStream, SdsError> {
        let request = self.client.post(self.stream_url(&stream.id)).json(stream);
        self.execute_json(request).await
    }

    pub async fn get_stream(&self, stream_id: &str) -> Result<SdsStream, SdsError> {
        self.execute_json(self.client.get(self.stream_url(stream_id))).await
    }

    pub async fn delete_stream(&self, stream_id: &str) -> Result<(), SdsError> {
        self.execute(self.client.delete(self.stream_url(stream_id))).await?;
        Ok(())
    }

    // Data

    pub async fn insert_values(&self, stream_id: &str, values: &[TemperatureReading]) -> Result<(), SdsError> {
        self.execute(self.client.post(self.data_url(stream_id)).json(values)).await?;
        Ok(())
    }

    /// Latest value on the stream; `None` when the stream is empty
    pub async fn get_last_value(&self, stream_id: &str) -> Result<Option<TemperatureReading>, SdsError> {
        let url = format!("{}/Last", self.data_url(stream_id));
        let res = self.execute(self.client.get(url)).await?;
        if res.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let body = res.bytes().await?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        Ok(serde_json::from_slice(&body)?)
    }

    /// Values stored at the given indices; missing indices are skipped
    pub async fn get_values(&self, stream_id: &str, indices: &[String]) -> Result<Vec<TemperatureReading>, SdsError> {
        let request = self.client.get(self.data_url(stream_id)).query(&index_query(indices));
        let values: Vec<Option<TemperatureReading>> = self.execute_json(request).await?;
        Ok(values.into_iter().flatten().collect())
    }

    pub async fn remove_values(&self, stream_id: &str, indices: &[String]) -> Result<(), SdsError> {
        let request = self.client.delete(self.data_url(stream_id)).query(&index_query(indices));
        self.execute(request).await?;
        Ok(())
    }
}

fn index_query(indices: &[String]) -> Vec<(&'static str, &str)> {
    indices.iter().map(|index| ("index", index.as_str())).collect()
}
