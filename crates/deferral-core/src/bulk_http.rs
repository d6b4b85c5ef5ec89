//! [`BulkFetcher`] over HTTP.
//!
//! Speaks the bulk contract: `POST <endpoint>` with `{"keys": [...]}`,
//! answered by `{"results": [{"key": k, "value": v | null}]}`. Non-2xx
//! statuses, timeouts and undecodable bodies fail the whole chunk.

use std::marker::PhantomData;

use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::batch::{BulkFetcher, BulkFuture, BulkRequest, BulkResponse};
use crate::config::HttpConfig;
use crate::error::Result;

pub struct HttpBulkFetcher<K, V> {
    client: Client,
    endpoint: String,
    _marker: PhantomData<fn(K) -> V>,
}

impl<K, V> Clone for HttpBulkFetcher<K, V> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            endpoint: self.endpoint.clone(),
            _marker: PhantomData,
        }
    }
}

impl<K, V> std::fmt::Debug for HttpBulkFetcher<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBulkFetcher")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl<K, V> HttpBulkFetcher<K, V> {
    /// Build a fetcher with its own client, using the configured timeout.
    pub fn new(endpoint: impl Into<String>, config: &HttpConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout()).build()?;
        Ok(Self::with_client(client, endpoint))
    }

    /// Build a fetcher sharing an existing client.
    pub fn with_client(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            _marker: PhantomData,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl<K, V> BulkFetcher<K, V> for HttpBulkFetcher<K, V>
where
    K: Serialize + DeserializeOwned + Send + Sync + 'static,
    V: DeserializeOwned + Send + 'static,
{
    fn fetch(&self, keys: Vec<K>) -> BulkFuture<K, V> {
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        Box::pin(async move {
            let chunk_size = keys.len();
            let response = client
                .post(&endpoint)
                .json(&BulkRequest { keys })
                .send()
                .await?
                .error_for_status()?;
            let body: BulkResponse<K, V> = response.json().await?;
            debug!(
                endpoint = %endpoint,
                chunk_size,
                results = body.results.len(),
                "Bulk response received"
            );
            Ok(body.results)
        })
    }
}
