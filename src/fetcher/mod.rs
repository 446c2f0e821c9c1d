// Module: Fetcher
// Obtains the live response for an endpoint definition.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::FetchError;
use crate::protocol::{CapturedResponse, EndpointDefinition};
use crate::template::Template;

/// Source of live responses for the pipeline.
///
/// Requires Send + Sync so endpoints can be fetched from concurrent tasks.
#[async_trait]
pub trait ResponseFetcher: Send + Sync {
    async fn fetch(&self, definition: &EndpointDefinition) -> Result<CapturedResponse, FetchError>;
}

/// Fetcher backed by a shared reqwest client.
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::InvalidRequest(format!("cannot build http client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ResponseFetcher for HttpFetcher {
    #[tracing::instrument(name = "fetch", skip_all, fields(endpoint = %definition.name))]
    async fn fetch(&self, definition: &EndpointDefinition) -> Result<CapturedResponse, FetchError> {
        let template = Template::new(&definition.variables);
        let request = &definition.request;

        let url = template.render_str(&request.url)?;
        let method = Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|e| FetchError::InvalidRequest(format!("invalid HTTP method: {}", e)))?;

        let mut builder = self.client.request(method.clone(), &url);

        for (name, value) in &request.headers {
            builder = builder.header(name, template.render_str(value)?);
        }

        if !request.query.is_empty() {
            let query = request
                .query
                .iter()
                .map(|(k, v)| Ok((k.clone(), template.render_str(v)?)))
                .collect::<Result<Vec<(String, String)>, FetchError>>()?;
            builder = builder.query(&query);
        }

        if let Some(body) = &request.body {
            builder = builder.json(&template.render_value(body)?);
        }

        let start = Instant::now();
        let response = builder.send().await.map_err(|e| transport_error(&url, e))?;

        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let raw_body = response.text().await.map_err(|e| transport_error(&url, e))?;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let body = if raw_body.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&raw_body).unwrap_or(Value::String(raw_body))
        };

        debug!(method = %method, %url, status, duration_ms = elapsed_ms, "response received");

        Ok(CapturedResponse {
            url,
            status,
            headers,
            body,
            elapsed_ms,
        })
    }
}

fn transport_error(url: &str, error: reqwest::Error) -> FetchError {
    warn!(%url, error = %error, "request failed");
    if error.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        FetchError::Transport {
            url: url.to_string(),
            reason: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition(value: Value) -> EndpointDefinition {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_missing_variable_is_invalid_request() {
        let fetcher = HttpFetcher::new(Duration::from_secs(1)).unwrap();
        let def = definition(json!({
            "name": "users",
            "request": { "url": "${base}/users" }
        }));

        let err = fetcher.fetch(&def).await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_unparseable_url_is_transport_error() {
        let fetcher = HttpFetcher::new(Duration::from_secs(2)).unwrap();
        // Rejected by the URL parser when sent, before any connection.
        let def = definition(json!({
            "name": "broken",
            "request": { "url": "http://[::1/health" }
        }));

        let err = fetcher.fetch(&def).await.unwrap_err();
        assert!(matches!(err, FetchError::Transport { ref url, .. } if url == "http://[::1/health"));
    }
}
