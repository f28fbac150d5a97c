//! HTTP transport implementation

use async_trait::async_trait;
use reqwest::{Method, Response, header};
use serde_json::Value;
use tracing::{debug, trace};

use super::{OutboundRequest, Transport};
use crate::pool::PooledConnection;
use crate::{Error, Result};

/// Longest response body kept in a [`Error::Backend`]
const MAX_ERROR_BODY: usize = 512;

/// JSON-over-HTTP transport
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpTransport;

impl HttpTransport {
    /// Create a new HTTP transport
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Flatten a JSON object into query pairs; nested values are sent as JSON text
    fn query_pairs(payload: &Value) -> Vec<(String, String)> {
        match payload {
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| {
                    let v = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), v)
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    async fn decode(request: &OutboundRequest, response: Response) -> Result<Value> {
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| map_reqwest_error(request, e))?;

        if !status.is_success() {
            let mut body = text;
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(Error::Backend {
                backend: request.backend_id.clone(),
                status: status.as_u16(),
                body,
            });
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[tracing::instrument(skip_all, fields(backend = %request.backend_id, method = %request.method))]
    async fn send(&self, conn: &PooledConnection, request: &OutboundRequest) -> Result<Value> {
        let mut builder = conn
            .client()
            .request(request.method.clone(), &request.url)
            .timeout(request.timeout)
            .header(header::ACCEPT, "application/json");

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }

        if let Some(payload) = &request.payload {
            builder = if matches!(request.method, Method::GET | Method::DELETE | Method::HEAD) {
                builder.query(&Self::query_pairs(payload))
            } else {
                builder.json(payload)
            };
        }

        trace!(url = %request.url, "Sending request");

        let response = tokio::time::timeout(request.timeout, builder.send())
            .await
            .map_err(|_| Error::Timeout {
                backend: request.backend_id.clone(),
                timeout: request.timeout,
            })?
            .map_err(|e| map_reqwest_error(request, e))?;

        debug!(status = response.status().as_u16(), "Response received");
        Self::decode(request, response).await
    }
}

/// Classify a client error into the gateway taxonomy
fn map_reqwest_error(request: &OutboundRequest, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout {
            backend: request.backend_id.clone(),
            timeout: request.timeout,
        }
    } else if e.is_connect() || e.is_request() || e.is_body() {
        Error::Connection {
            backend: request.backend_id.clone(),
            message: e.to_string(),
        }
    } else {
        Error::Http(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_pairs_flatten_scalars() {
        let pairs = HttpTransport::query_pairs(&json!({"q": "rust", "limit": 10, "tags": ["a"]}));
        let mut pairs = pairs;
        pairs.sort();
        assert_eq!(
            pairs,
            vec![
                ("limit".to_string(), "10".to_string()),
                ("q".to_string(), "rust".to_string()),
                ("tags".to_string(), "[\"a\"]".to_string()),
            ]
        );
    }

    #[test]
    fn test_query_pairs_ignore_non_objects() {
        assert!(HttpTransport::query_pairs(&json!([1, 2])).is_empty());
    }

    #[test]
    fn test_parse_method() {
        assert_eq!(super::super::parse_method("get").unwrap(), Method::GET);
        assert_eq!(super::super::parse_method(" Post ").unwrap(), Method::POST);
        assert!(super::super::parse_method("bad method").is_err());
    }
}
