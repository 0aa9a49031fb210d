//! HTTP adapter shared by the resource kinds.
//!
//! Requests go out through one `reqwest` client per kind. Responses come
//! back as raw status plus body so each kind can tell not-found apart from
//! a failed call before decoding anything.

use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use ucan_reconciler::ClientError;

use crate::credentials::Credentials;

#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpClient {
    pub fn new(
        base_url: &str,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        info!(
            endpoint = base_url,
            access_key = %credentials.access_key_id,
            service = %credentials.service,
            region = %credentials.region,
            "HTTP client ready"
        );
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client.request(method, self.url(path))
    }

    pub fn get(&self, path: &str) -> RequestBuilder {
        self.request(Method::GET, path)
    }

    pub fn post(&self, path: &str) -> RequestBuilder {
        self.request(Method::POST, path)
    }

    pub fn put(&self, path: &str) -> RequestBuilder {
        self.request(Method::PUT, path)
    }

    pub fn delete(&self, path: &str) -> RequestBuilder {
        self.request(Method::DELETE, path)
    }

    /// Send a request. Only a missing response is an error here.
    pub async fn send(&self, request: RequestBuilder) -> Result<RawResponse, ClientError> {
        let response = request.send().await.map_err(transport)?;
        let status = response.status().as_u16();
        let url = response.url().path().to_string();
        let body = response.bytes().await.map_err(transport)?;
        debug!(status, path = %url, bytes = body.len(), "Remote responded");
        Ok(RawResponse {
            status,
            body: body.to_vec(),
        })
    }
}

fn transport(e: reqwest::Error) -> ClientError {
    if e.is_timeout() {
        ClientError::Transport(format!("timed out: {}", e))
    } else {
        ClientError::Transport(e.to_string())
    }
}

/// Status code and body of a remote response.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }

    /// Turn 404 into `NotFound` and any other status >= 400 into `Status`.
    pub fn error_for_status(self) -> Result<Self, ClientError> {
        match self.status {
            404 => Err(ClientError::NotFound),
            status if status >= 400 => Err(ClientError::Status {
                status,
                body: String::from_utf8_lossy(&self.body).into_owned(),
            }),
            _ => Ok(self),
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        serde_json::from_slice(&self.body).map_err(|e| ClientError::Decode(e.to_string()))
    }
}
