//! Resource kinds served by the provider.
//!
//! Each kind implements `ExternalClient` against one ucan API and is built
//! from credential bytes through an `HttpFactory`.

pub mod floating_ip;
pub mod virtual_machine;
pub mod volume;

use std::time::Duration;

use ucan_reconciler::{ClientError, ClientFactory, ExternalClient};

use crate::credentials::Credentials;
use crate::http::HttpClient;

pub use floating_ip::{FloatingIpClient, FloatingIpSpec};
pub use virtual_machine::{VirtualMachineClient, VirtualMachineSpec};
pub use volume::{VolumeClient, VolumeSpec};

/// Builds a kind's client for one endpoint from credential bytes.
pub struct HttpFactory<C> {
    endpoint: String,
    timeout: Duration,
    build: fn(HttpClient) -> C,
}

impl<C> HttpFactory<C> {
    pub fn new(endpoint: &str, timeout: Duration, build: fn(HttpClient) -> C) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            timeout,
            build,
        }
    }
}

impl<C: ExternalClient> ClientFactory for HttpFactory<C> {
    type Client = C;

    fn connect(&self, credentials: &[u8]) -> Result<C, ClientError> {
        let credentials = Credentials::parse(credentials)?;
        let http = HttpClient::new(&self.endpoint, &credentials, self.timeout)?;
        Ok((self.build)(http))
    }
}

fn require(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{} is required", field));
    }
    Ok(())
}

fn require_positive(field: &str, value: u64) -> Result<(), String> {
    if value == 0 {
        return Err(format!("{} must be greater than zero", field));
    }
    Ok(())
}

/// Decode an ID from a create response; an empty one is a malformed response.
fn created_id(id: String, kind: &str) -> Result<String, ClientError> {
    if id.is_empty() {
        return Err(ClientError::Decode(format!("create response carries no {} id", kind)));
    }
    Ok(id)
}
