//! Floating IP - elastic public addresses on the network API.
//!
//! The network API scopes every call by project through the `X-UCAN-NS`
//! header rather than the path.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize};
use ucan_reconciler::{
    ClientError, DeclaredObject, ExternalClient, Observation, Readiness, RemoteResource,
};

use super::{HttpFactory, created_id, require, require_positive};
use crate::http::HttpClient;

pub const KIND: &str = "floating_ip";

pub const NAMESPACE_HEADER: &str = "X-UCAN-NS";

const COLLECTION: &str = "/v3/floatingips";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FloatingIpSpec {
    #[serde(default)]
    pub name: String,
    pub project_id: String,
    #[serde(default)]
    pub cell_id: String,
    /// Carrier line, e.g. "BGP".
    pub isp: String,
    #[serde(default)]
    pub floating_network_id: String,
    #[serde(default)]
    pub route_id: String,
    #[serde(default)]
    pub description: String,
    /// Bandwidth in Mbit/s.
    pub bandwidth: u64,
}

#[derive(Serialize)]
struct CreateRequest<'a> {
    floatingip: NewFloatingIp<'a>,
}

#[derive(Serialize)]
struct NewFloatingIp<'a> {
    name: &'a str,
    project_id: &'a str,
    cell_id: &'a str,
    floating_network_id: &'a str,
    isp: &'a str,
    bandwidth: u64,
    description: &'a str,
    route_id: &'a str,
}

#[derive(Serialize)]
struct UpdateRequest<'a> {
    floatingip: FloatingIpChanges<'a>,
}

#[derive(Serialize)]
struct FloatingIpChanges<'a> {
    name: &'a str,
    description: &'a str,
    bandwidth: u64,
}

#[derive(Deserialize)]
struct FloatingIpEnvelope {
    floatingips: FloatingIp,
}

// The network API sends null for unset fields
#[derive(Deserialize)]
struct FloatingIp {
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    bandwidth: Option<u64>,
    #[serde(default)]
    isp: Option<String>,
    #[serde(default)]
    floating_ip_address: Option<String>,
}

impl From<FloatingIp> for RemoteResource {
    fn from(fip: FloatingIp) -> Self {
        RemoteResource::new(fip.id, fip.status.unwrap_or_default())
            .with_attribute("name", fip.name.unwrap_or_default())
            .with_attribute("description", fip.description.unwrap_or_default())
            .with_attribute("bandwidth", fip.bandwidth.unwrap_or_default())
            .with_attribute("isp", fip.isp.unwrap_or_default())
            .with_attribute("floating_ip_address", fip.floating_ip_address)
    }
}

pub struct FloatingIpClient {
    http: HttpClient,
}

impl FloatingIpClient {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    pub fn factory(endpoint: &str, timeout: Duration) -> HttpFactory<Self> {
        HttpFactory::new(endpoint, timeout, Self::new)
    }

    fn scoped(&self, request: RequestBuilder, spec: &FloatingIpSpec) -> RequestBuilder {
        request.header(NAMESPACE_HEADER, &spec.project_id)
    }

    fn item(id: &str) -> String {
        format!("{}/{}", COLLECTION, id)
    }
}

#[async_trait]
impl ExternalClient for FloatingIpClient {
    type Spec = FloatingIpSpec;

    fn kind(&self) -> &'static str {
        KIND
    }

    fn validate(&self, spec: &FloatingIpSpec) -> Result<(), String> {
        require("projectId", &spec.project_id)?;
        require("isp", &spec.isp)?;
        require_positive("bandwidth", spec.bandwidth)
    }

    async fn observe(
        &self,
        object: &DeclaredObject<FloatingIpSpec>,
        external_id: &str,
    ) -> Result<Observation, ClientError> {
        let request = self.scoped(self.http.get(&Self::item(external_id)), &object.spec);
        let response = self.http.send(request).await?;
        if response.is_not_found() {
            return Ok(Observation::Absent);
        }
        let envelope: FloatingIpEnvelope = response.error_for_status()?.json()?;
        Ok(Observation::Present(envelope.floatingips.into()))
    }

    async fn create(&self, object: &DeclaredObject<FloatingIpSpec>) -> Result<String, ClientError> {
        let spec = &object.spec;
        let body = CreateRequest {
            floatingip: NewFloatingIp {
                name: &spec.name,
                project_id: &spec.project_id,
                cell_id: &spec.cell_id,
                floating_network_id: &spec.floating_network_id,
                isp: &spec.isp,
                bandwidth: spec.bandwidth,
                description: &spec.description,
                route_id: &spec.route_id,
            },
        };

        let request = self.scoped(self.http.post(COLLECTION).json(&body), spec);
        let response = self.http.send(request).await?.error_for_status()?;
        let envelope: FloatingIpEnvelope = response.json()?;
        created_id(envelope.floatingips.id, KIND)
    }

    async fn update(
        &self,
        object: &DeclaredObject<FloatingIpSpec>,
        remote: &RemoteResource,
    ) -> Result<(), ClientError> {
        let spec = &object.spec;
        let body = UpdateRequest {
            floatingip: FloatingIpChanges {
                name: &spec.name,
                description: &spec.description,
                bandwidth: spec.bandwidth,
            },
        };
        let request = self.scoped(self.http.put(&Self::item(&remote.id)).json(&body), spec);
        self.http.send(request).await?.error_for_status()?;
        Ok(())
    }

    async fn delete(
        &self,
        object: &DeclaredObject<FloatingIpSpec>,
        external_id: &str,
    ) -> Result<(), ClientError> {
        let request = self.scoped(self.http.delete(&Self::item(external_id)), &object.spec);
        self.http.send(request).await?.error_for_status()?;
        Ok(())
    }

    fn readiness(&self, remote: &RemoteResource) -> Readiness {
        match remote.state.as_str() {
            "running" => Readiness::Ready,
            "pending" | "creating" | "updating" => Readiness::Transitional,
            _ => Readiness::Failed,
        }
    }

    // Network, ISP and route are fixed at allocation
    fn is_up_to_date(&self, spec: &FloatingIpSpec, remote: &RemoteResource) -> bool {
        remote.str_attribute("name") == spec.name
            && remote.str_attribute("description") == spec.description
            && remote.u64_attribute("bandwidth") == Some(spec.bandwidth)
    }
}
