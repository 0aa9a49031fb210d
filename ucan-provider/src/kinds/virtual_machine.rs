//! Virtual machine - servers on the compute API.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use ucan_reconciler::{
    ClientError, DeclaredObject, ExternalClient, Observation, Readiness, RemoteResource,
};

use super::{HttpFactory, created_id, require};
use crate::http::HttpClient;

pub const KIND: &str = "virtual_machine";

const COLLECTION: &str = "/virtualmachine/v3/servers";

const TRANSITIONAL: &[&str] = &[
    "BUILD",
    "REBUILD",
    "RESIZE",
    "VERIFY_RESIZE",
    "REBOOT",
    "HARD_REBOOT",
    "MIGRATING",
    "PASSWORD",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    pub name: String,
    pub project_id: String,
    #[serde(default)]
    pub cell_id: String,
    pub image_ref: String,
    pub flavor_ref: String,
    #[serde(default)]
    pub availability_zone: String,
    #[serde(default)]
    pub user_data: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub security_groups: Vec<String>,
    #[serde(default)]
    pub block_device_mapping: Vec<BlockDevice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockDevice {
    #[serde(default)]
    pub boot_index: i64,
    #[serde(default)]
    pub delete_on_termination: bool,
    #[serde(default)]
    pub device_name: String,
    pub source_type: String,
    #[serde(default)]
    pub destination_type: String,
    #[serde(default)]
    pub volume_size: u64,
    #[serde(default)]
    pub volume_type: String,
    #[serde(default)]
    pub uuid: String,
}

#[derive(Serialize)]
struct CreateRequest<'a> {
    name: &'a str,
    project_id: &'a str,
    cell_id: &'a str,
    #[serde(rename = "imageRef")]
    image_ref: &'a str,
    #[serde(rename = "flavorRef")]
    flavor_ref: &'a str,
    availability_zone: &'a str,
    user_data: &'a str,
    metadata: &'a BTreeMap<String, String>,
    security_groups: Vec<SecurityGroup<'a>>,
    block_device_mapping: Vec<BlockDeviceMapping<'a>>,
}

#[derive(Serialize)]
struct SecurityGroup<'a> {
    name: &'a str,
}

#[derive(Serialize)]
struct BlockDeviceMapping<'a> {
    boot_index: i64,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    delete_on_termination: bool,
    #[serde(skip_serializing_if = "str::is_empty")]
    device_name: &'a str,
    source_type: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    destination_type: &'a str,
    #[serde(skip_serializing_if = "is_zero")]
    volume_size: u64,
    #[serde(skip_serializing_if = "str::is_empty")]
    volume_type: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    uuid: &'a str,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

impl<'a> From<&'a BlockDevice> for BlockDeviceMapping<'a> {
    fn from(device: &'a BlockDevice) -> Self {
        Self {
            boot_index: device.boot_index,
            delete_on_termination: device.delete_on_termination,
            device_name: &device.device_name,
            source_type: &device.source_type,
            destination_type: &device.destination_type,
            volume_size: device.volume_size,
            volume_type: &device.volume_type,
            uuid: &device.uuid,
        }
    }
}

#[derive(Serialize)]
struct UpdateRequest<'a> {
    server: ServerChanges<'a>,
}

#[derive(Serialize)]
struct ServerChanges<'a> {
    name: &'a str,
    metadata: &'a BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct ServerEnvelope {
    server: Server,
}

#[derive(Deserialize)]
struct Server {
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    metadata: Option<BTreeMap<String, String>>,
    #[serde(default)]
    image: Option<Reference>,
    #[serde(default)]
    flavor: Option<Reference>,
}

#[derive(Deserialize)]
struct Reference {
    #[serde(default)]
    id: Option<String>,
}

impl From<Server> for RemoteResource {
    fn from(server: Server) -> Self {
        let metadata: serde_json::Map<String, serde_json::Value> = server
            .metadata
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.into()))
            .collect();
        RemoteResource::new(server.id, server.status.unwrap_or_default())
            .with_attribute("name", server.name.unwrap_or_default())
            .with_attribute("metadata", metadata)
            .with_attribute("image", server.image.and_then(|r| r.id).unwrap_or_default())
            .with_attribute("flavor", server.flavor.and_then(|r| r.id).unwrap_or_default())
    }
}

pub struct VirtualMachineClient {
    http: HttpClient,
}

impl VirtualMachineClient {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    pub fn factory(endpoint: &str, timeout: Duration) -> HttpFactory<Self> {
        HttpFactory::new(endpoint, timeout, Self::new)
    }

    fn item(id: &str) -> String {
        format!("{}/{}", COLLECTION, id)
    }
}

#[async_trait]
impl ExternalClient for VirtualMachineClient {
    type Spec = VirtualMachineSpec;

    fn kind(&self) -> &'static str {
        KIND
    }

    fn validate(&self, spec: &VirtualMachineSpec) -> Result<(), String> {
        require("name", &spec.name)?;
        require("projectId", &spec.project_id)?;
        require("imageRef", &spec.image_ref)?;
        require("flavorRef", &spec.flavor_ref)?;
        for (index, device) in spec.block_device_mapping.iter().enumerate() {
            if device.source_type.is_empty() {
                return Err(format!("blockDeviceMapping[{}].sourceType is required", index));
            }
        }
        Ok(())
    }

    async fn observe(
        &self,
        _object: &DeclaredObject<VirtualMachineSpec>,
        external_id: &str,
    ) -> Result<Observation, ClientError> {
        let response = self.http.send(self.http.get(&Self::item(external_id))).await?;
        if response.is_not_found() {
            return Ok(Observation::Absent);
        }
        let envelope: ServerEnvelope = response.error_for_status()?.json()?;
        Ok(Observation::Present(envelope.server.into()))
    }

    async fn create(
        &self,
        object: &DeclaredObject<VirtualMachineSpec>,
    ) -> Result<String, ClientError> {
        let spec = &object.spec;
        let body = CreateRequest {
            name: &spec.name,
            project_id: &spec.project_id,
            cell_id: &spec.cell_id,
            image_ref: &spec.image_ref,
            flavor_ref: &spec.flavor_ref,
            availability_zone: &spec.availability_zone,
            user_data: &spec.user_data,
            metadata: &spec.metadata,
            security_groups: spec
                .security_groups
                .iter()
                .map(|name| SecurityGroup { name })
                .collect(),
            block_device_mapping: spec.block_device_mapping.iter().map(Into::into).collect(),
        };

        let response = self
            .http
            .send(self.http.post(COLLECTION).json(&body))
            .await?
            .error_for_status()?;
        let envelope: ServerEnvelope = response.json()?;
        created_id(envelope.server.id, KIND)
    }

    async fn update(
        &self,
        object: &DeclaredObject<VirtualMachineSpec>,
        remote: &RemoteResource,
    ) -> Result<(), ClientError> {
        let body = UpdateRequest {
            server: ServerChanges {
                name: &object.spec.name,
                metadata: &object.spec.metadata,
            },
        };
        self.http
            .send(self.http.put(&Self::item(&remote.id)).json(&body))
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn delete(
        &self,
        _object: &DeclaredObject<VirtualMachineSpec>,
        external_id: &str,
    ) -> Result<(), ClientError> {
        self.http
            .send(self.http.delete(&Self::item(external_id)))
            .await?
            .error_for_status()?;
        Ok(())
    }

    fn readiness(&self, remote: &RemoteResource) -> Readiness {
        let state = remote.state.as_str();
        if state == "ACTIVE" {
            Readiness::Ready
        } else if TRANSITIONAL.contains(&state) {
            Readiness::Transitional
        } else {
            Readiness::Failed
        }
    }

    /// Compares the name and the declared metadata keys. Keys the compute
    /// service adds on its own are ignored; image, flavor and disks are fixed.
    fn is_up_to_date(&self, spec: &VirtualMachineSpec, remote: &RemoteResource) -> bool {
        if remote.str_attribute("name") != spec.name {
            return false;
        }
        let observed = remote
            .attributes
            .get("metadata")
            .and_then(|m| m.as_object());
        spec.metadata.iter().all(|(key, value)| {
            observed
                .and_then(|m| m.get(key))
                .and_then(|v| v.as_str())
                == Some(value.as_str())
        })
    }
}
