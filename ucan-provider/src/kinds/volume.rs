//! Volume - block storage on the volume API.
//!
//! Every created volume is tagged with `<instance>/<kind>/<name>` of the object
//! that declared it, so a volume whose ID was never recorded can be found
//! again without adopting one owned by another deployment.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;
use ucan_reconciler::{
    ClientError, DeclaredObject, ExternalClient, ObjectKey, Observation, Readiness,
    RemoteResource,
};

use super::{HttpFactory, created_id, require, require_positive};
use crate::config::DEFAULT_INSTANCE;
use crate::http::HttpClient;

pub const KIND: &str = "volume";

/// Metadata key tying a remote volume to its declared object.
pub const OBJECT_TAG: &str = "ucan.io/object";

const READY: &[&str] = &["available", "in-use"];
const TRANSITIONAL: &[&str] = &[
    "creating",
    "downloading",
    "uploading",
    "extending",
    "attaching",
    "detaching",
    "reserved",
    "maintenance",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    pub name: String,
    pub project_id: String,
    /// Size in GiB.
    pub size: u64,
    pub volume_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub multiattach: bool,
    #[serde(default)]
    pub cell_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,
    /// Volume IDs to co-locate with.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub same_host: Vec<String>,
}

#[derive(Serialize)]
struct CreateRequest<'a> {
    volume: NewVolume<'a>,
    #[serde(rename = "OS-SCH-HNT:scheduler_hints")]
    scheduler_hints: SchedulerHints<'a>,
}

#[derive(Serialize)]
struct NewVolume<'a> {
    name: &'a str,
    size: u64,
    volume_type: &'a str,
    description: &'a str,
    multiattach: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    availability_zone: Option<&'a str>,
    cell_id: &'a str,
    metadata: BTreeMap<&'a str, &'a str>,
}

#[derive(Serialize)]
struct SchedulerHints<'a> {
    same_host: &'a [String],
}

#[derive(Serialize)]
struct UpdateRequest<'a> {
    volume: VolumeChanges<'a>,
}

#[derive(Serialize)]
struct VolumeChanges<'a> {
    name: &'a str,
    description: &'a str,
}

#[derive(Deserialize)]
struct VolumeEnvelope {
    volume: Volume,
}

#[derive(Deserialize)]
struct VolumeList {
    #[serde(default)]
    volumes: Vec<Volume>,
}

// Any of these may come back as null
#[derive(Deserialize)]
struct Volume {
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    volume_type: Option<String>,
    #[serde(default)]
    multiattach: Option<bool>,
}

impl From<Volume> for RemoteResource {
    fn from(volume: Volume) -> Self {
        RemoteResource::new(volume.id, volume.status.unwrap_or_default())
            .with_attribute("name", volume.name.unwrap_or_default())
            .with_attribute("description", volume.description.unwrap_or_default())
            .with_attribute("size", volume.size.unwrap_or_default())
            .with_attribute("volume_type", volume.volume_type.unwrap_or_default())
            .with_attribute("multiattach", volume.multiattach.unwrap_or_default())
    }
}

pub struct VolumeClient {
    http: HttpClient,
    instance: String,
}

impl VolumeClient {
    pub fn new(http: HttpClient) -> Self {
        Self {
            http,
            instance: DEFAULT_INSTANCE.to_string(),
        }
    }

    /// Scope the ownership tag to a deployment.
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = instance.into();
        self
    }

    /// Ownership tag value of the volume declared by `key`.
    pub fn tag(&self, key: &ObjectKey) -> String {
        format!("{}/{}/{}", self.instance, key.kind, key.name)
    }

    pub fn factory(endpoint: &str, timeout: Duration) -> HttpFactory<Self> {
        HttpFactory::new(endpoint, timeout, Self::new)
    }

    fn collection(project_id: &str) -> String {
        format!("/volume/v3/{}/volumes", project_id)
    }

    fn item(project_id: &str, id: &str) -> String {
        format!("{}/{}", Self::collection(project_id), id)
    }
}

#[async_trait]
impl ExternalClient for VolumeClient {
    type Spec = VolumeSpec;

    fn kind(&self) -> &'static str {
        KIND
    }

    fn validate(&self, spec: &VolumeSpec) -> Result<(), String> {
        require("name", &spec.name)?;
        require("projectId", &spec.project_id)?;
        require_positive("size", spec.size)?;
        require("volumeType", &spec.volume_type)
    }

    async fn observe(
        &self,
        object: &DeclaredObject<VolumeSpec>,
        external_id: &str,
    ) -> Result<Observation, ClientError> {
        let path = Self::item(&object.spec.project_id, external_id);
        let response = self.http.send(self.http.get(&path)).await?;
        if response.is_not_found() {
            return Ok(Observation::Absent);
        }
        let envelope: VolumeEnvelope = response.error_for_status()?.json()?;
        Ok(Observation::Present(envelope.volume.into()))
    }

    async fn create(&self, object: &DeclaredObject<VolumeSpec>) -> Result<String, ClientError> {
        let spec = &object.spec;
        let tag = self.tag(&object.key);
        let request = CreateRequest {
            volume: NewVolume {
                name: &spec.name,
                size: spec.size,
                volume_type: &spec.volume_type,
                description: &spec.description,
                multiattach: spec.multiattach,
                availability_zone: spec.availability_zone.as_deref(),
                cell_id: &spec.cell_id,
                metadata: BTreeMap::from([(OBJECT_TAG, tag.as_str())]),
            },
            scheduler_hints: SchedulerHints {
                same_host: &spec.same_host,
            },
        };

        let path = Self::collection(&spec.project_id);
        let response = self
            .http
            .send(self.http.post(&path).json(&request))
            .await?
            .error_for_status()?;
        let envelope: VolumeEnvelope = response.json()?;
        created_id(envelope.volume.id, KIND)
    }

    async fn update(
        &self,
        object: &DeclaredObject<VolumeSpec>,
        remote: &RemoteResource,
    ) -> Result<(), ClientError> {
        let request = UpdateRequest {
            volume: VolumeChanges {
                name: &object.spec.name,
                description: &object.spec.description,
            },
        };
        let path = Self::item(&object.spec.project_id, &remote.id);
        self.http
            .send(self.http.put(&path).json(&request))
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn delete(
        &self,
        object: &DeclaredObject<VolumeSpec>,
        external_id: &str,
    ) -> Result<(), ClientError> {
        let path = Self::item(&object.spec.project_id, external_id);
        self.http
            .send(self.http.delete(&path))
            .await?
            .error_for_status()?;
        Ok(())
    }

    fn readiness(&self, remote: &RemoteResource) -> Readiness {
        let state = remote.state.as_str();
        if READY.contains(&state) {
            Readiness::Ready
        } else if TRANSITIONAL.contains(&state) {
            Readiness::Transitional
        } else {
            Readiness::Failed
        }
    }

    // size, volumeType and multiattach cannot change after create
    fn is_up_to_date(&self, spec: &VolumeSpec, remote: &RemoteResource) -> bool {
        remote.str_attribute("name") == spec.name
            && remote.str_attribute("description") == spec.description
    }

    async fn find_existing(
        &self,
        object: &DeclaredObject<VolumeSpec>,
    ) -> Result<Option<String>, ClientError> {
        let tag = self.tag(&object.key);
        let mut filter = Map::new();
        filter.insert(OBJECT_TAG.to_string(), Value::from(tag.as_str()));
        let filter = Value::Object(filter).to_string();
        let path = format!("{}/detail", Self::collection(&object.spec.project_id));
        let response = self
            .http
            .send(self.http.get(&path).query(&[("metadata", filter.as_str())]))
            .await?
            .error_for_status()?;
        let list: VolumeList = response.json()?;

        match list.volumes.as_slice() {
            [] => Ok(None),
            [volume] => Ok(Some(volume.id.clone())),
            volumes => {
                warn!(
                    key = %object.key,
                    count = volumes.len(),
                    "Several remote volumes carry the same object tag"
                );
                Err(ClientError::Invalid(format!(
                    "{} volumes are tagged {}={}",
                    volumes.len(),
                    OBJECT_TAG,
                    tag
                )))
            }
        }
    }
}
