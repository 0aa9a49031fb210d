//! Provider credentials.

use std::fmt;

use serde::Deserialize;
use ucan_reconciler::ClientError;

/// Access key pair plus the signing scope it belongs to.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub region: String,
}

impl Credentials {
    /// Parse the JSON credential blob handed to the provider.
    pub fn parse(data: &[u8]) -> Result<Self, ClientError> {
        let credentials: Credentials = serde_json::from_slice(data)
            .map_err(|e| ClientError::Invalid(format!("cannot parse credentials: {}", e)))?;
        if credentials.access_key_id.is_empty() || credentials.secret_access_key.is_empty() {
            return Err(ClientError::Invalid("invalid certificate".to_string()));
        }
        Ok(credentials)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("service", &self.service)
            .field("region", &self.region)
            .finish()
    }
}
