//! ucan-provider: keeps ucan cloud resources in line with a declared manifest.
//!
//! - `manifest`: reads the manifest and authors the declared state
//! - `kinds`: one remote client per resource kind (volume, floating IP, VM)
//! - `provider`: wires stores, clients and schedulers together

pub mod config;
pub mod credentials;
pub mod http;
pub mod kinds;
pub mod manifest;
pub mod provider;

pub use config::{Endpoints, ProviderConfig};
pub use credentials::Credentials;
pub use manifest::{Manifest, ManifestError, ManifestFeeder, Stores};
pub use provider::Provider;
