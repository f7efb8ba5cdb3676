//! Provider trait and request/response types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::Properties;
use crate::error::Result;
use crate::resource::ResourceType;

/// A create or update request for one resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceRequest {
    /// Logical name, used for error attribution and physical naming.
    pub name: String,
    /// Resource type.
    pub resource_type: ResourceType,
    /// Fully resolved properties.
    pub properties: Properties,
}

/// What the provider returns after a create or update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionedResource {
    /// Provider-assigned identifier.
    pub id: String,
    /// Exported attributes.
    #[serde(default)]
    pub outputs: Properties,
}

/// A resource as currently observed at the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedResource {
    /// Provider-assigned identifier.
    pub id: String,
    /// Live properties.
    #[serde(default)]
    pub properties: Properties,
    /// Exported attributes.
    #[serde(default)]
    pub outputs: Properties,
}

/// Control-plane operations the executor and drift detection call.
///
/// Implementations classify failures into the `ProviderError` taxonomy so the
/// executor can decide what to retry.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Creates a resource.
    async fn create(&self, request: &ResourceRequest) -> Result<ProvisionedResource>;

    /// Reads a resource, returning `None` if it no longer exists.
    async fn read(&self, resource_type: ResourceType, name: &str, physical_id: &str) -> Result<Option<ObservedResource>>;

    /// Updates a resource in place.
    async fn update(&self, physical_id: &str, request: &ResourceRequest) -> Result<ProvisionedResource>;

    /// Deletes a resource. Fails with `NotFound` if it is already gone.
    async fn delete(&self, resource_type: ResourceType, name: &str, physical_id: &str) -> Result<()>;

    /// Provider name for logs and output.
    fn provider_name(&self) -> &'static str;
}
