//! In-process simulated control plane.
//!
//! Keeps resources in memory, optionally mirrored to a JSON file so state
//! survives between CLI runs. Used for local runs and tests; faults, drift
//! and latency can be injected per logical resource name.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Properties;
use crate::error::{ConvergeError, ProviderError, Result};
use crate::resource::ResourceType;

use super::api::{ObservedResource, Provider, ProvisionedResource, ResourceRequest};

/// Region used in synthesized ARNs.
const SIM_REGION: &str = "eu-west-1";

/// Account used in synthesized ARNs.
const SIM_ACCOUNT: &str = "000000000000";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Record {
    id: String,
    name: String,
    resource_type: ResourceType,
    properties: Properties,
    outputs: Properties,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Inventory {
    resources: BTreeMap<String, Record>,
}

/// Simulated provider.
#[derive(Debug, Default)]
pub struct SimulatedProvider {
    inventory: Mutex<Inventory>,
    path: Option<PathBuf>,
    faults: Mutex<HashMap<String, VecDeque<ProviderError>>>,
    calls: Mutex<HashMap<String, usize>>,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// Decrements the in-flight counter when a call finishes.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SimulatedProvider {
    /// Creates an empty in-memory provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a provider persisted at `path`, loading existing resources.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let inventory = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                ConvergeError::internal(format!("Failed to parse simulated provider file {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Inventory::default(),
            Err(e) => return Err(e.into()),
        };

        debug!("Simulated provider opened with {} resources", inventory.resources.len());

        Ok(Self {
            inventory: Mutex::new(inventory),
            path: Some(path),
            ..Self::default()
        })
    }

    /// Adds a fixed delay to every mutating call.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queues an error returned by the next mutating call for `name`.
    pub async fn fail_next(&self, name: &str, error: ProviderError) {
        self.faults.lock().await.entry(name.to_string()).or_default().push_back(error);
    }

    /// Number of mutating calls made for `name`, failed ones included.
    pub async fn call_count(&self, name: &str) -> usize {
        self.calls.lock().await.get(name).copied().unwrap_or(0)
    }

    /// Highest number of mutating calls observed in flight at once.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Number of live resources.
    pub async fn resource_count(&self) -> usize {
        self.inventory.lock().await.resources.len()
    }

    /// Finds a live resource by logical name.
    pub async fn find(&self, name: &str) -> Option<ObservedResource> {
        let inventory = self.inventory.lock().await;
        inventory.resources.values().find(|r| r.name == name).map(Record::observed)
    }

    /// Changes a live property out of band, as an operator console edit would.
    ///
    /// Returns false if no resource has that logical name.
    pub async fn tamper(&self, name: &str, field: &str, value: Value) -> bool {
        let mut inventory = self.inventory.lock().await;
        match inventory.resources.values_mut().find(|r| r.name == name) {
            Some(record) => {
                record.properties.insert(field.to_string(), value);
                true
            }
            None => false,
        }
    }

    /// Deletes a resource out of band.
    pub async fn remove_out_of_band(&self, name: &str) -> bool {
        let mut inventory = self.inventory.lock().await;
        let before = inventory.resources.len();
        inventory.resources.retain(|_, r| r.name != name);
        inventory.resources.len() != before
    }

    /// Records the call, applies latency and returns any queued fault.
    async fn begin(&self, name: &str) -> Result<InFlight<'_>> {
        *self.calls.lock().await.entry(name.to_string()).or_default() += 1;

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let fault = self.faults.lock().await.get_mut(name).and_then(VecDeque::pop_front);
        match fault {
            Some(error) => {
                debug!("Injected fault for '{name}': {error}");
                Err(error.into())
            }
            None => Ok(guard),
        }
    }

    async fn persist(&self, inventory: &Inventory) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(inventory)
            .map_err(|e| ConvergeError::internal(format!("Failed to serialize simulated provider: {e}")))?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }
}

impl Record {
    fn observed(&self) -> ObservedResource {
        ObservedResource {
            id: self.id.clone(),
            properties: self.properties.clone(),
            outputs: self.outputs.clone(),
        }
    }

    fn provisioned(&self) -> ProvisionedResource {
        ProvisionedResource {
            id: self.id.clone(),
            outputs: self.outputs.clone(),
        }
    }
}

fn physical_id(resource_type: ResourceType) -> String {
    let suffix = &Uuid::new_v4().simple().to_string()[..12];
    format!("{}-{suffix}", resource_type.as_str().replace('_', "-"))
}

/// Best human name for a resource: its declared name property, else the logical name.
fn display_name(request: &ResourceRequest) -> String {
    ["name", "role_name", "addon_name", "nodegroup_name"]
        .iter()
        .find_map(|key| request.properties.get(*key).and_then(Value::as_str))
        .map_or_else(|| request.name.clone(), str::to_string)
}

/// Fabricates the attributes a real control plane would export.
fn synthesize_outputs(request: &ResourceRequest, id: &str) -> Properties {
    let name = display_name(request);
    let kind = request.resource_type.as_str();

    request
        .resource_type
        .ops()
        .exports
        .iter()
        .map(|attribute| {
            let value = match *attribute {
                "name" => Value::String(name.clone()),
                "arn" => Value::String(format!("arn:aws:sim:{SIM_REGION}:{SIM_ACCOUNT}:{kind}/{name}")),
                "value" => request.properties.get("value").cloned().unwrap_or(Value::Null),
                "uid" => Value::String(id.to_string()),
                "endpoint" => Value::String(format!("https://{id}.{SIM_REGION}.sim.local")),
                "oidc_issuer" => Value::String(format!("https://oidc.{SIM_REGION}.sim.local/id/{id}")),
                "oidc_provider_arn" => Value::String(format!(
                    "arn:aws:iam::{SIM_ACCOUNT}:oidc-provider/oidc.{SIM_REGION}.sim.local/id/{id}"
                )),
                other => Value::String(format!("{other}-{id}")),
            };
            ((*attribute).to_string(), value)
        })
        .collect()
}

fn check_required(request: &ResourceRequest) -> Result<()> {
    let missing = request.resource_type.ops().missing_required(&request.properties);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ProviderError::Permanent {
            resource: request.name.clone(),
            message: format!("missing required properties: {}", missing.join(", ")),
            status: Some(400),
        }
        .into())
    }
}

#[async_trait]
impl Provider for SimulatedProvider {
    async fn create(&self, request: &ResourceRequest) -> Result<ProvisionedResource> {
        let _guard = self.begin(&request.name).await?;
        check_required(request)?;

        let id = physical_id(request.resource_type);
        let record = Record {
            outputs: synthesize_outputs(request, &id),
            id: id.clone(),
            name: request.name.clone(),
            resource_type: request.resource_type,
            properties: request.properties.clone(),
        };

        let mut inventory = self.inventory.lock().await;
        let provisioned = record.provisioned();
        inventory.resources.insert(id.clone(), record);
        self.persist(&inventory).await?;

        info!("Simulated create {} '{}' -> {id}", request.resource_type, request.name);
        Ok(provisioned)
    }

    async fn read(&self, _resource_type: ResourceType, _name: &str, physical_id: &str) -> Result<Option<ObservedResource>> {
        let inventory = self.inventory.lock().await;
        Ok(inventory.resources.get(physical_id).map(Record::observed))
    }

    async fn update(&self, physical_id: &str, request: &ResourceRequest) -> Result<ProvisionedResource> {
        let _guard = self.begin(&request.name).await?;
        check_required(request)?;

        let mut inventory = self.inventory.lock().await;
        let Some(record) = inventory.resources.get_mut(physical_id) else {
            return Err(ProviderError::NotFound {
                resource: request.name.clone(),
                physical_id: physical_id.to_string(),
            }
            .into());
        };

        let ops = request.resource_type.ops();
        let locked: Vec<&str> = ops
            .immutable
            .iter()
            .copied()
            .filter(|field| record.properties.get(*field) != request.properties.get(*field))
            .collect();
        if !locked.is_empty() {
            return Err(ProviderError::Permanent {
                resource: request.name.clone(),
                message: format!("cannot update immutable properties in place: {}", locked.join(", ")),
                status: Some(400),
            }
            .into());
        }

        record.properties = request.properties.clone();
        record.outputs = synthesize_outputs(request, physical_id);
        let provisioned = record.provisioned();
        self.persist(&inventory).await?;

        info!("Simulated update {} '{}' ({physical_id})", request.resource_type, request.name);
        Ok(provisioned)
    }

    async fn delete(&self, resource_type: ResourceType, name: &str, physical_id: &str) -> Result<()> {
        let _guard = self.begin(name).await?;

        let mut inventory = self.inventory.lock().await;
        if inventory.resources.remove(physical_id).is_none() {
            return Err(ProviderError::NotFound {
                resource: name.to_string(),
                physical_id: physical_id.to_string(),
            }
            .into());
        }
        self.persist(&inventory).await?;

        info!("Simulated delete {resource_type} '{name}' ({physical_id})");
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "simulated"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn role_request(name: &str, role_name: &str) -> ResourceRequest {
        ResourceRequest {
            name: name.to_string(),
            resource_type: ResourceType::IamRole,
            properties: [
                (String::from("assumed_by"), json!("eks.amazonaws.com")),
                (String::from("role_name"), json!(role_name)),
            ]
            .into_iter()
            .collect(),
        }
    }

    #[tokio::test]
    async fn test_create_read_delete() {
        let provider = SimulatedProvider::new();
        let created = provider.create(&role_request("cluster-role", "eks-admin")).await.expect("create");

        assert!(created.id.starts_with("iam-role-"));
        assert_eq!(created.outputs["name"], json!("eks-admin"));
        assert!(created.outputs["arn"].as_str().is_some_and(|arn| arn.ends_with("iam_role/eks-admin")));

        let observed = provider
            .read(ResourceType::IamRole, "cluster-role", &created.id)
            .await
            .expect("read")
            .expect("exists");
        assert_eq!(observed.properties["role_name"], json!("eks-admin"));

        provider.delete(ResourceType::IamRole, "cluster-role", &created.id).await.expect("delete");
        let err = provider
            .delete(ResourceType::IamRole, "cluster-role", &created.id)
            .await
            .expect_err("already gone");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_immutable_update_is_rejected() {
        let provider = SimulatedProvider::new();
        let created = provider.create(&role_request("cluster-role", "eks-admin")).await.expect("create");

        let err = provider
            .update(&created.id, &role_request("cluster-role", "renamed"))
            .await
            .expect_err("role_name is immutable");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed_in_order() {
        let provider = SimulatedProvider::new();
        provider.fail_next("cluster-role", ProviderError::transient("cluster-role", "throttled")).await;

        assert!(provider.create(&role_request("cluster-role", "eks-admin")).await.is_err());
        assert!(provider.create(&role_request("cluster-role", "eks-admin")).await.is_ok());
        assert_eq!(provider.call_count("cluster-role").await, 2);
        assert_eq!(provider.resource_count().await, 1);
    }

    #[tokio::test]
    async fn test_missing_required_is_permanent() {
        let provider = SimulatedProvider::new();
        let request = ResourceRequest {
            name: String::from("cluster"),
            resource_type: ResourceType::Cluster,
            properties: Properties::new(),
        };
        let err = provider.create(&request).await.expect_err("missing name and version");
        assert!(matches!(err, ConvergeError::Provider(ProviderError::Permanent { .. })));
    }

    #[tokio::test]
    async fn test_file_backed_inventory_survives_reopen() {
        let temp = TempDir::new().expect("temp dir");
        let path = temp.path().join("provider.json");

        let provider = SimulatedProvider::open(&path).await.expect("open");
        let created = provider.create(&role_request("cluster-role", "eks-admin")).await.expect("create");
        drop(provider);

        let reopened = SimulatedProvider::open(&path).await.expect("reopen");
        let observed = reopened.find("cluster-role").await.expect("persisted");
        assert_eq!(observed.id, created.id);
    }

    #[tokio::test]
    async fn test_tamper_changes_live_properties() {
        let provider = SimulatedProvider::new();
        provider.create(&role_request("cluster-role", "eks-admin")).await.expect("create");

        assert!(provider.tamper("cluster-role", "max_session_duration", json!(7200)).await);
        assert!(!provider.tamper("missing", "x", json!(1)).await);

        let observed = provider.find("cluster-role").await.expect("exists");
        assert_eq!(observed.properties["max_session_duration"], json!(7200));
    }
}
