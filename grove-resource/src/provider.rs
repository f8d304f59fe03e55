//! The provider capability interface.
//!
//! A provider manages the real-world objects behind one or more resource
//! types. The engine only ever talks to providers through this trait; how a
//! provider is reached (in process, over a pipe, over the network) is the
//! provider's concern.

use anyhow::{bail, Result};
use async_trait::async_trait;
use grove_core::{
    schema::ProviderSchema,
    value::{PathStep, Value},
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct ReadResourceRequest {
    pub type_name: String,
    /// The object as last recorded in the state.
    pub prior: Value,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct PlanResourceChangeRequest {
    pub type_name: String,
    /// Null when the object does not exist yet.
    pub prior: Value,
    /// The result of reconciling `prior` with `config`.
    pub proposed: Value,
    pub config: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanResourceChangeResponse {
    /// `proposed`, with everything the provider will compute during apply
    /// marked unknown.
    pub planned: Value,
    /// Attributes whose change cannot be applied in place.
    pub requires_replace: Vec<Vec<PathStep>>,
}

#[derive(Debug, Clone)]
pub struct ApplyResourceChangeRequest {
    pub type_name: String,
    /// Null when creating.
    pub prior: Value,
    /// Null when destroying.
    pub planned: Value,
    pub config: Value,
    pub cancel: CancellationToken,
}

/// The outcome of applying a change.
///
/// A failed apply may still have affected the real world. `new_state` then
/// describes whatever the provider knows to exist, e.g. an object that was
/// created but could not be fully configured. Null means no object exists.
#[derive(Debug)]
pub struct ApplyResourceChangeResponse {
    pub new_state: Value,
    pub error: Option<anyhow::Error>,
}

impl ApplyResourceChangeResponse {
    pub fn ok(new_state: Value) -> Self {
        ApplyResourceChangeResponse {
            new_state,
            error: None,
        }
    }

    pub fn failed(new_state: Value, error: anyhow::Error) -> Self {
        ApplyResourceChangeResponse {
            new_state,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpgradeResourceStateRequest {
    pub type_name: String,
    /// The schema version the object was written with.
    pub version: u64,
    pub raw: serde_json::Value,
}

#[async_trait]
pub trait ResourceProvider: Send + Sync {
    fn schema(&self) -> ProviderSchema;

    /// Configure the provider before any resource operation.
    async fn configure(&self, _config: Value) -> Result<()> {
        Ok(())
    }

    /// Provider-specific validation, beyond what the schema expresses.
    async fn validate_resource_config(&self, _type_name: &str, _config: &Value) -> Result<()> {
        Ok(())
    }

    /// Convert an object written under an older schema version to the JSON
    /// form of the current version.
    async fn upgrade_resource_state(&self, request: UpgradeResourceStateRequest) -> Result<serde_json::Value> {
        let current = self
            .schema()
            .get_resource_schema(&request.type_name)
            .map(|s| s.version)
            .unwrap_or(0);
        if request.version == current {
            return Ok(request.raw);
        }
        bail!(
            "no state upgrade for {} from schema version {} to {}",
            request.type_name,
            request.version,
            current
        )
    }

    /// Read the current state of an object. Returns null if it no longer
    /// exists.
    async fn read_resource(&self, request: ReadResourceRequest) -> Result<Value>;

    async fn plan_resource_change(&self, request: PlanResourceChangeRequest) -> Result<PlanResourceChangeResponse>;

    /// Create, update or (when `planned` is null) destroy an object.
    async fn apply_resource_change(&self, request: ApplyResourceChangeRequest) -> ApplyResourceChangeResponse;
}
