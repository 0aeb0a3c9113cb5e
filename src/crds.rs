use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube_derive::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Copies the spec of the Deployment `resourceName` from `sourceNamespace`
/// into a Deployment of the same name in `destinationNamespace`.
#[derive(CustomResource, Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "homerow.ca",
    version = "v1",
    kind = "DeploymentSync",
    namespaced,
    shortname = "dsync",
    status = "DeploymentSyncStatus",
    printcolumn = r#"{"name":"Source","type":"string","jsonPath":".spec.sourceNamespace"}"#,
    printcolumn = r#"{"name":"Destination","type":"string","jsonPath":".spec.destinationNamespace"}"#,
    printcolumn = r#"{"name":"Resource","type":"string","jsonPath":".spec.resourceName"}"#,
    printcolumn = r#"{"name":"Last Sync","type":"date","jsonPath":".status.lastSyncTime"}"#
)]
pub struct DeploymentSyncSpec {
    pub source_namespace: String,
    pub destination_namespace: String,
    pub resource_name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSyncStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<Time>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("required field '{0}' is empty")]
    EmptyField(&'static str),

    #[error("malformed DeploymentSync: {0}")]
    Malformed(String),
}

impl DeploymentSyncSpec {
    /// Rejects specs the API server accepted but that cannot name a Deployment.
    pub fn validate(&self) -> Result<(), SchemaError> {
        [
            ("sourceNamespace", &self.source_namespace),
            ("destinationNamespace", &self.destination_namespace),
            ("resourceName", &self.resource_name),
        ]
        .into_iter()
        .find(|(_, value)| value.trim().is_empty())
        .map_or(Ok(()), |(field, _)| Err(SchemaError::EmptyField(field)))
    }

    pub fn source_ref(&self) -> (&str, &str) {
        (&self.source_namespace, &self.resource_name)
    }

    pub fn destination_ref(&self) -> (&str, &str) {
        (&self.destination_namespace, &self.resource_name)
    }

    /// True if the Deployment at `namespace/name` is this intent's source or destination.
    pub fn references(&self, namespace: &str, name: &str) -> bool {
        name == self.resource_name
            && (namespace == self.source_namespace || namespace == self.destination_namespace)
    }
}
