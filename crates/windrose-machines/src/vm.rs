//! Controller-owned records of cloud VM instances

use k8s_openapi::api::core::v1::Node;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Credentials returned by the cloud provider for a created VM
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VmCredentials {
    /// Cloud instance ID; immutable once set
    #[serde(rename = "instanceID")]
    pub instance_id: String,

    /// Administrator account on the Windows VM
    pub admin_user: String,

    /// Administrator secret; never logged
    pub secret: String,
}

/// Lifecycle state of a tracked VM
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum VmState {
    /// Created on the cloud side, node bootstrap not yet finished.
    ///
    /// Entries still in this state when the registry reconciles are
    /// incomplete (a crash or a failed rollback left them behind) and are
    /// reaped.
    Configuring,
    /// Bootstrap finished; the VM joined the cluster as a worker node
    Ready,
}

/// One registry entry: a cloud instance this controller owns
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VmRecord {
    /// Cloud instance ID; registry key, unique across entries
    #[serde(rename = "instanceID")]
    pub instance_id: String,

    /// VM credentials; absent for ghost entries recovered from a damaged
    /// store document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<VmCredentials>,

    /// Name of the joined cluster node; empty until the node joins
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    /// Current lifecycle state
    pub state: VmState,
}

impl VmRecord {
    /// Record for a freshly created VM that has not finished bootstrap
    pub fn configuring(credentials: VmCredentials) -> Self {
        Self {
            instance_id: credentials.instance_id.clone(),
            credentials: Some(credentials),
            node_name: None,
            state: VmState::Configuring,
        }
    }

    /// True when the record cannot be destroyed through the cloud API:
    /// there are no credentials or no instance ID to address.
    pub fn is_ghost(&self) -> bool {
        match &self.credentials {
            None => true,
            Some(creds) => creds.instance_id.is_empty(),
        }
    }
}

/// Extract the cloud instance ID from a node's providerID.
///
/// Provider IDs follow the `<provider>://<path>/<instance-id>` convention
/// (e.g. `aws:///us-east-1a/i-0123456789abcdef0`); the instance ID is the
/// final path segment.
pub fn instance_id_from_node(node: &Node) -> Option<String> {
    let provider_id = node.spec.as_ref()?.provider_id.as_deref()?;
    let id = provider_id.rsplit('/').next()?;
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}
