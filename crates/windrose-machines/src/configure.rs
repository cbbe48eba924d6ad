//! Node configurator adapters
//!
//! A configurator bootstraps one raw Windows VM into a ready cluster node:
//! it drives the Windows bootstrapper tool against the VM, waits for the
//! kubelet to register and report Ready, then labels the node as a Windows
//! worker so the reconcile loop counts it.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use windrose_common::{Error, CONTROLLER_NAME, WINDOWS_OS_LABEL};

use crate::vm::{instance_id_from_node, VmCredentials};

/// Name of the Windows node bootstrapper binary on PATH
const BOOTSTRAPPER_BINARY: &str = "windows-node-bootstrapper";

/// Environment variable carrying the VM administrator secret to the
/// bootstrapper, keeping it out of the process argument list
const VM_SECRET_ENV: &str = "WINDROSE_VM_SECRET";

/// Interval between node registration polls
const NODE_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Registration polls before giving up; the provisioner's configure timeout
/// is the authoritative bound, this just keeps the loop finite on its own
const NODE_POLL_ATTEMPTS: u32 = 40;

/// Bootstraps one Windows VM into a ready cluster node
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeConfigurator: Send + Sync {
    /// Run the bootstrap and return the name of the joined node
    async fn configure(&self) -> Result<String, Error>;
}

/// Builds a configurator for one VM.
///
/// Construction can fail (e.g. unusable credentials); such failures classify
/// as `VMConfigurationFailure` at the provisioning call site.
#[cfg_attr(test, automock)]
pub trait ConfiguratorFactory: Send + Sync {
    /// Create a configurator for the given VM credentials.
    ///
    /// `cluster_service_cidr` is forwarded to the bootstrapper unchanged;
    /// it is opaque to this layer.
    fn for_vm(
        &self,
        credentials: &VmCredentials,
        cluster_service_cidr: &str,
    ) -> Result<Box<dyn NodeConfigurator>, Error>;
}

/// Production factory building [`BootstrapConfigurator`] instances
pub struct BootstrapConfiguratorFactory {
    client: Client,
}

impl BootstrapConfiguratorFactory {
    /// Create a factory using the given Kubernetes client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl ConfiguratorFactory for BootstrapConfiguratorFactory {
    fn for_vm(
        &self,
        credentials: &VmCredentials,
        cluster_service_cidr: &str,
    ) -> Result<Box<dyn NodeConfigurator>, Error> {
        validate_credentials(credentials)?;
        Ok(Box::new(BootstrapConfigurator {
            client: self.client.clone(),
            credentials: credentials.clone(),
            cluster_service_cidr: cluster_service_cidr.to_string(),
        }))
    }
}

/// Configurator driving the external Windows bootstrapper tool
pub struct BootstrapConfigurator {
    client: Client,
    credentials: VmCredentials,
    cluster_service_cidr: String,
}

impl BootstrapConfigurator {
    /// Run the bootstrapper binary against the VM
    async fn run_bootstrapper(&self) -> Result<(), Error> {
        let instance = &self.credentials.instance_id;
        let mut cmd = Command::new(BOOTSTRAPPER_BINARY);
        cmd.arg("--instance-id")
            .arg(instance)
            .arg("--admin-user")
            .arg(&self.credentials.admin_user)
            .arg("--cluster-service-cidr")
            .arg(&self.cluster_service_cidr)
            .env(VM_SECRET_ENV, &self.credentials.secret);

        debug!(instance = %instance, "running windows node bootstrapper");
        let output = cmd.output().await.map_err(|e| {
            Error::vm_configuration(instance, format!("bootstrapper spawn failed: {}", e))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(Error::vm_configuration(
                instance,
                format!("bootstrapper failed: {}", stderr),
            ));
        }
        Ok(())
    }

    /// Wait for the VM's node to register and report Ready
    async fn wait_for_node(&self) -> Result<Node, Error> {
        let instance = &self.credentials.instance_id;
        let api: Api<Node> = Api::all(self.client.clone());

        for attempt in 1..=NODE_POLL_ATTEMPTS {
            let nodes = api.list(&ListParams::default()).await.map_err(|e| {
                Error::vm_configuration(instance, format!("listing nodes: {}", e))
            })?;

            let joined = nodes.items.into_iter().find(|n| {
                instance_id_from_node(n).as_deref() == Some(instance.as_str()) && is_node_ready(n)
            });

            if let Some(node) = joined {
                return Ok(node);
            }

            debug!(instance = %instance, attempt, "node not ready yet");
            tokio::time::sleep(NODE_POLL_INTERVAL).await;
        }

        Err(Error::vm_configuration(
            instance,
            "node did not become ready in time",
        ))
    }

    /// Label the joined node as a Windows worker
    async fn label_node(&self, node: &Node) -> Result<(), Error> {
        let instance = &self.credentials.instance_id;
        let name = node.name_any();
        let api: Api<Node> = Api::all(self.client.clone());

        let patch = serde_json::json!({
            "metadata": {
                "labels": {
                    WINDOWS_OS_LABEL: "true"
                }
            }
        });
        api.patch(&name, &PatchParams::apply(CONTROLLER_NAME), &Patch::Merge(&patch))
            .await
            .map_err(|e| {
                Error::vm_configuration(instance, format!("labelling node {}: {}", name, e))
            })?;

        Ok(())
    }
}

#[async_trait]
impl NodeConfigurator for BootstrapConfigurator {
    async fn configure(&self) -> Result<String, Error> {
        let instance = &self.credentials.instance_id;

        self.run_bootstrapper().await?;

        let node = self.wait_for_node().await?;
        let node_name = node.name_any();

        if let Err(e) = self.label_node(&node).await {
            // The node joined but is not yet counted; surface the failure so
            // the pass rolls the VM back rather than leaving it half-adopted.
            warn!(instance = %instance, error = %e, "failed to label joined node");
            return Err(e);
        }

        info!(instance = %instance, node = %node_name, "windows VM joined the cluster");
        Ok(node_name)
    }
}

/// Reject credentials the bootstrapper cannot log in with
fn validate_credentials(credentials: &VmCredentials) -> Result<(), Error> {
    if credentials.admin_user.is_empty() || credentials.secret.is_empty() {
        return Err(Error::cloud_provider(format!(
            "VM {} has no usable credentials",
            credentials.instance_id
        )));
    }
    Ok(())
}

/// Check if a node has the Ready condition set to True
pub(crate) fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus};

    fn node_with_ready(status: &str) -> Node {
        Node {
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: status.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn ready_condition_true_is_ready() {
        assert!(is_node_ready(&node_with_ready("True")));
    }

    #[test]
    fn ready_condition_false_or_absent_is_not_ready() {
        assert!(!is_node_ready(&node_with_ready("False")));
        assert!(!is_node_ready(&Node::default()));
    }

    #[test]
    fn empty_admin_user_is_rejected() {
        let creds = VmCredentials {
            instance_id: "i-0abc".to_string(),
            admin_user: String::new(),
            secret: "s3cret".to_string(),
        };
        let err = validate_credentials(&creds).unwrap_err();
        assert!(err.to_string().contains("no usable credentials"));
    }

    #[test]
    fn empty_secret_is_rejected() {
        let creds = VmCredentials {
            instance_id: "i-0abc".to_string(),
            admin_user: "Administrator".to_string(),
            secret: String::new(),
        };
        assert!(validate_credentials(&creds).is_err());
    }

    #[test]
    fn complete_credentials_pass_validation() {
        let creds = VmCredentials {
            instance_id: "i-0abc".to_string(),
            admin_user: "Administrator".to_string(),
            secret: "s3cret".to_string(),
        };
        assert!(validate_credentials(&creds).is_ok());
    }
}
