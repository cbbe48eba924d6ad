//! WindowsMachineConfig Custom Resource Definition
//!
//! A WindowsMachineConfig declares how many Windows worker nodes the cluster
//! should have and the VM shape to provision them with. The resource is
//! cluster-scoped and singleton by convention (named `cluster`).

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::conditions::Condition;
use crate::error::Error;

/// Specification for a WindowsMachineConfig
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "windrose.dev",
    version = "v1alpha1",
    kind = "WindowsMachineConfig",
    plural = "windowsmachineconfigs",
    shortname = "wmc",
    status = "WindowsMachineConfigStatus",
    namespaced = false,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Joined","type":"integer","jsonPath":".status.joinedVMCount"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WindowsMachineConfigSpec {
    /// Desired number of Windows worker nodes
    pub replicas: u32,

    /// Cloud instance type for new VMs (e.g. "m5a.large")
    pub instance_type: String,

    /// AWS-specific configuration; required until another cloud is supported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws: Option<AwsSpec>,
}

/// AWS-specific provider configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AwsSpec {
    /// Account ID owning the mounted credentials
    #[serde(rename = "credentialAccountID")]
    pub credential_account_id: String,

    /// Name of the SSH key pair used for new VMs
    pub ssh_key_pair: String,
}

impl WindowsMachineConfigSpec {
    /// Validate the machine config specification
    pub fn validate(&self) -> Result<(), Error> {
        if self.instance_type.is_empty() {
            return Err(Error::cloud_provider("instanceType cannot be empty"));
        }
        if let Some(aws) = &self.aws {
            if aws.credential_account_id.is_empty() {
                return Err(Error::cloud_provider("aws.credentialAccountID cannot be empty"));
            }
            if aws.ssh_key_pair.is_empty() {
                return Err(Error::cloud_provider("aws.sshKeyPair cannot be empty"));
            }
        }
        Ok(())
    }
}

/// Status for a WindowsMachineConfig
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WindowsMachineConfigStatus {
    /// Conditions representing the reconcile state (Reconciling, Degraded)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Number of Windows worker nodes currently joined to the cluster
    #[serde(rename = "joinedVMCount", default)]
    pub joined_vm_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ConditionStatus, ConditionType};

    fn sample_spec() -> WindowsMachineConfigSpec {
        WindowsMachineConfigSpec {
            replicas: 2,
            instance_type: "m5a.large".to_string(),
            aws: Some(AwsSpec {
                credential_account_id: "123456789012".to_string(),
                ssh_key_pair: "windows-workers".to_string(),
            }),
        }
    }

    #[test]
    fn machine_config_yaml_round_trip() {
        let yaml = r#"
apiVersion: windrose.dev/v1alpha1
kind: WindowsMachineConfig
metadata:
  name: cluster
spec:
  replicas: 3
  instanceType: m5a.large
  aws:
    credentialAccountID: "123456789012"
    sshKeyPair: windows-workers
"#;
        let config: WindowsMachineConfig = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(config.spec.replicas, 3);
        assert_eq!(config.spec.instance_type, "m5a.large");
        let aws = config.spec.aws.expect("aws block");
        assert_eq!(aws.credential_account_id, "123456789012");
        assert_eq!(aws.ssh_key_pair, "windows-workers");
    }

    #[test]
    fn spec_without_aws_block_parses() {
        let yaml = r#"
apiVersion: windrose.dev/v1alpha1
kind: WindowsMachineConfig
metadata:
  name: cluster
spec:
  replicas: 0
  instanceType: m5a.large
"#;
        let config: WindowsMachineConfig = serde_yaml::from_str(yaml).expect("parse");
        assert!(config.spec.aws.is_none());
        // Parsing succeeds; the reconcile driver rejects the missing block
        // with CloudProviderAPIFailure, not the schema.
        assert!(config.spec.validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_fields() {
        let mut spec = sample_spec();
        spec.instance_type = String::new();
        assert!(spec.validate().is_err());

        let mut spec = sample_spec();
        spec.aws.as_mut().unwrap().credential_account_id = String::new();
        assert!(spec.validate().is_err());

        let mut spec = sample_spec();
        spec.aws.as_mut().unwrap().ssh_key_pair = String::new();
        assert!(spec.validate().is_err());

        assert!(sample_spec().validate().is_ok());
    }

    #[test]
    fn status_serializes_joined_count_with_api_name() {
        let status = WindowsMachineConfigStatus {
            conditions: vec![Condition::reconciling(false)],
            joined_vm_count: 4,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["joinedVMCount"], 4);
        assert_eq!(json["conditions"][0]["type"], "Reconciling");
        assert_eq!(json["conditions"][0]["status"], "False");
    }

    #[test]
    fn default_status_is_empty() {
        let status = WindowsMachineConfigStatus::default();
        assert!(status.conditions.is_empty());
        assert_eq!(status.joined_vm_count, 0);
        let cond = Condition::new(
            ConditionType::Degraded,
            ConditionStatus::Unknown,
            None,
            "",
        );
        assert_eq!(cond.status, ConditionStatus::Unknown);
    }
}
