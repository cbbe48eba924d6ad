//! Cloud provider adapters
//!
//! The cloud provider is polymorphic over `{create_vm, destroy_vm}` and
//! enumerated at construction by a factory: one concrete implementation per
//! cloud behind a small trait. Construction failures (missing spec block,
//! unmounted credential files) classify as `CloudProviderAPIFailure` and are
//! configuration bugs, not transient errors.

mod aws;

pub use aws::AwsCloudProvider;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use windrose_common::crd::WindowsMachineConfigSpec;
use windrose_common::{Error, CLOUD_CREDENTIALS_PATH, PRIVATE_KEY_PATH};

use crate::vm::VmCredentials;

/// Adapter over one cloud's VM lifecycle operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudProvider: Send + Sync + std::fmt::Debug {
    /// Create one Windows VM and return its credentials.
    ///
    /// This is the only non-idempotent external call the controller makes;
    /// callers must not retry it blindly.
    async fn create_vm(&self) -> Result<VmCredentials, Error>;

    /// Destroy the VM with the given instance ID.
    ///
    /// Must be idempotent: an instance that is already gone is success.
    async fn destroy_vm(&self, instance_id: &str) -> Result<(), Error>;
}

/// Constructs a cloud provider handle from the resource spec.
///
/// Modeled as a trait so reconcile tests can inject failures and fakes; the
/// production implementation is [`InstallerCloudFactory`].
#[cfg_attr(test, automock)]
pub trait CloudProviderFactory: Send + Sync {
    /// Build a provider for the given spec, or fail with
    /// `CloudProviderAPIFailure` when the spec or mounted credentials are
    /// unusable.
    fn from_spec(&self, spec: &WindowsMachineConfigSpec) -> Result<Arc<dyn CloudProvider>, Error>;
}

/// Production factory backed by the windows-node-installer tool.
///
/// Credential files are mounted by the host; their absence indicates a
/// deployment problem and is surfaced at construction time rather than on
/// the first cloud call.
pub struct InstallerCloudFactory {
    credentials_path: PathBuf,
    private_key_path: PathBuf,
}

impl InstallerCloudFactory {
    /// Factory using the well-known mounted credential paths
    pub fn new() -> Self {
        Self {
            credentials_path: PathBuf::from(CLOUD_CREDENTIALS_PATH),
            private_key_path: PathBuf::from(PRIVATE_KEY_PATH),
        }
    }

    /// Factory with explicit credential paths (for tests)
    pub fn with_paths(credentials_path: impl Into<PathBuf>, private_key_path: impl Into<PathBuf>) -> Self {
        Self {
            credentials_path: credentials_path.into(),
            private_key_path: private_key_path.into(),
        }
    }

    fn require_mounted(path: &Path, what: &str) -> Result<(), Error> {
        if path.exists() {
            Ok(())
        } else {
            Err(Error::cloud_provider(format!(
                "{} not mounted at {}",
                what,
                path.display()
            )))
        }
    }
}

impl Default for InstallerCloudFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl CloudProviderFactory for InstallerCloudFactory {
    fn from_spec(&self, spec: &WindowsMachineConfigSpec) -> Result<Arc<dyn CloudProvider>, Error> {
        spec.validate()?;

        let aws = spec
            .aws
            .as_ref()
            .ok_or_else(|| Error::cloud_provider("aws cloud provider spec is missing"))?;

        Self::require_mounted(&self.credentials_path, "cloud credentials")?;
        Self::require_mounted(&self.private_key_path, "private key")?;

        debug!(
            account = %aws.credential_account_id,
            instance_type = %spec.instance_type,
            "constructed aws cloud provider"
        );

        Ok(Arc::new(AwsCloudProvider::new(
            self.credentials_path.clone(),
            aws.credential_account_id.clone(),
            spec.instance_type.clone(),
            aws.ssh_key_pair.clone(),
            self.private_key_path.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use windrose_common::crd::AwsSpec;
    use windrose_common::ReasonCode;

    fn spec_with_aws() -> WindowsMachineConfigSpec {
        WindowsMachineConfigSpec {
            replicas: 1,
            instance_type: "m5a.large".to_string(),
            aws: Some(AwsSpec {
                credential_account_id: "123456789012".to_string(),
                ssh_key_pair: "windows-workers".to_string(),
            }),
        }
    }

    #[test]
    fn missing_aws_block_is_a_cloud_provider_failure() {
        let factory = InstallerCloudFactory::with_paths("/dev/null", "/dev/null");
        let mut spec = spec_with_aws();
        spec.aws = None;

        let err = factory.from_spec(&spec).unwrap_err();
        assert_eq!(err.reason(), ReasonCode::CloudProviderAPIFailure);
        assert!(err.to_string().contains("aws cloud provider spec is missing"));
    }

    #[test]
    fn unmounted_credentials_fail_construction() {
        let factory =
            InstallerCloudFactory::with_paths("/nonexistent/credentials", "/dev/null");
        let err = factory.from_spec(&spec_with_aws()).unwrap_err();
        assert_eq!(err.reason(), ReasonCode::CloudProviderAPIFailure);
        assert!(err.to_string().contains("not mounted"));
    }

    #[test]
    fn unmounted_private_key_fails_construction() {
        let factory =
            InstallerCloudFactory::with_paths("/dev/null", "/nonexistent/private-key.pem");
        let err = factory.from_spec(&spec_with_aws()).unwrap_err();
        assert!(err.to_string().contains("private key"));
    }

    #[test]
    fn valid_spec_with_mounted_paths_constructs_a_provider() {
        let factory = InstallerCloudFactory::with_paths("/dev/null", "/dev/null");
        assert!(factory.from_spec(&spec_with_aws()).is_ok());
    }

    #[test]
    fn invalid_spec_fields_fail_construction() {
        let factory = InstallerCloudFactory::with_paths("/dev/null", "/dev/null");
        let mut spec = spec_with_aws();
        spec.instance_type = String::new();
        assert!(factory.from_spec(&spec).is_err());
    }
}
