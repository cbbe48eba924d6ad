//! AWS cloud adapter backed by the windows-node-installer tool
//!
//! VM create/destroy is delegated to the `wni` binary shipped in the operator
//! image. Create emits a JSON document on stdout describing the provisioned
//! instance; destroy is idempotent on the tool side but "not found" from a
//! racing manual cleanup is still mapped to success here.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use windrose_common::Error;

use super::CloudProvider;
use crate::vm::VmCredentials;

/// Name of the windows-node-installer binary on PATH
const WNI_BINARY: &str = "wni";

/// Working directory handed to the installer for its state files
const WNI_WORKING_DIR: &str = "/tmp";

/// JSON document the installer prints for a created instance
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedInstance {
    #[serde(rename = "instanceID")]
    instance_id: String,
    admin_user: String,
    password: String,
}

/// AWS implementation of [`CloudProvider`]
#[derive(Debug)]
pub struct AwsCloudProvider {
    credentials_path: PathBuf,
    credential_account_id: String,
    instance_type: String,
    ssh_key_pair: String,
    private_key_path: PathBuf,
}

impl AwsCloudProvider {
    /// Create an adapter from the mounted credentials and spec fields
    pub fn new(
        credentials_path: PathBuf,
        credential_account_id: String,
        instance_type: String,
        ssh_key_pair: String,
        private_key_path: PathBuf,
    ) -> Self {
        Self {
            credentials_path,
            credential_account_id,
            instance_type,
            ssh_key_pair,
            private_key_path,
        }
    }

    /// Run an installer invocation and return its stdout on success
    async fn run_installer(&self, cmd: &mut Command, description: &str) -> Result<Vec<u8>, Error> {
        debug!("{}", description);
        let output = cmd
            .output()
            .await
            .map_err(|e| Error::cloud_provider(format!("{} spawn failed: {}", description, e)))?;

        if output.status.success() {
            debug!("{} succeeded", description);
            Ok(output.stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!("{} failed: {}", description, stderr);
            Err(Error::cloud_provider(format!(
                "{} failed: {}",
                description, stderr
            )))
        }
    }
}

#[async_trait]
impl CloudProvider for AwsCloudProvider {
    async fn create_vm(&self) -> Result<VmCredentials, Error> {
        let mut cmd = Command::new(WNI_BINARY);
        cmd.arg("aws")
            .arg("create")
            .arg("--credentials")
            .arg(&self.credentials_path)
            .arg("--credential-account")
            .arg(&self.credential_account_id)
            .arg("--instance-type")
            .arg(&self.instance_type)
            .arg("--ssh-key")
            .arg(&self.ssh_key_pair)
            .arg("--private-key")
            .arg(&self.private_key_path)
            .arg("--dir")
            .arg(WNI_WORKING_DIR)
            .arg("--output")
            .arg("json");

        let stdout = self
            .run_installer(&mut cmd, "wni aws create")
            .await
            .map_err(|e| Error::vm_creation(e.to_string()))?;

        let created: CreatedInstance = serde_json::from_slice(&stdout).map_err(|e| {
            Error::vm_creation(format!("unparseable installer output: {}", e))
        })?;

        if created.instance_id.is_empty() {
            // Orphaned-in-creation: nothing to address on the cloud side, so
            // the VM is forgotten rather than tracked.
            return Err(Error::vm_creation(
                "installer returned an instance without an ID",
            ));
        }

        info!(instance = %created.instance_id, "created windows VM");
        Ok(VmCredentials {
            instance_id: created.instance_id,
            admin_user: created.admin_user,
            secret: created.password,
        })
    }

    async fn destroy_vm(&self, instance_id: &str) -> Result<(), Error> {
        let mut cmd = Command::new(WNI_BINARY);
        cmd.arg("aws")
            .arg("destroy")
            .arg("--credentials")
            .arg(&self.credentials_path)
            .arg("--credential-account")
            .arg(&self.credential_account_id)
            .arg("--instance-id")
            .arg(instance_id)
            .arg("--dir")
            .arg(WNI_WORKING_DIR);

        match self.run_installer(&mut cmd, "wni aws destroy").await {
            Ok(_) => {
                info!(instance = %instance_id, "destroyed windows VM");
                Ok(())
            }
            // An instance that is already gone is success; someone cleaned it
            // up out of band and the end state is what we wanted.
            Err(e) if e.to_string().contains("not found") => {
                info!(instance = %instance_id, "windows VM already gone");
                Ok(())
            }
            Err(e) => Err(Error::vm_termination(instance_id, e.to_string())),
        }
    }
}
