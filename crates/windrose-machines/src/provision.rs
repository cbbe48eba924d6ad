//! Provisioning: executing one Add action
//!
//! The sequence is create → register → configure → mark ready. CreateVM is
//! the only non-idempotent external call, so the VM is registered (state
//! `Configuring`) and persisted the moment it exists; a crash during
//! configuration leaves a trackable entry that registry reconciliation reaps
//! instead of a silently leaked instance.

use std::time::Duration;

use tracing::{debug, info, warn};

use windrose_common::{metrics, Error};

use crate::cloud::CloudProvider;
use crate::configure::ConfiguratorFactory;
use crate::decommission::DESTROY_TIMEOUT;
use crate::registry::VmRegistry;
use crate::vm::VmRecord;

/// Deadline for one cloud-side create call
pub const CREATE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Deadline for bootstrapping a VM into a ready node
pub const CONFIGURE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Create, configure, and register one Windows worker node.
///
/// Returns the name of the joined node. On configuration failure the created
/// VM is destroyed exactly once; if that rollback also fails, both errors are
/// logged but only `VMConfigurationFailure` is returned, and the registry
/// entry is left for the tracker to reap and report on the next pass.
pub async fn add_worker_node(
    cloud: &dyn CloudProvider,
    configurators: &dyn ConfiguratorFactory,
    registry: &mut VmRegistry,
    cluster_service_cidr: &str,
) -> Result<String, Error> {
    debug!("creating a windows VM");
    let credentials = match tokio::time::timeout(CREATE_TIMEOUT, cloud.create_vm()).await {
        Ok(Ok(credentials)) => {
            metrics::record_vm_operation("create", true);
            credentials
        }
        Ok(Err(e)) => {
            metrics::record_vm_operation("create", false);
            return Err(classify_creation(e));
        }
        Err(_) => {
            metrics::record_vm_operation("create", false);
            return Err(Error::vm_creation(format!(
                "create timed out after {:?}",
                CREATE_TIMEOUT
            )));
        }
    };

    let instance_id = credentials.instance_id.clone();

    // Persist before configuring: from here on the instance exists cloud-side
    // and must survive a controller crash.
    registry.add(VmRecord::configuring(credentials.clone()));
    if let Err(e) = registry.flush().await {
        warn!(instance = %instance_id, error = %e, "could not persist new registry entry yet");
    }

    debug!(instance = %instance_id, "configuring the windows VM");
    let configurator = match configurators.for_vm(&credentials, cluster_service_cidr) {
        Ok(configurator) => configurator,
        Err(e) => return Err(rollback(cloud, registry, &instance_id, e).await),
    };

    let node_name = match tokio::time::timeout(CONFIGURE_TIMEOUT, configurator.configure()).await {
        Ok(Ok(node_name)) => node_name,
        Ok(Err(e)) => return Err(rollback(cloud, registry, &instance_id, e).await),
        Err(_) => {
            let e = Error::vm_configuration(
                &instance_id,
                format!("configure timed out after {:?}", CONFIGURE_TIMEOUT),
            );
            return Err(rollback(cloud, registry, &instance_id, e).await);
        }
    };

    metrics::record_vm_operation("configure", true);
    registry.mark_ready(&instance_id, &node_name);

    info!(instance = %instance_id, node = %node_name, "windows VM joined the cluster as a worker");
    Ok(node_name)
}

/// Best-effort destroy of a VM whose configuration failed.
///
/// Returns the `VMConfigurationFailure` to surface for this action. The
/// destroy is attempted exactly once; on success the registry entry is
/// removed, on failure it is kept so the leak stays visible.
async fn rollback(
    cloud: &dyn CloudProvider,
    registry: &mut VmRegistry,
    instance_id: &str,
    cause: Error,
) -> Error {
    metrics::record_vm_operation("configure", false);
    warn!(instance = %instance_id, error = %cause, "configuration failed, rolling back VM");

    match tokio::time::timeout(DESTROY_TIMEOUT, cloud.destroy_vm(instance_id)).await {
        Ok(Ok(())) => {
            metrics::record_vm_operation("destroy", true);
            registry.remove(instance_id);
            info!(instance = %instance_id, "rolled back unconfigured VM");
        }
        Ok(Err(destroy_err)) => {
            metrics::record_vm_operation("destroy", false);
            warn!(
                instance = %instance_id,
                error = %destroy_err,
                "rollback destroy failed, instance leaked until tracker reaps it"
            );
        }
        Err(_) => {
            metrics::record_vm_operation("destroy", false);
            warn!(
                instance = %instance_id,
                "rollback destroy timed out, instance leaked until tracker reaps it"
            );
        }
    }

    classify_configuration(instance_id, cause)
}

fn classify_creation(error: Error) -> Error {
    match error {
        e @ Error::VmCreation { .. } => e,
        other => Error::vm_creation(other.to_string()),
    }
}

fn classify_configuration(instance_id: &str, error: Error) -> Error {
    match error {
        e @ Error::VmConfiguration { .. } => e,
        other => Error::vm_configuration(instance_id, other.to_string()),
    }
}
