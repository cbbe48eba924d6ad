//! Decommissioning: executing one Remove action
//!
//! Victims come from the registry at execution time, so consecutive removals
//! observe the effect of earlier ones. Destroy is idempotent on the cloud
//! adapter side; an instance that is already gone counts as removed.

use std::time::Duration;

use tracing::{debug, info, warn};

use windrose_common::error::UNKNOWN_INSTANCE;
use windrose_common::{metrics, Error};

use crate::cloud::CloudProvider;
use crate::registry::VmRegistry;

/// Deadline for one cloud-side destroy call
pub const DESTROY_TIMEOUT: Duration = Duration::from_secs(60);

/// Destroy one tracked VM and deregister it.
///
/// Returns the instance ID of the removed VM. A victim with no usable
/// credentials was never fully created; it is dropped from the registry and
/// counts as success. A failed destroy keeps the registry entry so the VM
/// stays eligible next pass.
pub async fn remove_worker_node(
    cloud: &dyn CloudProvider,
    registry: &mut VmRegistry,
) -> Result<String, Error> {
    let victim = registry.choose_victim().ok_or_else(|| {
        Error::vm_termination(
            UNKNOWN_INSTANCE,
            "scale-down requested but no tracked VM is available",
        )
    })?;

    let instance_id = victim.instance_id.clone();

    if victim.is_ghost() {
        // Nothing addressable on the cloud side; forgetting it is the removal.
        info!(instance = %instance_id, "dropping ghost registry entry");
        registry.remove(&instance_id);
        return Ok(instance_id);
    }

    debug!(instance = %instance_id, "destroying windows VM");
    match tokio::time::timeout(DESTROY_TIMEOUT, cloud.destroy_vm(&instance_id)).await {
        Ok(Ok(())) => {
            metrics::record_vm_operation("destroy", true);
            registry.remove(&instance_id);
            info!(instance = %instance_id, "windows worker removed from the cluster");
            Ok(instance_id)
        }
        Ok(Err(e)) => {
            metrics::record_vm_operation("destroy", false);
            warn!(instance = %instance_id, error = %e, "destroy failed, keeping registry entry");
            Err(classify_termination(&instance_id, e))
        }
        Err(_) => {
            metrics::record_vm_operation("destroy", false);
            Err(Error::vm_termination(
                &instance_id,
                format!("destroy timed out after {:?}", DESTROY_TIMEOUT),
            ))
        }
    }
}

/// Ensure a destroy failure carries the VMTerminationFailure reason
fn classify_termination(instance_id: &str, error: Error) -> Error {
    match error {
        e @ Error::VmTermination { .. } => e,
        other => Error::vm_termination(instance_id, other.to_string()),
    }
}
