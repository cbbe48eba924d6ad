//! Error types for the Windrose operator
//!
//! Every failure that crosses a component boundary carries a stable,
//! machine-readable [`ReasonCode`] alongside the developer-facing cause.
//! The reason is what populates the `Degraded` condition on the custom
//! resource; the message is never parsed by callers.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default context value when no specific instance is available
pub const UNKNOWN_INSTANCE: &str = "unknown";

/// Machine-readable degradation reasons surfaced on the custom resource.
///
/// This is a closed set: conditions never carry a reason outside it.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ReasonCode {
    /// The cloud provider handle could not be constructed or reached
    CloudProviderAPIFailure,
    /// A VM create call failed
    VMCreationFailure,
    /// Bootstrapping a created VM into a cluster node failed
    VMConfigurationFailure,
    /// A VM destroy call failed
    VMTerminationFailure,
    /// The VM registry could not be persisted or disagrees with the cluster
    TrackerFailure,
    /// The custom resource status could not be updated
    StatusFailure,
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::CloudProviderAPIFailure => "CloudProviderAPIFailure",
            Self::VMCreationFailure => "VMCreationFailure",
            Self::VMConfigurationFailure => "VMConfigurationFailure",
            Self::VMTerminationFailure => "VMTerminationFailure",
            Self::TrackerFailure => "TrackerFailure",
            Self::StatusFailure => "StatusFailure",
        };
        write!(f, "{}", s)
    }
}

/// Main error type for Windrose operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Cloud provider handle construction or API-level failure
    #[error("cloud provider error: {message}")]
    CloudProvider {
        /// Description of what failed
        message: String,
    },

    /// A VM create call failed; no instance is tracked for this error
    #[error("vm creation error: {message}")]
    VmCreation {
        /// Description of what failed
        message: String,
    },

    /// Bootstrapping a created VM into a cluster node failed
    #[error("vm configuration error [{instance_id}]: {message}")]
    VmConfiguration {
        /// Cloud instance ID of the VM that failed to configure
        instance_id: String,
        /// Description of what failed
        message: String,
    },

    /// A VM destroy call failed; the registry entry is kept
    #[error("vm termination error [{instance_id}]: {message}")]
    VmTermination {
        /// Cloud instance ID of the VM that failed to terminate
        instance_id: String,
        /// Description of what failed
        message: String,
    },

    /// The VM registry could not be loaded, persisted, or reconciled
    #[error("tracker error: {message}")]
    Tracker {
        /// Description of what failed
        message: String,
    },

    /// The custom resource status could not be updated
    #[error("status update error: {message}")]
    Status {
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a cloud provider error with the given message
    pub fn cloud_provider(msg: impl Into<String>) -> Self {
        Self::CloudProvider {
            message: msg.into(),
        }
    }

    /// Create a VM creation error with the given message
    pub fn vm_creation(msg: impl Into<String>) -> Self {
        Self::VmCreation {
            message: msg.into(),
        }
    }

    /// Create a VM configuration error for a specific instance
    pub fn vm_configuration(instance_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::VmConfiguration {
            instance_id: instance_id.into(),
            message: msg.into(),
        }
    }

    /// Create a VM termination error for a specific instance
    pub fn vm_termination(instance_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::VmTermination {
            instance_id: instance_id.into(),
            message: msg.into(),
        }
    }

    /// Create a tracker error with the given message
    pub fn tracker(msg: impl Into<String>) -> Self {
        Self::Tracker {
            message: msg.into(),
        }
    }

    /// Create a status update error with the given message
    pub fn status(msg: impl Into<String>) -> Self {
        Self::Status {
            message: msg.into(),
        }
    }

    /// The degradation reason for this error.
    ///
    /// Raw Kubernetes API errors surface through the cluster-state tracking
    /// path and classify as `TrackerFailure`; every other variant maps to its
    /// own reason.
    pub fn reason(&self) -> ReasonCode {
        match self {
            Error::Kube { .. } => ReasonCode::TrackerFailure,
            Error::CloudProvider { .. } => ReasonCode::CloudProviderAPIFailure,
            Error::VmCreation { .. } => ReasonCode::VMCreationFailure,
            Error::VmConfiguration { .. } => ReasonCode::VMConfigurationFailure,
            Error::VmTermination { .. } => ReasonCode::VMTerminationFailure,
            Error::Tracker { .. } => ReasonCode::TrackerFailure,
            Error::Status { .. } => ReasonCode::StatusFailure,
        }
    }

    /// Get the cloud instance ID if this error is tied to a specific VM
    pub fn instance_id(&self) -> Option<&str> {
        match self {
            Error::VmConfiguration { instance_id, .. } => Some(instance_id),
            Error::VmTermination { instance_id, .. } => Some(instance_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: Error Classification During Reconciliation
    // ==========================================================================
    //
    // Every error the reconcile loop collects must resolve to a stable reason
    // so the Degraded condition stays machine-readable. These tests pin the
    // variant-to-reason mapping and the message formats operators see in logs.

    /// Story: a missing AWS spec block produces a cloud provider error that
    /// the driver publishes without requeueing.
    #[test]
    fn story_cloud_provider_construction_failure() {
        let err = Error::cloud_provider("aws cloud provider spec is missing");
        assert_eq!(err.reason(), ReasonCode::CloudProviderAPIFailure);
        assert!(err.to_string().contains("cloud provider error"));
        assert!(err.to_string().contains("spec is missing"));
        assert_eq!(err.instance_id(), None);
    }

    /// Story: creation failures carry no instance ID because no VM exists yet.
    #[test]
    fn story_creation_failure_has_no_instance() {
        let err = Error::vm_creation("quota exceeded in us-east-1");
        assert_eq!(err.reason(), ReasonCode::VMCreationFailure);
        assert_eq!(err.instance_id(), None);
        assert!(err.to_string().contains("quota exceeded"));
    }

    /// Story: configuration and termination failures name the instance so an
    /// operator can chase the leaked or stuck VM.
    #[test]
    fn story_vm_errors_name_the_instance() {
        let err = Error::vm_configuration("i-0abc123", "bootstrapper exited with status 1");
        assert_eq!(err.reason(), ReasonCode::VMConfigurationFailure);
        assert_eq!(err.instance_id(), Some("i-0abc123"));
        assert!(err.to_string().contains("[i-0abc123]"));

        let err = Error::vm_termination("i-0def456", "api timeout");
        assert_eq!(err.reason(), ReasonCode::VMTerminationFailure);
        assert_eq!(err.instance_id(), Some("i-0def456"));
    }

    /// Story: registry and status failures map to their own reasons so a
    /// degraded condition distinguishes "cannot persist state" from "cannot
    /// report state".
    #[test]
    fn story_tracker_and_status_reasons() {
        assert_eq!(
            Error::tracker("registry modified concurrently").reason(),
            ReasonCode::TrackerFailure
        );
        assert_eq!(
            Error::status("conflict after 3 attempts").reason(),
            ReasonCode::StatusFailure
        );
    }

    /// Reason codes serialize to the exact strings surfaced in conditions.
    #[test]
    fn reason_codes_display_exact_strings() {
        assert_eq!(
            ReasonCode::CloudProviderAPIFailure.to_string(),
            "CloudProviderAPIFailure"
        );
        assert_eq!(ReasonCode::VMCreationFailure.to_string(), "VMCreationFailure");
        assert_eq!(
            ReasonCode::VMConfigurationFailure.to_string(),
            "VMConfigurationFailure"
        );
        assert_eq!(
            ReasonCode::VMTerminationFailure.to_string(),
            "VMTerminationFailure"
        );
        assert_eq!(ReasonCode::TrackerFailure.to_string(), "TrackerFailure");
        assert_eq!(ReasonCode::StatusFailure.to_string(), "StatusFailure");
    }

    #[test]
    fn reason_codes_serialize_as_variant_names() {
        let json = serde_json::to_string(&ReasonCode::VMCreationFailure).unwrap();
        assert_eq!(json, "\"VMCreationFailure\"");
        let back: ReasonCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ReasonCode::VMCreationFailure);
    }

    /// Error constructors accept both String and &str.
    #[test]
    fn error_construction_ergonomics() {
        let instance = "i-0abc";
        let err = Error::vm_termination(instance, format!("destroy of {} failed", instance));
        assert!(err.to_string().contains("i-0abc"));

        let err = Error::tracker("static message");
        assert!(err.to_string().contains("static message"));
    }
}
