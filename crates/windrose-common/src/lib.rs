//! Common types for Windrose: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod metrics;
pub mod telemetry;

pub use error::{Error, ReasonCode};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace for Windrose system resources (registry ConfigMap, operator)
pub const WINDROSE_NAMESPACE: &str = "windrose-system";

/// Name of the ConfigMap backing the VM registry
pub const REGISTRY_CONFIGMAP: &str = "windows-vm-registry";

/// Field manager / event reporter name used for all API writes
pub const CONTROLLER_NAME: &str = "windrose-controller";

/// The singleton WindowsMachineConfig name the controller acts on.
///
/// The resource is cluster-scoped and singleton by convention; reconcile
/// requests for any other name are ignored without requeue.
pub const EXPECTED_CONFIG_NAME: &str = "cluster";

/// Label selector identifying Windows worker nodes provisioned by Windrose.
///
/// The node configurator applies this label once a VM has joined the cluster;
/// the reconcile loop counts nodes carrying it as the observed state.
pub const WINDOWS_OS_LABEL: &str = "windows-os";

/// Path where the host mounts the cloud credentials file
pub const CLOUD_CREDENTIALS_PATH: &str = "/etc/cloud/credentials";

/// Path where the host mounts the SSH private key for Windows VMs
pub const PRIVATE_KEY_PATH: &str = "/etc/private-key.pem";
