//! Windrose reconciliation engine
//!
//! This crate implements the control loop that converges the set of Windows
//! worker nodes in the cluster onto the replica count declared in a
//! `WindowsMachineConfig`. The loop observes the labelled node count, plans
//! add/remove actions, drives the cloud provider and node configurator
//! adapters, tracks owned VMs in a persistent registry, and publishes the
//! resulting condition set on the resource.

#![deny(missing_docs)]

pub mod cloud;
pub mod configure;
pub mod controller;
pub mod decommission;
pub mod plan;
pub mod provision;
pub mod registry;
pub mod status;
pub mod vm;

pub use controller::{error_policy, reconcile, Context, ContextBuilder};
pub use windrose_common::{Error, Result};
