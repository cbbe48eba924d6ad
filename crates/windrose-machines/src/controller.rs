//! WindowsMachineConfig controller implementation
//!
//! This module implements the reconciliation logic for WindowsMachineConfig
//! resources. It follows the Kubernetes controller pattern: observe the
//! current Windows worker population, compare against the declared replica
//! count, and issue ordered cloud and configuration actions to converge.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use windrose_common::crd::{Condition, WindowsMachineConfig};
use windrose_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use windrose_common::metrics::{self, ReconcileTimer};
use windrose_common::{Error, CONTROLLER_NAME, EXPECTED_CONFIG_NAME, WINDOWS_OS_LABEL};

#[cfg(test)]
use windrose_common::events::NoopEventPublisher;

use crate::cloud::{CloudProviderFactory, InstallerCloudFactory};
use crate::configure::{BootstrapConfiguratorFactory, ConfiguratorFactory};
use crate::decommission::remove_worker_node;
use crate::plan::{plan, ScaleAction};
use crate::provision::add_worker_node;
use crate::registry::{ConfigMapStore, RegistryStore, VmRegistry};
use crate::status::StatusPublisher;

/// Requeue interval once the cluster is converged; drift that produces no
/// watch event (an externally deleted node) is noticed on this cadence
const STEADY_REQUEUE: Duration = Duration::from_secs(300);

/// Helper function to get a Kubernetes resource by name, returning None if
/// not found.
async fn get_optional<K>(api: &Api<K>, name: &str) -> Result<Option<K>, Error>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    match api.get(name).await {
        Ok(resource) => Ok(Some(resource)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Trait abstracting Kubernetes client operations for WindowsMachineConfig
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a WindowsMachineConfig by name
    async fn get_machine_config(&self, name: &str) -> Result<Option<WindowsMachineConfig>, Error>;

    /// List the Windows worker nodes currently joined to the cluster
    async fn list_windows_nodes(&self) -> Result<Vec<Node>, Error>;

    /// Replace the status subresource of a WindowsMachineConfig.
    ///
    /// Uses the resourceVersion carried by `config`, so a concurrent writer
    /// surfaces as a 409 conflict.
    async fn update_status(&self, config: &WindowsMachineConfig) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_machine_config(&self, name: &str) -> Result<Option<WindowsMachineConfig>, Error> {
        let api: Api<WindowsMachineConfig> = Api::all(self.client.clone());
        get_optional(&api, name).await
    }

    async fn list_windows_nodes(&self) -> Result<Vec<Node>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let params = ListParams::default().labels(WINDOWS_OS_LABEL);
        let nodes = api.list(&params).await?;
        Ok(nodes.items)
    }

    async fn update_status(&self, config: &WindowsMachineConfig) -> Result<(), Error> {
        let api: Api<WindowsMachineConfig> = Api::all(self.client.clone());
        let name = config.name_any();
        let data = serde_json::to_vec(config)
            .map_err(|e| Error::status(format!("serializing status for {}: {}", name, e)))?;
        api.replace_status(&name, &PostParams::default(), data)
            .await?;
        Ok(())
    }
}

/// Shared context for the WindowsMachineConfig controller
///
/// The context is shared across all reconciliation calls and holds the
/// collaborators that are expensive to create. The cloud provider handle is
/// deliberately *not* cached here: it is constructed per reconcile from the
/// resource spec, so spec changes take effect on the next pass.
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client)
///     .cluster_service_cidr("172.30.0.0/16")
///     .build();
/// ```
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Factory constructing cloud provider handles from the resource spec
    pub cloud: Arc<dyn CloudProviderFactory>,
    /// Factory constructing per-VM node configurators
    pub configurators: Arc<dyn ConfiguratorFactory>,
    /// Durable store for the VM registry
    pub store: Arc<dyn RegistryStore>,
    /// Event publisher for emitting Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
    /// The singleton resource name this controller acts on
    pub expected_name: String,
    /// Cluster service CIDR forwarded opaquely to the node configurator
    pub cluster_service_cidr: String,
    /// Shutdown signal: no new scale actions start once cancelled
    pub shutdown: CancellationToken,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with custom fakes
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        cloud: Arc<dyn CloudProviderFactory>,
        configurators: Arc<dyn ConfiguratorFactory>,
        store: Arc<dyn RegistryStore>,
    ) -> Self {
        Self {
            kube,
            cloud,
            configurators,
            store,
            events: Arc::new(NoopEventPublisher),
            expected_name: EXPECTED_CONFIG_NAME.to_string(),
            cluster_service_cidr: "10.96.0.0/16".to_string(),
            shutdown: CancellationToken::new(),
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeClient>>,
    cloud: Option<Arc<dyn CloudProviderFactory>>,
    configurators: Option<Arc<dyn ConfiguratorFactory>>,
    store: Option<Arc<dyn RegistryStore>>,
    events: Option<Arc<dyn EventPublisher>>,
    expected_name: Option<String>,
    cluster_service_cidr: Option<String>,
    shutdown: Option<CancellationToken>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            cloud: None,
            configurators: None,
            store: None,
            events: None,
            expected_name: None,
            cluster_service_cidr: None,
            shutdown: None,
        }
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the cloud provider factory (primarily for testing)
    pub fn cloud_factory(mut self, cloud: Arc<dyn CloudProviderFactory>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    /// Override the configurator factory (primarily for testing)
    pub fn configurator_factory(mut self, configurators: Arc<dyn ConfiguratorFactory>) -> Self {
        self.configurators = Some(configurators);
        self
    }

    /// Override the registry store (primarily for testing)
    pub fn registry_store(mut self, store: Arc<dyn RegistryStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the event publisher (primarily for testing)
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Set the singleton resource name to reconcile (default: `cluster`)
    pub fn expected_name(mut self, name: impl Into<String>) -> Self {
        self.expected_name = Some(name.into());
        self
    }

    /// Set the cluster service CIDR forwarded to the node configurator
    pub fn cluster_service_cidr(mut self, cidr: impl Into<String>) -> Self {
        self.cluster_service_cidr = Some(cidr.into());
        self
    }

    /// Set the shutdown token cancelled on process termination
    pub fn shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone()))),
            cloud: self
                .cloud
                .unwrap_or_else(|| Arc::new(InstallerCloudFactory::new())),
            configurators: self.configurators.unwrap_or_else(|| {
                Arc::new(BootstrapConfiguratorFactory::new(self.client.clone()))
            }),
            store: self
                .store
                .unwrap_or_else(|| Arc::new(ConfigMapStore::new(self.client.clone()))),
            events: self
                .events
                .unwrap_or_else(|| Arc::new(KubeEventPublisher::new(self.client, CONTROLLER_NAME))),
            expected_name: self
                .expected_name
                .unwrap_or_else(|| EXPECTED_CONFIG_NAME.to_string()),
            cluster_service_cidr: self.cluster_service_cidr.unwrap_or_default(),
            shutdown: self.shutdown.unwrap_or_default(),
        }
    }
}

/// Reconcile a WindowsMachineConfig resource
///
/// One pass: observe the Windows worker count, run the scale plan against
/// the cloud provider, reconcile the VM registry, and publish the resulting
/// condition set. Per-action failures are collected rather than aborting the
/// plan; any collected error is returned at the end so the framework
/// requeues, after status has been published.
#[instrument(
    skip(config, ctx),
    fields(config = %config.name_any(), otel.kind = "internal")
)]
pub async fn reconcile(
    config: Arc<WindowsMachineConfig>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let name = config.name_any();

    // Singleton convention: only the expected resource is acted on
    if name != ctx.expected_name {
        debug!(expected = %ctx.expected_name, "ignoring unexpected WindowsMachineConfig");
        return Ok(Action::await_change());
    }

    let timer = ReconcileTimer::start(&name);
    info!("reconciling windows machines");

    // Re-read through the API: the watch cache can be stale, and the
    // resource may be gone by the time the event is processed. Owned objects
    // are garbage collected externally, so absence is success.
    let Some(config) = ctx.kube.get_machine_config(&name).await? else {
        debug!("resource not found, nothing to do");
        timer.success();
        return Ok(Action::await_change());
    };

    let mut status = StatusPublisher::new(&name);

    // Construct the cloud provider from the spec. Failure here is a
    // configuration bug (missing spec block, unmounted credentials), not a
    // transient error: surface it on the resource and do not requeue, or the
    // controller would storm against a broken spec.
    let cloud = match ctx.cloud.from_spec(&config.spec) {
        Ok(cloud) => cloud,
        Err(e) => {
            error!(error = %e, "could not construct cloud provider");
            ctx.events
                .publish(
                    &config.object_ref(&()),
                    EventType::Warning,
                    reasons::CLOUD_PROVIDER_INVALID,
                    actions::RECONCILE,
                    Some(e.to_string()),
                )
                .await;
            status.set_conditions(vec![Condition::reconciling(false)]);
            status.set_degraded_from(&[e]);
            if let Err(pe) = status.publish(ctx.kube.as_ref()).await {
                error!(error = %pe, "error updating status");
            }
            timer.error(windrose_common::ReasonCode::CloudProviderAPIFailure);
            return Ok(Action::await_change());
        }
    };

    // Observed state: Windows workers currently joined. A list failure is
    // transient and requeues with the error; deciding scale actions against
    // unknown state would be guesswork.
    let nodes = ctx.kube.list_windows_nodes().await?;
    let observed = nodes.len() as u32;
    let desired = config.spec.replicas;

    let mut registry = match VmRegistry::load(ctx.store.clone()).await {
        Ok(registry) => registry,
        Err(e) => {
            error!(error = %e, "could not load vm registry");
            status.set_conditions(vec![Condition::reconciling(false)]);
            status.set_degraded_from(&[Error::tracker(e.to_string())]);
            if let Err(pe) = status.publish(ctx.kube.as_ref()).await {
                error!(error = %pe, "error updating status");
            }
            timer.error(windrose_common::ReasonCode::TrackerFailure);
            return Err(e);
        }
    };

    let mut errs: Vec<Error> = Vec::new();
    let mut added: u32 = 0;
    let mut removed: u32 = 0;

    info!(desired, observed, "windows machine replicas");
    if desired != observed {
        ctx.events
            .publish(
                &config.object_ref(&()),
                EventType::Normal,
                reasons::SCALING_STARTED,
                actions::RECONCILE,
                Some(format!("desired={} observed={}", desired, observed)),
            )
            .await;

        status.set_conditions(vec![Condition::reconciling(true)]);
        if let Err(e) = status.publish(ctx.kube.as_ref()).await {
            errs.push(e);
        }

        for action in plan(desired, observed) {
            // On shutdown let in-flight work finish but start nothing new;
            // the registry flush below still runs.
            if ctx.shutdown.is_cancelled() {
                warn!("shutdown requested, abandoning remaining scale actions");
                break;
            }
            match action {
                ScaleAction::Add => {
                    match add_worker_node(
                        cloud.as_ref(),
                        ctx.configurators.as_ref(),
                        &mut registry,
                        &ctx.cluster_service_cidr,
                    )
                    .await
                    {
                        Ok(node_name) => {
                            added += 1;
                            ctx.events
                                .publish(
                                    &config.object_ref(&()),
                                    EventType::Normal,
                                    reasons::VM_PROVISIONED,
                                    actions::PROVISION,
                                    Some(format!("node {} joined", node_name)),
                                )
                                .await;
                        }
                        Err(e) => {
                            error!(error = %e, "error adding a windows worker node");
                            ctx.events
                                .publish(
                                    &config.object_ref(&()),
                                    EventType::Warning,
                                    reasons::VM_PROVISIONING_FAILED,
                                    actions::PROVISION,
                                    Some(e.to_string()),
                                )
                                .await;
                            errs.push(e);
                        }
                    }
                }
                ScaleAction::Remove => {
                    match remove_worker_node(cloud.as_ref(), &mut registry).await {
                        Ok(instance_id) => {
                            removed += 1;
                            ctx.events
                                .publish(
                                    &config.object_ref(&()),
                                    EventType::Normal,
                                    reasons::VM_REMOVED,
                                    actions::DECOMMISSION,
                                    Some(format!("instance {} removed", instance_id)),
                                )
                                .await;
                        }
                        Err(e) => {
                            error!(error = %e, "error removing a windows worker node");
                            ctx.events
                                .publish(
                                    &config.object_ref(&()),
                                    EventType::Warning,
                                    reasons::VM_REMOVAL_FAILED,
                                    actions::DECOMMISSION,
                                    Some(e.to_string()),
                                )
                                .await;
                            errs.push(e);
                        }
                    }
                }
            }
        }
    }

    // Registry reconciliation runs against a fresh node list so nodes that
    // joined during this pass are seen; the arithmetic count stands in when
    // the re-list fails.
    debug!("starting tracker reconciliation");
    let joined = match ctx.kube.list_windows_nodes().await {
        Ok(fresh) => {
            let count = fresh.len() as u32;
            errs.extend(registry.reconcile(&fresh).await);
            count
        }
        Err(e) => {
            errs.push(Error::tracker(format!("unable to list windows nodes: {}", e)));
            if let Err(fe) = registry.flush().await {
                errs.push(fe);
            }
            (observed + added).saturating_sub(removed)
        }
    };
    debug!("completed tracker reconciliation");
    metrics::record_population(joined, registry.len());

    status.set_joined_vm_count(joined);
    status.set_conditions(vec![Condition::reconciling(false)]);
    status.set_degraded_from(&errs);
    if let Err(e) = status.publish(ctx.kube.as_ref()).await {
        // Status must be published before any reconcile error is returned;
        // a failure here is itself grounds for a retry.
        error!(error = %e, "error updating status");
        errs.push(e);
    }

    if let Some(first) = errs.into_iter().next() {
        timer.error(first.reason());
        return Err(first);
    }

    timer.success();
    Ok(Action::requeue(STEADY_REQUEUE))
}

/// Error policy for the controller
///
/// Called when reconciliation fails; requeues with a short delay. Transient
/// cloud and API failures dominate here, so a flat delay is enough, and
/// configuration-class failures never reach this path (they return success
/// without requeue).
pub fn error_policy(
    config: Arc<WindowsMachineConfig>,
    error: &Error,
    _ctx: Arc<Context>,
) -> Action {
    error!(
        ?error,
        config = %config.name_any(),
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}
