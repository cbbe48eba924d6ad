//! Persistent registry of the VMs this controller owns
//!
//! The registry is the controller's memory across restarts: every VM created
//! through the cloud provider is recorded here, keyed by instance ID, and
//! persisted to a cluster-visible ConfigMap. Writes are compare-and-set via
//! the ConfigMap resourceVersion so a rival controller replica is detected
//! instead of silently overwritten.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Node};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use windrose_common::{Error, REGISTRY_CONFIGMAP, WINDROSE_NAMESPACE};

use crate::vm::{instance_id_from_node, VmRecord, VmState};

/// A loaded registry document: entries plus the store revision they came from
#[derive(Clone, Debug, Default)]
pub struct PersistedRegistry {
    /// Tracked VMs keyed by instance ID
    pub entries: BTreeMap<String, VmRecord>,
    /// Store revision for compare-and-set writes; `None` when the document
    /// does not exist yet
    pub revision: Option<String>,
}

/// Durable storage for the registry document.
///
/// The backing store must provide compare-and-set semantics: `save` with a
/// stale revision fails with `TrackerFailure` rather than clobbering a rival
/// writer's state.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Read the current registry document
    async fn load(&self) -> Result<PersistedRegistry, Error>;

    /// Write the registry document, guarded by the given revision.
    ///
    /// Returns the new revision on success.
    async fn save(
        &self,
        entries: &BTreeMap<String, VmRecord>,
        revision: Option<String>,
    ) -> Result<String, Error>;
}

/// ConfigMap-backed store in the windrose system namespace
pub struct ConfigMapStore {
    client: Client,
}

impl ConfigMapStore {
    /// Create a store using the given Kubernetes client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), WINDROSE_NAMESPACE)
    }
}

#[async_trait]
impl RegistryStore for ConfigMapStore {
    async fn load(&self) -> Result<PersistedRegistry, Error> {
        let cm = match self.api().get_opt(REGISTRY_CONFIGMAP).await {
            Ok(Some(cm)) => cm,
            Ok(None) => return Ok(PersistedRegistry::default()),
            Err(e) => return Err(Error::tracker(format!("loading registry: {}", e))),
        };

        let revision = cm.metadata.resource_version.clone();
        let mut entries = BTreeMap::new();
        for (instance_id, doc) in cm.data.unwrap_or_default() {
            match serde_json::from_str::<VmRecord>(&doc) {
                Ok(record) => {
                    entries.insert(instance_id, record);
                }
                Err(e) => {
                    // Keep the instance tracked as a ghost: losing the entry
                    // would orphan a possibly-live VM, while a ghost is
                    // removable on the next scale-down.
                    warn!(instance = %instance_id, error = %e, "unparseable registry entry, keeping as ghost");
                    entries.insert(
                        instance_id.clone(),
                        VmRecord {
                            instance_id,
                            credentials: None,
                            node_name: None,
                            state: VmState::Ready,
                        },
                    );
                }
            }
        }

        Ok(PersistedRegistry { entries, revision })
    }

    async fn save(
        &self,
        entries: &BTreeMap<String, VmRecord>,
        revision: Option<String>,
    ) -> Result<String, Error> {
        let mut data = BTreeMap::new();
        for (instance_id, record) in entries {
            let doc = serde_json::to_string(record)
                .map_err(|e| Error::tracker(format!("serializing registry entry: {}", e)))?;
            data.insert(instance_id.clone(), doc);
        }

        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(REGISTRY_CONFIGMAP.to_string()),
                namespace: Some(WINDROSE_NAMESPACE.to_string()),
                resource_version: revision.clone(),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };

        let result = if revision.is_some() {
            self.api()
                .replace(REGISTRY_CONFIGMAP, &PostParams::default(), &cm)
                .await
        } else {
            self.api().create(&PostParams::default(), &cm).await
        };

        match result {
            Ok(saved) => Ok(saved.resource_version().unwrap_or_default()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(Error::tracker(
                "registry modified concurrently by another writer",
            )),
            Err(e) => Err(Error::tracker(format!("persisting registry: {}", e))),
        }
    }
}

/// In-memory view of the registry for one reconcile pass
pub struct VmRegistry {
    store: Arc<dyn RegistryStore>,
    entries: BTreeMap<String, VmRecord>,
    revision: Option<String>,
    /// Instance IDs added during this pass; exempt from garbage collection
    /// until a later pass reloads the registry and sees them cold
    session: BTreeSet<String>,
}

impl VmRegistry {
    /// Load the registry from durable storage
    pub async fn load(store: Arc<dyn RegistryStore>) -> Result<Self, Error> {
        let persisted = store.load().await?;
        debug!(entries = persisted.entries.len(), "loaded vm registry");
        Ok(Self {
            store,
            entries: persisted.entries,
            revision: persisted.revision,
            session: BTreeSet::new(),
        })
    }

    /// Insert a record; no-op if the instance ID is already tracked.
    ///
    /// Records without an instance ID cannot be keyed or destroyed later;
    /// they are treated as orphaned-in-creation and forgotten.
    pub fn add(&mut self, record: VmRecord) {
        if record.instance_id.is_empty() {
            warn!("refusing to track a VM without an instance ID");
            return;
        }
        if self.entries.contains_key(&record.instance_id) {
            debug!(instance = %record.instance_id, "vm already tracked");
            return;
        }
        self.session.insert(record.instance_id.clone());
        self.entries.insert(record.instance_id.clone(), record);
    }

    /// Delete a record by instance ID; silent if absent
    pub fn remove(&mut self, instance_id: &str) {
        self.entries.remove(instance_id);
    }

    /// Promote a record to Ready once its node has joined
    pub fn mark_ready(&mut self, instance_id: &str, node_name: &str) {
        if let Some(record) = self.entries.get_mut(instance_id) {
            record.state = VmState::Ready;
            record.node_name = Some(node_name.to_string());
        }
    }

    /// Select a VM for removal: the lexicographically smallest instance ID.
    ///
    /// Deterministic for a fixed registry snapshot so scale-down behavior is
    /// testable; removals within one reconcile observe earlier removals
    /// because each action asks again.
    pub fn choose_victim(&self) -> Option<VmRecord> {
        self.entries.values().next().cloned()
    }

    /// True if the instance ID is tracked
    pub fn contains(&self, instance_id: &str) -> bool {
        self.entries.contains_key(instance_id)
    }

    /// Number of tracked VMs
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no VMs are tracked
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flush in-memory state to durable storage
    pub async fn flush(&mut self) -> Result<(), Error> {
        let revision = self.store.save(&self.entries, self.revision.clone()).await?;
        self.revision = Some(revision);
        Ok(())
    }

    /// Reconcile the registry against the live node list, then flush.
    ///
    /// Three kinds of disagreement are handled:
    /// - A `Configuring` entry whose node has joined is promoted to `Ready`
    ///   (a crash hit between node join and the ready mark).
    /// - Entries whose instance no longer resolves to a cluster node are
    ///   dropped; incomplete (`Configuring`) ones among them are the leaks
    ///   left by failed rollbacks or crashes and are reported as
    ///   `TrackerFailure`.
    /// - Windows nodes with no registry entry indicate external drift and
    ///   are reported as `TrackerFailure` without being adopted.
    ///
    /// Returns every tracker error encountered; the flush happens even when
    /// disagreements were found.
    pub async fn reconcile(&mut self, nodes: &[Node]) -> Vec<Error> {
        let mut errors = Vec::new();

        let mut node_by_instance: BTreeMap<String, &Node> = BTreeMap::new();
        for node in nodes {
            if let Some(id) = instance_id_from_node(node) {
                node_by_instance.insert(id, node);
            }
        }

        // Promote entries whose node joined before a crash could mark them
        let promotions: Vec<(String, String)> = self
            .entries
            .values()
            .filter(|r| r.state == VmState::Configuring)
            .filter_map(|r| {
                node_by_instance
                    .get(&r.instance_id)
                    .map(|n| (r.instance_id.clone(), n.name_any()))
            })
            .collect();
        for (instance_id, node_name) in promotions {
            info!(instance = %instance_id, node = %node_name, "adopting joined node for configuring entry");
            self.mark_ready(&instance_id, &node_name);
        }

        // Drop entries with no backing node. Entries created during this
        // pass are exempt: a leak left by a failed rollback is reported by
        // the next pass, which loads them cold.
        let session = std::mem::take(&mut self.session);
        let mut vanished: Vec<String> = Vec::new();
        let mut reaped: Vec<String> = Vec::new();
        self.entries.retain(|id, record| {
            if node_by_instance.contains_key(id) || session.contains(id) {
                return true;
            }
            match record.state {
                VmState::Ready => vanished.push(id.clone()),
                VmState::Configuring => reaped.push(id.clone()),
            }
            false
        });

        if !vanished.is_empty() {
            info!(instances = ?vanished, "dropping registry entries whose instances vanished");
        }
        if !reaped.is_empty() {
            warn!(instances = ?reaped, "reaped incomplete vm entries");
            errors.push(Error::tracker(format!(
                "reaped incomplete VM entries (possible leaked instances): {}",
                reaped.join(", ")
            )));
        }

        // Windows nodes nobody tracks: external drift, reported not adopted
        let tracked: BTreeSet<&String> = self.entries.keys().collect();
        let drifted: Vec<String> = node_by_instance
            .iter()
            .filter(|(id, _)| !tracked.contains(id))
            .map(|(_, node)| node.name_any())
            .collect();
        if !drifted.is_empty() {
            warn!(nodes = ?drifted, "windows nodes with no registry entry");
            errors.push(Error::tracker(format!(
                "windows nodes with no registry entry: {}",
                drifted.join(", ")
            )));
        }

        if let Err(e) = self.flush().await {
            errors.push(e);
        }

        errors
    }
}
