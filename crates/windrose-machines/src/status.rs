//! Status publishing for the WindowsMachineConfig resource
//!
//! The publisher accumulates the desired condition set and counters for one
//! reconcile pass and writes them atomically at the end, retrying on
//! conflict with fresh reads. Status failures classify as `StatusFailure`
//! and must never mask the reconcile error that preceded them.

use tracing::debug;

use windrose_common::crd::{merge_conditions, Condition};
use windrose_common::Error;

use crate::controller::KubeClient;

/// Bounded retry-on-conflict attempts for one publish
const MAX_PUBLISH_ATTEMPTS: u32 = 3;

/// Accumulates and writes the resource status for one reconcile pass
pub struct StatusPublisher {
    name: String,
    desired: Vec<Condition>,
    joined_vm_count: Option<u32>,
}

impl StatusPublisher {
    /// Publisher for the named WindowsMachineConfig
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            desired: Vec::new(),
            joined_vm_count: None,
        }
    }

    /// Replace desired conditions by type.
    ///
    /// Timestamps are resolved at publish time against the live resource:
    /// an unchanged `(type, status)` pair keeps its `lastTransitionTime`.
    pub fn set_conditions(&mut self, conditions: Vec<Condition>) {
        for condition in conditions {
            self.desired.retain(|c| c.type_ != condition.type_);
            self.desired.push(condition);
        }
    }

    /// Derive the Degraded condition from the errors a pass collected
    pub fn set_degraded_from(&mut self, errors: &[Error]) {
        self.set_conditions(vec![Condition::degraded_from(errors)]);
    }

    /// Set the joined node counter
    pub fn set_joined_vm_count(&mut self, count: u32) {
        self.joined_vm_count = Some(count);
    }

    /// Write the accumulated status to the API.
    ///
    /// Re-reads the resource before every attempt so a conflicting writer's
    /// changes are merged rather than fought over. A resource that vanished
    /// mid-pass is success: there is nothing left to report on.
    pub async fn publish(&self, kube: &dyn KubeClient) -> Result<(), Error> {
        for attempt in 1..=MAX_PUBLISH_ATTEMPTS {
            let fresh = match kube.get_machine_config(&self.name).await {
                Ok(Some(config)) => config,
                Ok(None) => {
                    debug!(config = %self.name, "resource gone, skipping status update");
                    return Ok(());
                }
                Err(e) => {
                    return Err(Error::status(format!(
                        "reading {} for status update: {}",
                        self.name, e
                    )))
                }
            };

            let mut updated = fresh.clone();
            let mut status = fresh.status.unwrap_or_default();
            status.conditions = merge_conditions(&status.conditions, &self.desired);
            if let Some(count) = self.joined_vm_count {
                status.joined_vm_count = count;
            }
            updated.status = Some(status);

            match kube.update_status(&updated).await {
                Ok(()) => return Ok(()),
                Err(Error::Kube {
                    source: kube::Error::Api(ae),
                }) if ae.code == 409 => {
                    debug!(config = %self.name, attempt, "status update conflict, re-reading");
                }
                Err(e) => {
                    return Err(Error::status(format!(
                        "updating status for {}: {}",
                        self.name, e
                    )))
                }
            }
        }

        Err(Error::status(format!(
            "status update for {} conflicted {} times",
            self.name, MAX_PUBLISH_ATTEMPTS
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use kube::core::ErrorResponse;

    use windrose_common::crd::{
        ConditionStatus, ConditionType, WindowsMachineConfig, WindowsMachineConfigSpec,
        WindowsMachineConfigStatus,
    };
    use windrose_common::ReasonCode;

    use crate::controller::MockKubeClient;

    fn sample_config(name: &str) -> WindowsMachineConfig {
        WindowsMachineConfig::new(
            name,
            WindowsMachineConfigSpec {
                replicas: 2,
                instance_type: "m5a.large".to_string(),
                aws: None,
            },
        )
    }

    fn conflict_error() -> Error {
        Error::Kube {
            source: kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: "conflict".to_string(),
                reason: "Conflict".to_string(),
                code: 409,
            }),
        }
    }

    /// Captured status writes, shared with mock closures
    #[derive(Clone, Default)]
    struct StatusCapture {
        writes: Arc<Mutex<Vec<WindowsMachineConfigStatus>>>,
    }

    impl StatusCapture {
        fn record(&self, config: &WindowsMachineConfig) {
            self.writes
                .lock()
                .unwrap()
                .push(config.status.clone().unwrap_or_default());
        }

        fn last(&self) -> Option<WindowsMachineConfigStatus> {
            self.writes.lock().unwrap().last().cloned()
        }

        fn count(&self) -> usize {
            self.writes.lock().unwrap().len()
        }
    }

    #[tokio::test]
    async fn publish_writes_conditions_and_counter() {
        let capture = StatusCapture::default();
        let capture_clone = capture.clone();

        let mut kube = MockKubeClient::new();
        kube.expect_get_machine_config()
            .returning(|name| Ok(Some(sample_config(name))));
        kube.expect_update_status().returning(move |config| {
            capture_clone.record(config);
            Ok(())
        });

        let mut publisher = StatusPublisher::new("cluster");
        publisher.set_conditions(vec![Condition::reconciling(false)]);
        publisher.set_degraded_from(&[]);
        publisher.set_joined_vm_count(3);

        publisher.publish(&kube).await.expect("publish");

        let status = capture.last().expect("one write");
        assert_eq!(status.joined_vm_count, 3);
        assert_eq!(status.conditions.len(), 2);
        let degraded = status
            .conditions
            .iter()
            .find(|c| c.type_ == ConditionType::Degraded)
            .unwrap();
        assert_eq!(degraded.status, ConditionStatus::False);
        assert_eq!(degraded.reason, None);
    }

    #[tokio::test]
    async fn publish_preserves_timestamp_for_unchanged_status() {
        let existing = Condition::reconciling(false);
        let stamp = existing.last_transition_time;

        let capture = StatusCapture::default();
        let capture_clone = capture.clone();

        let mut kube = MockKubeClient::new();
        kube.expect_get_machine_config().returning(move |name| {
            let mut config = sample_config(name);
            config.status = Some(WindowsMachineConfigStatus {
                conditions: vec![existing.clone()],
                joined_vm_count: 1,
            });
            Ok(Some(config))
        });
        kube.expect_update_status().returning(move |config| {
            capture_clone.record(config);
            Ok(())
        });

        let mut publisher = StatusPublisher::new("cluster");
        publisher.set_conditions(vec![Condition::reconciling(false)]);
        publisher.publish(&kube).await.expect("publish");

        let status = capture.last().unwrap();
        assert_eq!(status.conditions[0].last_transition_time, stamp);
        // Counter untouched when never set
        assert_eq!(status.joined_vm_count, 1);
    }

    #[tokio::test]
    async fn publish_retries_conflicts_with_fresh_reads() {
        let reads = Arc::new(AtomicU32::new(0));
        let reads_clone = reads.clone();
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let mut kube = MockKubeClient::new();
        kube.expect_get_machine_config().returning(move |name| {
            reads_clone.fetch_add(1, Ordering::SeqCst);
            Ok(Some(sample_config(name)))
        });
        kube.expect_update_status().returning(move |_| {
            if attempts_clone.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(conflict_error())
            } else {
                Ok(())
            }
        });

        let mut publisher = StatusPublisher::new("cluster");
        publisher.set_conditions(vec![Condition::reconciling(true)]);
        publisher.publish(&kube).await.expect("publish");

        // One fresh read per attempt
        assert_eq!(reads.load(Ordering::SeqCst), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn publish_gives_up_after_bounded_conflicts() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_machine_config()
            .times(3)
            .returning(|name| Ok(Some(sample_config(name))));
        kube.expect_update_status()
            .times(3)
            .returning(|_| Err(conflict_error()));

        let mut publisher = StatusPublisher::new("cluster");
        publisher.set_conditions(vec![Condition::reconciling(true)]);

        let err = publisher.publish(&kube).await.unwrap_err();
        assert_eq!(err.reason(), ReasonCode::StatusFailure);
        assert!(err.to_string().contains("conflicted 3 times"));
    }

    #[tokio::test]
    async fn publish_on_deleted_resource_is_success() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_machine_config().returning(|_| Ok(None));
        // No update_status expectation: a call would panic the mock

        let mut publisher = StatusPublisher::new("cluster");
        publisher.set_conditions(vec![Condition::reconciling(false)]);
        assert!(publisher.publish(&kube).await.is_ok());
    }

    #[tokio::test]
    async fn non_conflict_update_failure_is_status_failure() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_machine_config()
            .returning(|name| Ok(Some(sample_config(name))));
        kube.expect_update_status()
            .returning(|_| Err(Error::status("boom")));

        let mut publisher = StatusPublisher::new("cluster");
        publisher.set_conditions(vec![Condition::reconciling(false)]);

        let err = publisher.publish(&kube).await.unwrap_err();
        assert_eq!(err.reason(), ReasonCode::StatusFailure);
    }

    #[tokio::test]
    async fn set_conditions_replaces_by_type() {
        let capture = StatusCapture::default();
        let capture_clone = capture.clone();

        let mut kube = MockKubeClient::new();
        kube.expect_get_machine_config()
            .returning(|name| Ok(Some(sample_config(name))));
        kube.expect_update_status().returning(move |config| {
            capture_clone.record(config);
            Ok(())
        });

        let mut publisher = StatusPublisher::new("cluster");
        publisher.set_conditions(vec![Condition::reconciling(true)]);
        publisher.set_conditions(vec![Condition::reconciling(false)]);
        publisher.publish(&kube).await.expect("publish");

        let status = capture.last().unwrap();
        assert_eq!(capture.count(), 1);
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].status, ConditionStatus::False);
    }

    #[tokio::test]
    async fn degraded_from_errors_carries_first_reason() {
        let capture = StatusCapture::default();
        let capture_clone = capture.clone();

        let mut kube = MockKubeClient::new();
        kube.expect_get_machine_config()
            .returning(|name| Ok(Some(sample_config(name))));
        kube.expect_update_status().returning(move |config| {
            capture_clone.record(config);
            Ok(())
        });

        let errors = vec![
            Error::vm_configuration("i-0abc", "bootstrap failed"),
            Error::tracker("drift"),
        ];
        let mut publisher = StatusPublisher::new("cluster");
        publisher.set_degraded_from(&errors);
        publisher.publish(&kube).await.expect("publish");

        let status = capture.last().unwrap();
        let degraded = &status.conditions[0];
        assert_eq!(degraded.status, ConditionStatus::True);
        assert_eq!(degraded.reason, Some(ReasonCode::VMConfigurationFailure));
        assert!(degraded.message.contains("bootstrap failed"));
        assert!(degraded.message.contains("drift"));
    }
}
