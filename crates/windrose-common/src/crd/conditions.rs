//! Kubernetes-style conditions for the WindowsMachineConfig status
//!
//! The controller publishes exactly two condition types: `Reconciling` while
//! scale actions are in flight, and `Degraded` when the last pass produced
//! errors. Timestamps follow the Kubernetes convention of only moving when
//! the `(type, status)` pair changes.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, ReasonCode};

/// Condition types published on a WindowsMachineConfig
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionType {
    /// True while scale actions are in flight
    Reconciling,
    /// True if the last reconcile produced any error
    Degraded,
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reconciling => write!(f, "Reconciling"),
            Self::Degraded => write!(f, "Degraded"),
        }
    }
}

/// Status of a condition (True, False, Unknown)
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

/// One entry of the condition set attached to a WindowsMachineConfig
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (Reconciling, Degraded)
    #[serde(rename = "type")]
    pub type_: ConditionType,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason; only set on Degraded=True
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ReasonCode>,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Last time the (type, status) pair transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: ConditionType,
        status: ConditionStatus,
        reason: Option<ReasonCode>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_,
            status,
            reason,
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Reconciling condition with the given truth value
    pub fn reconciling(active: bool) -> Self {
        let status = if active {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        };
        Self::new(ConditionType::Reconciling, status, None, "")
    }

    /// Degraded=True with a specific reason and message
    pub fn degraded(reason: ReasonCode, message: impl Into<String>) -> Self {
        Self::new(ConditionType::Degraded, ConditionStatus::True, Some(reason), message)
    }

    /// Degraded computed from the errors a reconcile pass collected.
    ///
    /// Empty slice means a clean pass: Degraded=False with no reason. Otherwise
    /// the reason comes from the first error and the message concatenates all
    /// of them.
    pub fn degraded_from(errors: &[Error]) -> Self {
        match errors.first() {
            None => Self::new(ConditionType::Degraded, ConditionStatus::False, None, ""),
            Some(first) => {
                let message = errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                Self::degraded(first.reason(), message)
            }
        }
    }
}

/// Merge desired conditions into an existing condition set.
///
/// Conditions are replaced by type. When the `(type, status)` pair is
/// unchanged the existing `lastTransitionTime` is preserved while reason and
/// message are refreshed; a status flip takes the new timestamp. Existing
/// types not present in `desired` are kept untouched.
pub fn merge_conditions(existing: &[Condition], desired: &[Condition]) -> Vec<Condition> {
    let mut merged: Vec<Condition> = Vec::with_capacity(existing.len() + desired.len());

    for current in existing {
        match desired.iter().find(|d| d.type_ == current.type_) {
            Some(update) => {
                let mut next = update.clone();
                if next.status == current.status {
                    next.last_transition_time = current.last_transition_time;
                }
                merged.push(next);
            }
            None => merged.push(current.clone()),
        }
    }

    // Types that never existed before are appended in desired order
    for update in desired {
        if !existing.iter().any(|c| c.type_ == update.type_) {
            merged.push(update.clone());
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(ts: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(ts, 0).unwrap()
    }

    fn reconciling_at(active: bool, ts: i64) -> Condition {
        let mut c = Condition::reconciling(active);
        c.last_transition_time = at(ts);
        c
    }

    #[test]
    fn degraded_from_empty_errors_is_false_with_no_reason() {
        let cond = Condition::degraded_from(&[]);
        assert_eq!(cond.type_, ConditionType::Degraded);
        assert_eq!(cond.status, ConditionStatus::False);
        assert_eq!(cond.reason, None);
        assert!(cond.message.is_empty());
    }

    #[test]
    fn degraded_from_uses_first_reason_and_joins_messages() {
        let errors = vec![
            Error::vm_creation("first failure"),
            Error::vm_termination("i-0abc", "second failure"),
        ];
        let cond = Condition::degraded_from(&errors);
        assert_eq!(cond.status, ConditionStatus::True);
        assert_eq!(cond.reason, Some(ReasonCode::VMCreationFailure));
        assert!(cond.message.contains("first failure"));
        assert!(cond.message.contains("second failure"));
        assert!(cond.message.contains("; "));
    }

    #[test]
    fn merge_preserves_timestamp_when_status_unchanged() {
        let existing = vec![reconciling_at(true, 1000)];
        let desired = vec![Condition::reconciling(true)];

        let merged = merge_conditions(&existing, &desired);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].last_transition_time, at(1000));
    }

    #[test]
    fn merge_bumps_timestamp_on_status_flip() {
        let existing = vec![reconciling_at(true, 1000)];
        let desired = vec![Condition::reconciling(false)];

        let merged = merge_conditions(&existing, &desired);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].status, ConditionStatus::False);
        assert!(merged[0].last_transition_time > at(1000));
    }

    #[test]
    fn merge_replaces_reason_and_message_in_place() {
        let mut stale = Condition::degraded(ReasonCode::VMCreationFailure, "old message");
        stale.last_transition_time = at(500);
        let update = Condition::degraded(ReasonCode::VMCreationFailure, "new message");

        let merged = merge_conditions(&[stale], &[update]);
        assert_eq!(merged[0].message, "new message");
        // Same (type, status): timestamp stays put
        assert_eq!(merged[0].last_transition_time, at(500));
    }

    #[test]
    fn merge_keeps_unrelated_types_and_appends_new_ones() {
        let existing = vec![reconciling_at(false, 2000)];
        let desired = vec![Condition::degraded(ReasonCode::TrackerFailure, "drift")];

        let merged = merge_conditions(&existing, &desired);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].type_, ConditionType::Reconciling);
        assert_eq!(merged[0].last_transition_time, at(2000));
        assert_eq!(merged[1].type_, ConditionType::Degraded);
    }

    #[test]
    fn condition_serializes_with_kubernetes_field_names() {
        let cond = Condition::degraded(ReasonCode::StatusFailure, "conflict");
        let json = serde_json::to_value(&cond).unwrap();
        assert_eq!(json["type"], "Degraded");
        assert_eq!(json["status"], "True");
        assert_eq!(json["reason"], "StatusFailure");
        assert!(json.get("lastTransitionTime").is_some());
    }

    #[test]
    fn reconciling_condition_omits_reason() {
        let json = serde_json::to_value(Condition::reconciling(true)).unwrap();
        assert!(json.get("reason").is_none());
        assert!(json.get("message").is_none());
    }
}
