use std::fmt::Display;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type summarising the outcome of the last reconcile.
pub const TYPE_SYNCED: &str = "Synced";

pub const REASON_RECONCILE_SUCCESS: &str = "ReconcileSuccess";
pub const REASON_RECONCILE_ERROR: &str = "ReconcileError";
pub const REASON_WAITING: &str = "Waiting";

#[derive(Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// A single observation about a resource, keyed by its type.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of the condition, e.g. Synced.
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition: True, False or Unknown.
    pub status: ConditionStatus,

    /// Machine readable reason for the last transition.
    #[serde(default)]
    pub reason: String,

    /// Human readable details about the last transition.
    #[serde(default)]
    pub message: String,

    /// Last time the status of the condition changed.
    #[serde(default)]
    pub last_transition_time: Option<Time>,
}

impl Condition {
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Some(Time(Utc::now())),
        }
    }

    pub fn reconcile_success() -> Self {
        Self::new(
            TYPE_SYNCED,
            ConditionStatus::True,
            REASON_RECONCILE_SUCCESS,
            "",
        )
    }

    pub fn reconcile_error(error: &impl Display) -> Self {
        Self::new(
            TYPE_SYNCED,
            ConditionStatus::False,
            REASON_RECONCILE_ERROR,
            error.to_string(),
        )
    }

    /// Reconcile made progress but has to come back later, e.g. while a
    /// remote identity has no id yet.
    pub fn waiting(message: impl Into<String>) -> Self {
        Self::new(TYPE_SYNCED, ConditionStatus::False, REASON_WAITING, message)
    }

    fn same_observation(&self, other: &Condition) -> bool {
        self.status == other.status && self.reason == other.reason && self.message == other.message
    }
}

/// Ordered set of conditions, at most one per type.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
pub struct ConditionedStatus {
    /// Conditions of the resource.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ConditionedStatus {
    /// Sets the given conditions, replacing any existing condition of the same
    /// type. The transition time is kept when the status does not change.
    pub fn set_conditions(&mut self, conditions: impl IntoIterator<Item = Condition>) {
        for condition in conditions {
            match self
                .conditions
                .iter_mut()
                .find(|existing| existing.type_ == condition.type_)
            {
                Some(existing) if existing.same_observation(&condition) => {}
                Some(existing) if existing.status == condition.status => {
                    existing.reason = condition.reason;
                    existing.message = condition.message;
                }
                Some(existing) => *existing = condition,
                None => self.conditions.push(condition),
            }
        }
    }

    pub fn get_condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|condition| condition.type_ == type_)
    }
}

/// Implemented by status types that embed a [`ConditionedStatus`].
pub trait Conditioned {
    fn conditioned_status(&self) -> &ConditionedStatus;
    fn conditioned_status_mut(&mut self) -> &mut ConditionedStatus;
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn keeps_one_condition_per_type() {
        let mut status = ConditionedStatus::default();
        status.set_conditions([Condition::reconcile_error(&"boom")]);
        status.set_conditions([Condition::reconcile_success()]);

        assert_eq!(status.conditions.len(), 1);
        let synced = status.get_condition(TYPE_SYNCED).unwrap();
        assert_eq!(synced.status, ConditionStatus::True);
        assert_eq!(synced.reason, REASON_RECONCILE_SUCCESS);
    }

    #[test]
    fn unchanged_status_keeps_transition_time() {
        let earlier = Time(Utc::now() - Duration::minutes(5));
        let mut status = ConditionedStatus::default();
        status.set_conditions([Condition {
            last_transition_time: Some(earlier.clone()),
            ..Condition::reconcile_error(&"first")
        }]);

        status.set_conditions([Condition::reconcile_error(&"second")]);

        let synced = status.get_condition(TYPE_SYNCED).unwrap();
        assert_eq!(synced.message, "second");
        assert_eq!(synced.last_transition_time, Some(earlier));
    }

    #[test]
    fn identical_condition_is_a_no_op() {
        let mut status = ConditionedStatus::default();
        status.set_conditions([Condition::reconcile_success()]);
        let before = status.clone();

        status.set_conditions([Condition::reconcile_success()]);

        assert_eq!(status, before);
    }

    #[test]
    fn serializes_type_field() {
        let json = serde_json::to_value(Condition::waiting("waiting for role")).unwrap();
        assert_eq!(json["type"], "Synced");
        assert_eq!(json["status"], "False");
        assert_eq!(json["reason"], "Waiting");
    }
}
