//! Typed, timestamped status conditions shared by all safespace resources.

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type: validation of the sandbox spec failed.
pub const CONDITION_VALIDATION_FAILED: &str = "ValidationFailed";
/// Condition type: the resource is serving its purpose.
pub const CONDITION_READY: &str = "Ready";
/// Condition type: the backing pod vanished while the sandbox was running.
pub const CONDITION_POD_MISSING: &str = "PodMissing";
/// Condition type: the sandbox outlived its declared timeout.
pub const CONDITION_EXPIRED: &str = "Expired";
/// Condition type: the sandbox never left a transitional phase.
pub const CONDITION_STUCK: &str = "Stuck";

/// One of the three literal condition status strings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// A typed status signal. The containing list is keyed by `type`: setting an
/// existing type overwrites in place, and `lastTransitionTime` refreshes only
/// when the status value actually changed.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
}

/// Set `type_` to the given status, last-writer-wins.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: &str,
) {
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            if existing.status != status {
                existing.last_transition_time = Some(Time(Utc::now()));
            }
            existing.status = status;
            existing.reason = reason.to_string();
            existing.message = message.to_string();
        }
        None => conditions.push(Condition {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: Some(Time(Utc::now())),
        }),
    }
}

/// Look up a condition by type.
pub fn get_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_set_condition_inserts() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            CONDITION_READY,
            ConditionStatus::True,
            "PodReady",
            "backing pod is ready",
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].type_, "Ready");
        assert_eq!(conditions[0].status, ConditionStatus::True);
        assert!(conditions[0].last_transition_time.is_some());
    }

    #[test]
    fn test_set_condition_overwrites_in_place() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, "Ready", ConditionStatus::True, "A", "a");
        set_condition(&mut conditions, "Stuck", ConditionStatus::False, "B", "b");
        set_condition(&mut conditions, "Ready", ConditionStatus::True, "C", "c");
        assert_eq!(conditions.len(), 2);
        let ready = get_condition(&conditions, "Ready").unwrap();
        assert_eq!(ready.reason, "C");
    }

    #[test]
    fn test_transition_time_only_refreshes_on_status_change() {
        let old = Time(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap());
        let mut conditions = vec![Condition {
            type_: "Ready".to_string(),
            status: ConditionStatus::True,
            reason: String::new(),
            message: String::new(),
            last_transition_time: Some(old.clone()),
        }];

        // Same status: timestamp untouched
        set_condition(&mut conditions, "Ready", ConditionStatus::True, "R", "m");
        assert_eq!(conditions[0].last_transition_time, Some(old.clone()));

        // Status flipped: timestamp refreshed
        set_condition(&mut conditions, "Ready", ConditionStatus::False, "R", "m");
        assert_ne!(conditions[0].last_transition_time, Some(old));
    }

    #[test]
    fn test_condition_wire_format() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, "Expired", ConditionStatus::True, "Timeout", "");
        let json = serde_json::to_value(&conditions[0]).unwrap();
        assert_eq!(json["type"], "Expired");
        assert_eq!(json["status"], "True");
        assert_eq!(json["reason"], "Timeout");
        assert!(json.get("message").is_none());
        assert!(json.get("lastTransitionTime").is_some());
    }
}
