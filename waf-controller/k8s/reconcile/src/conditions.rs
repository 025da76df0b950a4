//! Helpers maintaining the three-condition pattern shared by all reconciled
//! resources.
//!
//! Every helper stamps the resource's spec generation into the touched
//! conditions and updates the last-transition-time only when a condition's
//! status actually changes, per the standard condition contract. Each returns
//! whether it changed anything so callers can skip no-op status patches.

use chrono::Utc;
use coraza_waf_controller_k8s_api::{Condition, Time};

pub const READY: &str = "Ready";
pub const PROGRESSING: &str = "Progressing";
pub const DEGRADED: &str = "Degraded";

/// The resource reached its desired state; transitional conditions are
/// removed.
pub fn set_ready(
    conditions: &mut Vec<Condition>,
    generation: Option<i64>,
    reason: &str,
    message: &str,
) -> bool {
    let mut changed = upsert(conditions, READY, true, generation, reason, message);
    changed |= remove(conditions, PROGRESSING);
    changed |= remove(conditions, DEGRADED);
    changed
}

/// The resource is being created or updated. Any Degraded condition is left
/// in place so a previous failure stays visible while the retry runs.
pub fn set_progressing(
    conditions: &mut Vec<Condition>,
    generation: Option<i64>,
    reason: &str,
    message: &str,
) -> bool {
    let mut changed = upsert(conditions, PROGRESSING, true, generation, reason, message);
    changed |= upsert(conditions, READY, false, generation, reason, message);
    changed
}

/// The resource failed to reach or maintain its desired state.
pub fn set_degraded(
    conditions: &mut Vec<Condition>,
    generation: Option<i64>,
    reason: &str,
    message: &str,
) -> bool {
    let mut changed = upsert(conditions, DEGRADED, true, generation, reason, message);
    changed |= upsert(conditions, READY, false, generation, reason, message);
    changed |= remove(conditions, PROGRESSING);
    changed
}

/// Returns the condition of the given type, if present.
pub fn find<'c>(conditions: &'c [Condition], type_: &str) -> Option<&'c Condition> {
    conditions.iter().find(|condition| condition.type_ == type_)
}

fn upsert(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: bool,
    generation: Option<i64>,
    reason: &str,
    message: &str,
) -> bool {
    let status = if status { "True" } else { "False" };
    match conditions.iter_mut().find(|condition| condition.type_ == type_) {
        Some(existing) => {
            let transitioned = existing.status != status;
            if !transitioned
                && existing.reason == reason
                && existing.message == message
                && existing.observed_generation == generation
            {
                return false;
            }
            if transitioned {
                existing.last_transition_time = Time(Utc::now());
            }
            existing.status = status.to_string();
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = generation;
            true
        }
        None => {
            conditions.push(Condition {
                last_transition_time: Time(Utc::now()),
                message: message.to_string(),
                observed_generation: generation,
                reason: reason.to_string(),
                status: status.to_string(),
                type_: type_.to_string(),
            });
            true
        }
    }
}

fn remove(conditions: &mut Vec<Condition>, type_: &str) -> bool {
    let before = conditions.len();
    conditions.retain(|condition| condition.type_ != type_);
    conditions.len() != before
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statuses(conditions: &[Condition]) -> Vec<(&str, &str)> {
        conditions
            .iter()
            .map(|condition| (condition.type_.as_str(), condition.status.as_str()))
            .collect()
    }

    #[test]
    fn ready_clears_progressing_and_degraded() {
        let mut conditions = Vec::new();
        set_progressing(&mut conditions, Some(1), "Reconciling", "starting");
        set_degraded(&mut conditions, Some(1), "ConfigMapNotFound", "missing");

        assert!(set_ready(&mut conditions, Some(1), "RulesCached", "cached"));
        assert_eq!(statuses(&conditions), [(READY, "True")]);
        assert_eq!(conditions[0].reason, "RulesCached");
        assert_eq!(conditions[0].observed_generation, Some(1));
    }

    #[test]
    fn progressing_sets_ready_false_and_keeps_degraded() {
        let mut conditions = Vec::new();
        set_degraded(&mut conditions, Some(1), "ProvisioningFailed", "apply failed");

        assert!(set_progressing(&mut conditions, Some(2), "Reconciling", "retrying"));
        assert!(find(&conditions, DEGRADED).is_some());
        assert_eq!(find(&conditions, READY).unwrap().status, "False");
        assert_eq!(find(&conditions, PROGRESSING).unwrap().status, "True");
    }

    #[test]
    fn degraded_removes_progressing() {
        let mut conditions = Vec::new();
        set_progressing(&mut conditions, Some(1), "Reconciling", "starting");

        assert!(set_degraded(&mut conditions, Some(1), "InvalidConfiguration", "bad kind"));
        assert!(find(&conditions, PROGRESSING).is_none());
        assert_eq!(find(&conditions, DEGRADED).unwrap().status, "True");
        assert_eq!(find(&conditions, READY).unwrap().status, "False");
    }

    #[test]
    fn unchanged_set_reports_no_change() {
        let mut conditions = Vec::new();
        assert!(set_ready(&mut conditions, Some(3), "RulesCached", "cached"));
        assert!(!set_ready(&mut conditions, Some(3), "RulesCached", "cached"));
    }

    #[test]
    fn transition_time_updates_only_on_status_flips() {
        let mut conditions = Vec::new();
        set_ready(&mut conditions, Some(1), "RulesCached", "cached");
        let initial = find(&conditions, READY).unwrap().last_transition_time.clone();

        // Same status with a new generation: metadata refreshes, the
        // transition time does not.
        set_ready(&mut conditions, Some(2), "RulesCached", "cached again");
        let ready = find(&conditions, READY).unwrap();
        assert_eq!(ready.last_transition_time, initial);
        assert_eq!(ready.observed_generation, Some(2));
        assert_eq!(ready.message, "cached again");
    }

    #[test]
    fn generation_is_stamped_on_every_touched_condition() {
        let mut conditions = Vec::new();
        set_degraded(&mut conditions, Some(7), "InvalidConfigMap", "no rules key");
        for condition in &conditions {
            assert_eq!(condition.observed_generation, Some(7));
        }
    }
}
