//! Helpers for managing the conditions list on a LuaPolicy status.
//!
//! Conditions are the source of truth; the phase/reason/message fields are
//! derived from them each reconcile for human display.

use crate::crd::{
    CONDITION_READY, Condition, ConditionSeverity, LuaPolicyStatus, PolicyPhase,
};

/// Add or replace a condition of the same type, keeping the previous
/// transition time when the status did not actually change.
pub fn set(status: &mut LuaPolicyStatus, condition: Condition) {
    if let Some(existing) = status
        .conditions
        .iter_mut()
        .find(|c| c.r#type == condition.r#type)
    {
        let transition_time = if existing.status == condition.status {
            existing.last_transition_time.clone()
        } else {
            condition.last_transition_time.clone()
        };
        *existing = condition;
        existing.last_transition_time = transition_time;
    } else {
        status.conditions.push(condition);
    }
}

/// Mark a condition type as true.
pub fn mark_true(status: &mut LuaPolicyStatus, condition_type: &str) {
    set(status, Condition::r#true(condition_type));
}

/// Mark a condition type as false with reason, severity and message.
pub fn mark_false(
    status: &mut LuaPolicyStatus,
    condition_type: &str,
    reason: &str,
    severity: ConditionSeverity,
    message: &str,
) {
    set(
        status,
        Condition::r#false(condition_type, reason, severity, message),
    );
}

/// Remove a condition type entirely.
pub fn delete(status: &mut LuaPolicyStatus, condition_type: &str) {
    status.conditions.retain(|c| c.r#type != condition_type);
}

/// Whether the condition type exists at all.
pub fn has(status: &LuaPolicyStatus, condition_type: &str) -> bool {
    status.conditions.iter().any(|c| c.r#type == condition_type)
}

/// Whether the condition type exists and is true.
pub fn is_true(status: &LuaPolicyStatus, condition_type: &str) -> bool {
    status
        .conditions
        .iter()
        .find(|c| c.r#type == condition_type)
        .is_some_and(Condition::is_true)
}

/// Whether the condition type exists and is false.
pub fn is_false(status: &LuaPolicyStatus, condition_type: &str) -> bool {
    status
        .conditions
        .iter()
        .find(|c| c.r#type == condition_type)
        .is_some_and(|c| c.status == "False")
}

/// Summarize the given condition types into the Ready condition: Ready is
/// true iff every listed condition that is present is true. The first false
/// condition contributes its reason and message.
pub fn set_summary(status: &mut LuaPolicyStatus, condition_types: &[&str]) {
    let mut summary = Condition::r#true(CONDITION_READY);
    for condition_type in condition_types {
        if let Some(c) = status
            .conditions
            .iter()
            .find(|c| c.r#type == *condition_type)
        {
            if !c.is_true() {
                summary = Condition::r#false(
                    CONDITION_READY,
                    &c.reason,
                    c.severity.unwrap_or(ConditionSeverity::Error),
                    &c.message,
                );
                break;
            }
        }
    }
    set(status, summary);
}

/// Derive phase/reason/message from the conditions: the policy is Failed when
/// reconciliation errored or any condition is false with Error severity.
pub fn reconcile_phase(status: &mut LuaPolicyStatus, had_error: bool) {
    status.phase = Some(if had_error {
        PolicyPhase::Failed
    } else {
        PolicyPhase::Synced
    });
    status.reason = String::new();
    status.message = String::new();

    for c in &status.conditions {
        if c.status == "False" && c.severity == Some(ConditionSeverity::Error) {
            status.phase = Some(PolicyPhase::Failed);
            status.reason = c.reason.clone();
            status.message = c.message.clone();
            break;
        }
    }
}
