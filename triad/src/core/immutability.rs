//! Plan immutability checks.

use crate::core::types::InnerState;

/// Upper bound on remediation steps a run may insert beyond its initial plan.
pub const MAX_REMEDIATION_STEPS: usize = 3;

/// Validate that the plan in `next` respects the plan fixed in `prev`.
///
/// Once `prev.initial_plan` is set this enforces:
/// - `initialPlan` is unchanged.
/// - `steps` keeps every previous step in order. The only allowed edit is one
///   remediation step inserted directly after `current_step`, bounded by
///   [`MAX_REMEDIATION_STEPS`] over the whole run.
///
/// Returns a list of stable error messages (empty when compliant).
pub fn check_plan_immutability(prev: &InnerState, next: &InnerState, current_step: usize) -> Vec<String> {
    let mut errors = Vec::new();
    if prev.initial_plan.is_empty() {
        return errors;
    }

    if next.initial_plan != prev.initial_plan {
        errors.push("initial plan changed after planning".to_string());
    }

    if next.steps == prev.steps {
        return errors;
    }
    if is_remediation_insert(&prev.steps, &next.steps, current_step)
        && next.steps.len() <= prev.initial_plan.len() + MAX_REMEDIATION_STEPS
    {
        return errors;
    }
    if next.steps.len() < prev.steps.len() {
        errors.push(format!(
            "steps removed: {} -> {}",
            prev.steps.len(),
            next.steps.len()
        ));
    } else {
        errors.push("steps reordered or rewritten after planning".to_string());
    }
    errors
}

/// True if `next` equals `prev` with exactly one step inserted at index `at`.
fn is_remediation_insert(prev: &[String], next: &[String], at: usize) -> bool {
    if next.len() != prev.len() + 1 || at > prev.len() || at == 0 {
        return false;
    }
    next[..at] == prev[..at] && next[at + 1..] == prev[at..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planned(steps: &[&str]) -> InnerState {
        let steps: Vec<String> = steps.iter().map(|s| s.to_string()).collect();
        InnerState {
            steps: steps.clone(),
            initial_plan: steps,
            ..InnerState::default()
        }
    }

    /// Identical plans produce no errors.
    #[test]
    fn immutability_allows_identical_plan() {
        let prev = planned(&["a", "b", "c"]);
        assert!(check_plan_immutability(&prev, &prev.clone(), 2).is_empty());
    }

    /// Planning turns are never constrained.
    #[test]
    fn immutability_ignores_planning_phase() {
        let prev = InnerState::default();
        let next = planned(&["a"]);
        assert!(check_plan_immutability(&prev, &next, 0).is_empty());
    }

    /// Editing the initial plan is reported.
    #[test]
    fn immutability_reports_initial_plan_change() {
        let prev = planned(&["a", "b"]);
        let mut next = prev.clone();
        next.initial_plan[0] = "z".to_string();
        let errors = check_plan_immutability(&prev, &next, 1);
        assert!(errors.iter().any(|err| err.contains("initial plan")));
    }

    /// Removing a step is reported.
    #[test]
    fn immutability_reports_removed_steps() {
        let prev = planned(&["a", "b", "c"]);
        let mut next = prev.clone();
        next.steps.pop();
        let errors = check_plan_immutability(&prev, &next, 1);
        assert!(errors.iter().any(|err| err.contains("removed")));
    }

    /// Reordering steps is reported.
    #[test]
    fn immutability_reports_reordered_steps() {
        let prev = planned(&["a", "b", "c"]);
        let mut next = prev.clone();
        next.steps.swap(0, 2);
        let errors = check_plan_immutability(&prev, &next, 1);
        assert!(errors.iter().any(|err| err.contains("reordered")));
    }

    /// One remediation step right after the current step is accepted.
    #[test]
    fn immutability_allows_remediation_after_current_step() {
        let prev = planned(&["a", "b", "c"]);
        let mut next = prev.clone();
        next.steps.insert(2, "fix b".to_string());
        assert!(check_plan_immutability(&prev, &next, 2).is_empty());

        let mut misplaced = prev.clone();
        misplaced.steps.insert(0, "fix".to_string());
        assert!(!check_plan_immutability(&prev, &misplaced, 2).is_empty());
    }

    /// Remediation inserts stop once the bound is reached.
    #[test]
    fn immutability_bounds_remediation_steps() {
        let mut prev = planned(&["a", "b"]);
        for i in 0..MAX_REMEDIATION_STEPS {
            prev.steps.insert(1, format!("fix {i}"));
        }
        let mut next = prev.clone();
        next.steps.insert(1, "one more".to_string());
        assert!(!check_plan_immutability(&prev, &next, 1).is_empty());
    }
}
