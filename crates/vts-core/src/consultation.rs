//! Consultation gate
//!
//! Decides whether generation may proceed on its own or needs a human
//! decision first. The gate is a pure state machine; the orchestrator records
//! each transition in the audit chain.
//!
//! ```text
//! NotEvaluated --> Proceeding
//!      |
//!      +--> ConsultationRequired --> Bypassed   (validation mode, bypassable triggers only)
//!                              \--> Resolved   (external decision)
//! ```

use crate::analysis::{AnalysisKind, AnalysisReport};
use crate::error::{GateError, StageFailure, StateMachineError};
use crate::types::{CategorizationResult, Category, CategoryTable};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

/// Unique consultation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConsultationId(pub Ulid);

impl ConsultationId {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ConsultationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConsultationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Gate state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    /// No signals evaluated yet
    NotEvaluated,
    /// No trigger fired; generation may start
    Proceeding,
    /// At least one trigger fired; waiting on bypass or review
    ConsultationRequired,
    /// Suppressed in validation mode, with a compliance note
    Bypassed,
    /// A reviewer approved, rejected or overrode
    Resolved,
}

/// States reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: GateState) -> &'static [GateState] {
    use GateState::{Bypassed, ConsultationRequired, NotEvaluated, Proceeding, Resolved};
    match from {
        NotEvaluated => &[Proceeding, ConsultationRequired],
        ConsultationRequired => &[Bypassed, Resolved],
        Proceeding | Bypassed | Resolved => &[],
    }
}

/// # Errors
/// Returns `IllegalTransition` if `to` is not reachable from `from`
pub fn validate_transition(from: GateState, to: GateState) -> Result<(), StateMachineError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(StateMachineError::illegal("consultation gate", from, to))
    }
}

/// Why a consultation was raised
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsultationReason {
    CategorizationFailure,
    Ambiguous,
    LowConfidence,
    TaskFailure,
}

/// Inputs the gate decides on
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GateSignals {
    pub category: Option<Category>,
    pub confidence: Option<f64>,
    pub categorization_failed: bool,
    /// Whether analysis ran at all
    pub analysis_ran: bool,
    pub tasks_expected: usize,
    pub tasks_succeeded: usize,
    pub failed_tasks: Vec<AnalysisKind>,
}

impl GateSignals {
    /// Collect signals from the stages that ran
    #[must_use]
    pub fn collect(
        categorization: Result<&CategorizationResult, &StageFailure>,
        analysis: Option<&AnalysisReport>,
    ) -> Self {
        let (category, confidence, categorization_failed) = match categorization {
            Ok(result) => (Some(result.category), Some(result.confidence), false),
            Err(_) => (None, None, true),
        };
        let mut signals = Self {
            category,
            confidence,
            categorization_failed,
            ..Self::default()
        };
        if let Some(report) = analysis {
            signals.analysis_ran = true;
            signals.tasks_expected = report.tasks.len();
            signals.tasks_succeeded = report.succeeded_count();
            signals.failed_tasks = report.failed_kinds();
        }
        signals
    }

    fn task_failure(&self) -> bool {
        self.analysis_ran && self.tasks_succeeded < self.tasks_expected
    }
}

/// Human decision on a consultation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Generation may proceed
    Approved,
    /// Generation must not run for this document
    Rejected,
}

/// External answer to a consultation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub requirement_id: ConsultationId,
    pub decision: Decision,
    pub reviewer: String,
    pub rationale: String,
    /// Category the reviewer assigns in place of the model's
    pub category_override: Option<Category>,
    pub resolved_at: DateTime<Utc>,
}

impl Resolution {
    #[must_use]
    pub fn approve(
        requirement_id: ConsultationId,
        reviewer: impl Into<String>,
        rationale: impl Into<String>,
    ) -> Self {
        Self::new(requirement_id, Decision::Approved, reviewer, rationale)
    }

    #[must_use]
    pub fn reject(
        requirement_id: ConsultationId,
        reviewer: impl Into<String>,
        rationale: impl Into<String>,
    ) -> Self {
        Self::new(requirement_id, Decision::Rejected, reviewer, rationale)
    }

    fn new(
        requirement_id: ConsultationId,
        decision: Decision,
        reviewer: impl Into<String>,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            requirement_id,
            decision,
            reviewer: reviewer.into(),
            rationale: rationale.into(),
            category_override: None,
            resolved_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_category_override(mut self, category: Category) -> Self {
        self.category_override = Some(category);
        self
    }
}

/// A raised request for human review
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsultationRequirement {
    pub id: ConsultationId,
    /// Highest-priority trigger
    pub reason: ConsultationReason,
    /// Every trigger that applied, in priority order
    pub triggers: Vec<ConsultationReason>,
    pub category: Option<Category>,
    pub triggering_confidence: Option<f64>,
    pub threshold: Option<f64>,
    pub failed_tasks: Vec<AnalysisKind>,
    /// Whether validation mode may bypass this consultation
    pub bypassable: bool,
    pub bypassed: bool,
    pub bypass_reason: Option<String>,
    pub resolution: Option<Resolution>,
    pub raised_at: DateTime<Utc>,
}

impl ConsultationRequirement {
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.bypassed || self.resolution.is_some()
    }
}

/// The gate for one run
#[derive(Debug, Clone)]
pub struct ConsultationGate {
    thresholds: CategoryTable<f64>,
    state: GateState,
    requirement: Option<ConsultationRequirement>,
}

impl ConsultationGate {
    #[must_use]
    pub fn new(thresholds: CategoryTable<f64>) -> Self {
        Self {
            thresholds,
            state: GateState::NotEvaluated,
            requirement: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn state(&self) -> GateState {
        self.state
    }

    #[must_use]
    pub fn requirement(&self) -> Option<&ConsultationRequirement> {
        self.requirement.as_ref()
    }

    /// Decide between proceeding and raising a consultation
    ///
    /// # Errors
    /// Returns `Transition` if the gate was already evaluated
    pub fn evaluate(&mut self, signals: &GateSignals) -> Result<GateState, GateError> {
        let threshold = signals.category.and_then(|c| self.thresholds.get(c));
        let mut triggers = Vec::new();
        if signals.categorization_failed {
            triggers.push(ConsultationReason::CategorizationFailure);
        }
        if signals.category.is_some_and(|c| c.is_ambiguous()) {
            triggers.push(ConsultationReason::Ambiguous);
        }
        if let (Some(confidence), Some(threshold)) = (signals.confidence, threshold) {
            if confidence < threshold {
                triggers.push(ConsultationReason::LowConfidence);
            }
        }
        if signals.task_failure() {
            triggers.push(ConsultationReason::TaskFailure);
        }

        let to = if triggers.is_empty() {
            GateState::Proceeding
        } else {
            GateState::ConsultationRequired
        };
        validate_transition(self.state, to)?;

        if let Some(&reason) = triggers.first() {
            let bypassable = triggers.iter().all(|t| match t {
                ConsultationReason::LowConfidence => true,
                ConsultationReason::TaskFailure => signals.tasks_succeeded > 0,
                ConsultationReason::Ambiguous | ConsultationReason::CategorizationFailure => false,
            });
            self.requirement = Some(ConsultationRequirement {
                id: ConsultationId::new(),
                reason,
                triggers,
                category: signals.category,
                triggering_confidence: signals.confidence,
                threshold,
                failed_tasks: signals.failed_tasks.clone(),
                bypassable,
                bypassed: false,
                bypass_reason: None,
                resolution: None,
                raised_at: Utc::now(),
            });
        }
        self.state = to;
        Ok(to)
    }

    /// Suppress the open consultation under validation mode
    ///
    /// # Errors
    /// - `Transition` unless a consultation is open
    /// - `BypassNotEnabled` without validation mode
    /// - `NotBypassable` if any trigger forbids bypass
    pub fn bypass(
        &mut self,
        validation_mode: bool,
        reason: impl Into<String>,
    ) -> Result<&ConsultationRequirement, GateError> {
        validate_transition(self.state, GateState::Bypassed)?;
        if !validation_mode {
            return Err(GateError::BypassNotEnabled);
        }
        let requirement = self.requirement.as_mut().ok_or(GateError::NoRequirement)?;
        if !requirement.bypassable {
            return Err(GateError::NotBypassable(format!(
                "triggers {:?} require a human decision",
                requirement.triggers
            )));
        }
        requirement.bypassed = true;
        requirement.bypass_reason = Some(reason.into());
        self.state = GateState::Bypassed;
        Ok(requirement)
    }

    /// Attach a human decision to the open consultation
    ///
    /// # Errors
    /// - `Transition` unless a consultation is open
    /// - `RequirementMismatch` if the resolution answers another consultation
    pub fn resolve(&mut self, resolution: Resolution) -> Result<&ConsultationRequirement, GateError> {
        validate_transition(self.state, GateState::Resolved)?;
        let requirement = self.requirement.as_mut().ok_or(GateError::NoRequirement)?;
        if requirement.id != resolution.requirement_id {
            return Err(GateError::RequirementMismatch);
        }
        requirement.resolution = Some(resolution);
        self.state = GateState::Resolved;
        Ok(requirement)
    }

    /// Whether suite generation may run
    #[must_use]
    pub fn may_generate(&self) -> bool {
        match self.state {
            GateState::Proceeding | GateState::Bypassed => true,
            GateState::Resolved => self
                .requirement
                .as_ref()
                .and_then(|r| r.resolution.as_ref())
                .is_some_and(|r| r.decision == Decision::Approved),
            GateState::NotEvaluated | GateState::ConsultationRequired => false,
        }
    }

    /// Category generation should use, honoring a reviewer override
    #[must_use]
    pub fn effective_category(&self, categorized: Option<Category>) -> Option<Category> {
        self.requirement
            .as_ref()
            .and_then(|r| r.resolution.as_ref())
            .and_then(|r| r.category_override)
            .or(categorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn thresholds() -> CategoryTable<f64> {
        CategoryTable {
            category_1: 0.60,
            category_3: 0.70,
            category_4: 0.85,
            category_5: 0.90,
        }
    }

    fn categorized(category: Category, confidence: f64) -> GateSignals {
        GateSignals {
            category: Some(category),
            confidence: Some(confidence),
            analysis_ran: true,
            tasks_expected: 3,
            tasks_succeeded: 3,
            ..GateSignals::default()
        }
    }

    #[test]
    fn confident_run_proceeds() {
        let mut gate = ConsultationGate::new(thresholds());
        assert_eq!(
            gate.evaluate(&categorized(Category::Four, 0.85)).unwrap(),
            GateState::Proceeding
        );
        assert!(gate.requirement().is_none());
        assert!(gate.may_generate());
    }

    #[test]
    fn low_confidence_requires_consultation() {
        let mut gate = ConsultationGate::new(thresholds());
        let state = gate.evaluate(&categorized(Category::Four, 0.52)).unwrap();
        assert_eq!(state, GateState::ConsultationRequired);

        let requirement = gate.requirement().unwrap();
        assert_eq!(requirement.reason, ConsultationReason::LowConfidence);
        assert_eq!(requirement.threshold, Some(0.85));
        assert_eq!(requirement.triggering_confidence, Some(0.52));
        assert!(requirement.bypassable);
        assert!(!gate.may_generate());
    }

    #[test]
    fn total_task_failure_is_not_bypassable() {
        let mut gate = ConsultationGate::new(thresholds());
        let signals = GateSignals {
            tasks_succeeded: 0,
            failed_tasks: AnalysisKind::ALL.to_vec(),
            ..categorized(Category::Three, 0.95)
        };
        gate.evaluate(&signals).unwrap();
        let requirement = gate.requirement().unwrap();
        assert_eq!(requirement.reason, ConsultationReason::TaskFailure);
        assert_eq!(requirement.failed_tasks.len(), 3);
        assert!(!requirement.bypassable);
        assert!(matches!(
            gate.bypass(true, "validation run"),
            Err(GateError::NotBypassable(_))
        ));
        assert_eq!(gate.state(), GateState::ConsultationRequired);
    }

    #[test]
    fn triggers_are_collected_in_priority_order() {
        let mut gate = ConsultationGate::new(thresholds());
        let signals = GateSignals {
            tasks_succeeded: 2,
            failed_tasks: vec![AnalysisKind::Research],
            ..categorized(Category::Five, 0.4)
        };
        gate.evaluate(&signals).unwrap();
        let requirement = gate.requirement().unwrap();
        assert_eq!(
            requirement.triggers,
            vec![ConsultationReason::LowConfidence, ConsultationReason::TaskFailure]
        );
        assert!(requirement.bypassable);
    }

    #[test]
    fn ambiguous_and_failed_categorization_need_a_human() {
        let mut gate = ConsultationGate::new(thresholds());
        gate.evaluate(&categorized(Category::Ambiguous, 0.99)).unwrap();
        assert_eq!(gate.requirement().unwrap().reason, ConsultationReason::Ambiguous);
        assert!(gate.bypass(true, "x").is_err());

        let mut gate = ConsultationGate::new(thresholds());
        let signals = GateSignals {
            categorization_failed: true,
            ..GateSignals::default()
        };
        gate.evaluate(&signals).unwrap();
        let requirement = gate.requirement().unwrap();
        assert_eq!(requirement.reason, ConsultationReason::CategorizationFailure);
        assert_eq!(requirement.threshold, None);
    }

    #[test]
    fn bypass_requires_validation_mode() {
        let mut gate = ConsultationGate::new(thresholds());
        gate.evaluate(&categorized(Category::Four, 0.52)).unwrap();
        assert_eq!(gate.bypass(false, "x").unwrap_err(), GateError::BypassNotEnabled);

        let requirement = gate.bypass(true, "validation run").unwrap();
        assert!(requirement.bypassed);
        assert_eq!(requirement.bypass_reason.as_deref(), Some("validation run"));
        assert_eq!(gate.state(), GateState::Bypassed);
        assert!(gate.may_generate());
    }

    #[test]
    fn bypass_is_terminal() {
        let mut gate = ConsultationGate::new(thresholds());
        gate.evaluate(&categorized(Category::Four, 0.52)).unwrap();
        let id = gate.requirement().unwrap().id;
        gate.bypass(true, "validation run").unwrap();
        assert!(matches!(
            gate.resolve(Resolution::approve(id, "qa", "late")),
            Err(GateError::Transition(_))
        ));
    }

    #[test]
    fn resolution_must_match_and_decides_generation() {
        let mut gate = ConsultationGate::new(thresholds());
        gate.evaluate(&categorized(Category::Four, 0.52)).unwrap();
        let id = gate.requirement().unwrap().id;

        assert_eq!(
            gate.resolve(Resolution::approve(ConsultationId::new(), "qa", "")).unwrap_err(),
            GateError::RequirementMismatch
        );
        gate.resolve(Resolution::reject(id, "qa.lead", "scope unclear")).unwrap();
        assert_eq!(gate.state(), GateState::Resolved);
        assert!(!gate.may_generate());
    }

    #[test]
    fn override_replaces_model_category() {
        let mut gate = ConsultationGate::new(thresholds());
        gate.evaluate(&categorized(Category::Ambiguous, 0.9)).unwrap();
        let id = gate.requirement().unwrap().id;
        gate.resolve(Resolution::approve(id, "qa", "it is 4").with_category_override(Category::Four))
            .unwrap();
        assert!(gate.may_generate());
        assert_eq!(
            gate.effective_category(Some(Category::Ambiguous)),
            Some(Category::Four)
        );
    }

    #[derive(Debug, Clone)]
    enum Op {
        Evaluate(f64, usize),
        Bypass(bool),
        Resolve,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0.0..=1.0f64, 0usize..=3).prop_map(|(c, s)| Op::Evaluate(c, s)),
            any::<bool>().prop_map(Op::Bypass),
            Just(Op::Resolve),
        ]
    }

    proptest! {
        #[test]
        fn bypass_only_from_consultation_required(ops in prop::collection::vec(op(), 1..8)) {
            let mut gate = ConsultationGate::new(thresholds());
            for op in ops {
                let before = gate.state();
                match op {
                    Op::Evaluate(confidence, succeeded) => {
                        let signals = GateSignals {
                            tasks_succeeded: succeeded,
                            ..categorized(Category::Four, confidence)
                        };
                        let _ = gate.evaluate(&signals);
                    }
                    Op::Bypass(validation_mode) => {
                        let _ = gate.bypass(validation_mode, "prop");
                    }
                    Op::Resolve => {
                        if let Some(id) = gate.requirement().map(|r| r.id) {
                            let _ = gate.resolve(Resolution::approve(id, "prop", ""));
                        }
                    }
                }
                let after = gate.state();
                if after == GateState::Bypassed && before != GateState::Bypassed {
                    prop_assert_eq!(before, GateState::ConsultationRequired);
                }
                if before != after {
                    prop_assert!(allowed_transitions(before).contains(&after));
                }
            }
        }

        #[test]
        fn any_task_failure_blocks_proceeding(confidence in 0.0..=1.0f64, succeeded in 0usize..3) {
            let mut gate = ConsultationGate::new(thresholds());
            let signals = GateSignals {
                tasks_succeeded: succeeded,
                ..categorized(Category::One, confidence)
            };
            prop_assert_eq!(gate.evaluate(&signals).unwrap(), GateState::ConsultationRequired);
        }
    }
}
