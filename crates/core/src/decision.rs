//! Pure decision state machine for approval instances.
//!
//! Applies one approve/reject decision to an instance and its ordered steps,
//! enforcing sequence gating, and returns the mutated pair without touching
//! any store. Persistence wraps this in a transaction so a decision and the
//! pointer advance always commit together.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::instance::{ApprovalInstance, InstanceId, InstanceStatus, ResolutionMode};
use crate::domain::step::{Step, StepId, StepStatus};

/// Actor recorded on steps completed by the engine itself (e.g. an optional
/// submission step auto-completed at creation).
pub const SYSTEM_ACTOR: &str = "system";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Approve,
    Reject,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecisionRequest {
    /// Explicit target step; when omitted the step at `current_step` is used.
    pub step_id: Option<StepId>,
    pub actor: String,
    pub action: DecisionAction,
    pub comment: Option<String>,
}

impl DecisionRequest {
    pub fn approve(actor: impl Into<String>) -> Self {
        Self { step_id: None, actor: actor.into(), action: DecisionAction::Approve, comment: None }
    }

    pub fn reject(actor: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            step_id: None,
            actor: actor.into(),
            action: DecisionAction::Reject,
            comment: Some(reason.into()),
        }
    }

    pub fn on_step(mut self, step_id: StepId) -> Self {
        self.step_id = Some(step_id);
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DecisionError {
    #[error("approval instance {instance} is already finalized as {status:?}")]
    AlreadyFinalized { instance: InstanceId, status: InstanceStatus },
    #[error("step {step} not found on instance {instance}")]
    StepNotFound { instance: InstanceId, step: StepId },
    #[error("instance {instance} has no step at current sequence {sequence}")]
    CurrentStepMissing { instance: InstanceId, sequence: u32 },
    #[error("step {step} was already processed ({status:?})")]
    StepAlreadyProcessed { step: StepId, status: StepStatus },
    #[error("cannot approve step {attempted} before step {first_unmet} is completed")]
    SequenceViolation { attempted: u32, first_unmet: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum DecisionOutcomeKind {
    /// A non-final step was approved; the pointer moved to `next_sequence`.
    Advanced { next_sequence: u32 },
    /// The last step was approved; the instance is terminally approved.
    FullyApproved,
    /// Any step was rejected; the instance is terminally rejected.
    Rejected,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DecisionOutcome {
    pub instance: ApprovalInstance,
    pub step: Step,
    pub kind: DecisionOutcomeKind,
}

/// Apply one decision. Pure: the caller persists the returned instance and
/// step (and only those) atomically.
pub fn apply_decision(
    instance: &ApprovalInstance,
    steps: &[Step],
    request: &DecisionRequest,
    decided_at: DateTime<Utc>,
) -> Result<DecisionOutcome, DecisionError> {
    if instance.status.is_terminal() {
        return Err(DecisionError::AlreadyFinalized {
            instance: instance.id.clone(),
            status: instance.status,
        });
    }

    let target = resolve_target(instance, steps, request)?;

    if target.status != StepStatus::Pending {
        return Err(DecisionError::StepAlreadyProcessed {
            step: target.id.clone(),
            status: target.status,
        });
    }

    if request.action == DecisionAction::Approve {
        enforce_sequence(instance, steps, target)?;
    }

    let mut decided = target.clone();
    decided.comments = request.comment.clone();
    decided.decided_by = Some(request.actor.clone());
    decided.decided_at = Some(decided_at);

    let mut updated = instance.clone();
    updated.updated_at = decided_at;

    let kind = match request.action {
        DecisionAction::Reject => {
            decided.status = StepStatus::Rejected;
            updated.status = InstanceStatus::Rejected;
            updated.rejected_by = Some(request.actor.clone());
            updated.rejected_at = Some(decided_at);
            updated.rejection_reason = request.comment.clone();
            DecisionOutcomeKind::Rejected
        }
        DecisionAction::Approve => {
            decided.status = StepStatus::Completed;
            if decided.sequence == updated.total_steps {
                updated.status = InstanceStatus::Approved;
                updated.current_step = updated.total_steps;
                updated.final_approved_by = Some(request.actor.clone());
                updated.final_approved_at = Some(decided_at);
                DecisionOutcomeKind::FullyApproved
            } else {
                updated.current_step = decided.sequence + 1;
                updated.status = InstanceStatus::InProgress;
                DecisionOutcomeKind::Advanced { next_sequence: decided.sequence + 1 }
            }
        }
    };

    Ok(DecisionOutcome { instance: updated, step: decided, kind })
}

fn resolve_target<'a>(
    instance: &ApprovalInstance,
    steps: &'a [Step],
    request: &DecisionRequest,
) -> Result<&'a Step, DecisionError> {
    match &request.step_id {
        Some(step_id) => steps.iter().find(|step| &step.id == step_id).ok_or_else(|| {
            DecisionError::StepNotFound { instance: instance.id.clone(), step: step_id.clone() }
        }),
        None => steps.iter().find(|step| step.sequence == instance.current_step).ok_or(
            DecisionError::CurrentStepMissing {
                instance: instance.id.clone(),
                sequence: instance.current_step,
            },
        ),
    }
}

/// Sequence gating differs by resolver variant, preserved as observed in the
/// two source systems: hierarchy-resolved instances re-check that every prior
/// step is completed; catalog-resolved instances only ever act on the step at
/// `current_step`, which makes out-of-order approval structurally impossible.
fn enforce_sequence(
    instance: &ApprovalInstance,
    steps: &[Step],
    target: &Step,
) -> Result<(), DecisionError> {
    match instance.resolution {
        ResolutionMode::Hierarchy => {
            let first_unmet = steps
                .iter()
                .filter(|step| step.sequence < target.sequence)
                .filter(|step| step.status != StepStatus::Completed)
                .map(|step| step.sequence)
                .min();
            match first_unmet {
                Some(first_unmet) => Err(DecisionError::SequenceViolation {
                    attempted: target.sequence,
                    first_unmet,
                }),
                None => Ok(()),
            }
        }
        ResolutionMode::Catalog => {
            if target.sequence != instance.current_step {
                return Err(DecisionError::SequenceViolation {
                    attempted: target.sequence,
                    first_unmet: instance.current_step,
                });
            }
            Ok(())
        }
    }
}
