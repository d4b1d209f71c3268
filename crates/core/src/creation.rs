use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::catalog::StepTemplate;
use crate::decision::SYSTEM_ACTOR;
use crate::domain::instance::{
    ApprovalInstance, InstanceId, InstanceStatus, InstanceWithSteps, Priority, ResolutionMode,
};
use crate::domain::step::{Step, StepId, StepStatus};

/// Caller-supplied inputs for a new approval instance. The payload is an
/// opaque snapshot owned by the caller; its shape varies by request type.
#[derive(Clone, Debug, PartialEq)]
pub struct NewApprovalInstance {
    pub request_type: String,
    pub reference_type: String,
    pub reference_id: String,
    pub reference_number: Option<String>,
    pub requester_id: String,
    pub requester_zone: Option<String>,
    pub requester_depot: Option<String>,
    pub priority: Priority,
    pub payload: serde_json::Value,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field `{field}`")]
    MissingField { field: &'static str },
    #[error("resolved step chain for `{request_type}` is empty")]
    EmptyChain { request_type: String },
}

/// Build the instance/step pair from resolved templates. Pure: the store
/// persists both in one transaction so partial creation is never observable.
///
/// When the first step is marked not-required it models the requester's own
/// submission: it is completed here with the system actor and the pointer
/// starts at step 2.
pub fn assemble_instance(
    new: &NewApprovalInstance,
    templates: &[StepTemplate],
    resolution: ResolutionMode,
    now: DateTime<Utc>,
) -> Result<InstanceWithSteps, ValidationError> {
    require(&new.requester_id, "requester_id")?;
    require(&new.request_type, "request_type")?;
    require(&new.reference_type, "reference_type")?;
    require(&new.reference_id, "reference_id")?;

    if templates.is_empty() {
        return Err(ValidationError::EmptyChain { request_type: new.request_type.clone() });
    }

    let instance_id = InstanceId(Uuid::new_v4().to_string());
    let total_steps = templates.len() as u32;

    // A lone optional step still needs a decision, otherwise the instance
    // could never be finalized.
    let auto_complete_first = !templates[0].is_required && total_steps > 1;

    let steps: Vec<Step> = templates
        .iter()
        .map(|template| {
            let auto = auto_complete_first && template.sequence == 1;
            Step {
                id: StepId(Uuid::new_v4().to_string()),
                instance_id: instance_id.clone(),
                sequence: template.sequence,
                name: template.name.clone(),
                assignee: template.assignee.clone(),
                is_required: template.is_required,
                status: if auto { StepStatus::Completed } else { StepStatus::Pending },
                comments: None,
                decided_by: auto.then(|| SYSTEM_ACTOR.to_string()),
                decided_at: auto.then_some(now),
                created_at: now,
            }
        })
        .collect();

    let instance = ApprovalInstance {
        id: instance_id,
        request_type: new.request_type.clone(),
        reference_type: new.reference_type.clone(),
        reference_id: new.reference_id.clone(),
        reference_number: new.reference_number.clone(),
        requester_id: new.requester_id.clone(),
        priority: new.priority,
        payload: new.payload.clone(),
        resolution,
        status: InstanceStatus::Pending,
        current_step: if auto_complete_first { 2 } else { 1 },
        total_steps,
        final_approved_by: None,
        final_approved_at: None,
        rejected_by: None,
        rejected_at: None,
        rejection_reason: None,
        active: true,
        created_at: now,
        updated_at: now,
    };

    Ok(InstanceWithSteps { instance, steps })
}

fn require(value: &str, field: &'static str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField { field });
    }
    Ok(())
}
