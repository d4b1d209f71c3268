use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::step::Step;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "low" => Self::Low,
            "high" => Self::High,
            "urgent" => Self::Urgent,
            _ => Self::Medium,
        }
    }
}

/// Overall status of an approval instance. Pending and InProgress are both
/// "open"; the split exists for reporting only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    InProgress,
    Approved,
    Rejected,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "in_progress" => Self::InProgress,
            "approved" => Self::Approved,
            "rejected" => Self::Rejected,
            _ => Self::Pending,
        }
    }
}

/// Which resolver variant produced the step list. The two variants differ in
/// decision gating: hierarchy-resolved instances re-check that every prior
/// step is completed before an approval, catalog-resolved instances rely on
/// the `current_step` pointer alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMode {
    Catalog,
    Hierarchy,
}

impl ResolutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Catalog => "catalog",
            Self::Hierarchy => "hierarchy",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "hierarchy" => Self::Hierarchy,
            _ => Self::Catalog,
        }
    }
}

/// A single approval-gated business request and its routing state.
///
/// The payload is an opaque snapshot captured at creation; the engine stores
/// and returns it but never inspects it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApprovalInstance {
    pub id: InstanceId,
    pub request_type: String,
    pub reference_type: String,
    pub reference_id: String,
    pub reference_number: Option<String>,
    pub requester_id: String,
    pub priority: Priority,
    pub payload: serde_json::Value,
    pub resolution: ResolutionMode,
    pub status: InstanceStatus,
    pub current_step: u32,
    pub total_steps: u32,
    pub final_approved_by: Option<String>,
    pub final_approved_at: Option<DateTime<Utc>>,
    pub rejected_by: Option<String>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApprovalInstance {
    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Exactly one of {open, approved terminal fields, rejected terminal
    /// fields} must hold.
    pub fn terminal_fields_consistent(&self) -> bool {
        let approved_set = self.final_approved_by.is_some() && self.final_approved_at.is_some();
        let rejected_set = self.rejected_by.is_some() && self.rejected_at.is_some();
        match self.status {
            InstanceStatus::Pending | InstanceStatus::InProgress => !approved_set && !rejected_set,
            InstanceStatus::Approved => approved_set && !rejected_set,
            InstanceStatus::Rejected => rejected_set && !approved_set,
        }
    }
}

/// An instance together with its ordered steps, eagerly loaded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstanceWithSteps {
    pub instance: ApprovalInstance,
    pub steps: Vec<Step>,
}

impl InstanceWithSteps {
    pub fn current_step(&self) -> Option<&Step> {
        self.steps.iter().find(|step| step.sequence == self.instance.current_step)
    }

    pub fn step_by_sequence(&self, sequence: u32) -> Option<&Step> {
        self.steps.iter().find(|step| step.sequence == sequence)
    }
}
