use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::instance::InstanceId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepId(pub String);

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Completed,
    Rejected,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "completed" => Self::Completed,
            "rejected" => Self::Rejected,
            _ => Self::Pending,
        }
    }
}

/// A step resolves to a role (any active holder may act), a specific user,
/// or both (the user is the preferred recipient, the role the fallback
/// audience for notifications).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignee {
    pub role: Option<String>,
    pub user: Option<String>,
}

impl Assignee {
    pub fn role(role: impl Into<String>) -> Self {
        Self { role: Some(role.into()), user: None }
    }

    pub fn user(user: impl Into<String>) -> Self {
        Self { role: None, user: Some(user.into()) }
    }

    pub fn is_empty(&self) -> bool {
        self.role.is_none() && self.user.is_none()
    }

    pub fn describe(&self) -> String {
        match (&self.user, &self.role) {
            (Some(user), _) => user.clone(),
            (None, Some(role)) => format!("role:{role}"),
            (None, None) => "unassigned".to_string(),
        }
    }
}

/// One ordered decision point inside an approval instance.
///
/// `comments`, `decided_by` and `decided_at` are written exactly once, on the
/// transition out of Pending.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub instance_id: InstanceId,
    pub sequence: u32,
    pub name: String,
    pub assignee: Assignee,
    pub is_required: bool,
    pub status: StepStatus,
    pub comments: Option<String>,
    pub decided_by: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Step {
    pub fn is_pending(&self) -> bool {
        self.status == StepStatus::Pending
    }
}
