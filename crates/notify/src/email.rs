use tera::{Context, Tera};
use tokio::sync::Mutex;
use tracing::info;

use crate::dispatcher::NotifyError;

const REQUEST_SUBJECT: &str = "Approval needed: {{ step_name }} for {{ reference }}";
const REQUEST_BODY: &str = "\
Hello {{ recipient_name }},

{{ requester_name }} submitted {{ reference }} ({{ request_type }}) and it has \
reached the \"{{ step_name }}\" step, which is assigned to you.

Priority: {{ priority }}
{% if comment %}Note from the requester: {{ comment }}
{% endif %}
Please review it in the approvals inbox.
";

const OUTCOME_SUBJECT: &str = "{{ reference }} was {{ outcome }}";
const OUTCOME_BODY: &str = "\
Hello {{ recipient_name }},

Your request {{ reference }} ({{ request_type }}) was {{ outcome }} by {{ decided_by }}.
{% if reason %}
Reason: {{ reason }}
{% endif %}";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub body: String,
}

/// Renders the two approval email shapes from embedded templates.
pub struct EmailTemplateRenderer {
    tera: Tera,
}

impl EmailTemplateRenderer {
    pub fn new() -> Result<Self, NotifyError> {
        let mut tera = Tera::default();
        tera.add_raw_templates(vec![
            ("approval_requested_subject", REQUEST_SUBJECT),
            ("approval_requested_body", REQUEST_BODY),
            ("approval_outcome_subject", OUTCOME_SUBJECT),
            ("approval_outcome_body", OUTCOME_BODY),
        ])?;
        Ok(Self { tera })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn render_request(
        &self,
        recipient_name: &str,
        requester_name: &str,
        reference: &str,
        request_type: &str,
        step_name: &str,
        priority: &str,
        comment: Option<&str>,
    ) -> Result<RenderedEmail, NotifyError> {
        let mut context = Context::new();
        context.insert("recipient_name", recipient_name);
        context.insert("requester_name", requester_name);
        context.insert("reference", reference);
        context.insert("request_type", request_type);
        context.insert("step_name", step_name);
        context.insert("priority", priority);
        context.insert("comment", &comment);

        Ok(RenderedEmail {
            subject: self.tera.render("approval_requested_subject", &context)?,
            body: self.tera.render("approval_requested_body", &context)?,
        })
    }

    pub fn render_outcome(
        &self,
        recipient_name: &str,
        reference: &str,
        request_type: &str,
        outcome: &str,
        decided_by: &str,
        reason: Option<&str>,
    ) -> Result<RenderedEmail, NotifyError> {
        let mut context = Context::new();
        context.insert("recipient_name", recipient_name);
        context.insert("reference", reference);
        context.insert("request_type", request_type);
        context.insert("outcome", outcome);
        context.insert("decided_by", decided_by);
        context.insert("reason", &reason);

        Ok(RenderedEmail {
            subject: self.tera.render("approval_outcome_subject", &context)?,
            body: self.tera.render("approval_outcome_body", &context)?,
        })
    }
}

#[async_trait::async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, to: &str, email: &RenderedEmail) -> Result<(), NotifyError>;
}

/// Default sender: logs instead of talking to an SMTP relay. Real delivery is
/// an operational concern wired in at deployment.
pub struct LoggingEmailSender {
    from_address: String,
}

impl LoggingEmailSender {
    pub fn new(from_address: impl Into<String>) -> Self {
        Self { from_address: from_address.into() }
    }
}

#[async_trait::async_trait]
impl EmailSender for LoggingEmailSender {
    async fn send(&self, to: &str, email: &RenderedEmail) -> Result<(), NotifyError> {
        info!(
            event_name = "email_logged",
            from = %self.from_address,
            to = %to,
            subject = %email.subject,
            "email delivery is disabled; logging instead"
        );
        Ok(())
    }
}

/// Test double that records outgoing mail.
#[derive(Default)]
pub struct InMemoryEmailSender {
    sent: Mutex<Vec<(String, RenderedEmail)>>,
}

impl InMemoryEmailSender {
    pub async fn sent(&self) -> Vec<(String, RenderedEmail)> {
        self.sent.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl EmailSender for InMemoryEmailSender {
    async fn send(&self, to: &str, email: &RenderedEmail) -> Result<(), NotifyError> {
        self.sent.lock().await.push((to.to_string(), email.clone()));
        Ok(())
    }
}
