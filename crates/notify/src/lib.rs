pub mod dispatcher;
pub mod email;

pub use dispatcher::{
    InMemoryNotificationDispatcher, Notification, NotificationDispatcher, NotifyError,
    SqlNotificationDispatcher,
};
pub use email::{
    EmailSender, EmailTemplateRenderer, InMemoryEmailSender, LoggingEmailSender, RenderedEmail,
};
