use async_trait::async_trait;

use crate::error::ApiResult;

/// Outbound email message.
#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// Trait for sending emails. Implementations: the Resend provider in the
/// API crate, or [`ConsoleEmailProvider`] for local development.
#[async_trait]
pub trait EmailProvider: Send + Sync {
    async fn send(&self, message: EmailMessage) -> ApiResult<()>;
}

/// Development email provider that logs instead of sending.
pub struct ConsoleEmailProvider;

#[async_trait]
impl EmailProvider for ConsoleEmailProvider {
    async fn send(&self, message: EmailMessage) -> ApiResult<()> {
        tracing::info!(
            to = %message.to,
            subject = %message.subject,
            "email (console provider): {}",
            message.text
        );
        Ok(())
    }
}

/// Test doubles, exposed so downstream crates can assert on sent mail.
pub mod testing {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Records sent messages for assertions.
    pub struct MockEmailProvider {
        pub sent: Arc<Mutex<Vec<EmailMessage>>>,
    }

    impl MockEmailProvider {
        pub fn new() -> (Self, Arc<Mutex<Vec<EmailMessage>>>) {
            let sent = Arc::new(Mutex::new(Vec::new()));
            (Self { sent: sent.clone() }, sent)
        }
    }

    #[async_trait]
    impl EmailProvider for MockEmailProvider {
        async fn send(&self, message: EmailMessage) -> ApiResult<()> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }
    }
}
