//! Resend email provider and the transactional templates.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use berth_core::email::{EmailMessage, EmailProvider};
use berth_core::error::{ApiError, ApiResult};

const RESEND_ENDPOINT: &str = "https://api.resend.com/emails";
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Sends transactional mail through the Resend HTTP API.
pub struct ResendEmailProvider {
    api_key: String,
    from: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct ResendRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
    text: &'a str,
}

impl ResendEmailProvider {
    pub fn new(api_key: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            from: from.into(),
            client: reqwest::Client::builder()
                .timeout(SEND_TIMEOUT)
                .build()
                .expect("reqwest client"),
        }
    }
}

#[async_trait]
impl EmailProvider for ResendEmailProvider {
    async fn send(&self, message: EmailMessage) -> ApiResult<()> {
        let body = ResendRequest {
            from: &self.from,
            to: [message.to.as_str()],
            subject: &message.subject,
            html: &message.html,
            text: &message.text,
        };

        let response = self
            .client
            .post(RESEND_ENDPOINT)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ApiError::internal(format!("Email send failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(ApiError::internal(format!(
                "Email provider error: HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}

// --- Templates ---

pub fn verification_email(app_url: &str, name: &str, to: &str, raw_token: &str) -> EmailMessage {
    let link = format!("{}/auth/verify-email?token={}", app_url, raw_token);
    EmailMessage {
        to: to.to_string(),
        subject: "Verify your email address".to_string(),
        html: format!(
            "<p>Hi {},</p>\
             <p>Welcome to Berth. Confirm your email address to finish setting up your account:</p>\
             <p><a href=\"{}\">Verify email</a></p>\
             <p>This link expires in 24 hours. If you didn't create an account, you can ignore this email.</p>",
            name, link
        ),
        text: format!(
            "Hi {},\n\nWelcome to Berth. Confirm your email address to finish setting up your account:\n\n{}\n\nThis link expires in 24 hours. If you didn't create an account, you can ignore this email.",
            name, link
        ),
    }
}

pub fn password_reset_email(app_url: &str, name: &str, to: &str, raw_token: &str) -> EmailMessage {
    let link = format!("{}/auth/reset-password?token={}", app_url, raw_token);
    EmailMessage {
        to: to.to_string(),
        subject: "Reset your password".to_string(),
        html: format!(
            "<p>Hi {},</p>\
             <p>We received a request to reset your password:</p>\
             <p><a href=\"{}\">Reset password</a></p>\
             <p>This link expires in 15 minutes. If you didn't request a reset, you can ignore this email.</p>",
            name, link
        ),
        text: format!(
            "Hi {},\n\nWe received a request to reset your password:\n\n{}\n\nThis link expires in 15 minutes. If you didn't request a reset, you can ignore this email.",
            name, link
        ),
    }
}

pub fn invite_email(app_url: &str, org_name: &str, to: &str, raw_token: &str) -> EmailMessage {
    let link = format!("{}/invites/accept?token={}", app_url, raw_token);
    EmailMessage {
        to: to.to_string(),
        subject: format!("You've been invited to join {} on Berth", org_name),
        html: format!(
            "<p>You've been invited to join <strong>{}</strong> on Berth.</p>\
             <p><a href=\"{}\">Accept invitation</a></p>\
             <p>This invitation expires in 7 days.</p>",
            org_name, link
        ),
        text: format!(
            "You've been invited to join {} on Berth.\n\nAccept the invitation:\n\n{}\n\nThis invitation expires in 7 days.",
            org_name, link
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verification_email_contains_link_with_token() {
        let message = verification_email("https://app.berth.dev", "Ada", "ada@x.io", "rawtok");
        assert_eq!(message.to, "ada@x.io");
        assert!(message.text.contains("https://app.berth.dev/auth/verify-email?token=rawtok"));
        assert!(message.html.contains("rawtok"));
    }

    #[test]
    fn test_reset_email_mentions_expiry() {
        let message = password_reset_email("https://app.berth.dev", "Ada", "ada@x.io", "tok");
        assert!(message.text.contains("15 minutes"));
    }

    #[test]
    fn test_invite_email_names_the_org() {
        let message = invite_email("https://app.berth.dev", "Acme", "dev@x.io", "tok");
        assert!(message.subject.contains("Acme"));
        assert!(message.text.contains("7 days"));
    }
}
