//! Email notifications for billing events
//!
//! Sends transactional emails via the Resend API. Delivery is best-effort:
//! every `send_*` method reports `Ok(false)` when the email did not go out,
//! so callers never fail a webhook or an account deletion over email.

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use myhealthguide_shared::PlanTag;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// Email configuration
#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// Resend API key
    pub resend_api_key: String,
    /// From address for emails
    pub email_from: String,
    /// App name for branding
    pub app_name: String,
    /// Support email
    pub support_email: String,
    /// Public app URL used for links
    pub dashboard_url: String,
}

impl EmailConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self {
            resend_api_key: std::env::var("RESEND_API_KEY").unwrap_or_default(),
            email_from: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "MyHealth Guide <noreply@myguide.health>".to_string()),
            app_name: std::env::var("APP_NAME").unwrap_or_else(|_| "MyHealth Guide".to_string()),
            support_email: std::env::var("SUPPORT_EMAIL")
                .unwrap_or_else(|_| "support@myguide.health".to_string()),
            dashboard_url: std::env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "https://myguide.health".to_string()),
        }
    }

    /// Check if email sending is enabled
    pub fn is_enabled(&self) -> bool {
        !self.resend_api_key.is_empty()
    }
}

/// Transport for a rendered email
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html: &str) -> BillingResult<()>;
}

/// [`Mailer`] posting to `https://api.resend.com/emails`
pub struct ResendMailer {
    api_key: String,
    from: String,
    client: reqwest::Client,
}

impl ResendMailer {
    pub fn new(config: &EmailConfig) -> Self {
        Self {
            api_key: config.resend_api_key.clone(),
            from: config.email_from.clone(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Mailer for ResendMailer {
    async fn send(&self, to: &str, subject: &str, html: &str) -> BillingResult<()> {
        if self.api_key.is_empty() {
            return Err(BillingError::Config("RESEND_API_KEY not set".to_string()));
        }

        #[allow(clippy::disallowed_methods)]
        // json! macro uses unwrap internally, safe for primitive types
        let body = serde_json::json!({
            "from": self.from,
            "to": [to],
            "subject": subject,
            "html": html
        });

        let response = self
            .client
            .post("https://api.resend.com/emails")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| BillingError::Internal(format!("Resend request failed: {}", e)))?;

        if response.status().is_success() {
            return Ok(());
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(BillingError::Internal(format!(
            "Resend returned {}: {}",
            status, body
        )))
    }
}

/// Billing email notification service
#[derive(Clone)]
pub struct BillingEmailService {
    config: EmailConfig,
    mailer: Arc<dyn Mailer>,
}

impl BillingEmailService {
    /// Create a new email service sending through Resend
    pub fn new(config: EmailConfig) -> Self {
        let mailer = Arc::new(ResendMailer::new(&config));
        Self { config, mailer }
    }

    /// Create with a custom transport
    pub fn with_mailer(config: EmailConfig, mailer: Arc<dyn Mailer>) -> Self {
        Self { config, mailer }
    }

    /// Create from environment variables
    pub fn from_env() -> Self {
        Self::new(EmailConfig::from_env())
    }

    /// Send one email
    ///
    /// Returns `Ok(true)` if the email was sent and `Ok(false)` if it was
    /// skipped or failed. Failures are logged, never propagated.
    async fn send_email(&self, to: &str, subject: &str, html: &str) -> BillingResult<bool> {
        if to.is_empty() {
            tracing::warn!(subject = %subject, "No recipient address, skipping billing email");
            return Ok(false);
        }

        match self.mailer.send(to, subject, html).await {
            Ok(()) => {
                tracing::info!(to = %to, subject = %subject, "Billing email sent");
                Ok(true)
            }
            Err(e) => {
                tracing::error!(
                    to = %to,
                    subject = %subject,
                    error = %e,
                    "Failed to send billing email - non-fatal"
                );
                Ok(false)
            }
        }
    }

    fn layout(&self, heading: &str, heading_color: &str, body: &str) -> String {
        format!(
            r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"></head>
<body style="font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; line-height: 1.6; color: #333; max-width: 600px; margin: 0 auto; padding: 20px;">
    <h2 style="color: {heading_color};">{heading}</h2>
    {body}
    <p style="color: #666; font-size: 14px;">
        Questions? Contact us at <a href="mailto:{support_email}">{support_email}</a>
    </p>
    <hr style="border: none; border-top: 1px solid #eee; margin: 20px 0;">
    <p style="color: #999; font-size: 12px;">{app_name}</p>
</body>
</html>"#,
            heading_color = heading_color,
            heading = heading,
            body = body,
            support_email = self.config.support_email,
            app_name = self.config.app_name,
        )
    }

    fn button(&self, href: &str, label: &str) -> String {
        format!(
            r#"<p>
        <a href="{href}" style="display: inline-block; padding: 12px 24px; background-color: #2563eb; color: white; text-decoration: none; border-radius: 6px; font-weight: bold;">
            {label}
        </a>
    </p>"#,
            href = href,
            label = label,
        )
    }

    /// Send subscription cancelled confirmation
    pub async fn send_subscription_cancelled(
        &self,
        to: &str,
        name: Option<&str>,
        plan: Option<PlanTag>,
    ) -> BillingResult<bool> {
        let resubscribe_link = format!("{}/pricing", self.config.dashboard_url);
        let body = format!(
            r#"<p>Hi {greeting},</p>
    <p>Your <strong>{plan}</strong> subscription has been cancelled and your account no longer has paid access.</p>
    <p>Your care records stay in place. You can resubscribe at any time to pick up where you left off.</p>
    {button}"#,
            greeting = greeting(name),
            plan = plan_display(plan),
            button = self.button(&resubscribe_link, "Resubscribe"),
        );

        self.send_email(
            to,
            &format!("Subscription Cancelled - {}", self.config.app_name),
            &self.layout("Subscription Cancelled", "#333", &body),
        )
        .await
    }

    /// Send trial ending notification
    pub async fn send_trial_ending(
        &self,
        to: &str,
        name: Option<&str>,
        plan: Option<PlanTag>,
        trial_end: Option<OffsetDateTime>,
    ) -> BillingResult<bool> {
        let billing_link = format!("{}/dashboard/settings?tab=subscription", self.config.dashboard_url);
        let days_remaining = trial_end
            .map(|end| (end - OffsetDateTime::now_utc()).whole_days().max(0))
            .unwrap_or(3);

        let body = format!(
            r#"<p>Hi {greeting},</p>
    <p>Your <strong>{plan}</strong> trial will end in <strong>{days_remaining} day{s}</strong>.</p>
    <p>Your subscription starts automatically when the trial ends. You can review or change your plan before then.</p>
    {button}"#,
            greeting = greeting(name),
            plan = plan_display(plan),
            days_remaining = days_remaining,
            s = if days_remaining == 1 { "" } else { "s" },
            button = self.button(&billing_link, "Manage Subscription"),
        );

        self.send_email(
            to,
            &format!("Your Trial is Ending Soon - {}", self.config.app_name),
            &self.layout("Your Trial is Ending Soon", "#f59e0b", &body),
        )
        .await
    }

    /// Send account deletion confirmation
    pub async fn send_account_deleted(&self, to: &str, name: Option<&str>) -> BillingResult<bool> {
        let body = format!(
            r#"<p>Hi {greeting},</p>
    <p>Your {app_name} account has been deleted and any active subscription was cancelled. You will not be charged again.</p>
    <p>If you did not request this, reply to this email right away.</p>"#,
            greeting = greeting(name),
            app_name = self.config.app_name,
        );

        self.send_email(
            to,
            &format!("Your Account Has Been Deleted - {}", self.config.app_name),
            &self.layout("Account Deleted", "#333", &body),
        )
        .await
    }
}

/// Salutation for `name`, escaped for HTML
fn greeting(name: Option<&str>) -> Cow<'_, str> {
    match name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => html_escape::encode_text(name),
        None => Cow::Borrowed("there"),
    }
}

fn plan_display(plan: Option<PlanTag>) -> &'static str {
    match plan {
        Some(PlanTag::Family) => "Family",
        Some(PlanTag::SingleAgency) => "Single Agency",
        Some(PlanTag::MultiAgency) => "Multi Agency",
        None => "MyHealth Guide",
    }
}
