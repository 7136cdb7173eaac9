//! E-mail notifier: task reports and operator escalations.
//!
//! - `send_report` is gated by the global `notifications.enabled` switch.
//!   When off it returns `DeliveryResult::Disabled` without touching the
//!   transport; that is a configuration no-op, not a failure.
//! - Every transport call goes through the mail `RetryPolicy` with a
//!   per-attempt deadline.
//! - A report that terminally fails is escalated with `send_admin`.
//! - `send_admin` always runs (it reports system health) and its own failures
//!   are only logged, never escalated again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stockwatch_core::config::NotificationsConfig;
use stockwatch_core::error::StockWatchError;
use stockwatch_core::retry::{RetryPolicy, TerminalError, TerminalKind};
use stockwatch_core::traits::{DeliveryResult, MailTransport, NotifyChannel};
use stockwatch_core::types::{NotificationRequest, OutgoingMail};
use tokio_util::sync::CancellationToken;

use crate::render::{ReportContent, escape_html};

/// Notifier that delivers through a `MailTransport`.
pub struct EmailNotifier {
    transport: Arc<dyn MailTransport>,
    settings: NotificationsConfig,
    retry: RetryPolicy,
    send_timeout: Duration,
    shutdown: CancellationToken,
}

impl EmailNotifier {
    pub fn new(
        transport: Arc<dyn MailTransport>,
        settings: NotificationsConfig,
        retry: RetryPolicy,
        send_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            settings,
            retry,
            send_timeout,
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop retry loops when this token is cancelled.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Render and deliver a report to `recipients`.
    pub async fn send_report(
        &self,
        recipients: &[String],
        subject: &str,
        content: &ReportContent,
    ) -> DeliveryResult {
        if !self.settings.enabled {
            tracing::info!(
                "🔕 Notifications disabled in config, report '{subject}' not sent ({} recipient(s))",
                recipients.len()
            );
            return DeliveryResult::Disabled;
        }

        let mail = OutgoingMail {
            to: recipients.to_vec(),
            subject: subject.to_string(),
            html_body: content.render_html(),
            text_body: content.render_text(),
        };

        match self.deliver("report mail", &mail).await {
            Ok(()) => {
                tracing::info!("📤 Report '{subject}' sent to {} recipient(s)", recipients.len());
                DeliveryResult::Sent
            }
            Err(failure) => {
                let reason = failure.to_string();
                if failure.kind == TerminalKind::Cancelled {
                    tracing::warn!("🛑 Report '{subject}' abandoned by shutdown: {reason}");
                    return DeliveryResult::Failed(reason);
                }
                tracing::error!("❌ Report '{subject}' could not be delivered: {reason}");

                let details = format!(
                    "A report e-mail could not be delivered.\n\n\
                     Subject: {subject}\n\
                     Recipients: {}\n\
                     Outcome: {}\n\
                     Cause: {}",
                    recipients.join(", "),
                    outcome_wording(&failure),
                    failure.last_error
                );
                self.send_admin(&format!("Report delivery failed: {subject}"), &details)
                    .await;
                DeliveryResult::Failed(reason)
            }
        }
    }

    /// Deliver an escalation to the configured operator recipients.
    pub async fn send_admin(&self, subject: &str, details: &str) -> DeliveryResult {
        if self.settings.admin_recipients.is_empty() {
            tracing::error!("🚨 No operator recipients configured, escalation dropped: {subject}: {details}");
            return DeliveryResult::Failed("no operator recipients configured".into());
        }

        let full_subject = format!("{} [ADMIN] {subject}", self.settings.subject_prefix);
        let mail = OutgoingMail {
            to: self.settings.admin_recipients.clone(),
            subject: full_subject.clone(),
            html_body: format!(
                "<!DOCTYPE html>\n<html><body>\n<h2>{}</h2>\n<pre>{}</pre>\n</body></html>\n",
                escape_html(subject),
                escape_html(details)
            ),
            text_body: format!("{subject}\n\n{details}\n"),
        };

        match self.deliver("admin mail", &mail).await {
            Ok(()) => {
                tracing::warn!("🚨 Operator escalation sent: {subject}");
                DeliveryResult::Sent
            }
            Err(failure) => {
                // Terminal sink: log only.
                tracing::error!(
                    "❌ Operator escalation '{full_subject}' failed ({}): {}. Original details: {details}",
                    outcome_wording(&failure),
                    failure.last_error
                );
                DeliveryResult::Failed(failure.to_string())
            }
        }
    }

    async fn deliver(
        &self,
        label: &str,
        mail: &OutgoingMail,
    ) -> Result<(), TerminalError<StockWatchError>> {
        let transport = &self.transport;
        let deadline = self.send_timeout;
        self.retry
            .execute(
                label,
                |_| async move {
                    match tokio::time::timeout(deadline, transport.send(mail)).await {
                        Ok(result) => result,
                        Err(_) => Err(StockWatchError::Timeout(format!(
                            "mail transport did not answer within {deadline:?}"
                        ))),
                    }
                },
                StockWatchError::is_transient,
                &self.shutdown,
            )
            .await
    }

    fn report_subject(&self, request: &NotificationRequest) -> String {
        let summary = &request.result.summary;
        let headline = match (summary.items_in_shortage, summary.critical_items) {
            (0, 0) => "all items available".to_string(),
            (shortage, 0) => format!("{shortage} item(s) in shortage"),
            (shortage, critical) => {
                format!("{shortage} item(s) in shortage, {critical} critical")
            }
        };
        format!("{} {}: {headline}", self.settings.subject_prefix, request.task.name)
    }
}

fn outcome_wording(failure: &TerminalError<StockWatchError>) -> String {
    match failure.kind {
        TerminalKind::ExhaustedRetries => {
            format!("retries exhausted after {} attempts", failure.attempts)
        }
        TerminalKind::NonRetryable => "non-retryable error".to_string(),
        TerminalKind::Cancelled => {
            format!("cancelled by shutdown after {} attempts", failure.attempts)
        }
    }
}

#[async_trait]
impl NotifyChannel for EmailNotifier {
    fn name(&self) -> &str {
        "email"
    }

    async fn deliver_report(&self, request: &NotificationRequest) -> DeliveryResult {
        let content = ReportContent::from_request(request);
        let subject = self.report_subject(request);
        self.send_report(&request.task.recipients, &subject, &content)
            .await
    }

    async fn deliver_admin(&self, subject: &str, details: &str) -> DeliveryResult {
        self.send_admin(subject, details).await
    }
}
