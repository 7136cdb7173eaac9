//! Notification channel capability.

use async_trait::async_trait;

use crate::types::NotificationRequest;

/// Outcome of a delivery attempt (after the channel's own retries).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    /// Handed to the transport successfully.
    Sent,
    /// Notifications are switched off in configuration. Nothing was contacted.
    Disabled,
    /// Delivery terminally failed.
    Failed(String),
}

impl DeliveryResult {
    pub fn is_sent(&self) -> bool {
        matches!(self, DeliveryResult::Sent)
    }
}

/// A way of reaching people: task recipients for reports, operators for
/// escalations. The executor holds a list of these and fans out to each.
#[async_trait]
pub trait NotifyChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver a task report to the task's recipients.
    async fn deliver_report(&self, request: &NotificationRequest) -> DeliveryResult;

    /// Deliver a system-health escalation to the operator recipients.
    /// Implementations must never escalate their own failures further.
    async fn deliver_admin(&self, subject: &str, details: &str) -> DeliveryResult;
}
