//! Mail transport trait.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::OutgoingMail;

/// Delivers one rendered message in a single attempt.
///
/// Failures are reported as `StockWatchError::Transport` with a
/// `TransportFailure` classification; retrying is the caller's business.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, mail: &OutgoingMail) -> Result<()>;
}
