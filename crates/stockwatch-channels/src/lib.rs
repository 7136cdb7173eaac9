//! # StockWatch Channels
//! Delivery side of the pipeline.
//!
//! - `render`: one structured report, rendered to HTML and plain text
//! - `notifier`: `EmailNotifier`: reports to task recipients, escalations to operators
//! - `email`: `SmtpMailTransport` (async lettre)

pub mod email;
pub mod notifier;
pub mod render;

pub use email::SmtpMailTransport;
pub use notifier::EmailNotifier;
pub use render::ReportContent;
