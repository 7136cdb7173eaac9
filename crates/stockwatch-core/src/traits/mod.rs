//! Collaborator seams. Everything the pipeline talks to sits behind one of these.

pub mod calculator;
pub mod channel;
pub mod mail;
pub mod store;

pub use calculator::Calculator;
pub use channel::{DeliveryResult, NotifyChannel};
pub use mail::MailTransport;
pub use store::TaskStore;
