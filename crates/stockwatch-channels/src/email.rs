//! SMTP mail transport: async lettre over tokio.
//!
//! Sends multipart/alternative messages (plain text + HTML) through a relay
//! configured with STARTTLS, implicit TLS, or no encryption. Relay replies are
//! mapped onto `TransportFailure` so the retry policy can tell a bad password
//! from a busy server.

use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use stockwatch_core::config::{SmtpConfig, SmtpSecurity};
use stockwatch_core::error::{Result, StockWatchError, TransportFailure};
use stockwatch_core::traits::MailTransport;
use stockwatch_core::types::OutgoingMail;

/// Mail transport backed by an SMTP relay.
pub struct SmtpMailTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    relay: String,
}

impl SmtpMailTransport {
    /// Build the transport. Nothing is contacted until the first send.
    ///
    /// Must be called inside a Tokio runtime: the connection pool spawns its
    /// reaper task on construction.
    pub fn new(config: &SmtpConfig) -> Result<Self> {
        let from: Mailbox = format!("{} <{}>", config.from_name, config.from_address)
            .parse()
            .map_err(|e| StockWatchError::Config(format!("Invalid from address: {e}")))?;

        let builder = match config.security {
            SmtpSecurity::Starttls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                    .map_err(|e| StockWatchError::Config(format!("SMTP relay: {e}")))?
            }
            SmtpSecurity::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|e| StockWatchError::Config(format!("SMTP relay: {e}")))?,
            SmtpSecurity::None => {
                tracing::warn!("⚠️ SMTP relay {} configured without encryption", config.host);
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
            }
        };

        let mut builder = builder.port(config.port);
        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }

        Ok(Self {
            mailer: builder.build(),
            from,
            relay: format!("{}:{}", config.host, config.port),
        })
    }

    fn build_message(&self, mail: &OutgoingMail) -> Result<Message> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(mail.subject.clone());

        for recipient in &mail.to {
            let mailbox: Mailbox = recipient.parse().map_err(|e| {
                StockWatchError::transport(
                    TransportFailure::Rejected,
                    format!("Invalid recipient '{recipient}': {e}"),
                )
            })?;
            builder = builder.to(mailbox);
        }

        builder
            .multipart(MultiPart::alternative_plain_html(
                mail.text_body.clone(),
                mail.html_body.clone(),
            ))
            .map_err(|e| {
                StockWatchError::transport(TransportFailure::Rejected, format!("Build email: {e}"))
            })
    }
}

#[async_trait]
impl MailTransport for SmtpMailTransport {
    async fn send(&self, mail: &OutgoingMail) -> Result<()> {
        let message = self.build_message(mail)?;
        self.mailer
            .send(message)
            .await
            .map_err(|e| classify_smtp_error(&e))?;
        tracing::debug!("📤 Mail '{}' accepted by {}", mail.subject, self.relay);
        Ok(())
    }
}

/// Map a lettre SMTP error onto the transport failure classes.
fn classify_smtp_error(e: &lettre::transport::smtp::Error) -> StockWatchError {
    let code = e.status().map(|c| c.to_string());
    let kind = classify_reply(code.as_deref(), e.is_permanent(), e.is_transient(), e.is_timeout());
    StockWatchError::transport(kind, format!("SMTP send: {e}"))
}

fn classify_reply(
    code: Option<&str>,
    permanent: bool,
    transient: bool,
    timeout: bool,
) -> TransportFailure {
    match code {
        Some("530") | Some("534") | Some("535") => TransportFailure::Authentication,
        _ if timeout => TransportFailure::Connectivity,
        _ if permanent => TransportFailure::Rejected,
        _ if transient => TransportFailure::Throttling,
        _ => TransportFailure::Connectivity,
    }
}
