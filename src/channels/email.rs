//! Email channel adapter: polls an IMAP mailbox for unseen messages
//! (`imap`, blocking, run on a dedicated thread) and sends replies over SMTP
//! (`lettre`, async).

use super::traits::{ChannelAdapter, HealthStatus};
use crate::error::{Result, RuntimeTransient, ValidationError};
use crate::{ChannelType, Envelope, InboundEvent, MessagePart, Role};
use lettre::message::Mailbox;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message as SmtpMessage, Tokio1Executor};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct EmailCredentials {
    imap_host: String,
    imap_port: u16,
    smtp_host: String,
    smtp_port: u16,
    username: String,
    password: String,
    from_address: String,
}

pub struct EmailAdapter {
    creds: EmailCredentials,
    self_identity: String,
    connected: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

impl EmailAdapter {
    pub fn new(self_identity: String, credentials: &serde_json::Value) -> Result<Self> {
        let field = |name: &str| -> Result<String> {
            credentials
                .get(name)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| ValidationError::MissingField(format!("credentials.{name}")).into())
        };

        let creds = EmailCredentials {
            imap_host: field("imap_host")?,
            imap_port: credentials.get("imap_port").and_then(|v| v.as_u64()).unwrap_or(993) as u16,
            smtp_host: field("smtp_host")?,
            smtp_port: credentials.get("smtp_port").and_then(|v| v.as_u64()).unwrap_or(587) as u16,
            username: field("username")?,
            password: field("password")?,
            from_address: field("from_address")?,
        };

        Ok(Self {
            creds,
            self_identity,
            connected: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
        })
    }
}

fn poll_mailbox(creds: EmailCredentials, self_identity: String, tx: mpsc::Sender<InboundEvent>, running: Arc<AtomicBool>) -> Result<()> {
    let tls = native_tls::TlsConnector::new().map_err(|e| RuntimeTransient::ChannelThrottled(e.to_string()))?;
    let client = imap::connect((creds.imap_host.as_str(), creds.imap_port), &creds.imap_host, &tls)
        .map_err(|e| RuntimeTransient::ChannelThrottled(e.to_string()))?;
    let mut session = client
        .login(&creds.username, &creds.password)
        .map_err(|(e, _)| RuntimeTransient::ChannelThrottled(e.to_string()))?;

    while running.load(Ordering::SeqCst) {
        session
            .select("INBOX")
            .map_err(|e| RuntimeTransient::ChannelThrottled(e.to_string()))?;

        let unseen = session
            .search("UNSEEN")
            .map_err(|e| RuntimeTransient::ChannelThrottled(e.to_string()))?;

        for uid in unseen {
            let messages = session
                .fetch(uid.to_string(), "RFC822")
                .map_err(|e| RuntimeTransient::ChannelThrottled(e.to_string()))?;
            let Some(raw) = messages.iter().next().and_then(|m| m.body()) else { continue };
            let Ok(parsed) = mailparse::parse_mail(raw) else { continue };

            let from = parsed
                .headers
                .get_first_value("From")
                .unwrap_or_default();
            let message_id = parsed.headers.get_first_value("Message-ID");
            let in_reply_to = parsed.headers.get_first_value("In-Reply-To");
            let subject = parsed.headers.get_first_value("Subject").unwrap_or_default();
            let body = parsed.get_body().unwrap_or_default();

            let event = InboundEvent {
                channel_type: ChannelType::Email,
                external_conversation_id: from.clone(),
                thread_id: None,
                sender_subject: from,
                sender_display_name: None,
                self_subject: self_identity.clone(),
                role: Role::User,
                parts: vec![MessagePart::Text { text: format!("{subject}\n\n{body}") }],
                reply_to_external_id: in_reply_to,
                external_message_id: message_id,
                reaction: None,
            };

            if tx.blocking_send(event).is_err() {
                return Ok(());
            }
        }

        std::thread::sleep(POLL_INTERVAL);
    }
    Ok(())
}

#[async_trait::async_trait]
impl ChannelAdapter for EmailAdapter {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Email
    }

    async fn start(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);

        let creds = self.creds.clone();
        let self_identity = self.self_identity.clone();
        let running = self.running.clone();

        let result = tokio::task::spawn_blocking(move || poll_mailbox(creds, self_identity, tx, running))
            .await
            .map_err(|e| RuntimeTransient::ChannelThrottled(e.to_string()))?;

        self.connected.store(false, Ordering::SeqCst);
        result
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, envelope: &Envelope) -> Result<()> {
        let to: Mailbox = envelope
            .target
            .conversation_id
            .parse()
            .map_err(|_| ValidationError::MalformedEvent("invalid email address".into()))?;
        let from: Mailbox = self
            .creds
            .from_address
            .parse()
            .map_err(|_| ValidationError::MalformedEvent("invalid from address".into()))?;

        let body = envelope
            .blocks
            .iter()
            .filter_map(|part| match part {
                MessagePart::Text { text } => Some(text.as_str()),
                MessagePart::Attachment(_) => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        let mut builder = SmtpMessage::builder().from(from).to(to).subject("Re:");
        if let Some(reply_to) = &envelope.target.reply_to {
            builder = builder.in_reply_to(reply_to.clone());
        }
        let message = builder
            .body(body)
            .map_err(|e| RuntimeTransient::ChannelThrottled(e.to_string()))?;

        let transport: AsyncSmtpTransport<Tokio1Executor> =
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.creds.smtp_host)
                .map_err(|e| RuntimeTransient::ChannelThrottled(e.to_string()))?
                .port(self.creds.smtp_port)
                .credentials(lettre::transport::smtp::authentication::Credentials::new(
                    self.creds.username.clone(),
                    self.creds.password.clone(),
                ))
                .build();

        transport
            .send(message)
            .await
            .map_err(|e| RuntimeTransient::ChannelThrottled(e.to_string()))?;
        Ok(())
    }

    async fn health(&self) -> Result<HealthStatus> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(HealthStatus::Healthy)
        } else {
            Ok(HealthStatus::Down)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_imap_host_is_rejected() {
        let err = EmailAdapter::new(
            "bot1".into(),
            &serde_json::json!({"smtp_host": "smtp.example.com", "username": "u", "password": "p", "from_address": "a@example.com"}),
        );
        assert!(err.is_err());
    }
}
