#![cfg(feature = "web")]
//! Outgoing email
//!
//! Codes and shared reports are rendered from the handlebars templates in
//! `src/templates` and sent over SMTP. Without SMTP settings the server falls
//! back to writing mails to the log, which is only meant for local use.

use handlebars::Handlebars;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde_json::json;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::config::SmtpConfig;
use crate::error::AppError;
use crate::otp::{OtpChallenge, OtpPurpose};

const OTP_TEMPLATE: &str = "otp";
const REPORT_TEMPLATE: &str = "report";
const DEFAULT_FROM: &str = "Glucolog <no-reply@glucolog.local>";

#[derive(Error, Debug)]
pub enum MailError {
    #[error("Invalid email address: {0}")]
    Address(#[from] lettre::address::AddressError),

    #[error("Failed to build message: {0}")]
    Message(#[from] lettre::error::Error),

    #[error("SMTP error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    #[error("Invalid template: {0}")]
    Template(#[from] handlebars::TemplateError),

    #[error("Failed to render template: {0}")]
    Render(#[from] handlebars::RenderError),

    #[error("Invalid attachment type {0:?}")]
    ContentType(String),
}

impl From<MailError> for AppError {
    fn from(err: MailError) -> Self {
        match err {
            MailError::Address(_) => AppError::BadRequest(err.to_string()),
            other => AppError::Mail(other.to_string()),
        }
    }
}

/// A message captured by the in-memory transport
#[derive(Debug, Clone, PartialEq)]
pub struct SentMail {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub attachment: Option<String>,
}

pub type Outbox = Arc<Mutex<Vec<SentMail>>>;

enum Transport {
    Smtp(AsyncSmtpTransport<Tokio1Executor>),
    Log,
    Memory(Outbox),
}

pub struct Mailer {
    transport: Transport,
    templates: Handlebars<'static>,
    from: Mailbox,
}

fn templates() -> Result<Handlebars<'static>, MailError> {
    let mut handlebars = Handlebars::new();
    handlebars.set_strict_mode(true);
    // plain text mails
    handlebars.register_escape_fn(handlebars::no_escape);
    handlebars.register_template_string(OTP_TEMPLATE, include_str!("templates/otp.hbs"))?;
    handlebars.register_template_string(REPORT_TEMPLATE, include_str!("templates/report.hbs"))?;
    Ok(handlebars)
}

impl Mailer {
    fn with_transport(transport: Transport, from: &str) -> Result<Self, MailError> {
        Ok(Mailer {
            transport,
            templates: templates()?,
            from: from.parse()?,
        })
    }

    pub fn smtp(config: &SmtpConfig) -> Result<Self, MailError> {
        let creds = Credentials::new(config.username.clone(), config.password.clone());

        let builder = if config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?
        } else {
            let tls_parameters = TlsParameters::new(config.host.clone())?;
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)?
                .tls(Tls::Wrapper(tls_parameters))
        };
        let smtp = builder.credentials(creds).port(config.port).build();

        log::info!("Sending mail through {}:{}", config.host, config.port);
        Self::with_transport(Transport::Smtp(smtp), &config.from)
    }

    /// Writes every message to the log instead of sending it
    pub fn log_only() -> Result<Self, MailError> {
        Self::with_transport(Transport::Log, DEFAULT_FROM)
    }

    /// Keeps sent messages in memory, returning the shared outbox
    pub fn memory() -> Result<(Self, Outbox), MailError> {
        let outbox = Outbox::default();
        let mailer = Self::with_transport(Transport::Memory(outbox.clone()), DEFAULT_FROM)?;
        Ok((mailer, outbox))
    }

    pub fn from_config(smtp: Option<&SmtpConfig>) -> Result<Self, MailError> {
        match smtp {
            Some(config) => Self::smtp(config),
            None => Self::log_only(),
        }
    }

    pub async fn send_otp(
        &self,
        to: &str,
        username: &str,
        challenge: &OtpChallenge,
        ttl_minutes: i64,
    ) -> Result<(), MailError> {
        let body = self.templates.render(
            OTP_TEMPLATE,
            &json!({
                "username": username,
                "code": challenge.code,
                "minutes": ttl_minutes,
                "reset": challenge.purpose == OtpPurpose::PasswordReset,
            }),
        )?;

        let message = Message::builder()
            .from(self.from.clone())
            .to(to.parse()?)
            .subject(challenge.purpose.subject())
            .header(ContentType::TEXT_PLAIN)
            .body(body.clone())?;

        self.deliver(message, to, challenge.purpose.subject(), body, None)
            .await
    }

    /// Sends an exported report as an attachment
    pub async fn send_report(
        &self,
        to: &str,
        sender: &str,
        note: Option<&str>,
        filename: &str,
        content: Vec<u8>,
        content_type: &str,
    ) -> Result<(), MailError> {
        let subject = format!("{} shared a glucose report", sender);
        let body = self.templates.render(
            REPORT_TEMPLATE,
            &json!({
                "sender": sender,
                "filename": filename,
                "message": note.unwrap_or(""),
            }),
        )?;

        let content_type = ContentType::parse(content_type)
            .map_err(|_| MailError::ContentType(content_type.to_string()))?;
        let attachment = Attachment::new(filename.to_string()).body(content, content_type);

        let message = Message::builder()
            .from(self.from.clone())
            .to(to.parse()?)
            .subject(subject.clone())
            .multipart(
                MultiPart::mixed()
                    .singlepart(SinglePart::plain(body.clone()))
                    .singlepart(attachment),
            )?;

        self.deliver(message, to, &subject, body, Some(filename.to_string()))
            .await
    }

    async fn deliver(
        &self,
        message: Message,
        to: &str,
        subject: &str,
        body: String,
        attachment: Option<String>,
    ) -> Result<(), MailError> {
        match &self.transport {
            Transport::Smtp(smtp) => {
                smtp.send(message).await?;
                log::info!("Sent \"{}\" to {}", subject, to);
            }
            Transport::Log => {
                log::info!("Mail to {} ({}):\n{}", to, subject, body);
            }
            Transport::Memory(outbox) => {
                let mut outbox = outbox.lock().unwrap_or_else(|e| e.into_inner());
                outbox.push(SentMail {
                    to: to.to_string(),
                    subject: subject.to_string(),
                    body,
                    attachment,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::otp::OtpPolicy;
    use chrono::Utc;

    #[tokio::test]
    async fn otp_mail_contains_code() {
        let (mailer, outbox) = Mailer::memory().unwrap();
        let challenge =
            OtpChallenge::issue(OtpPurpose::EmailVerification, Utc::now(), &OtpPolicy::default());

        mailer
            .send_otp("alice@example.com", "alice", &challenge, 10)
            .await
            .unwrap();

        let sent = outbox.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "alice@example.com");
        assert_eq!(sent[0].subject, "Verify your email address");
        assert!(sent[0].body.contains(&challenge.code));
        assert!(sent[0].body.contains("Hello alice,"));
        assert!(sent[0].body.contains("10 minutes"));
        assert!(!sent[0].body.contains("reset the password"));
    }

    #[tokio::test]
    async fn reset_mail_uses_reset_wording() {
        let (mailer, outbox) = Mailer::memory().unwrap();
        let challenge =
            OtpChallenge::issue(OtpPurpose::PasswordReset, Utc::now(), &OtpPolicy::default());

        mailer
            .send_otp("alice@example.com", "alice", &challenge, 15)
            .await
            .unwrap();

        let sent = outbox.lock().unwrap();
        assert_eq!(sent[0].subject, "Password Reset Request");
        assert!(sent[0].body.contains("reset the password"));
    }

    #[tokio::test]
    async fn report_mail_has_attachment() {
        let (mailer, outbox) = Mailer::memory().unwrap();
        mailer
            .send_report(
                "doctor@example.com",
                "alice",
                Some("Numbers from March"),
                "readings.csv",
                b"taken_at,value\n".to_vec(),
                "text/csv",
            )
            .await
            .unwrap();

        let sent = outbox.lock().unwrap();
        assert_eq!(sent[0].attachment.as_deref(), Some("readings.csv"));
        assert!(sent[0].body.contains("Numbers from March"));
    }

    #[tokio::test]
    async fn bad_recipient_is_rejected() {
        let (mailer, outbox) = Mailer::memory().unwrap();
        let challenge =
            OtpChallenge::issue(OtpPurpose::EmailVerification, Utc::now(), &OtpPolicy::default());

        let err = mailer
            .send_otp("not an address", "alice", &challenge, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, MailError::Address(_)));
        assert!(outbox.lock().unwrap().is_empty());
    }
}
