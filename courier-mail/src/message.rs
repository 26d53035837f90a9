//! The outgoing message builder.
//!
//! The builder is sticky on error: the first invalid input records an error
//! and every later mutation becomes a no-op. Call sites stay linear and the
//! failure surfaces once, at send time. This mirrors how the dispatcher
//! builds a message from an already-validated request in one straight pass.

use std::fmt;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};

use crate::attachment::{Attachment, ResolvedAttachment};
use crate::dkim::MessageSigner;
use crate::encoding::dot_stuff;
use crate::error::MailError;
use crate::mime;
use crate::request::BodyPart;
use courier_smtp::{DsnRequest, SmtpSession};

/// A parsed, display-name-carrying mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    pub display: Option<String>,
    pub address: String,
}

impl Mailbox {
    /// Strict single-mailbox parsing: exactly one non-group address with a
    /// local part and a domain.
    fn parse(header: &'static str, input: &str) -> Result<Self, MailError> {
        let invalid = |reason: String| MailError::InvalidAddress {
            header,
            address: input.to_string(),
            reason,
        };

        let list = mailparse::addrparse(input).map_err(|err| invalid(err.to_string()))?;
        if list.len() != 1 {
            return Err(invalid("expected exactly one mailbox".to_string()));
        }
        let single = match &list[0] {
            mailparse::MailAddr::Single(single) => single,
            mailparse::MailAddr::Group(_) => {
                return Err(invalid("group addresses are not allowed".to_string()));
            }
        };
        match single.addr.split_once('@') {
            Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {}
            _ => return Err(invalid("missing local part or domain".to_string())),
        }

        Ok(Self {
            display: single.display_name.clone().filter(|name| !name.is_empty()),
            address: single.addr.clone(),
        })
    }

    /// The domain half of the address.
    #[must_use]
    pub fn domain(&self) -> &str {
        self.address
            .split_once('@')
            .map_or("localhost", |(_, domain)| domain)
    }
}

impl fmt::Display for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.display {
            Some(display) => {
                write!(f, "\"{}\" <{}>", display.replace('"', "\\\""), self.address)
            }
            None => f.write_str(&self.address),
        }
    }
}

/// The configured single-sender identity every outgoing message starts
/// from: From display name and address, X-Errors-To, and the bounce
/// return path.
#[derive(Debug, Clone)]
pub struct SenderProfile {
    pub display_name: String,
    pub address: String,
    pub errors_to: String,
    pub return_path: String,
}

impl SenderProfile {
    #[must_use]
    pub fn new(
        display_name: impl Into<String>,
        address: impl Into<String>,
        errors_to: impl Into<String>,
        return_path: impl Into<String>,
    ) -> Self {
        Self {
            display_name: display_name.into(),
            address: address.into(),
            errors_to: errors_to.into(),
            return_path: return_path.into(),
        }
    }

    /// Start a message stamped with this profile.
    #[must_use]
    pub fn message(&self) -> MailMessage {
        let mut message = MailMessage::new();
        if self.display_name.is_empty() {
            message.set_from(&self.address);
        } else {
            message.set_from(&format!("\"{}\" <{}>", self.display_name, self.address));
        }
        if !self.errors_to.is_empty() {
            message.add_header("X-Errors-To", &self.errors_to);
        }
        if !self.return_path.is_empty() {
            message.set_return_path(&self.return_path);
        }
        message
    }
}

/// Message priority, mapped onto the conventional header trio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Low,
    High,
}

/// An outgoing mail message.
#[derive(Default)]
pub struct MailMessage {
    pub(crate) from: Option<Mailbox>,
    pub(crate) sender: Option<Mailbox>,
    pub(crate) reply_to: Option<Mailbox>,
    pub(crate) return_path: Option<Mailbox>,
    pub(crate) to: Vec<Mailbox>,
    pub(crate) cc: Vec<Mailbox>,
    pub(crate) bcc: Vec<Mailbox>,
    pub(crate) subject: String,
    pub(crate) date: Option<DateTime<Utc>>,
    pub(crate) extra_headers: Vec<(String, String)>,
    pub(crate) parts: Vec<BodyPart>,
    pub(crate) attachments: Vec<ResolvedAttachment>,
    pub(crate) inlines: Vec<ResolvedAttachment>,
    dsn: Option<DsnRequest>,
    signer: Option<Arc<MessageSigner>>,
    error: Option<MailError>,
    /// Serialized-and-signed bytes, built once so retries transmit the
    /// identical wire message.
    wire: OnceLock<Vec<u8>>,
}

impl MailMessage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The first error recorded by any builder call, if any.
    #[must_use]
    pub fn error(&self) -> Option<&MailError> {
        self.error.as_ref()
    }

    fn poisoned(&self) -> bool {
        self.error.is_some()
    }

    fn fail(&mut self, error: MailError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    pub fn set_subject(&mut self, subject: &str) -> &mut Self {
        if self.poisoned() {
            return self;
        }
        self.subject = subject.to_string();
        self
    }

    /// Set or replace the From address.
    pub fn set_from(&mut self, address: &str) -> &mut Self {
        if self.poisoned() {
            return self;
        }
        match Mailbox::parse("From", address) {
            Ok(mailbox) => {
                if self
                    .sender
                    .as_ref()
                    .is_some_and(|sender| sender.address == mailbox.address)
                {
                    self.fail(MailError::SenderMatchesFrom);
                } else {
                    self.from = Some(mailbox);
                }
            }
            Err(err) => self.fail(err),
        }
        self
    }

    pub fn set_sender(&mut self, address: &str) -> &mut Self {
        if self.poisoned() {
            return self;
        }
        if self.sender.is_some() {
            self.fail(MailError::DuplicateAddress("Sender"));
            return self;
        }
        match Mailbox::parse("Sender", address) {
            Ok(mailbox) => {
                if self
                    .from
                    .as_ref()
                    .is_some_and(|from| from.address == mailbox.address)
                {
                    self.fail(MailError::SenderMatchesFrom);
                } else {
                    self.sender = Some(mailbox);
                }
            }
            Err(err) => self.fail(err),
        }
        self
    }

    pub fn set_reply_to(&mut self, address: &str) -> &mut Self {
        if self.poisoned() {
            return self;
        }
        if self.reply_to.is_some() {
            self.fail(MailError::DuplicateAddress("Reply-To"));
            return self;
        }
        match Mailbox::parse("Reply-To", address) {
            Ok(mailbox) => self.reply_to = Some(mailbox),
            Err(err) => self.fail(err),
        }
        self
    }

    /// Set the bounce address. Not serialized as a visible recipient; it is
    /// the first candidate for the envelope sender.
    pub fn set_return_path(&mut self, address: &str) -> &mut Self {
        if self.poisoned() {
            return self;
        }
        if self.return_path.is_some() {
            self.fail(MailError::DuplicateAddress("Return-Path"));
            return self;
        }
        match Mailbox::parse("Return-Path", address) {
            Ok(mailbox) => self.return_path = Some(mailbox),
            Err(err) => self.fail(err),
        }
        self
    }

    pub fn add_to<I, S>(&mut self, addresses: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.add_recipients("To", addresses);
        self
    }

    pub fn add_cc<I, S>(&mut self, addresses: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.add_recipients("Cc", addresses);
        self
    }

    pub fn add_bcc<I, S>(&mut self, addresses: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.add_recipients("Bcc", addresses);
        self
    }

    fn add_recipients<I, S>(&mut self, header: &'static str, addresses: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for address in addresses {
            if self.poisoned() {
                return;
            }
            let address = address.as_ref();
            if address.is_empty() {
                continue;
            }
            match Mailbox::parse(header, address) {
                Ok(mailbox) => match header {
                    "To" => self.to.push(mailbox),
                    "Cc" => self.cc.push(mailbox),
                    _ => self.bcc.push(mailbox),
                },
                Err(err) => self.fail(err),
            }
        }
    }

    /// Date is only serialized when explicitly requested.
    pub fn set_date(&mut self, date: DateTime<Utc>) -> &mut Self {
        if self.poisoned() {
            return self;
        }
        self.date = Some(date);
        self
    }

    pub fn add_header(&mut self, name: &str, value: &str) -> &mut Self {
        if self.poisoned() {
            return self;
        }
        self.extra_headers
            .push((name.to_string(), value.to_string()));
        self
    }

    pub fn set_priority(&mut self, priority: Priority) -> &mut Self {
        match priority {
            Priority::Low => {
                self.add_header("X-Priority", "5 (Lowest)");
                self.add_header("X-MSMail-Priority", "Low");
                self.add_header("Importance", "Low")
            }
            Priority::High => {
                self.add_header("X-Priority", "1 (Highest)");
                self.add_header("X-MSMail-Priority", "High");
                self.add_header("Importance", "High")
            }
        }
    }

    pub fn set_list_unsubscribe(&mut self, target: &str) -> &mut Self {
        self.add_header("List-Unsubscribe", target)
    }

    /// Attach a file; inline attachments land in the related branch.
    pub fn attach(&mut self, attachment: &Attachment) -> &mut Self {
        if self.poisoned() {
            return self;
        }
        match attachment.resolve() {
            Ok(resolved) if resolved.inline => self.inlines.push(resolved),
            Ok(resolved) => self.attachments.push(resolved),
            Err(err) => self.fail(err),
        }
        self
    }

    /// Replace the body parts. Bodies are expected to be final (rendered).
    pub fn set_parts(&mut self, parts: Vec<BodyPart>) -> &mut Self {
        if self.poisoned() {
            return self;
        }
        self.parts = parts;
        self
    }

    /// Append an alternative body part.
    pub fn add_part(&mut self, part: BodyPart) -> &mut Self {
        if self.poisoned() {
            return self;
        }
        self.parts.push(part);
        self
    }

    pub fn set_dsn(&mut self, dsn: DsnRequest) -> &mut Self {
        if self.poisoned() {
            return self;
        }
        self.dsn = Some(dsn);
        self
    }

    pub fn set_dkim(&mut self, signer: Arc<MessageSigner>) -> &mut Self {
        if self.poisoned() {
            return self;
        }
        self.signer = Some(signer);
        self
    }

    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Every To, Cc, and Bcc address, in that order.
    #[must_use]
    pub fn recipients(&self) -> Vec<String> {
        self.to
            .iter()
            .chain(&self.cc)
            .chain(&self.bcc)
            .map(|mailbox| mailbox.address.clone())
            .collect()
    }

    /// The address used in MAIL FROM when none is given explicitly:
    /// return-path, then sender, from, reply-to.
    #[must_use]
    pub fn envelope_sender(&self) -> Option<&str> {
        self.return_path
            .as_ref()
            .or(self.sender.as_ref())
            .or(self.from.as_ref())
            .or(self.reply_to.as_ref())
            .map(|mailbox| mailbox.address.as_str())
    }

    /// Serialize (and sign, when a signer is set) the message. The result
    /// is built once and reused by retries, so the wire bytes, including
    /// Message-ID and signature, are stable for the message's lifetime.
    ///
    /// # Errors
    ///
    /// Returns an error when the builder was poisoned or signing fails.
    pub fn wire_message(&self) -> Result<Vec<u8>, MailError> {
        if let Some(error) = &self.error {
            return Err(MailError::Invalid(error.to_string()));
        }
        if let Some(wire) = self.wire.get() {
            return Ok(wire.clone());
        }

        let serialized = mime::serialize(self);
        let signed = match &self.signer {
            Some(signer) => signer.sign(&serialized)?,
            None => serialized,
        };
        Ok(self.wire.get_or_init(|| signed).clone())
    }

    /// Transmit via `session` using the default envelope sender.
    ///
    /// # Errors
    ///
    /// Surfaces any recorded builder error, then validation, signing, and
    /// transport failures.
    pub async fn send_via(&self, session: &SmtpSession) -> Result<(), MailError> {
        self.send_envelope_from(None, session).await
    }

    /// Transmit with an explicit envelope sender.
    ///
    /// # Errors
    ///
    /// See [`send_via`](Self::send_via).
    pub async fn send_envelope_from(
        &self,
        envelope_from: Option<&str>,
        session: &SmtpSession,
    ) -> Result<(), MailError> {
        if let Some(error) = &self.error {
            return Err(MailError::Invalid(error.to_string()));
        }

        let from = envelope_from
            .or_else(|| self.envelope_sender())
            .ok_or(MailError::NoEnvelopeSender)?;
        let recipients = self.recipients();
        if recipients.is_empty() {
            return Err(MailError::NoRecipients);
        }

        let wire = self.wire_message()?;
        let stuffed = dot_stuff(&wire);
        session
            .transmit(from, &recipients, &stuffed, self.dsn.as_ref())
            .await?;
        Ok(())
    }
}
