//! Error type for message assembly and rendering.

use thiserror::Error;

/// Errors raised while building, rendering, signing, or transmitting a
/// message.
#[derive(Debug, Error)]
pub enum MailError {
    /// An address failed strict mailbox parsing.
    #[error("invalid address in {header}: [{address}]: {reason}")]
    InvalidAddress {
        header: &'static str,
        address: String,
        reason: String,
    },

    /// A second value was supplied for a header that allows only one.
    #[error("there can only be one {0} address")]
    DuplicateAddress(&'static str),

    /// From and Sender must name different mailboxes.
    #[error("the From and Sender addresses must differ")]
    SenderMatchesFrom,

    /// The message names nobody in To, Cc, or Bcc.
    #[error("no recipients specified")]
    NoRecipients,

    /// No address is available to use as the envelope sender.
    #[error("no envelope sender available")]
    NoEnvelopeSender,

    /// A body part carries a content type no rendering engine handles.
    #[error("content type is not found: {0}")]
    ContentTypeNotFound(String),

    /// Template parsing or substitution failed.
    #[error("template rendering failed: {0}")]
    Template(#[from] tera::Error),

    /// An attachment could not be resolved to its content bytes.
    #[error("attachment error: {0}")]
    Attachment(String),

    /// DKIM signing failed; the message must not leave unsigned.
    #[error("DKIM signing failed: {0}")]
    Dkim(String),

    /// An earlier builder call poisoned the message.
    #[error("{0}")]
    Invalid(String),

    /// The SMTP transaction itself failed.
    #[error(transparent)]
    Client(#[from] courier_smtp::ClientError),
}

impl MailError {
    /// Whether handing the same message to another session could succeed.
    /// Everything except transport and signing trouble is an input defect.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::Client(_) | Self::Dkim(_))
    }
}
