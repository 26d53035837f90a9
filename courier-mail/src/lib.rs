//! Mail message assembly for the courier dispatch worker.
//!
//! This crate owns everything between a decoded bus request and the bytes
//! handed to an SMTP session: the request model, template merge, the
//! content-type-aware renderer, the sticky-error message builder, MIME
//! serialization, and DKIM signing.

pub mod attachment;
pub mod dkim;
mod encoding;
pub mod error;
pub mod message;
mod mime;
pub mod render;
pub mod request;
pub mod template;

pub use attachment::Attachment;
pub use dkim::MessageSigner;
pub use error::MailError;
pub use message::{MailMessage, Mailbox, Priority, SenderProfile};
pub use render::render_parts;
pub use request::{BodyPart, ContentType, EmailRequest, FromProfile, Locale, ServiceSettings};
pub use template::StoredTemplate;
