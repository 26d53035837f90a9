//! Wire-level SMTP submission client.
//!
//! This crate implements the client half of an SMTP conversation: dialing
//! (implicit TLS or plain with STARTTLS upgrade), EHLO extension discovery,
//! authentication, and the MAIL/RCPT/DATA transaction, with NOOP and QUIT
//! for session upkeep. Pooling and retry policy live one layer up in
//! `courier-delivery`; message assembly lives in `courier-mail`.

pub mod auth;
mod connection;
pub mod error;
pub mod extensions;
pub mod response;
pub mod session;

pub use auth::{AuthMode, Mechanism};
pub use error::{ClientError, Result};
pub use extensions::Extensions;
pub use response::Response;
pub use session::{DsnRequest, Notify, SmtpProfile, SmtpSession};
