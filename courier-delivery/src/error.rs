//! Error types for pooled delivery.

use thiserror::Error;

use courier_mail::MailError;
use courier_smtp::ClientError;

/// Failure to obtain a session from the pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool was shut down.
    #[error("session pool is closed")]
    Closed,

    /// No pooled session was free and dialing a new one failed.
    #[error("failed to establish session: {0}")]
    Dial(#[from] ClientError),
}

/// Outcome of a send that did not succeed.
#[derive(Debug, Error)]
pub enum SendError {
    /// The message itself is defective; no attempt can deliver it.
    #[error("message rejected before transmission: {0}")]
    Rejected(MailError),

    /// Every attempt in the retry budget failed.
    #[error("delivery failed after {attempts} attempts: {source}")]
    Exhausted { attempts: u32, source: MailError },

    /// The pool was shut down mid-send.
    #[error("session pool is closed")]
    PoolClosed,
}
