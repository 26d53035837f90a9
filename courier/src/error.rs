//! Startup failure surface of the binary.

use thiserror::Error;

use courier_common::config::ConfigError;
use courier_delivery::PoolError;
use courier_mail::MailError;

/// Anything that can stop the worker from coming up. The process exits
/// non-zero on every variant.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("bus error: {0}")]
    Bus(#[from] lapin::Error),

    #[error("template store error: {0}")]
    Store(#[from] mongodb::error::Error),

    #[error("failed to load DKIM key: {0}")]
    DkimKey(#[from] std::io::Error),

    #[error("DKIM setup failed: {0}")]
    Dkim(#[from] MailError),

    #[error("SMTP preflight failed: {0}")]
    Preflight(#[from] PoolError),
}
