//! The retrying sender in front of the session pool.

use std::sync::Arc;

use courier_mail::{MailError, MailMessage};
use courier_smtp::{ClientError, SmtpProfile};

use crate::error::{PoolError, SendError};
use crate::pool::SessionPool;
use crate::DeliveryConfig;

/// Sends built messages through pooled sessions with a bounded retry
/// budget. Transient dial and transmission failures are absorbed here; the
/// dispatcher only sees the final outcome.
pub struct Sender {
    pool: SessionPool,
    max_attempts: u32,
}

impl Sender {
    #[must_use]
    pub fn new(profile: Arc<SmtpProfile>, config: DeliveryConfig) -> Self {
        let pool = SessionPool::new(profile, &config);
        Self {
            pool,
            max_attempts: config.max_attempts,
        }
    }

    /// Number of sessions currently idle in the pool.
    #[must_use]
    pub fn idle_sessions(&self) -> usize {
        self.pool.idle_sessions()
    }

    /// Establish one session up front and park it, so a misconfigured
    /// relay fails the process at startup rather than on the first
    /// delivery.
    ///
    /// # Errors
    ///
    /// Returns the handshake failure.
    pub async fn preflight(&self) -> Result<(), PoolError> {
        let session = self.pool.connect_new().await.map_err(PoolError::Dial)?;
        self.pool.release(session);
        Ok(())
    }

    /// Deliver `message`, retrying up to the configured budget.
    ///
    /// Failed sessions are discarded, successful ones go back to the pool.
    /// An end-of-stream mid-transaction triggers one inline
    /// reconnect-and-retry before the loop falls back to pool
    /// reacquisition. Deterministic message defects are surfaced
    /// immediately without burning attempts.
    ///
    /// # Errors
    ///
    /// `Rejected` for input defects, `Exhausted` when the retry budget runs
    /// out, `PoolClosed` after shutdown.
    pub async fn send(&self, message: &MailMessage) -> Result<(), SendError> {
        let mut last_error: Option<MailError> = None;

        for _ in 0..self.max_attempts {
            let session = match self.pool.acquire().await {
                Ok(session) => session,
                Err(PoolError::Closed) => return Err(SendError::PoolClosed),
                Err(PoolError::Dial(err)) => {
                    last_error = Some(err.into());
                    continue;
                }
            };

            match message.send_via(&session).await {
                Ok(()) => {
                    self.pool.release(session);
                    return Ok(());
                }
                Err(MailError::Client(err)) => {
                    session.mark_dead();
                    drop(session);
                    tracing::warn!("transmission failed, session discarded: {err}");
                    let eof = matches!(err, ClientError::ConnectionClosed);
                    last_error = Some(MailError::Client(err));
                    if eof {
                        match self.retry_on_fresh_session(message).await {
                            Ok(true) => return Ok(()),
                            Ok(false) => {}
                            Err(send_error) => return Err(send_error),
                        }
                    }
                }
                Err(err) if err.is_retriable() => {
                    // Signing trouble: the session never saw the message.
                    self.pool.release(session);
                    last_error = Some(err);
                }
                Err(err) => {
                    self.pool.release(session);
                    return Err(SendError::Rejected(err));
                }
            }
        }

        let source = last_error.unwrap_or(MailError::Client(ClientError::ConnectionClosed));
        Err(SendError::Exhausted {
            attempts: self.max_attempts,
            source,
        })
    }

    /// One immediate reconnect after an EOF. `Ok(true)` means delivered.
    async fn retry_on_fresh_session(&self, message: &MailMessage) -> Result<bool, SendError> {
        let Ok(session) = self.pool.connect_new().await else {
            return Ok(false);
        };
        match message.send_via(&session).await {
            Ok(()) => {
                self.pool.release(session);
                Ok(true)
            }
            Err(MailError::Client(_)) => {
                session.mark_dead();
                Ok(false)
            }
            Err(err) if err.is_retriable() => {
                self.pool.release(session);
                Ok(false)
            }
            Err(err) => {
                self.pool.release(session);
                Err(SendError::Rejected(err))
            }
        }
    }

    /// Drain the pool, QUITting idle sessions under the shutdown deadline.
    pub async fn shutdown(&self) {
        self.pool.drain().await;
    }
}
