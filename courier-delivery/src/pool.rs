//! Bounded pool of idle SMTP sessions with per-session keep-alive.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{timeout, Instant};

use courier_smtp::{ClientError, SmtpProfile, SmtpSession};

use crate::error::PoolError;
use crate::DeliveryConfig;

/// A bounded FIFO of idle sessions.
///
/// Invariants: at most `capacity` sessions sit idle; a checked-out session
/// is owned by exactly one task; sessions put back are believed healthy and
/// sessions that failed a transmission never come back. Each dialed session
/// gets a background NOOP probe that takes it out of rotation as soon as
/// the relay stops answering.
pub struct SessionPool {
    profile: Arc<SmtpProfile>,
    idle_tx: async_channel::Sender<Arc<SmtpSession>>,
    idle_rx: async_channel::Receiver<Arc<SmtpSession>>,
    acquire_grace: Duration,
    probe_interval: Duration,
    quit_timeout: Duration,
}

impl SessionPool {
    #[must_use]
    pub fn new(profile: Arc<SmtpProfile>, config: &DeliveryConfig) -> Self {
        let (idle_tx, idle_rx) = async_channel::bounded(config.capacity);
        Self {
            profile,
            idle_tx,
            idle_rx,
            acquire_grace: config.acquire_grace,
            probe_interval: config.probe_interval,
            quit_timeout: config.quit_timeout,
        }
    }

    /// Number of sessions currently idle.
    #[must_use]
    pub fn idle_sessions(&self) -> usize {
        self.idle_rx.len()
    }

    /// Take an idle session, or dial a new one when the pool stays empty
    /// past the grace period. Whichever arrives first wins the race; a
    /// failed dial surfaces so the caller's retry loop keeps waiting on
    /// the pool.
    ///
    /// # Errors
    ///
    /// Returns `Closed` after shutdown, or `Dial` when no pooled session
    /// was free and establishing a fresh one failed.
    pub async fn acquire(&self) -> Result<Arc<SmtpSession>, PoolError> {
        if let Some(session) = self.try_take() {
            return Ok(session);
        }

        if let Ok(found) = timeout(self.acquire_grace, self.recv_alive()).await {
            return found;
        }

        tokio::select! {
            found = self.recv_alive() => found,
            dialed = self.connect_new() => dialed.map_err(PoolError::Dial),
        }
    }

    /// Put a healthy session back. Dead sessions and overflow beyond the
    /// capacity are dropped; the probe ends with the last reference.
    pub fn release(&self, session: Arc<SmtpSession>) {
        if !session.is_alive() {
            return;
        }
        let _ = self.idle_tx.try_send(session);
    }

    /// Dial a fresh session and start its keep-alive probe.
    ///
    /// # Errors
    ///
    /// Returns the handshake error.
    pub async fn connect_new(&self) -> Result<Arc<SmtpSession>, ClientError> {
        let session = Arc::new(self.profile.connect().await?);
        self.spawn_probe(&session);
        Ok(session)
    }

    /// Close the pool and QUIT every idle session within the drain
    /// deadline. Sessions still checked out finish their transaction and
    /// are dropped on release.
    pub async fn drain(&self) {
        self.idle_tx.close();
        let deadline = Instant::now() + self.quit_timeout;
        while let Ok(session) = self.idle_rx.try_recv() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let _ = timeout(remaining, session.quit()).await;
        }
    }

    fn try_take(&self) -> Option<Arc<SmtpSession>> {
        while let Ok(session) = self.idle_rx.try_recv() {
            if session.is_alive() {
                return Some(session);
            }
        }
        None
    }

    async fn recv_alive(&self) -> Result<Arc<SmtpSession>, PoolError> {
        loop {
            let session = self.idle_rx.recv().await.map_err(|_| PoolError::Closed)?;
            if session.is_alive() {
                return Ok(session);
            }
        }
    }

    /// Probe the session with NOOP on a fixed cadence. The weak reference
    /// lets the task end as soon as the session leaves circulation; a
    /// failed probe marks the session dead, which also ends the task.
    fn spawn_probe(&self, session: &Arc<SmtpSession>) {
        let weak = Arc::downgrade(session);
        let interval = self.probe_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(session) = weak.upgrade() else { break };
                if !session.is_alive() {
                    break;
                }
                if session.noop().await.is_err() {
                    tracing::debug!("keep-alive probe failed, session leaves rotation");
                    break;
                }
            }
        });
    }
}
