//! Session establishment and the serialized command pipeline.
//!
//! A [`SmtpSession`] owns one established connection to the relay. All
//! command sequences are funneled through a per-session mutex, so a session
//! checked out of the pool can only ever have one transaction in flight,
//! contended at most by the background keep-alive probe.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::timeout;

use courier_common::config::{Encryption, SmtpConfig};

use crate::auth::{self, AuthMode, Mechanism};
use crate::connection::Connection;
use crate::error::{ClientError, Result};
use crate::extensions::Extensions;
use crate::response::Response;

/// Initial size of the reply read buffer.
const BUFFER_SIZE: usize = 8192;

/// Upper bound on the reply buffer (1 MiB).
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// DSN notification classes (RFC 3461 section 4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notify {
    Never,
    Failure,
    Delay,
    Success,
}

impl Notify {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Never => "NEVER",
            Self::Failure => "FAILURE",
            Self::Delay => "DELAY",
            Self::Success => "SUCCESS",
        }
    }
}

/// Delivery status notifications requested for a message. Only honored when
/// the relay advertises the DSN extension.
#[derive(Debug, Clone, Default)]
pub struct DsnRequest {
    pub notify: Vec<Notify>,
    /// Ask the relay to carry the original recipient (`ORCPT`).
    pub preserve_original_recipient: bool,
}

impl DsnRequest {
    /// The `NOTIFY=` value, with `NEVER` overriding everything else.
    fn notify_parameter(&self) -> Option<String> {
        if self.notify.is_empty() {
            return None;
        }
        if self.notify.contains(&Notify::Never) {
            return Some(Notify::Never.as_str().to_string());
        }
        Some(
            self.notify
                .iter()
                .map(|notify| notify.as_str())
                .collect::<Vec<_>>()
                .join(","),
        )
    }
}

/// The configured relay endpoint and session policy.
#[derive(Debug, Clone)]
pub struct SmtpProfile {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Domain announced in EHLO/HELO.
    pub helo: String,
    pub encryption: Encryption,
    pub auth: AuthMode,
    /// Bounds the full dial + greet + handshake path.
    pub connect_timeout: Duration,
    /// Bounds one complete message transaction.
    pub send_timeout: Duration,
    pub accept_invalid_certs: bool,
}

impl SmtpProfile {
    #[must_use]
    pub fn from_config(config: &SmtpConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            password: config.password.clone(),
            helo: "localhost".to_string(),
            encryption: config.encryption,
            auth: AuthMode::default(),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            send_timeout: Duration::from_secs(config.send_timeout_secs),
            accept_invalid_certs: config.accept_invalid_certs,
        }
    }

    /// Establish a ready-to-use session: dial, greet, EHLO, optional
    /// STARTTLS upgrade, optional AUTH.
    ///
    /// # Errors
    ///
    /// Returns an error if any handshake step fails or the connect timeout
    /// elapses.
    pub async fn connect(&self) -> Result<SmtpSession> {
        timeout(self.connect_timeout, self.handshake())
            .await
            .map_err(|_| ClientError::Timeout("connection handshake"))?
    }

    async fn handshake(&self) -> Result<SmtpSession> {
        let connection = Connection::dial(
            &self.host,
            self.port,
            self.encryption,
            self.accept_invalid_certs,
        )
        .await?;
        let mut transport = Transport::new(connection);

        transport.read_response().await?.into_result()?;

        let mut extensions = transport.hello(&self.helo).await?;

        if self.encryption == Encryption::StartTls && extensions.supports_starttls() {
            transport.command("STARTTLS").await?.into_result()?;
            transport
                .upgrade_to_tls(&self.host, self.accept_invalid_certs)
                .await?;
            // RFC 3207: the pre-TLS extension set is void after the upgrade.
            extensions = transport.hello(&self.helo).await?;
        }

        if !self.username.is_empty()
            && self.auth != AuthMode::None
            && extensions.contains("AUTH")
        {
            self.authenticate(&mut transport, &extensions).await?;
        }

        Ok(SmtpSession {
            inner: Mutex::new(transport),
            extensions,
            send_timeout: self.send_timeout,
            alive: AtomicBool::new(true),
        })
    }

    async fn authenticate(
        &self,
        transport: &mut Transport,
        extensions: &Extensions,
    ) -> Result<()> {
        let mechanism = match self.auth {
            AuthMode::None => return Ok(()),
            AuthMode::Mechanism(mechanism) => mechanism,
            AuthMode::Auto => auth::select_mechanism(&extensions.auth_mechanisms())
                .ok_or_else(|| {
                    ClientError::Auth("no supported mechanism advertised".to_string())
                })?,
        };

        match mechanism {
            Mechanism::Plain => {
                let initial = auth::plain_initial(&self.username, &self.password);
                let response = transport.command(&format!("AUTH PLAIN {initial}")).await?;
                accepted(&response)
            }
            Mechanism::Login => {
                let response = transport.command("AUTH LOGIN").await?;
                challenged(&response)?;
                let response = transport
                    .command(&auth::login_step(&self.username))
                    .await?;
                challenged(&response)?;
                let response = transport
                    .command(&auth::login_step(&self.password))
                    .await?;
                accepted(&response)
            }
            Mechanism::CramMd5 => {
                let response = transport.command("AUTH CRAM-MD5").await?;
                challenged(&response)?;
                let challenge = response.lines.first().map(String::as_str).unwrap_or("");
                let answer = auth::cram_md5_answer(&self.username, &self.password, challenge)?;
                let response = transport.command(&answer).await?;
                accepted(&response)
            }
        }
    }
}

/// 235 means the relay accepted the credentials.
fn accepted(response: &Response) -> Result<()> {
    if response.code == 235 {
        Ok(())
    } else {
        Err(ClientError::Auth(format!(
            "{} {}",
            response.code,
            response.message()
        )))
    }
}

/// 334 carries the next SASL challenge.
fn challenged(response: &Response) -> Result<()> {
    if response.code == 334 {
        Ok(())
    } else {
        Err(ClientError::Auth(format!(
            "{} {}",
            response.code,
            response.message()
        )))
    }
}

/// One established relay connection with its advertised extensions.
#[derive(Debug)]
pub struct SmtpSession {
    inner: Mutex<Transport>,
    extensions: Extensions,
    send_timeout: Duration,
    alive: AtomicBool,
}

impl SmtpSession {
    #[must_use]
    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Whether the session is still believed usable. Cleared by the
    /// keep-alive probe, by QUIT, and by unrecoverable transaction errors.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn mark_dead(&self) {
        self.alive.store(false, Ordering::Relaxed);
    }

    /// Keep-alive probe.
    ///
    /// # Errors
    ///
    /// Returns the underlying error after marking the session dead.
    pub async fn noop(&self) -> Result<()> {
        let mut transport = self.inner.lock().await;
        match transport.command("NOOP").await.and_then(Response::into_result) {
            Ok(_) => Ok(()),
            Err(err) => {
                self.mark_dead();
                Err(err)
            }
        }
    }

    /// Abort the current mail transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the relay rejects the reset; the session is
    /// marked dead in that case.
    pub async fn rset(&self) -> Result<()> {
        let mut transport = self.inner.lock().await;
        match transport.command("RSET").await.and_then(Response::into_result) {
            Ok(_) => Ok(()),
            Err(err) => {
                self.mark_dead();
                Err(err)
            }
        }
    }

    /// Close the session cleanly. The session is unusable afterwards
    /// regardless of the outcome.
    ///
    /// # Errors
    ///
    /// Returns an error if the QUIT exchange fails.
    pub async fn quit(&self) -> Result<()> {
        self.mark_dead();
        let mut transport = self.inner.lock().await;
        transport.command("QUIT").await.map(|_| ())
    }

    /// Run one complete mail transaction: MAIL FROM, RCPT TO for every
    /// recipient, DATA and the message payload, written verbatim.
    ///
    /// `SIZE` is attached to MAIL FROM when advertised; DSN parameters are
    /// attached per recipient when requested and advertised.
    ///
    /// # Errors
    ///
    /// Returns an error if any step is rejected, the connection fails, or
    /// the send timeout elapses. A clean protocol rejection is followed by
    /// RSET so the session stays usable; any other failure marks it dead.
    pub async fn transmit(
        &self,
        from: &str,
        recipients: &[String],
        data: &[u8],
        dsn: Option<&DsnRequest>,
    ) -> Result<()> {
        let mut transport = self.inner.lock().await;
        let outcome = timeout(
            self.send_timeout,
            transaction(&mut transport, &self.extensions, from, recipients, data, dsn),
        )
        .await;

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                let recoverable = matches!(
                    err,
                    ClientError::Smtp { .. } | ClientError::UnexpectedResponse { .. }
                );
                if recoverable {
                    if transport
                        .command("RSET")
                        .await
                        .and_then(Response::into_result)
                        .is_err()
                    {
                        self.mark_dead();
                    }
                } else {
                    self.mark_dead();
                }
                Err(err)
            }
            Err(_) => {
                // The transaction was cancelled mid-flight; the stream state
                // is unknown.
                self.mark_dead();
                Err(ClientError::Timeout("message transaction"))
            }
        }
    }
}

async fn transaction(
    transport: &mut Transport,
    extensions: &Extensions,
    from: &str,
    recipients: &[String],
    data: &[u8],
    dsn: Option<&DsnRequest>,
) -> Result<()> {
    let mut mail = format!("MAIL FROM:<{from}>");
    if extensions.contains("SIZE") {
        let _ = write!(mail, " SIZE={}", data.len());
    }
    transport.command(&mail).await?.into_result()?;

    let dsn = dsn.filter(|_| extensions.supports_dsn());
    for recipient in recipients {
        let mut rcpt = format!("RCPT TO:<{recipient}>");
        if let Some(dsn) = dsn {
            if let Some(notify) = dsn.notify_parameter() {
                let _ = write!(rcpt, " NOTIFY={notify}");
                if dsn.preserve_original_recipient {
                    let _ = write!(rcpt, " ORCPT=rfc822;{recipient}");
                }
            }
        }
        transport.command(&rcpt).await?.into_result()?;
    }

    let response = transport.command("DATA").await?;
    if response.code != 354 {
        return Err(
            if response.is_temporary_error() || response.is_permanent_error() {
                ClientError::Smtp {
                    code: response.code,
                    message: response.message(),
                }
            } else {
                ClientError::UnexpectedResponse {
                    code: response.code,
                    message: response.message(),
                }
            },
        );
    }

    transport.send_raw(data).await?;
    if !data.ends_with(b"\r\n") {
        transport.send_raw(b"\r\n").await?;
    }
    transport.send_raw(b".\r\n").await?;
    transport.read_response().await?.into_result()?;

    Ok(())
}

/// The byte stream plus a reply parse buffer.
#[derive(Debug)]
struct Transport {
    connection: Option<Connection>,
    buffer: Vec<u8>,
    filled: usize,
}

impl Transport {
    fn new(connection: Connection) -> Self {
        Self {
            connection: Some(connection),
            buffer: vec![0u8; BUFFER_SIZE],
            filled: 0,
        }
    }

    fn connection(&mut self) -> Result<&mut Connection> {
        self.connection.as_mut().ok_or(ClientError::ConnectionClosed)
    }

    async fn read_response(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) = Response::parse(&self.buffer[..self.filled])? {
                self.buffer.copy_within(consumed..self.filled, 0);
                self.filled -= consumed;
                return Ok(response);
            }

            if self.filled >= self.buffer.len() {
                let grown = self.buffer.len() * 2;
                if grown > MAX_BUFFER_SIZE {
                    return Err(ClientError::Parse(format!(
                        "reply exceeds {MAX_BUFFER_SIZE} bytes"
                    )));
                }
                self.buffer.resize(grown, 0);
            }

            let filled = self.filled;
            let n = {
                let buffer = &mut self.buffer[filled..];
                self.connection
                    .as_mut()
                    .ok_or(ClientError::ConnectionClosed)?
                    .read(buffer)
                    .await?
            };
            self.filled += n;
        }
    }

    async fn send_raw(&mut self, data: &[u8]) -> Result<()> {
        self.connection()?.send(data).await
    }

    async fn command(&mut self, line: &str) -> Result<Response> {
        let wire = format!("{line}\r\n");
        self.connection()?.send(wire.as_bytes()).await?;
        self.read_response().await
    }

    /// EHLO with a HELO fallback for relays that reject it.
    async fn hello(&mut self, helo: &str) -> Result<Extensions> {
        let response = self.command(&format!("EHLO {helo}")).await?;
        if response.is_success() {
            return Ok(Extensions::from_ehlo(&response));
        }
        self.command(&format!("HELO {helo}")).await?.into_result()?;
        Ok(Extensions::default())
    }

    async fn upgrade_to_tls(&mut self, domain: &str, accept_invalid_certs: bool) -> Result<()> {
        let connection = self.connection.take().ok_or(ClientError::ConnectionClosed)?;
        self.connection = Some(connection.upgrade_to_tls(domain, accept_invalid_certs).await?);
        // Anything buffered before the upgrade belongs to the plaintext
        // conversation.
        self.filled = 0;
        Ok(())
    }
}
