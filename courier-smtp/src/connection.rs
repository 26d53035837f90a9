//! The raw byte stream under an SMTP session: plain TCP or TLS-wrapped.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use courier_common::config::Encryption;

use crate::error::{ClientError, Result};

/// A connection to the relay, either plain or TLS-wrapped.
#[derive(Debug)]
pub(crate) enum Connection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Connection {
    /// Dial `host:port`, wrapping in TLS from the first byte when the
    /// profile uses implicit TLS.
    pub(crate) async fn dial(
        host: &str,
        port: u16,
        encryption: Encryption,
        accept_invalid_certs: bool,
    ) -> Result<Self> {
        let stream = TcpStream::connect((host, port)).await.map_err(ClientError::Io)?;

        match encryption {
            Encryption::SslTls => {
                let connector = tls_connector(accept_invalid_certs)?;
                let server_name = ServerName::try_from(host.to_string())
                    .map_err(|err| ClientError::Tls(format!("invalid server name: {err}")))?;
                let tls = connector
                    .connect(server_name, stream)
                    .await
                    .map_err(|err| ClientError::Tls(err.to_string()))?;
                Ok(Self::Tls(Box::new(tls)))
            }
            Encryption::None | Encryption::StartTls => Ok(Self::Plain(stream)),
        }
    }

    pub(crate) async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(stream) => stream.write_all(data).await?,
            Self::Tls(stream) => stream.write_all(data).await?,
        }
        Ok(())
    }

    /// Read into `buf`, mapping EOF to [`ClientError::ConnectionClosed`].
    pub(crate) async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        };
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(n)
    }

    /// Upgrade a plain connection after a successful STARTTLS exchange.
    pub(crate) async fn upgrade_to_tls(
        self,
        domain: &str,
        accept_invalid_certs: bool,
    ) -> Result<Self> {
        match self {
            Self::Plain(stream) => {
                let connector = tls_connector(accept_invalid_certs)?;
                let server_name = ServerName::try_from(domain.to_string())
                    .map_err(|err| ClientError::Tls(format!("invalid server name: {err}")))?;
                let tls = connector
                    .connect(server_name, stream)
                    .await
                    .map_err(|err| ClientError::Tls(err.to_string()))?;
                Ok(Self::Tls(Box::new(tls)))
            }
            Self::Tls(_) => Err(ClientError::Tls("connection is already TLS".to_string())),
        }
    }
}

fn tls_connector(accept_invalid_certs: bool) -> Result<TlsConnector> {
    let mut root_store = RootCertStore::empty();

    let certs = rustls_native_certs::load_native_certs();
    for cert in certs.certs {
        root_store
            .add(cert)
            .map_err(|err| ClientError::Tls(format!("failed to add certificate: {err}")))?;
    }
    if !certs.errors.is_empty() {
        tracing::warn!(?certs.errors, "some system certificates could not be loaded");
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    if accept_invalid_certs {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerifier));
    }

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Certificate verifier that accepts everything. Only reachable through the
/// `accept_invalid_certs` switch, which exists for test relays with
/// self-signed certificates.
#[derive(Debug)]
struct NoVerifier;

impl tokio_rustls::rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[tokio_rustls::rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: tokio_rustls::rustls::pki_types::UnixTime,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::ServerCertVerified,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<tokio_rustls::rustls::SignatureScheme> {
        vec![
            tokio_rustls::rustls::SignatureScheme::RSA_PKCS1_SHA256,
            tokio_rustls::rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            tokio_rustls::rustls::SignatureScheme::ED25519,
        ]
    }
}
