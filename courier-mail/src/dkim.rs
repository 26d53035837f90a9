//! DKIM message signing (RFC 6376).

use mail_auth::common::crypto::{RsaKey, Sha256};
use mail_auth::common::headers::HeaderWriter;
use mail_auth::dkim::{DkimSigner, Done};

use crate::error::MailError;

/// The fixed header set bound by every signature.
pub const SIGNED_HEADERS: [&str; 8] = [
    "Date",
    "From",
    "To",
    "Message-ID",
    "Subject",
    "MIME-Version",
    "Content-Type",
    "Content-Transfer-Encoding",
];

/// Signature lifetime: 90 days.
pub const SIGNATURE_EXPIRY_SECS: u64 = 7_776_000;

/// A ready-to-use signer built once at startup from the configured selector,
/// domain, and private key. Immutable afterwards and shared across workers.
///
/// Canonicalization is relaxed/relaxed and the algorithm rsa-sha256; the
/// signature carries its own timestamp and expiry.
pub struct MessageSigner {
    signer: DkimSigner<RsaKey<Sha256>, Done>,
    domain: String,
    selector: String,
}

impl MessageSigner {
    /// Build a signer from a PKCS#1 PEM private key.
    ///
    /// # Errors
    ///
    /// Returns an error when the key does not parse, so a bad key is caught
    /// at startup rather than on the first send.
    pub fn new(
        private_key_pem: &str,
        domain: impl Into<String>,
        selector: impl Into<String>,
    ) -> Result<Self, MailError> {
        let domain = domain.into();
        let selector = selector.into();
        let key = RsaKey::<Sha256>::from_pkcs1_pem(private_key_pem)
            .map_err(|err| MailError::Dkim(err.to_string()))?;
        let signer = DkimSigner::from_key(key)
            .domain(domain.clone())
            .selector(selector.clone())
            .headers(SIGNED_HEADERS)
            .expiration(SIGNATURE_EXPIRY_SECS);
        Ok(Self {
            signer,
            domain,
            selector,
        })
    }

    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    #[must_use]
    pub fn selector(&self) -> &str {
        &self.selector
    }

    /// Sign the fully serialized message and return it with the
    /// `DKIM-Signature:` header prepended.
    ///
    /// # Errors
    ///
    /// Returns an error when signing fails; an unsigned message must not be
    /// transmitted in that case.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, MailError> {
        let signature = self
            .signer
            .sign(message)
            .map_err(|err| MailError::Dkim(err.to_string()))?;

        let mut signed = Vec::with_capacity(message.len() + 512);
        signature.write_header(&mut signed);
        signed.extend_from_slice(message);
        Ok(signed)
    }
}
