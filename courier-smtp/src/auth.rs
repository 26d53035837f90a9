//! SMTP authentication mechanisms (RFC 4954).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use md5::Md5;

use crate::error::{ClientError, Result};

/// A concrete SASL mechanism the client can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    Plain,
    Login,
    CramMd5,
}

impl Mechanism {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
            Self::CramMd5 => "CRAM-MD5",
        }
    }
}

/// How to pick the mechanism for a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AuthMode {
    /// Pick the first supported mechanism the server advertises, in the
    /// order PLAIN, LOGIN, CRAM-MD5.
    #[default]
    Auto,
    /// Use exactly this mechanism.
    Mechanism(Mechanism),
    /// Skip authentication entirely.
    None,
}

/// Preference order used by [`AuthMode::Auto`].
const PREFERENCE: [Mechanism; 3] = [Mechanism::Plain, Mechanism::Login, Mechanism::CramMd5];

/// Pick a mechanism from the advertised list, by client preference.
#[must_use]
pub fn select_mechanism(advertised: &[&str]) -> Option<Mechanism> {
    PREFERENCE.into_iter().find(|mechanism| {
        advertised
            .iter()
            .any(|name| name.eq_ignore_ascii_case(mechanism.as_str()))
    })
}

/// Initial response for `AUTH PLAIN` (RFC 4616).
#[must_use]
pub(crate) fn plain_initial(username: &str, password: &str) -> String {
    BASE64.encode(format!("\0{username}\0{password}"))
}

#[must_use]
pub(crate) fn login_step(value: &str) -> String {
    BASE64.encode(value)
}

/// Answer to a CRAM-MD5 challenge: `base64(user " " hex(hmac-md5(challenge)))`.
pub(crate) fn cram_md5_answer(
    username: &str,
    password: &str,
    challenge_b64: &str,
) -> Result<String> {
    let challenge = BASE64
        .decode(challenge_b64.trim())
        .map_err(|err| ClientError::Auth(format!("invalid CRAM-MD5 challenge: {err}")))?;

    let mut mac = Hmac::<Md5>::new_from_slice(password.as_bytes())
        .map_err(|err| ClientError::Auth(err.to_string()))?;
    mac.update(&challenge);

    let digest = mac.finalize().into_bytes();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }

    Ok(BASE64.encode(format!("{username} {hex}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_selection_follows_preference_order() {
        assert_eq!(
            select_mechanism(&["CRAM-MD5", "LOGIN", "PLAIN"]),
            Some(Mechanism::Plain)
        );
        assert_eq!(
            select_mechanism(&["CRAM-MD5", "LOGIN"]),
            Some(Mechanism::Login)
        );
        assert_eq!(select_mechanism(&["cram-md5"]), Some(Mechanism::CramMd5));
        assert_eq!(select_mechanism(&["XOAUTH2"]), None);
        assert_eq!(select_mechanism(&[]), None);
    }

    #[test]
    fn plain_initial_is_nul_separated() {
        let encoded = plain_initial("user", "pass");
        let decoded = BASE64.decode(encoded).unwrap();
        assert_eq!(decoded, b"\0user\0pass");
    }

    #[test]
    fn cram_md5_matches_rfc_2195_example() {
        // Worked example from RFC 2195 section 2.
        let challenge = BASE64.encode("<1896.697170952@postoffice.reston.mci.net>");
        let answer = cram_md5_answer("tim", "tanstaaftanstaaf", &challenge).unwrap();
        let decoded = String::from_utf8(BASE64.decode(answer).unwrap()).unwrap();
        assert_eq!(decoded, "tim b913a602c7eda7a495b4e6e7334d3890");
    }

    #[test]
    fn garbage_challenge_is_an_auth_error() {
        let err = cram_md5_answer("tim", "secret", "!!not-base64!!").unwrap_err();
        assert!(matches!(err, ClientError::Auth(_)));
    }
}
