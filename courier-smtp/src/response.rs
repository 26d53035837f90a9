//! SMTP reply parsing (RFC 5321 section 4.2).

use crate::error::{ClientError, Result};

/// A complete, possibly multi-line, SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Three-digit status code shared by every line of the reply.
    pub code: u16,
    /// Text of each reply line, in order, without codes or separators.
    pub lines: Vec<String>,
}

impl Response {
    #[must_use]
    pub const fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// All reply text joined with newlines.
    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join("\n")
    }

    /// `true` for 2xx replies.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    /// `true` for 4xx replies.
    #[must_use]
    pub const fn is_temporary_error(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    /// `true` for 5xx replies.
    #[must_use]
    pub const fn is_permanent_error(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    /// Convert an error reply into the matching [`ClientError`].
    ///
    /// # Errors
    ///
    /// Returns `Smtp` for 4xx/5xx replies and `UnexpectedResponse` for
    /// anything that is neither success nor a recognized error class.
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else if self.is_temporary_error() || self.is_permanent_error() {
            Err(ClientError::Smtp {
                code: self.code,
                message: self.message(),
            })
        } else {
            Err(ClientError::UnexpectedResponse {
                code: self.code,
                message: self.message(),
            })
        }
    }

    /// Try to parse one complete reply from the front of `buffer`.
    ///
    /// Returns the reply and the number of bytes consumed, or `None` when
    /// the buffer does not yet hold a complete reply.
    ///
    /// # Errors
    ///
    /// Returns `Parse` when the buffered bytes cannot be an SMTP reply.
    pub fn parse(buffer: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut lines = Vec::new();
        let mut code = None;
        let mut consumed = 0;

        loop {
            let rest = &buffer[consumed..];
            let Some(end) = rest.iter().position(|&b| b == b'\n') else {
                // No full line buffered yet.
                return Ok(None);
            };

            let mut line = &rest[..end];
            if line.ends_with(b"\r") {
                line = &line[..line.len() - 1];
            }
            consumed += end + 1;

            let line = std::str::from_utf8(line)?;
            if line.is_empty() {
                continue;
            }

            let (line_code, last, text) = Self::split_line(line)?;
            match code {
                Some(code) if code != line_code => {
                    return Err(ClientError::Parse(format!(
                        "status code changed mid-reply: expected {code}, got {line_code}"
                    )));
                }
                Some(_) => {}
                None => code = Some(line_code),
            }
            lines.push(text.to_string());

            if last {
                // `code` is always set once a line has been parsed.
                let code = code.unwrap_or_default();
                return Ok(Some((Self::new(code, lines), consumed)));
            }
        }
    }

    /// Split one reply line into (code, is-last, text).
    fn split_line(line: &str) -> Result<(u16, bool, &str)> {
        if line.len() < 3 {
            return Err(ClientError::Parse(format!("reply line too short: {line:?}")));
        }
        let code = line[..3]
            .parse::<u16>()
            .map_err(|_| ClientError::Parse(format!("invalid status code in {line:?}")))?;

        match line.as_bytes().get(3) {
            None => Ok((code, true, "")),
            Some(b' ') => Ok((code, true, &line[4..])),
            Some(b'-') => Ok((code, false, &line[4..])),
            Some(_) => Err(ClientError::Parse(format!(
                "invalid separator after status code in {line:?}"
            ))),
        }
    }
}
