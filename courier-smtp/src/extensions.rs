//! The extension map advertised in an EHLO reply.

use std::collections::HashMap;

use crate::response::Response;

/// Keyword/parameter pairs from the EHLO reply, keyed by uppercase keyword.
#[derive(Debug, Clone, Default)]
pub struct Extensions {
    entries: HashMap<String, String>,
}

impl Extensions {
    /// Parse the extension lines of an EHLO reply. The first line is the
    /// server greeting and carries no extension.
    #[must_use]
    pub fn from_ehlo(response: &Response) -> Self {
        let mut entries = HashMap::new();
        for line in response.lines.iter().skip(1) {
            let (keyword, parameter) = match line.split_once(' ') {
                Some((keyword, parameter)) => (keyword, parameter.trim()),
                None => (line.as_str(), ""),
            };
            // Some servers advertise `AUTH=PLAIN LOGIN` alongside the
            // standard form.
            let (keyword, parameter) = match keyword.split_once('=') {
                Some((keyword, first)) if parameter.is_empty() => {
                    (keyword, first.trim())
                }
                Some((keyword, first)) => {
                    entries.insert(
                        keyword.to_ascii_uppercase(),
                        format!("{first} {parameter}"),
                    );
                    continue;
                }
                None => (keyword, parameter),
            };
            if keyword.is_empty() {
                continue;
            }
            entries.insert(keyword.to_ascii_uppercase(), parameter.to_string());
        }
        Self { entries }
    }

    #[must_use]
    pub fn contains(&self, keyword: &str) -> bool {
        self.entries.contains_key(&keyword.to_ascii_uppercase())
    }

    #[must_use]
    pub fn parameter(&self, keyword: &str) -> Option<&str> {
        self.entries
            .get(&keyword.to_ascii_uppercase())
            .map(String::as_str)
    }

    /// The advertised SIZE limit, when present and well-formed.
    #[must_use]
    pub fn size_limit(&self) -> Option<usize> {
        self.parameter("SIZE").and_then(|s| s.parse().ok())
    }

    #[must_use]
    pub fn supports_starttls(&self) -> bool {
        self.contains("STARTTLS")
    }

    #[must_use]
    pub fn supports_dsn(&self) -> bool {
        self.contains("DSN")
    }

    /// Authentication mechanisms advertised under `AUTH`.
    #[must_use]
    pub fn auth_mechanisms(&self) -> Vec<&str> {
        self.parameter("AUTH")
            .map(|parameter| parameter.split_ascii_whitespace().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ehlo_reply(lines: &[&str]) -> Response {
        Response::new(250, lines.iter().map(ToString::to_string).collect())
    }

    #[test]
    fn parses_standard_extension_lines() {
        let extensions = Extensions::from_ehlo(&ehlo_reply(&[
            "mail.example.com greets client",
            "SIZE 35882577",
            "8BITMIME",
            "STARTTLS",
            "DSN",
            "AUTH PLAIN LOGIN CRAM-MD5",
        ]));

        assert_eq!(extensions.size_limit(), Some(35_882_577));
        assert!(extensions.supports_starttls());
        assert!(extensions.supports_dsn());
        assert!(extensions.contains("8bitmime"));
        assert!(!extensions.contains("CHUNKING"));
        assert_eq!(
            extensions.auth_mechanisms(),
            vec!["PLAIN", "LOGIN", "CRAM-MD5"]
        );
    }

    #[test]
    fn greeting_line_is_not_an_extension() {
        let extensions = Extensions::from_ehlo(&ehlo_reply(&["SIZE matters, says the greeting"]));
        assert!(!extensions.contains("SIZE"));
    }

    #[test]
    fn equals_form_auth_is_recognized() {
        let extensions =
            Extensions::from_ehlo(&ehlo_reply(&["mail.example.com", "AUTH=PLAIN LOGIN"]));
        assert_eq!(extensions.auth_mechanisms(), vec!["PLAIN", "LOGIN"]);
    }

    #[test]
    fn malformed_size_is_ignored() {
        let extensions = Extensions::from_ehlo(&ehlo_reply(&["mail.example.com", "SIZE lots"]));
        assert!(extensions.contains("SIZE"));
        assert_eq!(extensions.size_limit(), None);
    }
}
