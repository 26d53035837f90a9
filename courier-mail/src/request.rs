//! The email-send request as decoded from a bus payload.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::attachment::Attachment;
use crate::message::MailMessage;

/// Body part content type tags.
///
/// Unknown tags survive decoding so that the renderer, not the JSON layer,
/// decides their fate: an unrecognized tag fails the request
/// deterministically instead of poisoning the whole payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentType {
    TextPlain,
    TextHtml,
    TextCalendar,
    TextAmp,
    Other(String),
}

impl ContentType {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::TextPlain => "text/plain",
            Self::TextHtml => "text/html",
            Self::TextCalendar => "text/calendar",
            Self::TextAmp => "text/x-amp-html",
            Self::Other(tag) => tag,
        }
    }

    /// HTML-family parts are rendered with HTML escaping.
    #[must_use]
    pub const fn is_html(&self) -> bool {
        matches!(self, Self::TextHtml | Self::TextAmp)
    }
}

impl Default for ContentType {
    fn default() -> Self {
        Self::TextPlain
    }
}

impl From<&str> for ContentType {
    fn from(tag: &str) -> Self {
        match tag {
            "text/plain" => Self::TextPlain,
            "text/html" => Self::TextHtml,
            "text/calendar" => Self::TextCalendar,
            "text/x-amp-html" => Self::TextAmp,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ContentType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ContentType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(Self::from(tag.as_str()))
    }
}

/// One part of the message body. Before rendering `body` holds template
/// source; after rendering it holds the final text.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct BodyPart {
    pub content_type: ContentType,
    pub body: String,
}

/// Template locale. Anything that is not `ru` normalizes to `en`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Locale {
    #[default]
    En,
    Ru,
}

impl Locale {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::En => "en",
            Self::Ru => "ru",
        }
    }
}

impl fmt::Display for Locale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Locale {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Locale {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(if raw == "ru" { Self::Ru } else { Self::En })
    }
}

/// Sender profile selector. `singleSender` (or nothing) is the only
/// supported profile; anything else is preserved verbatim so the dispatcher
/// can reject it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FromProfile {
    #[default]
    SingleSender,
    Other(String),
}

impl Serialize for FromProfile {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::SingleSender => serializer.serialize_str("singleSender"),
            Self::Other(profile) => serializer.serialize_str(profile),
        }
    }
}

impl<'de> Deserialize<'de> for FromProfile {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "" | "singleSender" => Self::SingleSender,
            _ => Self::Other(raw),
        })
    }
}

/// Advanced settings of the mailer service carried with a request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct ServiceSettings {
    /// Keys the template store; empty means "no template".
    pub name: String,
    pub from: FromProfile,
    pub locale: Locale,
}

/// An email-send request from the bus.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct EmailRequest {
    pub to: Vec<String>,
    pub subject: String,
    pub copy_to: Vec<String>,
    pub blind_copy_to: Vec<String>,
    pub sender: String,
    pub reply_to: String,
    pub parts: Vec<BodyPart>,
    /// Template variables substituted into part bodies.
    pub part_values: serde_json::Map<String, serde_json::Value>,
    pub files: Vec<Attachment>,
    pub settings: ServiceSettings,
}

impl EmailRequest {
    /// The validity rule checked after template merge: a subject plus at
    /// least one part or attachment.
    #[must_use]
    pub fn has_content(&self) -> bool {
        !self.subject.is_empty() && (!self.parts.is_empty() || !self.files.is_empty())
    }

    /// Every recipient (To, Cc, Bcc) joined with `delimiter`, for log lines.
    #[must_use]
    pub fn recipients(&self, delimiter: &str) -> String {
        self.to
            .iter()
            .chain(&self.copy_to)
            .chain(&self.blind_copy_to)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(delimiter)
    }

    /// Move the request's content into a message started from the sender
    /// profile. Parts are expected to be rendered already; any invalid
    /// address or attachment poisons the builder and surfaces at send time.
    #[must_use]
    pub fn into_message(self, mut message: MailMessage) -> MailMessage {
        message.set_subject(&self.subject);

        if !self.sender.is_empty() {
            message.set_sender(&self.sender);
        }
        if !self.reply_to.is_empty() {
            message.set_reply_to(&self.reply_to);
        }

        message.add_to(&self.to);
        message.add_cc(&self.copy_to);
        message.add_bcc(&self.blind_copy_to);

        for file in &self.files {
            message.attach(file);
        }
        message.set_parts(self.parts);

        message
    }
}
