//! File attachments: content sourcing and MIME type derivation.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::MailError;

/// An attachment as described in a request or stored template.
///
/// Exactly one of `data`, `b64_data`, or `file_path` provides the content;
/// the first non-empty of them, in that order, wins. `name` is required
/// unless `file_path` is set, in which case it can be derived from the file
/// name. The MIME type falls back to the name/path extension and finally to
/// `application/octet-stream`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Attachment {
    pub file_path: String,
    pub name: String,
    pub mime_type: String,
    #[serde(rename = "b64Data")]
    pub b64_data: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    /// Inline parts are placed in the related branch of the message and get
    /// a `Content-ID`, so HTML bodies can reference them.
    pub inline: bool,
}

/// An attachment with its content bytes, name, and MIME type settled.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedAttachment {
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
    pub inline: bool,
}

impl Attachment {
    pub(crate) fn resolve(&self) -> Result<ResolvedAttachment, MailError> {
        let data = if !self.data.is_empty() {
            self.data.clone()
        } else if !self.b64_data.is_empty() {
            BASE64
                .decode(self.b64_data.trim())
                .map_err(|err| MailError::Attachment(format!("invalid base64 content: {err}")))?
        } else if !self.file_path.is_empty() {
            std::fs::read(&self.file_path).map_err(|err| {
                MailError::Attachment(format!("failed to read {}: {err}", self.file_path))
            })?
        } else {
            return Err(MailError::Attachment(
                "attachment has no content source".to_string(),
            ));
        };

        let name = if !self.name.is_empty() {
            self.name.clone()
        } else if !self.file_path.is_empty() {
            Path::new(&self.file_path)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default()
        } else {
            String::new()
        };
        if name.is_empty() {
            return Err(MailError::Attachment(
                "attachment has no name and none can be derived".to_string(),
            ));
        }

        let mime_type = if self.mime_type.is_empty() {
            mime_type_for(&name)
                .or_else(|| mime_type_for(&self.file_path))
                .unwrap_or("application/octet-stream")
                .to_string()
        } else {
            self.mime_type.clone()
        };

        Ok(ResolvedAttachment {
            name,
            mime_type,
            data,
            inline: self.inline,
        })
    }
}

/// MIME type by file extension.
fn mime_type_for(name: &str) -> Option<&'static str> {
    let extension = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
    Some(match extension.as_str() {
        "txt" => "text/plain",
        "htm" | "html" => "text/html",
        "ics" => "text/calendar",
        "csv" => "text/csv",
        "xml" => "text/xml",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        _ => return None,
    })
}

/// Go-style base64 transport for raw byte fields in JSON.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(de::Error::custom)
    }
}
