//! Stored template documents and their merge into requests.

use serde::{Deserialize, Serialize};

use crate::attachment::Attachment;
use crate::request::{BodyPart, EmailRequest, Locale};

/// A template document from the store, keyed by (name, locale).
///
/// It carries defaults for the request fields a caller may omit. The merge
/// policy is fill-absent: a field the request already provides always wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct StoredTemplate {
    pub name: String,
    pub locale: Locale,
    pub subject: String,
    pub parts: Vec<BodyPart>,
    pub files: Vec<Attachment>,
}

impl StoredTemplate {
    /// Fill the request's empty fields from this template.
    pub fn merge_into(&self, request: &mut EmailRequest) {
        if request.subject.is_empty() && !self.subject.is_empty() {
            request.subject = self.subject.clone();
        }
        if request.parts.is_empty() && !self.parts.is_empty() {
            request.parts = self.parts.clone();
        }
        if request.files.is_empty() && !self.files.is_empty() {
            request.files = self.files.clone();
        }
    }
}
