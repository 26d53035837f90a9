//! Content-type-aware template rendering.
//!
//! Every body part is a template source; the request's variable map is
//! substituted into it. The escaping policy belongs to the engine, not the
//! caller: HTML-family parts render with HTML autoescaping, text-family
//! parts render verbatim. Rendering is pure and deterministic, so a failure
//! here is an input defect, never a retriable one.
//!
//! Producers address variables with the dot-rooted accessor convention
//! (`{{.name}}`), where the leading dot is the variable map itself. The
//! engine here takes bare identifiers, so sources are translated before
//! parsing; bare `{{name}}` sources pass through untouched and both
//! conventions render identically.

use tera::{Context, Tera};

use crate::error::MailError;
use crate::request::{ContentType, EmailRequest};

/// Render every body part of `request` in place.
///
/// # Errors
///
/// Returns an error on an unknown content type or when template parsing or
/// substitution fails.
pub fn render_parts(request: &mut EmailRequest) -> Result<(), MailError> {
    if request.parts.is_empty() {
        return Ok(());
    }

    let context = Context::from_serialize(&request.part_values)?;

    for part in &mut request.parts {
        let autoescape = match &part.content_type {
            ContentType::TextHtml | ContentType::TextAmp => true,
            ContentType::TextPlain | ContentType::TextCalendar => false,
            ContentType::Other(tag) => {
                return Err(MailError::ContentTypeNotFound(tag.clone()));
            }
        };
        let source = translate_dot_accessors(&part.body);
        part.body = Tera::one_off(&source, &context, autoescape)?;
    }

    Ok(())
}

/// Rewrite `{{.field}}` expressions to the engine's bare `{{field}}` form.
///
/// Only a dot immediately heading an expression is dropped, and only when
/// it introduces an identifier, so `{{user.name}}` and literal text outside
/// expressions stay untouched.
fn translate_dot_accessors(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();

    while let Some(ch) = chars.next() {
        out.push(ch);
        if ch != '{' || chars.peek() != Some(&'{') {
            continue;
        }
        out.push('{');
        chars.next();

        if chars.peek() == Some(&'-') {
            out.push('-');
            chars.next();
        }
        while let Some(&c) = chars.peek() {
            if !c.is_whitespace() {
                break;
            }
            out.push(c);
            chars.next();
        }

        if chars.peek() == Some(&'.') {
            let mut ahead = chars.clone();
            ahead.next();
            if ahead
                .peek()
                .is_some_and(|c| c.is_alphanumeric() || *c == '_')
            {
                chars.next();
            }
        }
    }

    out
}
