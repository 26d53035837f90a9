//! RFC 822/MIME serialization of a built message.
//!
//! The multipart nesting follows a fixed decision tree:
//! mixed wraps everything when regular attachments share the message with
//! other content, related wraps inline files with the body, alternative
//! wraps multiple body parts. With a single entity no wrapper is emitted.
//! Text parts are quoted-printable, files are base64, everything is UTF-8.

use std::fmt::Write as _;

use uuid::Uuid;

use crate::attachment::ResolvedAttachment;
use crate::encoding::{base64_wrapped, encode_header_value, quoted_printable};
use crate::message::{MailMessage, Mailbox};
use crate::request::BodyPart;

/// Serialize the message: headers, then the multipart body.
pub(crate) fn serialize(message: &MailMessage) -> Vec<u8> {
    let mut head = String::with_capacity(512);

    push_header(&mut head, "MIME-Version", "1.0");
    if let Some(date) = &message.date {
        push_header(&mut head, "Date", &date.to_rfc2822());
    }

    let domain = message
        .from
        .as_ref()
        .map_or("localhost", Mailbox::domain);
    push_header(
        &mut head,
        "Message-ID",
        &format!("<{}@{}>", Uuid::new_v4().simple(), domain),
    );

    if let Some(from) = &message.from {
        push_header(&mut head, "From", &from.to_string());
    }
    if let Some(sender) = &message.sender {
        push_header(&mut head, "Sender", &sender.to_string());
    }
    if !message.to.is_empty() {
        push_header(&mut head, "To", &join_mailboxes(&message.to));
    }
    if !message.cc.is_empty() {
        push_header(&mut head, "Cc", &join_mailboxes(&message.cc));
    }
    if let Some(reply_to) = &message.reply_to {
        push_header(&mut head, "Reply-To", &reply_to.to_string());
    }
    if let Some(return_path) = &message.return_path {
        push_header(&mut head, "Return-Path", &format!("<{}>", return_path.address));
    }
    // Bcc recipients exist only in the envelope.
    push_header(&mut head, "Subject", &encode_header_value(&message.subject));
    for (name, value) in &message.extra_headers {
        push_header(&mut head, name, value);
    }

    let (content_headers, body) = serialize_body(message);

    let mut out = String::with_capacity(head.len() + content_headers.len() + body.len() + 2);
    out.push_str(&head);
    out.push_str(&content_headers);
    out.push_str("\r\n");
    out.push_str(&body);
    out.into_bytes()
}

/// Build the entity headers and body according to the nesting tree.
fn serialize_body(message: &MailMessage) -> (String, String) {
    let parts = &message.parts;
    let inlines = &message.inlines;
    let attachments = &message.attachments;

    let mixed = attachments.len() > 1
        || (!parts.is_empty() && !attachments.is_empty())
        || (!inlines.is_empty() && !attachments.is_empty());
    let related = inlines.len() > 1 || (!parts.is_empty() && !inlines.is_empty());
    let alternative = parts.len() > 1;

    if !mixed && !related && !alternative {
        return serialize_single_entity(message);
    }

    let b_mixed = boundary();
    let b_related = boundary();
    let b_alternative = boundary();

    let (top_kind, top_boundary) = if mixed {
        ("mixed", &b_mixed)
    } else if related {
        ("related", &b_related)
    } else {
        ("alternative", &b_alternative)
    };
    let content_headers =
        format!("Content-Type: multipart/{top_kind}; boundary=\"{top_boundary}\"\r\n");

    let mut body = String::new();

    if related && mixed {
        open_nested(&mut body, &b_mixed, "related", &b_related);
    }
    if alternative && (mixed || related) {
        let parent = if related { &b_related } else { &b_mixed };
        open_nested(&mut body, parent, "alternative", &b_alternative);
    }

    let parts_boundary = if alternative {
        &b_alternative
    } else if related {
        &b_related
    } else {
        &b_mixed
    };
    for part in parts {
        write_part(&mut body, parts_boundary, part);
    }
    if alternative {
        close_boundary(&mut body, &b_alternative);
    }

    let inline_boundary = if related { &b_related } else { &b_mixed };
    for file in inlines {
        write_file(&mut body, inline_boundary, file);
    }
    if related {
        close_boundary(&mut body, &b_related);
    }

    for file in attachments {
        write_file(&mut body, &b_mixed, file);
    }
    if mixed {
        close_boundary(&mut body, &b_mixed);
    }

    (content_headers, body)
}

/// A message with at most one entity is serialized without any wrapper.
fn serialize_single_entity(message: &MailMessage) -> (String, String) {
    if let Some(part) = message.parts.first() {
        let mut body = quoted_printable(part.body.as_bytes());
        body.push_str("\r\n");
        return (part_headers(part), body);
    }
    if let Some(file) = message
        .inlines
        .first()
        .or_else(|| message.attachments.first())
    {
        let mut body = base64_wrapped(&file.data);
        body.push_str("\r\n");
        return (file_headers(file), body);
    }
    (
        "Content-Type: text/plain; charset=\"UTF-8\"\r\nContent-Transfer-Encoding: quoted-printable\r\n"
            .to_string(),
        String::new(),
    )
}

fn push_header(out: &mut String, name: &str, value: &str) {
    let _ = write!(out, "{name}: {value}\r\n");
}

fn join_mailboxes(mailboxes: &[Mailbox]) -> String {
    mailboxes
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn boundary() -> String {
    Uuid::new_v4().simple().to_string()
}

fn open_nested(body: &mut String, parent: &str, kind: &str, child: &str) {
    let _ = write!(
        body,
        "--{parent}\r\nContent-Type: multipart/{kind}; boundary=\"{child}\"\r\n\r\n"
    );
}

fn close_boundary(body: &mut String, boundary: &str) {
    let _ = write!(body, "--{boundary}--\r\n");
}

fn part_headers(part: &BodyPart) -> String {
    format!(
        "Content-Type: {}; charset=\"UTF-8\"\r\nContent-Transfer-Encoding: quoted-printable\r\n",
        part.content_type
    )
}

fn write_part(body: &mut String, boundary: &str, part: &BodyPart) {
    let _ = write!(body, "--{boundary}\r\n{}", part_headers(part));
    body.push_str("\r\n");
    body.push_str(&quoted_printable(part.body.as_bytes()));
    body.push_str("\r\n");
}

fn file_headers(file: &ResolvedAttachment) -> String {
    let mut headers = format!(
        "Content-Type: {}; name=\"{}\"\r\nContent-Transfer-Encoding: base64\r\n",
        file.mime_type, file.name
    );
    if file.inline {
        let _ = write!(
            headers,
            "Content-Disposition: inline; filename=\"{}\"\r\nContent-ID: <{}>\r\n",
            file.name, file.name
        );
    } else {
        let _ = write!(
            headers,
            "Content-Disposition: attachment; filename=\"{}\"\r\n",
            file.name
        );
    }
    headers
}

fn write_file(body: &mut String, boundary: &str, file: &ResolvedAttachment) {
    let _ = write!(body, "--{boundary}\r\n{}", file_headers(file));
    body.push_str("\r\n");
    body.push_str(&base64_wrapped(&file.data));
    body.push_str("\r\n");
}
