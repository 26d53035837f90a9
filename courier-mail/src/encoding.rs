//! Content transfer encodings used by the message serializer.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// Longest allowed encoded line, excluding the CRLF.
const LINE_LIMIT: usize = 76;

/// Quoted-printable encoding (RFC 2045 section 6.7).
///
/// Line breaks in the input are normalized to CRLF, trailing whitespace
/// before a break is encoded, and long lines get soft breaks.
pub(crate) fn quoted_printable(input: &[u8]) -> String {
    let mut out = String::with_capacity(input.len() + input.len() / 8);
    let mut line_len = 0usize;
    let mut bytes = input.iter().copied().peekable();

    while let Some(byte) = bytes.next() {
        match byte {
            b'\r' => {
                // Emitted together with the following newline.
            }
            b'\n' => {
                out.push_str("\r\n");
                line_len = 0;
            }
            b' ' | b'\t' => {
                let at_line_end =
                    matches!(bytes.peek(), None | Some(&b'\n') | Some(&b'\r'));
                if at_line_end {
                    push_encoded(&mut out, &mut line_len, byte);
                } else {
                    push_literal(&mut out, &mut line_len, byte);
                }
            }
            0x21..=0x3C | 0x3E..=0x7E => push_literal(&mut out, &mut line_len, byte),
            _ => push_encoded(&mut out, &mut line_len, byte),
        }
    }
    out
}

fn push_literal(out: &mut String, line_len: &mut usize, byte: u8) {
    if *line_len + 1 >= LINE_LIMIT {
        out.push_str("=\r\n");
        *line_len = 0;
    }
    out.push(byte as char);
    *line_len += 1;
}

fn push_encoded(out: &mut String, line_len: &mut usize, byte: u8) {
    if *line_len + 3 >= LINE_LIMIT {
        out.push_str("=\r\n");
        *line_len = 0;
    }
    out.push('=');
    out.push_str(&format!("{byte:02X}"));
    *line_len += 3;
}

/// Base64 with CRLF line wrapping at 76 columns (RFC 2045 section 6.8).
pub(crate) fn base64_wrapped(data: &[u8]) -> String {
    let encoded = BASE64.encode(data);
    let mut out = String::with_capacity(encoded.len() + 2 * (encoded.len() / LINE_LIMIT + 1));
    let mut start = 0;
    while start < encoded.len() {
        let end = usize::min(start + LINE_LIMIT, encoded.len());
        if start > 0 {
            out.push_str("\r\n");
        }
        out.push_str(&encoded[start..end]);
        start = end;
    }
    out
}

/// RFC 2047 header encoding. ASCII text passes through untouched; anything
/// else becomes B-encoded UTF-8 words folded across lines.
pub(crate) fn encode_header_value(value: &str) -> String {
    let plain = value
        .chars()
        .all(|c| c.is_ascii() && (!c.is_ascii_control() || c == '\t'));
    if plain {
        return value.to_string();
    }

    // 42 raw bytes keep each encoded word within the 75-char bound.
    const CHUNK: usize = 42;
    let mut words = Vec::new();
    let mut chunk = String::new();
    for ch in value.chars() {
        if chunk.len() + ch.len_utf8() > CHUNK {
            words.push(format!("=?UTF-8?B?{}?=", BASE64.encode(&chunk)));
            chunk.clear();
        }
        chunk.push(ch);
    }
    if !chunk.is_empty() {
        words.push(format!("=?UTF-8?B?{}?=", BASE64.encode(&chunk)));
    }
    words.join("\r\n ")
}

/// Escape lines starting with a dot for transmission inside DATA
/// (RFC 5321 section 4.5.2). Applied after signing, so signatures cover the
/// unstuffed bytes.
pub(crate) fn dot_stuff(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 8);
    let mut at_line_start = true;
    for &byte in data {
        if at_line_start && byte == b'.' {
            out.push(b'.');
        }
        out.push(byte);
        at_line_start = byte == b'\n';
    }
    out
}
