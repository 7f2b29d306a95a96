//! Minimal RFC 5322 / MIME walker
//!
//! Only what hashing needs: header unfolding, multipart splitting and
//! transfer-encoding decode. Anything it cannot make sense of is reported as a
//! [`MimeError`] so callers can fall back to "hash unavailable".

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use std::collections::HashMap;
use thiserror::Error;

const MAX_DEPTH: usize = 16;

/// Lenient about padding, strict about the alphabet
const BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Error)]
pub enum MimeError {
    #[error("multipart part without a boundary parameter")]
    MissingBoundary,
    #[error("multipart boundary {0:?} never appears in the body")]
    BoundaryNotFound(String),
    #[error("invalid base64 content: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("multipart nesting too deep")]
    TooDeep,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// A message or body part: headers plus the still-encoded body
#[derive(Debug, Clone)]
pub struct Part {
    pub headers: Vec<Header>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType {
    /// Lowercased `type/subtype`
    pub media_type: String,
    pub params: HashMap<String, String>,
}

impl ContentType {
    pub fn is_multipart(&self) -> bool {
        self.media_type.starts_with("multipart/")
    }

    pub fn is_text(&self) -> bool {
        self.media_type.starts_with("text/")
    }
}

impl Default for ContentType {
    fn default() -> Self {
        Self {
            media_type: "text/plain".to_string(),
            params: HashMap::new(),
        }
    }
}

impl Part {
    pub fn parse(raw: &[u8]) -> Self {
        let (head, body) = split_header_block(raw);
        Self {
            headers: parse_headers(head),
            body: body.to_vec(),
        }
    }

    /// First header with this name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn content_type(&self) -> ContentType {
        match self.header("content-type") {
            Some(value) => {
                let (media_type, params) = parse_parameterized(value);
                if media_type.contains('/') {
                    ContentType { media_type, params }
                } else {
                    ContentType::default()
                }
            }
            None => ContentType::default(),
        }
    }

    /// Lowercased disposition type (`attachment`, `inline`), if declared
    pub fn disposition(&self) -> Option<String> {
        self.header("content-disposition")
            .map(|value| parse_parameterized(value).0)
            .filter(|d| !d.is_empty())
    }

    /// Filename from Content-Disposition, falling back to Content-Type `name`
    pub fn filename(&self) -> Option<String> {
        let from_disposition = self
            .header("content-disposition")
            .and_then(|value| parse_parameterized(value).1.remove("filename"));
        from_disposition
            .or_else(|| self.content_type().params.remove("name"))
            .filter(|name| !name.is_empty())
    }

    /// Body with the Content-Transfer-Encoding undone
    pub fn decoded_body(&self) -> Result<Vec<u8>, MimeError> {
        let encoding = self
            .header("content-transfer-encoding")
            .map(|e| e.trim().to_ascii_lowercase())
            .unwrap_or_default();

        match encoding.as_str() {
            "base64" => {
                let compact: Vec<u8> = self
                    .body
                    .iter()
                    .copied()
                    .filter(|b| !b.is_ascii_whitespace())
                    .collect();
                Ok(BASE64.decode(compact)?)
            }
            "quoted-printable" => Ok(decode_quoted_printable(&self.body)),
            _ => Ok(self.body.clone()),
        }
    }

    /// Every non-multipart part, depth first, in document order
    pub fn leaves(&self) -> Result<Vec<Part>, MimeError> {
        let mut out = Vec::new();
        collect_leaves(self, 0, &mut out)?;
        Ok(out)
    }
}

fn collect_leaves(part: &Part, depth: usize, out: &mut Vec<Part>) -> Result<(), MimeError> {
    if depth > MAX_DEPTH {
        return Err(MimeError::TooDeep);
    }

    let content_type = part.content_type();
    if !content_type.is_multipart() {
        out.push(part.clone());
        return Ok(());
    }

    let boundary = content_type
        .params
        .get("boundary")
        .filter(|b| !b.is_empty())
        .ok_or(MimeError::MissingBoundary)?;

    for child in split_multipart(&part.body, boundary)? {
        collect_leaves(&Part::parse(&child), depth + 1, out)?;
    }
    Ok(())
}

/// Split at the first empty line; a message without one is all headers
pub fn split_header_block(raw: &[u8]) -> (&[u8], &[u8]) {
    if raw.starts_with(b"\r\n") {
        return (&[], &raw[2..]);
    }
    if raw.starts_with(b"\n") {
        return (&[], &raw[1..]);
    }

    let crlf = find(raw, b"\r\n\r\n").map(|i| (i, 4));
    let lf = find(raw, b"\n\n").map(|i| (i, 2));
    let split = match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    };

    match split {
        Some((i, len)) => (&raw[..i], &raw[i + len..]),
        None => (raw, &[]),
    }
}

/// Unfold continuation lines and split `Name: value` pairs
pub fn parse_headers(block: &[u8]) -> Vec<Header> {
    let text = String::from_utf8_lossy(block);
    let mut headers: Vec<Header> = Vec::new();

    for line in text.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = headers.last_mut() {
                last.value.push(' ');
                last.value.push_str(line.trim());
            }
            continue;
        }

        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim();
            if name.is_empty() || name.contains(' ') {
                continue;
            }
            headers.push(Header {
                name: name.to_string(),
                value: value.trim().to_string(),
            });
        }
    }

    headers
}

/// `type; key=value; key="quoted value"` into (lowercased type, params)
fn parse_parameterized(value: &str) -> (String, HashMap<String, String>) {
    let mut segments = split_unquoted(value, ';').into_iter();
    let head = segments
        .next()
        .map(|s| s.trim().to_ascii_lowercase())
        .unwrap_or_default();

    let params = segments
        .filter_map(|segment| {
            let (key, val) = segment.split_once('=')?;
            let key = key.trim().to_ascii_lowercase();
            let val = val.trim().trim_matches('"').to_string();
            Some((key, val))
        })
        .collect();

    (head, params)
}

fn split_unquoted(value: &str, sep: char) -> Vec<&str> {
    let mut out = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in value.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c == sep && !in_quotes => {
                out.push(&value[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    out.push(&value[start..]);
    out
}

/// Child bodies between `--boundary` delimiter lines
///
/// Line endings inside parts are normalized to `\n`. A missing closing
/// delimiter is tolerated; a body that never mentions the boundary is not.
fn split_multipart(body: &[u8], boundary: &str) -> Result<Vec<Vec<u8>>, MimeError> {
    let delimiter = format!("--{}", boundary);
    let closing = format!("--{}--", boundary);

    let mut parts = Vec::new();
    let mut current: Option<Vec<&[u8]>> = None;
    let mut seen_delimiter = false;

    for line in body.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let trimmed = trim_end_ascii(line);

        if trimmed == closing.as_bytes() {
            if let Some(lines) = current.take() {
                parts.push(lines.join(&b'\n'));
            }
            seen_delimiter = true;
            break;
        }
        if trimmed == delimiter.as_bytes() {
            if let Some(lines) = current.take() {
                parts.push(lines.join(&b'\n'));
            }
            current = Some(Vec::new());
            seen_delimiter = true;
            continue;
        }
        if let Some(lines) = current.as_mut() {
            lines.push(line);
        }
    }

    if let Some(lines) = current.take() {
        parts.push(lines.join(&b'\n'));
    }

    if !seen_delimiter {
        return Err(MimeError::BoundaryNotFound(boundary.to_string()));
    }
    Ok(parts)
}

fn decode_quoted_printable(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        let b = input[i];
        if b != b'=' {
            out.push(b);
            i += 1;
            continue;
        }

        // Soft line break
        if input[i + 1..].starts_with(b"\r\n") {
            i += 3;
            continue;
        }
        if input[i + 1..].starts_with(b"\n") {
            i += 2;
            continue;
        }

        let hex = input.get(i + 1..i + 3).and_then(|pair| {
            let s = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(s, 16).ok()
        });
        match hex {
            Some(byte) => {
                out.push(byte);
                i += 3;
            }
            None => {
                out.push(b'=');
                i += 1;
            }
        }
    }
    out
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn trim_end_ascii(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    &bytes[..end]
}
