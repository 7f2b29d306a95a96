//! Comparison keys for scan result reuse
//!
//! Three keys with decreasing precision:
//! 1. full hash: the whole message minus per-delivery header noise
//! 2. attachment hash: the set of binary attachments, order independent
//! 3. template hash: subject plus personalisation-masked text body, bound to
//!    the link targets and the attachment set
//!
//! Only the full hash is always available. The other two return `None` when
//! the message has nothing to key on or cannot be parsed.

use crate::content::mime::{self, MimeError, Part};
use crate::content::normalize;
use blake3::Hasher;
use tracing::debug;

const FULL_DOMAIN: &[u8] = b"mailworker.full.v1\0";
const ATTACHMENT_DOMAIN: &[u8] = b"mailworker.attachment.v1\0";
const TEMPLATE_DOMAIN: &[u8] = b"mailworker.template.v1\0";

/// Stands in for the attachment digest of a message without attachments
const NO_ATTACHMENTS: &str = "none";

/// Hash of the message with routing, recipient, id, date and signature headers neutralized
///
/// Identical for every recipient of the same content.
pub fn full_hash(raw: &[u8]) -> String {
    let (head, body) = mime::split_header_block(raw);
    let headers = mime::parse_headers(head);

    let mut hasher = Hasher::new();
    hasher.update(FULL_DOMAIN);
    hasher.update(normalize::canonical_headers(&headers).as_bytes());
    hasher.update(b"\n");
    hasher.update(body);
    hasher.finalize().to_hex().to_string()
}

/// Hash of all binary attachments, or `None` if there are none
///
/// Attachments are hashed as sorted (filename, media type, decoded bytes)
/// tuples so part order never matters.
pub fn attachment_hash(raw: &[u8]) -> Option<String> {
    match Part::parse(raw).leaves().and_then(|leaves| attachment_digest(&leaves)) {
        Ok(digest) => digest,
        Err(e) => {
            debug!(error = %e, "Attachment hash unavailable");
            None
        }
    }
}

/// Hash of the subject, the personalisation-masked primary text body, every
/// link target and the attachment set
///
/// A template match therefore never spans messages whose links or
/// attachments differ.
pub fn template_hash(raw: &[u8]) -> Option<String> {
    match template_digest(&Part::parse(raw)) {
        Ok(digest) => digest,
        Err(e) => {
            debug!(error = %e, "Template hash unavailable");
            None
        }
    }
}

fn attachment_digest(leaves: &[Part]) -> Result<Option<String>, MimeError> {
    let mut attachments: Vec<(String, String, Vec<u8>)> = Vec::new();
    for part in leaves.iter().filter(|p| is_binary_attachment(p)) {
        attachments.push((
            part.filename().unwrap_or_default(),
            part.content_type().media_type,
            part.decoded_body()?,
        ));
    }

    if attachments.is_empty() {
        return Ok(None);
    }
    attachments.sort();

    let mut hasher = Hasher::new();
    hasher.update(ATTACHMENT_DOMAIN);
    for (filename, media_type, data) in &attachments {
        update_framed(&mut hasher, filename.as_bytes());
        update_framed(&mut hasher, media_type.as_bytes());
        update_framed(&mut hasher, data);
    }
    Ok(Some(hasher.finalize().to_hex().to_string()))
}

fn template_digest(root: &Part) -> Result<Option<String>, MimeError> {
    let leaves = root.leaves()?;

    let Some(body) = primary_text(&leaves)? else {
        return Ok(None);
    };
    let body = normalize::template_body(&body);
    if body.is_empty() {
        return Ok(None);
    }
    let subject = normalize::template_subject(root.header("subject").unwrap_or_default());
    let links = html_links(&leaves)?;
    let attachments = attachment_digest(&leaves)?;

    let mut hasher = Hasher::new();
    hasher.update(TEMPLATE_DOMAIN);
    update_framed(&mut hasher, subject.as_bytes());
    update_framed(&mut hasher, body.as_bytes());
    hasher.update(&(links.len() as u64).to_le_bytes());
    for link in &links {
        update_framed(&mut hasher, link.as_bytes());
    }
    update_framed(
        &mut hasher,
        attachments.as_deref().unwrap_or(NO_ATTACHMENTS).as_bytes(),
    );
    Ok(Some(hasher.finalize().to_hex().to_string()))
}

/// `href`/`src` targets of every inline HTML part, in document order
fn html_links(leaves: &[Part]) -> Result<Vec<String>, MimeError> {
    let mut links = Vec::new();
    for part in leaves
        .iter()
        .filter(|p| p.content_type().media_type == "text/html" && !is_binary_attachment(p))
    {
        let html = String::from_utf8_lossy(&part.decoded_body()?).into_owned();
        links.extend(normalize::link_targets(&html));
    }
    Ok(links)
}

/// All three keys for one payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentHashes {
    pub full: String,
    pub attachment: Option<String>,
    pub template: Option<String>,
}

impl ContentHashes {
    pub fn compute(raw: &[u8]) -> Self {
        Self {
            full: full_hash(raw),
            attachment: attachment_hash(raw),
            template: template_hash(raw),
        }
    }
}

fn is_binary_attachment(part: &Part) -> bool {
    let content_type = part.content_type();
    if content_type.is_multipart() {
        return false;
    }
    if part.disposition().as_deref() == Some("attachment") || part.filename().is_some() {
        return true;
    }
    !content_type.is_text()
}

/// First inline text/plain part, else first inline text/html with tags stripped
fn primary_text(leaves: &[Part]) -> Result<Option<String>, MimeError> {
    let inline_text = |media_type: &str| {
        leaves.iter().find(|part| {
            part.content_type().media_type == media_type && !is_binary_attachment(part)
        })
    };

    if let Some(part) = inline_text("text/plain") {
        let bytes = part.decoded_body()?;
        return Ok(Some(String::from_utf8_lossy(&bytes).into_owned()));
    }
    if let Some(part) = inline_text("text/html") {
        let bytes = part.decoded_body()?;
        return Ok(Some(normalize::strip_html(&String::from_utf8_lossy(&bytes))));
    }
    Ok(None)
}

/// Length-prefix each field so adjacent fields cannot run together
fn update_framed(hasher: &mut Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(to: &str, message_id: &str, body: &str) -> Vec<u8> {
        format!(
            "Received: from relay.example.net by mx.example.com\r\n\
             DKIM-Signature: v=1; a=rsa-sha256; b={message_id}sig\r\n\
             From: news@example.com\r\n\
             To: {to}\r\n\
             Message-ID: <{message_id}@example.com>\r\n\
             Date: Mon, 19 Oct 2026 10:00:00 +0000\r\n\
             Subject: Weekly digest\r\n\
             \r\n\
             {body}"
        )
        .into_bytes()
    }

    fn with_attachments(subject: &str, parts: &[(&str, &str, &str)]) -> Vec<u8> {
        let mut raw = format!(
            "Subject: {subject}\r\n\
             Content-Type: multipart/mixed; boundary=\"b1\"\r\n\
             \r\n\
             --b1\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             See attached.\r\n"
        );
        for (filename, media_type, base64) in parts {
            raw.push_str(&format!(
                "--b1\r\n\
                 Content-Type: {media_type}\r\n\
                 Content-Disposition: attachment; filename=\"{filename}\"\r\n\
                 Content-Transfer-Encoding: base64\r\n\
                 \r\n\
                 {base64}\r\n"
            ));
        }
        raw.push_str("--b1--\r\n");
        raw.into_bytes()
    }

    fn templated(subject: &str, body: &str) -> Vec<u8> {
        format!("Subject: {subject}\r\nContent-Type: text/plain\r\n\r\n{body}").into_bytes()
    }

    #[test]
    fn test_full_hash_ignores_delivery_fields() {
        let a = message("alice@example.org", "id-1", "Same body");
        let b = message("bob@example.net", "id-2", "Same body");
        assert_eq!(full_hash(&a), full_hash(&b));
    }

    #[test]
    fn test_full_hash_sees_body_changes() {
        let a = message("alice@example.org", "id-1", "Same body");
        let b = message("alice@example.org", "id-1", "Same body!");
        assert_ne!(full_hash(&a), full_hash(&b));
    }

    #[test]
    fn test_full_hash_sees_subject_changes() {
        let a = message("alice@example.org", "id-1", "x");
        let b = String::from_utf8(a.clone())
            .unwrap()
            .replace("Weekly digest", "Daily digest")
            .into_bytes();
        assert_ne!(full_hash(&a), full_hash(&b));
    }

    #[test]
    fn test_full_hash_of_garbage_still_works() {
        let digest = full_hash(&[0xff, 0xfe, 0x00, 0x01]);
        assert_eq!(digest.len(), 64);
    }

    #[test]
    fn test_attachment_hash_none_without_attachments() {
        assert!(attachment_hash(&message("a@example.org", "1", "text only")).is_none());
        assert!(attachment_hash(&with_attachments("s", &[])).is_none());
    }

    #[test]
    fn test_attachment_hash_order_independent() {
        let one = ("a.pdf", "application/pdf", "JVBERi0xLjQK");
        let two = ("b.zip", "application/zip", "UEsDBAo=");

        let forward = attachment_hash(&with_attachments("s", &[one, two])).unwrap();
        let reversed = attachment_hash(&with_attachments("s", &[two, one])).unwrap();
        assert_eq!(forward, reversed);
    }

    #[test]
    fn test_attachment_hash_changes_with_bytes() {
        let original = ("a.pdf", "application/pdf", "JVBERi0xLjQK");
        let altered = ("a.pdf", "application/pdf", "JVBERi0xLjUK");

        assert_ne!(
            attachment_hash(&with_attachments("s", &[original])),
            attachment_hash(&with_attachments("s", &[altered]))
        );
    }

    #[test]
    fn test_attachment_hash_ignores_text_and_subject() {
        let part = ("a.pdf", "application/pdf", "JVBERi0xLjQK");
        assert_eq!(
            attachment_hash(&with_attachments("first", &[part])),
            attachment_hash(&with_attachments("second", &[part]))
        );
    }

    #[test]
    fn test_attachment_hash_parse_failure_is_none() {
        let broken = b"Content-Type: multipart/mixed\r\n\r\n--b1\r\nno boundary param\r\n";
        assert!(attachment_hash(broken).is_none());

        let bad_base64 = with_attachments("s", &[("a.bin", "application/octet-stream", "@@@@")]);
        assert!(attachment_hash(&bad_base64).is_none());
    }

    #[test]
    fn test_template_hash_masks_greeting_name() {
        let john = templated("Your statement", "Hi John, your statement is ready.");
        let sarah = templated("Your statement", "Hi Sarah, your statement is ready.");
        assert_eq!(template_hash(&john).unwrap(), template_hash(&sarah).unwrap());
    }

    #[test]
    fn test_template_hash_subject_breaks_match() {
        let a = templated("Your statement", "Hi John, your statement is ready.");
        let b = templated("Your invoice", "Hi John, your statement is ready.");
        assert_ne!(template_hash(&a), template_hash(&b));
    }

    #[test]
    fn test_template_hash_keeps_standalone_capitals() {
        let monday = templated("Offer", "Big Sale starts Monday.");
        let friday = templated("Offer", "Big Sale starts Friday.");
        assert_ne!(template_hash(&monday), template_hash(&friday));

        // A shared capitalized word is not enough to merge different content
        let a = templated("Offer", "Sale on shoes");
        let b = templated("Offer", "Sale on hats");
        assert_ne!(template_hash(&a), template_hash(&b));
    }

    #[test]
    fn test_template_hash_masks_identifiers() {
        let a = templated("Shipped", "Order 12345 shipped to bob@example.com");
        let b = templated("Shipped", "Order 99881 shipped to eve@example.net");
        assert_eq!(template_hash(&a), template_hash(&b));
    }

    #[test]
    fn test_template_hash_none_without_text() {
        let only_pdf = b"Subject: x\r\nContent-Type: application/pdf\r\n\r\nJVBER";
        assert!(template_hash(only_pdf).is_none());
        assert!(template_hash(b"Subject: x\r\n\r\n   ").is_none());
    }

    #[test]
    fn test_template_hash_html_fallback() {
        let html = b"Subject: x\r\nContent-Type: text/html\r\n\r\n<p>Dear Ann, hello</p>";
        let other = b"Subject: x\r\nContent-Type: text/html\r\n\r\n<div>Dear Bea, hello</div>";
        assert_eq!(template_hash(html), template_hash(other));
    }

    #[test]
    fn test_hash_domains_differ() {
        let raw = templated("x", "Hi John");
        let hashes = ContentHashes::compute(&raw);
        assert_ne!(Some(hashes.full.clone()), hashes.template);
        assert!(hashes.attachment.is_none());
    }

    fn templated_with_attachment(greeting: &str, base64: &str) -> Vec<u8> {
        format!(
            "Subject: Invoice\r\n\
             Content-Type: multipart/mixed; boundary=\"b1\"\r\n\
             \r\n\
             --b1\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             {greeting}, see attached.\r\n\
             --b1\r\n\
             Content-Type: application/octet-stream\r\n\
             Content-Disposition: attachment; filename=\"inv.exe\"\r\n\
             Content-Transfer-Encoding: base64\r\n\
             \r\n\
             {base64}\r\n\
             --b1--\r\n"
        )
        .into_bytes()
    }

    #[test]
    fn test_template_hash_bound_to_attachments() {
        let john = templated_with_attachment("Hi John", "JVBERi0xLjQK");
        let sarah = templated_with_attachment("Hi Sarah", "JVBERi0xLjQK");
        let swapped = templated_with_attachment("Hi John", "TVqQAAMAAAAEAAAA");

        assert_eq!(template_hash(&john), template_hash(&sarah));
        assert!(template_hash(&swapped).is_some());
        assert_ne!(template_hash(&john), template_hash(&swapped));

        // Same text without any attachment is a different template too
        let bare = templated("Invoice", "Hi John, see attached.");
        assert_ne!(template_hash(&john), template_hash(&bare));
    }

    #[test]
    fn test_template_hash_bound_to_link_targets() {
        let html = |href: &str| {
            format!(
                "Subject: Account notice\r\nContent-Type: text/html\r\n\r\n\
                 <p>Dear Ann, please <a href=\"{href}\">sign in</a>.</p>"
            )
            .into_bytes()
        };
        let genuine = html("https://bank.example/login");
        let phishing = html("https://bank-example.evil/login");
        assert_ne!(template_hash(&genuine), template_hash(&phishing));
        assert_eq!(template_hash(&genuine), template_hash(&html("https://bank.example/login")));
    }

    #[test]
    fn test_template_hash_sees_links_in_html_alternative() {
        let alternative = |href: &str| {
            format!(
                "Subject: Offer\r\n\
                 Content-Type: multipart/alternative; boundary=\"alt\"\r\n\r\n\
                 --alt\r\nContent-Type: text/plain\r\n\r\nClick here\r\n\
                 --alt\r\nContent-Type: text/html\r\n\r\n<a href=\"{href}\">Click here</a>\r\n\
                 --alt--\r\n"
            )
            .into_bytes()
        };
        assert_ne!(
            template_hash(&alternative("https://a.example/")),
            template_hash(&alternative("https://b.example/"))
        );
    }
}
