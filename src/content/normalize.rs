//! Normalization rules applied before hashing
//!
//! Two families:
//! - header canonicalization for the full-content hash (drop per-delivery
//!   fields, mask recipients)
//! - template substitution for the template hash (mask personalisation in the
//!   body, never in the subject)

use crate::content::mime::Header;
use lazy_static::lazy_static;
use regex::Regex;

/// Routing trace, per-recipient envelope fields, identifiers, dates and
/// per-message signatures
const VOLATILE_HEADERS: &[&str] = &[
    "received",
    "x-received",
    "return-path",
    "delivered-to",
    "x-original-to",
    "envelope-to",
    "x-envelope-to",
    "message-id",
    "date",
    "dkim-signature",
    "x-google-dkim-signature",
    "domainkey-signature",
    "arc-seal",
    "arc-message-signature",
    "arc-authentication-results",
    "authentication-results",
    "received-spf",
];

const RECIPIENT_HEADERS: &[&str] = &["to", "cc", "bcc"];

pub const RECIPIENT_PLACEHOLDER: &str = "<recipient>";

lazy_static! {
    static ref EMAIL: Regex =
        Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9-]+(?:\.[A-Za-z0-9-]+)*\.[A-Za-z]{2,}").unwrap();

    // "order 12345", "Ticket #9876", "invoice no. 42", "Reference: 7-11"
    static ref LABELED_ID: Regex = Regex::new(
        r"\b((?i:order|ticket|invoice|account|booking|reference|ref|case|confirmation|tracking))(\s*(?:#|(?i:no)\.?|(?i:number)|(?i:id))?\s*:?\s*)\d[\d-]*"
    )
    .unwrap();

    static ref PHONE: Regex = Regex::new(
        r"(?:\+\d{1,3}[\s.-]?)?(?:\(\d{2,4}\)|\b\d{2,4})[\s.-]\d{3,4}[\s.-]\d{3,4}\b"
    )
    .unwrap();

    // Only a capitalized word directly after a greeting token is a name
    static ref GREETING_NAME: Regex =
        Regex::new(r"\b((?i:hi|hello|dear))(\s+)\p{Lu}[\p{L}'-]*").unwrap();

    static ref HTML_TAG: Regex = Regex::new(r"(?s)<[^>]*>").unwrap();

    static ref LINK_ATTR: Regex = Regex::new(
        r#"(?i)\b(?:href|src)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>"']+))"#
    )
    .unwrap();

    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
}

/// Canonical header text for the full-content hash
///
/// Header order is preserved; names are lowercased and values whitespace
/// collapsed so refolding by a relay does not change the result.
pub fn canonical_headers(headers: &[Header]) -> String {
    let mut out = String::new();
    for header in headers {
        let name = header.name.to_ascii_lowercase();
        if VOLATILE_HEADERS.contains(&name.as_str()) {
            continue;
        }

        out.push_str(&name);
        out.push(':');
        if RECIPIENT_HEADERS.contains(&name.as_str()) {
            out.push_str(RECIPIENT_PLACEHOLDER);
        } else {
            out.push_str(&collapse_whitespace(&header.value));
        }
        out.push('\n');
    }
    out
}

/// Mask personalisation in a text body
///
/// Substitution is deliberately narrow: addresses, phone numbers, labeled
/// numeric identifiers and the single word following a greeting. Capitalized
/// words anywhere else are left alone.
pub fn template_body(text: &str) -> String {
    let text = EMAIL.replace_all(text, "<email>");
    let text = LABELED_ID.replace_all(&text, "${1}${2}<id>");
    let text = PHONE.replace_all(&text, "<phone>");
    let text = GREETING_NAME.replace_all(&text, "${1}${2}<name>");
    collapse_whitespace(&text)
}

/// Subjects only get whitespace collapsed; any wording difference must break a match
pub fn template_subject(subject: &str) -> String {
    collapse_whitespace(subject)
}

pub fn strip_html(html: &str) -> String {
    HTML_TAG.replace_all(html, " ").into_owned()
}

/// `href` and `src` attribute values, in document order
///
/// Stripping tags hides these, so they are hashed separately.
pub fn link_targets(html: &str) -> Vec<String> {
    LINK_ATTR
        .captures_iter(html)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3)))
        .map(|m| m.as_str().trim().to_string())
        .collect()
}

fn collapse_whitespace(text: &str) -> String {
    WHITESPACE.replace_all(text.trim(), " ").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(name: &str, value: &str) -> Header {
        Header {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_volatile_headers_dropped_and_recipients_masked() {
        let headers = vec![
            header("Received", "from mx1 by mx2"),
            header("Message-ID", "<abc@example.com>"),
            header("To", "alice@example.com"),
            header("Subject", "Weekly   digest"),
            header("DKIM-Signature", "v=1; b=xyz"),
        ];

        assert_eq!(
            canonical_headers(&headers),
            "to:<recipient>\nsubject:Weekly digest\n"
        );
    }

    #[test]
    fn test_greeting_name_substituted() {
        assert_eq!(template_body("Hi John, welcome"), "Hi <name>, welcome");
        assert_eq!(template_body("Dear  Sarah,"), "Dear <name>,");
        assert_eq!(template_body("hello Émile"), "hello <name>");
    }

    #[test]
    fn test_standalone_capitalized_words_kept() {
        assert_eq!(
            template_body("Big Sale on Monday"),
            "Big Sale on Monday"
        );
        // Not preceded by a greeting token
        assert_eq!(template_body("Thanks John"), "Thanks John");
    }

    #[test]
    fn test_contact_details_substituted() {
        assert_eq!(
            template_body("Write to bob.smith@mail.example.org today"),
            "Write to <email> today"
        );
        assert_eq!(
            template_body("Call +1 555-123-4567 now"),
            "Call <phone> now"
        );
    }

    #[test]
    fn test_labeled_identifiers_substituted() {
        assert_eq!(template_body("Your order 12345 shipped"), "Your order <id> shipped");
        assert_eq!(template_body("Ticket #9876 closed"), "Ticket #<id> closed");
        assert_eq!(template_body("invoice no. 42"), "invoice no. <id>");
        // Unlabeled numbers stay
        assert_eq!(template_body("Save 25 percent"), "Save 25 percent");
    }

    #[test]
    fn test_subject_only_whitespace() {
        assert_eq!(template_subject("  Order 123  shipped "), "Order 123 shipped");
    }

    #[test]
    fn test_strip_html() {
        assert_eq!(
            collapse_whitespace(&strip_html("<p>Hi <b>there</b></p>")),
            "Hi there"
        );
    }

    #[test]
    fn test_link_targets_in_document_order() {
        let html = r#"<a href="https://shop.example/sale">Shop</a>
            <img SRC='https://cdn.example/logo.png'> <a href=https://x.example/y>x</a>"#;
        assert_eq!(
            link_targets(html),
            vec![
                "https://shop.example/sale",
                "https://cdn.example/logo.png",
                "https://x.example/y"
            ]
        );
        assert!(link_targets("<p>no links</p>").is_empty());
    }
}
