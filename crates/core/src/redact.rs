//! Contact-detail redaction for negotiation messages
//!
//! Strips phone numbers, links, email addresses and messaging-app references
//! so that deals stay on the platform. Rules run in a fixed order, each over
//! the output of the previous one. Replacement tokens contain no digits, `@`,
//! `http`, `www.` or app names, so no token can be re-matched by a later rule
//! and redacting already-redacted text is a no-op.

use std::sync::LazyLock;

use regex::{NoExpand, Regex};
use serde::{Deserialize, Serialize};

pub const PHONE_TOKEN: &str = "[phone hidden]";
pub const LINK_TOKEN: &str = "[link hidden]";
pub const EMAIL_TOKEN: &str = "[email hidden]";
pub const CONTACT_TOKEN: &str = "[contact hidden]";

/// Category of sensitive content that was removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedactionCategory {
    Phone,
    Link,
    Email,
    Contact,
}

/// Result of running text through the redaction rules
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redaction {
    pub sanitized: String,
    pub was_filtered: bool,
    /// Categories that matched, in rule order
    pub categories: Vec<RedactionCategory>,
}

struct Rule {
    category: RedactionCategory,
    pattern: Regex,
    token: &'static str,
}

// ASCII digit classes only; `\d` would also accept other scripts' digits.
static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        Rule {
            category: RedactionCategory::Phone,
            pattern: Regex::new(
                r"(?:\+[0-9]{1,3}[ -]?)?(?:[0-9]{10,}|\b[0-9]{5}[ -][0-9]{5,})",
            )
            .expect("phone pattern"),
            token: PHONE_TOKEN,
        },
        Rule {
            category: RedactionCategory::Link,
            pattern: Regex::new(r"(?i)(?:https?://|www\.)\S+").expect("link pattern"),
            token: LINK_TOKEN,
        },
        Rule {
            category: RedactionCategory::Email,
            pattern: Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}")
                .expect("email pattern"),
            token: EMAIL_TOKEN,
        },
        Rule {
            category: RedactionCategory::Contact,
            pattern: Regex::new(r"(?i)\bwhats ?app\w*|\bwa\.me/\S*").expect("contact pattern"),
            token: CONTACT_TOKEN,
        },
    ]
});

/// Redact sensitive contact details from `text`.
///
/// Pure and deterministic: the same input always yields the same output.
pub fn redact(text: &str) -> Redaction {
    let mut sanitized = text.to_string();
    let mut categories = Vec::new();

    for rule in RULES.iter() {
        if rule.pattern.is_match(&sanitized) {
            sanitized = rule
                .pattern
                .replace_all(&sanitized, NoExpand(rule.token))
                .into_owned();
            categories.push(rule.category);
        }
    }

    Redaction {
        sanitized,
        was_filtered: !categories.is_empty(),
        categories,
    }
}

/// True if `text` contains anything the redaction rules would remove
pub fn contains_sensitive(text: &str) -> bool {
    RULES.iter().any(|rule| rule.pattern.is_match(text))
}
