//! Bead ID grammar and generators.
//!
//! IDs are `<prefix>-<slug>` where the prefix selects the database the bead
//! lives in. The grammar is bit-exact: prefix `[a-z][a-z0-9]{0,15}`, slug
//! `[a-z0-9_-]{1,64}`.

use crate::errors::StoreError;
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

static PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9]{0,15}$").expect("prefix regex"));
static SLUG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9_-]{1,64}$").expect("slug regex"));

/// A validated bead identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BeadId {
    raw: String,
    prefix_len: usize,
}

impl BeadId {
    /// Parse and validate a bead ID.
    ///
    /// The prefix is everything before the first `-`; the slug may itself
    /// contain `-` and `_`.
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let Some(dash) = raw.find('-') else {
            return Err(StoreError::InvalidId { raw: raw.to_string() });
        };
        let (prefix, rest) = raw.split_at(dash);
        let slug = &rest[1..];
        if !PREFIX_RE.is_match(prefix) || !SLUG_RE.is_match(slug) {
            return Err(StoreError::InvalidId { raw: raw.to_string() });
        }
        Ok(Self {
            raw: raw.to_string(),
            prefix_len: dash,
        })
    }

    /// Build an ID from validated parts.
    pub fn new(prefix: &str, slug: &str) -> Result<Self, StoreError> {
        Self::parse(&format!("{prefix}-{slug}"))
    }

    /// The database-selecting prefix.
    pub fn prefix(&self) -> &str {
        &self.raw[..self.prefix_len]
    }

    /// The slug portion after the first dash.
    pub fn slug(&self) -> &str {
        &self.raw[self.prefix_len + 1..]
    }

    /// The full textual ID.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for BeadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<BeadId> for String {
    fn from(id: BeadId) -> Self {
        id.raw
    }
}

/// Words stripped when slugging a decision question into a topic.
const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "be", "can", "do", "does", "for", "how", "in", "is", "it", "of",
    "on", "or", "should", "that", "the", "this", "to", "we", "what", "which", "why", "with",
];

/// Generate the slug for an auto-created decision bead:
/// `dec-<topic>-<random>` where `topic` is a stop-word-stripped slug of the
/// question (at most 40 chars) and `random` is 6 base36 chars.
pub fn decision_slug(question: &str) -> String {
    let mut topic = String::new();
    for word in question.split(|c: char| !c.is_ascii_alphanumeric()) {
        let word = word.to_ascii_lowercase();
        if word.is_empty() || STOP_WORDS.contains(&word.as_str()) {
            continue;
        }
        let need = word.len() + usize::from(!topic.is_empty());
        if topic.len() + need > 40 {
            break;
        }
        if !topic.is_empty() {
            topic.push('-');
        }
        topic.push_str(&word);
    }
    if topic.is_empty() {
        topic.push_str("question");
    }
    format!("dec-{topic}-{}", random_base36(6))
}

/// Short random base36 suffix derived from a v4 UUID.
pub fn random_base36(len: usize) -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let bytes = *uuid::Uuid::new_v4().as_bytes();
    let mut out = String::with_capacity(len);
    let mut acc: u128 = u128::from_be_bytes(bytes);
    for _ in 0..len {
        out.push(ALPHABET[(acc % 36) as usize] as char);
        acc /= 36;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_id() {
        let id = BeadId::parse("gt-42").unwrap();
        assert_eq!(id.prefix(), "gt");
        assert_eq!(id.slug(), "42");
    }

    #[test]
    fn slug_may_contain_dashes_and_underscores() {
        let id = BeadId::parse("hq-dec-fix-tests-a1b2c3").unwrap();
        assert_eq!(id.prefix(), "hq");
        assert_eq!(id.slug(), "dec-fix-tests-a1b2c3");

        let id = BeadId::parse("gt-mol1_2").unwrap();
        assert_eq!(id.slug(), "mol1_2");
    }

    #[test]
    fn rejects_bad_prefixes() {
        assert!(BeadId::parse("Gt-42").is_err());
        assert!(BeadId::parse("1gt-42").is_err());
        assert!(BeadId::parse("toolongprefixabcdef-42").is_err());
        assert!(BeadId::parse("-42").is_err());
        assert!(BeadId::parse("gt").is_err());
    }

    #[test]
    fn rejects_bad_slugs() {
        assert!(BeadId::parse("gt-").is_err());
        assert!(BeadId::parse("gt-UPPER").is_err());
        assert!(BeadId::parse("gt-has.dot").is_err());
        let long = format!("gt-{}", "x".repeat(65));
        assert!(BeadId::parse(&long).is_err());
    }

    #[test]
    fn decision_slug_strips_stop_words_and_caps_topic() {
        let slug = decision_slug("Should we migrate the database to Postgres?");
        assert!(slug.starts_with("dec-migrate-database-postgres-"));
        let id = BeadId::new("hq", &slug).unwrap();
        assert_eq!(id.prefix(), "hq");
    }

    #[test]
    fn decision_slug_topic_never_exceeds_forty_chars() {
        let slug = decision_slug(
            "incredibly extraordinarily unnecessarily verbose question about everything",
        );
        let topic = slug
            .strip_prefix("dec-")
            .unwrap()
            .rsplit_once('-')
            .unwrap()
            .0;
        assert!(topic.len() <= 40, "topic was {} chars", topic.len());
    }

    #[test]
    fn decision_slug_empty_question_falls_back() {
        let slug = decision_slug("???");
        assert!(slug.starts_with("dec-question-"));
    }

    #[test]
    fn random_base36_has_requested_length() {
        let r = random_base36(6);
        assert_eq!(r.len(), 6);
        assert!(r.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
}
