//! Hierarchical cache keys and invalidation patterns.
//!
//! Keys are colon-delimited ASCII segments (`post:42:likes`). Patterns use
//! the same grammar plus a wildcard:
//!
//! - a trailing `p*` in the last segment matches any key whose segment at that
//!   position starts with `p`, followed by any tail (`user:1*` matches
//!   `user:1:a` and `user:10`);
//! - a lone `*` in a non-final segment matches exactly one segment
//!   (`user:*:stats` matches `user:7:stats`, not `user:7:x:stats`).
//!
//! Matching is done segment by segment; no regular expressions are built.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Segment separator.
pub const SEPARATOR: char = ':';

/// Wildcard marker, valid only in patterns.
pub const WILDCARD: char = '*';

/// Maximum encoded key length in bytes.
pub const MAX_KEY_LEN: usize = 512;

fn segment_char_ok(c: char) -> bool {
    c.is_ascii_graphic() && c != SEPARATOR && c != WILDCARD
}

fn check_segment(raw: &str, segment: &str) -> Result<(), String> {
    if segment.is_empty() {
        return Err("empty segment".to_string());
    }
    if let Some(bad) = segment.chars().find(|c| !segment_char_ok(*c)) {
        return Err(format!("illegal character {bad:?}"));
    }
    if raw.len() > MAX_KEY_LEN {
        return Err(format!("longer than {MAX_KEY_LEN} bytes"));
    }
    Ok(())
}

// ============================================================================
// CACHE KEY
// ============================================================================

/// A validated storage key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CacheKey {
    raw: String,
}

impl CacheKey {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        if raw.is_empty() {
            return Err(ValidationError::InvalidKey {
                key: raw.to_string(),
                reason: "empty key".to_string(),
            });
        }
        for segment in raw.split(SEPARATOR) {
            check_segment(raw, segment).map_err(|reason| ValidationError::InvalidKey {
                key: raw.to_string(),
                reason,
            })?;
        }
        Ok(Self {
            raw: raw.to_string(),
        })
    }

    /// Build a key from segments, e.g. `["post", "42", "likes"]`.
    pub fn from_segments<I, S>(segments: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = segments
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(":");
        Self::parse(&joined)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.raw.split(SEPARATOR)
    }

    /// Append a segment.
    pub fn child(&self, segment: impl AsRef<str>) -> Result<Self, ValidationError> {
        Self::parse(&format!("{}:{}", self.raw, segment.as_ref()))
    }

    /// Split into `type:id:params...`.
    pub fn parts(&self) -> KeyParts {
        let mut iter = self.segments();
        let kind = iter.next().unwrap_or_default().to_string();
        let id = iter.next().map(str::to_string);
        let params = iter.map(str::to_string).collect();
        KeyParts { kind, id, params }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.raw)
    }
}

impl FromStr for CacheKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CacheKey {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.raw
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.raw
    }
}

/// Decomposed `type:id:params...` view of a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyParts {
    pub kind: String,
    pub id: Option<String>,
    pub params: Vec<String>,
}

// ============================================================================
// KEY PATTERN
// ============================================================================

/// One segment of a pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PatternSegment {
    Literal(String),
    /// Exactly one segment, any content.
    Any,
    /// Final segment starting with the given stem; any tail may follow.
    Prefix(String),
}

/// A key or wildcard pattern, used as an invalidation target.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyPattern {
    raw: String,
    segments: Vec<PatternSegment>,
}

impl KeyPattern {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let invalid = |reason: String| ValidationError::InvalidPattern {
            pattern: raw.to_string(),
            reason,
        };
        if raw.is_empty() {
            return Err(invalid("empty pattern".to_string()));
        }

        let parts: Vec<&str> = raw.split(SEPARATOR).collect();
        let last = parts.len() - 1;
        let mut segments = Vec::with_capacity(parts.len());

        for (i, part) in parts.iter().enumerate() {
            match part.find(WILDCARD) {
                None => {
                    check_segment(raw, part).map_err(invalid)?;
                    segments.push(PatternSegment::Literal(part.to_string()));
                }
                Some(_) if *part == "*" && i != last => segments.push(PatternSegment::Any),
                Some(pos) if i == last && pos == part.len() - 1 => {
                    let stem = &part[..pos];
                    if let Some(bad) = stem.chars().find(|c| !segment_char_ok(*c)) {
                        return Err(invalid(format!("illegal character {bad:?}")));
                    }
                    segments.push(PatternSegment::Prefix(stem.to_string()));
                }
                Some(_) => {
                    return Err(invalid(
                        "wildcard must be a whole segment or end the pattern".to_string(),
                    ))
                }
            }
        }

        if raw.len() > MAX_KEY_LEN {
            return Err(invalid(format!("longer than {MAX_KEY_LEN} bytes")));
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[PatternSegment] {
        &self.segments
    }

    /// True when the pattern contains no wildcard.
    pub fn is_literal(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, PatternSegment::Literal(_)))
    }

    /// The exact key this pattern names, if it has no wildcard.
    pub fn as_key(&self) -> Option<CacheKey> {
        if self.is_literal() {
            Some(CacheKey {
                raw: self.raw.clone(),
            })
        } else {
            None
        }
    }

    pub fn matches(&self, key: &CacheKey) -> bool {
        let mut key_segments = key.segments();
        for segment in &self.segments {
            let Some(actual) = key_segments.next() else {
                return false;
            };
            match segment {
                PatternSegment::Literal(expected) => {
                    if actual != expected {
                        return false;
                    }
                }
                PatternSegment::Any => {}
                PatternSegment::Prefix(stem) => return actual.starts_with(stem.as_str()),
            }
        }
        key_segments.next().is_none()
    }

    /// Longest string prefix every matching key shares.
    ///
    /// Used for ordered prefix scans; the result may admit keys that
    /// `matches` then rejects.
    pub fn literal_prefix(&self) -> String {
        let mut prefix = String::new();
        for segment in &self.segments {
            match segment {
                PatternSegment::Literal(lit) => {
                    prefix.push_str(lit);
                    prefix.push(SEPARATOR);
                }
                PatternSegment::Any => return prefix,
                PatternSegment::Prefix(stem) => {
                    prefix.push_str(stem);
                    return prefix;
                }
            }
        }
        // Fully literal: drop the separator pushed after the last segment.
        prefix.pop();
        prefix
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl fmt::Debug for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyPattern({})", self.raw)
    }
}

impl FromStr for KeyPattern {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for KeyPattern {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<KeyPattern> for String {
    fn from(pattern: KeyPattern) -> Self {
        pattern.raw
    }
}

impl From<CacheKey> for KeyPattern {
    fn from(key: CacheKey) -> Self {
        let segments = key
            .segments()
            .map(|s| PatternSegment::Literal(s.to_string()))
            .collect();
        Self {
            raw: key.raw,
            segments,
        }
    }
}

impl From<&CacheKey> for KeyPattern {
    fn from(key: &CacheKey) -> Self {
        Self::from(key.clone())
    }
}

// ============================================================================
// WELL-KNOWN KEYS
// ============================================================================

/// Builders for the keys the built-in rules and change handlers touch.
pub struct CacheKeys;

impl CacheKeys {
    pub fn post(id: &str) -> Result<CacheKey, ValidationError> {
        CacheKey::from_segments(["post", id])
    }

    pub fn post_likes(id: &str) -> Result<CacheKey, ValidationError> {
        CacheKey::from_segments(["post", id, "likes"])
    }

    pub fn post_likers(id: &str) -> Result<CacheKey, ValidationError> {
        CacheKey::from_segments(["post", id, "likers"])
    }

    pub fn post_stats(id: &str) -> Result<CacheKey, ValidationError> {
        CacheKey::from_segments(["post", id, "stats"])
    }

    pub fn post_comments(id: &str) -> Result<CacheKey, ValidationError> {
        CacheKey::from_segments(["post", id, "comments"])
    }

    pub fn comment(id: &str) -> Result<CacheKey, ValidationError> {
        CacheKey::from_segments(["comment", id])
    }

    pub fn comment_likes(id: &str) -> Result<CacheKey, ValidationError> {
        CacheKey::from_segments(["comment", id, "likes"])
    }

    pub fn comment_likers(id: &str) -> Result<CacheKey, ValidationError> {
        CacheKey::from_segments(["comment", id, "likers"])
    }

    pub fn user_stats(id: &str) -> Result<CacheKey, ValidationError> {
        CacheKey::from_segments(["user", id, "stats"])
    }

    pub fn user_follows(id: &str) -> Result<CacheKey, ValidationError> {
        CacheKey::from_segments(["user", id, "follows"])
    }

    pub fn user_liked_posts(id: &str) -> Result<CacheKey, ValidationError> {
        CacheKey::from_segments(["user", id, "liked_posts"])
    }

    pub fn user_liked_comments(id: &str) -> Result<CacheKey, ValidationError> {
        CacheKey::from_segments(["user", id, "liked_comments"])
    }

    /// Every page of a paginated key: `base*`.
    pub fn all_pages(base: &CacheKey) -> KeyPattern {
        let mut segments: Vec<PatternSegment> = base
            .segments()
            .map(|s| PatternSegment::Literal(s.to_string()))
            .collect();
        if let Some(PatternSegment::Literal(last)) = segments.pop() {
            segments.push(PatternSegment::Prefix(last));
        }
        KeyPattern {
            raw: format!("{base}*"),
            segments,
        }
    }
}
