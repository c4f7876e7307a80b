//! Revision identity: parsing, formatting, and ordering
//! of CouchDB-style revision ids of the form `{generation}-{suffix}`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{BurrowError, Result};

/// A revision identifier: `{generation}-{suffix}`.
///
/// - `generation` starts at 1 and increases by exactly 1 from parent to
///   child; it is sometimes called `pos` elsewhere in the codebase.
/// - `suffix` is an opaque token, typically an MD5 hash of the parent's
///   suffix plus the new body, computed by the caller so that independent
///   peers converge on the same id for the same edit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Revision {
    pub generation: u64,
    pub suffix: String,
}

impl Revision {
    pub fn new(generation: u64, suffix: impl Into<String>) -> Self {
        Self {
            generation,
            suffix: suffix.into(),
        }
    }

    /// The revision one generation above `parent`, carrying `suffix`.
    pub fn child_of(parent: Option<&Revision>, suffix: impl Into<String>) -> Self {
        let generation = parent.map(|r| r.generation + 1).unwrap_or(1);
        Revision::new(generation, suffix)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.suffix)
    }
}

impl FromStr for Revision {
    type Err = BurrowError;

    fn from_str(s: &str) -> Result<Self> {
        let (gen_str, suffix) = s
            .split_once('-')
            .ok_or_else(|| BurrowError::InvalidRev(s.to_string()))?;
        if suffix.is_empty() {
            return Err(BurrowError::InvalidRev(s.to_string()));
        }
        let generation: u64 = gen_str
            .parse()
            .map_err(|_| BurrowError::InvalidRev(s.to_string()))?;
        if generation == 0 {
            return Err(BurrowError::InvalidRev(s.to_string()));
        }
        Ok(Revision {
            generation,
            suffix: suffix.to_string(),
        })
    }
}

/// Ordering between sibling revisions: higher generation wins; ties break on
/// lexicographic descending suffix. `Ord` here is ascending (smaller = worse
/// candidate for winner), so callers picking a winner take `.max()`.
impl Ord for Revision {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.suffix.cmp(&other.suffix))
    }
}

impl PartialOrd for Revision {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A `(sequence, filename)`-style identifier is irrelevant here; this is
/// just a typed alias so call sites read `DocId` rather than bare `String`.
pub type DocId = String;

/// Compute a new revision's suffix deterministically from its parent's
/// suffix (if any) and its JSON body, so independent peers applying the
/// same edit converge on the same revision id. This is the caller-side
/// half of the contract: the engine only checks that `generation`
/// increases by exactly one, never recomputes the suffix itself.
pub fn compute_suffix(parent: Option<&Revision>, body: &serde_json::Value) -> String {
    let mut hasher = md5::Md5::new();
    if let Some(p) = parent {
        md5::Digest::update(&mut hasher, p.suffix.as_bytes());
    }
    md5::Digest::update(&mut hasher, b"\0");
    md5::Digest::update(&mut hasher, body.to_string().as_bytes());
    let digest = md5::Digest::finalize(hasher);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// True for ids the store accepts as ordinary documents: non-empty, and
/// either free of a leading underscore or using one of the two reserved
/// prefixes.
pub fn is_valid_doc_id(id: &str) -> bool {
    if id.is_empty() {
        return false;
    }
    if !id.starts_with('_') {
        return true;
    }
    id.starts_with("_design/") || id.starts_with("_local/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse_round_trip() {
        let rev = Revision::new(3, "abc123");
        assert_eq!(rev.to_string(), "3-abc123");
        let parsed: Revision = "3-abc123".parse().unwrap();
        assert_eq!(parsed, rev);
    }

    #[test]
    fn ordering_generation_dominates() {
        let r1 = Revision::new(1, "zzz");
        let r2 = Revision::new(2, "aaa");
        assert!(r1 < r2);
    }

    #[test]
    fn ordering_suffix_breaks_ties() {
        let r1 = Revision::new(2, "aaa");
        let r2 = Revision::new(2, "bbb");
        assert!(r1 < r2);
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!("nope".parse::<Revision>().is_err());
        assert!("abc-123".parse::<Revision>().is_err());
        assert!("0-abc".parse::<Revision>().is_err());
        assert!("1-".parse::<Revision>().is_err());
    }

    #[test]
    fn child_of_none_is_generation_one() {
        let child = Revision::child_of(None, "abc");
        assert_eq!(child.generation, 1);
    }

    #[test]
    fn child_of_parent_increments_generation() {
        let parent = Revision::new(4, "abc");
        let child = Revision::child_of(Some(&parent), "def");
        assert_eq!(child.generation, 5);
    }

    #[test]
    fn compute_suffix_is_deterministic_and_parent_sensitive() {
        let body = serde_json::json!({"a": 1});
        let s1 = compute_suffix(None, &body);
        let s2 = compute_suffix(None, &body);
        assert_eq!(s1, s2);

        let parent = Revision::new(1, s1.clone());
        let s3 = compute_suffix(Some(&parent), &body);
        assert_ne!(s1, s3);
    }

    #[test]
    fn doc_id_validation() {
        assert!(is_valid_doc_id("foo"));
        assert!(is_valid_doc_id("_design/view1"));
        assert!(is_valid_doc_id("_local/checkpoint"));
        assert!(!is_valid_doc_id("_bogus"));
        assert!(!is_valid_doc_id(""));
    }
}
