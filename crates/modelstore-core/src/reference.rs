//! Model reference parsing.
//!
//! A reference names a model in one of three syntactically disjoint forms:
//!
//! - an ID: `sha256:<hex>` (the manifest digest)
//! - a digest reference: `<repository>@sha256:<hex>`
//! - a tag: `<repository>[:<tag>]`, normalized to always carry a tag
//!
//! Tags never parse as digests, so a lookup is never ambiguous.

use crate::digest::Digest;
use crate::error::{Result, StoreError};
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

/// Tag applied when a reference names only a repository.
pub const DEFAULT_TAG: &str = "latest";

/// Repository: optional `host[:port]/` then lowercase path components.
static REPOSITORY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:[a-zA-Z0-9](?:[a-zA-Z0-9.-]*[a-zA-Z0-9])?(?::[0-9]+)?/)?[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*(?:/[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*)*$",
    )
    .unwrap()
});

static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[\w][\w.-]{0,127}$").unwrap());

/// A normalized `repository:tag` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tag {
    repository: String,
    tag: String,
}

impl Tag {
    /// Parse and normalize a tag string. `ai/smollm2` becomes `ai/smollm2:latest`.
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = |reason: &str| StoreError::InvalidReference {
            reference: s.to_string(),
            reason: reason.to_string(),
        };

        if s.is_empty() {
            return Err(invalid("empty reference"));
        }
        if Digest::looks_like_digest(s) {
            return Err(invalid("a digest cannot be used as a tag"));
        }
        if s.contains('@') {
            return Err(invalid("digest references cannot be used as tags"));
        }

        // The tag separator is the last ':' after the last '/', so a registry
        // port (`host:5000/name`) is not mistaken for a tag.
        let last_slash = s.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (repository, tag) = match s[last_slash..].rfind(':') {
            Some(i) => (&s[..last_slash + i], &s[last_slash + i + 1..]),
            None => (s, DEFAULT_TAG),
        };

        if !REPOSITORY.is_match(repository) {
            return Err(invalid("repository name must be lowercase path components"));
        }
        if !TAG.is_match(tag) {
            return Err(invalid("tag must match [A-Za-z0-9_][A-Za-z0-9_.-]{0,127}"));
        }

        Ok(Self {
            repository: repository.to_string(),
            tag: tag.to_string(),
        })
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

/// A parsed model reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Id(Digest),
    Digest { repository: String, digest: Digest },
    Tag(Tag),
}

impl Reference {
    pub fn parse(s: &str) -> Result<Self> {
        if let Ok(digest) = s.parse::<Digest>() {
            return Ok(Reference::Id(digest));
        }
        if let Some((repository, digest)) = s.split_once('@') {
            if !REPOSITORY.is_match(repository) {
                return Err(StoreError::InvalidReference {
                    reference: s.to_string(),
                    reason: "repository name must be lowercase path components".to_string(),
                });
            }
            let digest = digest.parse::<Digest>().map_err(|e| StoreError::InvalidReference {
                reference: s.to_string(),
                reason: e.to_string(),
            })?;
            return Ok(Reference::Digest {
                repository: repository.to_string(),
                digest,
            });
        }
        Tag::parse(s).map(Reference::Tag)
    }

    /// The model ID this reference pins, if it pins one.
    pub fn digest(&self) -> Option<&Digest> {
        match self {
            Reference::Id(d) | Reference::Digest { digest: d, .. } => Some(d),
            Reference::Tag(_) => None,
        }
    }
}
