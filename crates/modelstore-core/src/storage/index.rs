//! The index: ledger of model IDs, their tags and the blobs they reference.
//!
//! [`Index`] is a plain value. Its helpers never mutate in place; each returns
//! the next index, so the store can compute a mutation fully before doing the
//! single rewrite that publishes it.

use crate::digest::Digest;
use crate::error::{Result, StoreError};
use crate::reference::{Reference, Tag};
use crate::storage::atomic::{atomic_read_json, atomic_write_json};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One stored model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Digest of the model's manifest.
    pub id: Digest,
    /// Normalized `repository:tag` strings.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Layer digests in manifest order, then the config digest.
    #[serde(default)]
    pub files: Vec<Digest>,
}

impl IndexEntry {
    pub fn new(id: Digest, files: Vec<Digest>) -> Self {
        Self {
            id,
            tags: Vec::new(),
            files,
        }
    }

    pub fn has_tag(&self, tag: &Tag) -> bool {
        let wanted = tag.to_string();
        self.tags.iter().any(|t| *t == wanted)
    }

    pub fn matches(&self, reference: &Reference) -> bool {
        match reference {
            Reference::Id(id) | Reference::Digest { digest: id, .. } => self.id == *id,
            Reference::Tag(tag) => self.has_tag(tag),
        }
    }

    fn with_tag(&self, tag: &Tag) -> Self {
        let mut entry = self.clone();
        if !entry.has_tag(tag) {
            entry.tags.push(tag.to_string());
        }
        entry
    }

    fn without_tag(&self, tag: &Tag) -> Self {
        let wanted = tag.to_string();
        let mut entry = self.clone();
        entry.tags.retain(|t| *t != wanted);
        entry
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    #[serde(default)]
    pub models: Vec<IndexEntry>,
}

impl Index {
    /// Look up an entry by ID, digest reference or tag.
    ///
    /// Unparseable references match nothing.
    pub fn find(&self, reference: &str) -> Option<&IndexEntry> {
        let reference = Reference::parse(reference).ok()?;
        self.find_reference(&reference)
    }

    pub fn find_reference(&self, reference: &Reference) -> Option<&IndexEntry> {
        self.models.iter().find(|e| e.matches(reference))
    }

    pub fn get(&self, id: &Digest) -> Option<&IndexEntry> {
        self.models.iter().find(|e| e.id == *id)
    }

    /// Append `entry` unless an entry with the same ID already exists.
    pub fn add(&self, entry: IndexEntry) -> Index {
        if self.get(&entry.id).is_some() {
            return self.clone();
        }
        let mut next = self.clone();
        next.models.push(entry);
        next
    }

    pub fn remove(&self, id: &Digest) -> Index {
        Index {
            models: self
                .models
                .iter()
                .filter(|e| e.id != *id)
                .cloned()
                .collect(),
        }
    }

    /// Point `tag` at the model named by `reference`, moving it off any other
    /// model.
    pub fn tag(&self, reference: &str, tag: &str) -> Result<Index> {
        let tag = Tag::parse(tag)?;
        let reference = Reference::parse(reference)?;
        let target = self
            .find_reference(&reference)
            .map(|e| e.id.clone())
            .ok_or_else(|| StoreError::not_found(format!("model {}", display(&reference))))?;

        Ok(Index {
            models: self
                .models
                .iter()
                .map(|e| {
                    if e.id == target {
                        e.with_tag(&tag)
                    } else {
                        e.without_tag(&tag)
                    }
                })
                .collect(),
        })
    }

    /// Remove `tag`, returning the ID it pointed at.
    pub fn untag(&self, tag: &str) -> Result<(Digest, Index)> {
        let tag = Tag::parse(tag)?;
        let id = self
            .models
            .iter()
            .find(|e| e.has_tag(&tag))
            .map(|e| e.id.clone())
            .ok_or_else(|| StoreError::not_found(format!("tag {}", tag)))?;

        let next = Index {
            models: self.models.iter().map(|e| e.without_tag(&tag)).collect(),
        };
        Ok((id, next))
    }

    /// Whether any entry other than `id` references `blob`.
    pub fn references_elsewhere(&self, id: &Digest, blob: &Digest) -> bool {
        self.models
            .iter()
            .filter(|e| e.id != *id)
            .any(|e| e.files.contains(blob))
    }
}

fn display(reference: &Reference) -> String {
    match reference {
        Reference::Id(id) => id.to_string(),
        Reference::Digest { repository, digest } => format!("{}@{}", repository, digest),
        Reference::Tag(tag) => tag.to_string(),
    }
}

/// The persisted index file, `<root>/index.json`.
#[derive(Debug, Clone)]
pub struct IndexFile {
    path: PathBuf,
    keep_backup: bool,
}

impl IndexFile {
    pub fn new(path: impl Into<PathBuf>, keep_backup: bool) -> Self {
        Self {
            path: path.into(),
            keep_backup,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the index. A missing file reads as an empty index.
    pub fn read(&self) -> Result<Index> {
        Ok(atomic_read_json(&self.path)?.unwrap_or_default())
    }

    pub fn write(&self, index: &Index) -> Result<()> {
        atomic_write_json(&self.path, index, self.keep_backup)
    }
}
