//! Changesets and changelogs.
//!
//! A changelog is an ordered list of changesets; each changeset is an
//! identified list of statements applied at most once. The on-disk form is
//! the serde JSON of [`ChangeLog`].

use std::{collections::HashSet, fmt, path::Path};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    errors::{MigrationError, MigrationResult},
    statement::Statement,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    pub id: String,
    pub author: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub comments: String,
    #[serde(default)]
    pub contexts: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Execute on every update, even when already recorded.
    #[serde(default)]
    pub run_always: bool,
    /// Re-execute when the checksum changes instead of failing validation.
    #[serde(default)]
    pub run_on_change: bool,
    pub statements: Vec<Statement>,
}

impl ChangeSet {
    pub fn new(id: impl Into<String>, author: impl Into<String>, statements: Vec<Statement>) -> Self {
        Self {
            id: id.into(),
            author: author.into(),
            description: String::new(),
            comments: String::new(),
            contexts: Vec::new(),
            labels: Vec::new(),
            run_always: false,
            run_on_change: false,
            statements,
        }
    }

    /// Hex SHA-256 of the canonical JSON of the statements. Descriptive
    /// fields do not contribute.
    pub fn checksum(&self) -> MigrationResult<String> {
        let canonical = serde_json::to_vec(&self.statements)?;
        let digest = Sha256::digest(&canonical);
        Ok(hex::encode(digest))
    }

    /// Description recorded in history; falls back to the statement kinds.
    pub fn summary(&self) -> String {
        if !self.description.is_empty() {
            return self.description.clone();
        }
        let kinds: Vec<&str> = self.statements.iter().map(|s| s.kind().as_str()).collect();
        kinds.join(", ")
    }

    /// A changeset without contexts runs everywhere; an empty active set runs
    /// everything.
    pub fn matches_contexts(&self, active: &[String]) -> bool {
        self.contexts.is_empty()
            || active.is_empty()
            || self
                .contexts
                .iter()
                .any(|context| active.iter().any(|a| a.eq_ignore_ascii_case(context)))
    }
}

impl fmt::Display for ChangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.id, self.author)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeLog {
    /// Logical path recorded in history as `fileName`.
    #[serde(default)]
    pub path: String,
    pub changesets: Vec<ChangeSet>,
}

impl ChangeLog {
    pub fn new(path: impl Into<String>, changesets: Vec<ChangeSet>) -> Self {
        Self {
            path: path.into(),
            changesets,
        }
    }

    /// Reads a JSON changelog. An empty logical path defaults to the file path.
    pub fn load(file: &Path) -> MigrationResult<Self> {
        let content = std::fs::read_to_string(file).map_err(|err| MigrationError::InvalidChangeLog {
            message: format!("failed to read {}: {err}", file.display()),
        })?;
        let mut changelog: Self = serde_json::from_str(&content)?;
        if changelog.path.is_empty() {
            changelog.path = file.display().to_string();
        }
        changelog.validate()?;
        Ok(changelog)
    }

    /// Rejects duplicate `(id, author)` pairs and empty identifiers.
    pub fn validate(&self) -> MigrationResult<()> {
        let mut seen = HashSet::new();
        for changeset in &self.changesets {
            if changeset.id.trim().is_empty() || changeset.author.trim().is_empty() {
                return Err(MigrationError::InvalidChangeLog {
                    message: format!("changeset in {} is missing an id or author", self.path),
                });
            }
            if !seen.insert((changeset.id.as_str(), changeset.author.as_str())) {
                return Err(MigrationError::InvalidChangeLog {
                    message: format!("duplicate changeset {changeset} in {}", self.path),
                });
            }
        }
        Ok(())
    }
}
