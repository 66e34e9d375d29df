//! Source channel lists.
//!
//! Two plain-text files (one per editorial class) name the channels the
//! listener follows: one username per line, `#` comments and blank lines
//! ignored, a leading `@` tolerated.

use std::collections::HashMap;
use std::path::Path;

use tracing::info;

use crate::error::{CoreError, Result};
use crate::types::{SourceClass, SourceId};

/// Parsed source lists with class lookup.
#[derive(Debug, Clone, Default)]
pub struct SourceBook {
    classes: HashMap<SourceId, SourceClass>,
}

impl SourceBook {
    /// Load both class lists from disk.
    pub fn load(arab_list: &Path, smart_list: &Path) -> Result<Self> {
        let mut classes = HashMap::new();
        for id in read_source_list(arab_list)? {
            classes.insert(id, SourceClass::Arab);
        }
        // A username present in both files keeps its smart classification.
        for id in read_source_list(smart_list)? {
            classes.insert(id, SourceClass::Smart);
        }
        info!(sources = classes.len(), "source lists loaded");
        Ok(Self { classes })
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (SourceId, SourceClass)>) -> Self {
        Self {
            classes: entries.into_iter().collect(),
        }
    }

    /// Editorial class of a source, `None` when the channel is not followed.
    pub fn class_of(&self, source: &SourceId) -> Option<SourceClass> {
        self.classes.get(source).copied()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

/// Read one source-list file into usernames.
pub fn read_source_list(path: &Path) -> Result<Vec<SourceId>> {
    let content = std::fs::read_to_string(path).map_err(|source| CoreError::SourceList {
        path: path.display().to_string(),
        source,
    })?;
    Ok(parse_source_list(&content))
}

fn parse_source_list(content: &str) -> Vec<SourceId> {
    content
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| SourceId::from(line.trim_start_matches('@')))
        .collect()
}
