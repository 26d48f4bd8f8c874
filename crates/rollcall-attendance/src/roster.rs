//! Class enrollment and edit authorization, supplied by the caller.

use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

/// Who is enrolled in a class. Close uses this to synthesize absences.
pub trait ClassRoster: Send + Sync {
    fn enrolled(&self, class_id: &str) -> Vec<String>;
}

/// Whether `actor` may edit attendance for `class_id`.
pub trait EditAuthorizer: Send + Sync {
    fn can_edit(&self, actor: &str, class_id: &str) -> bool;
}

/// In-memory roster, typically loaded from a `{ "7A": ["S1", "S2"] }` file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct StaticRoster {
    classes: HashMap<String, BTreeSet<String>>,
}

impl StaticRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_class<I, S>(mut self, class_id: &str, students: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.classes
            .entry(class_id.to_string())
            .or_default()
            .extend(students.into_iter().map(Into::into));
        self
    }

    pub fn load(path: &Path) -> Result<Self, std::io::Error> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.classes.keys().map(String::as_str)
    }
}

impl ClassRoster for StaticRoster {
    fn enrolled(&self, class_id: &str) -> Vec<String> {
        self.classes
            .get(class_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Actor → classes they may edit. The class `*` grants every class.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct StaticAuthorizer {
    grants: HashMap<String, BTreeSet<String>>,
}

impl StaticAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(mut self, actor: &str, class_id: &str) -> Self {
        self.grants
            .entry(actor.to_string())
            .or_default()
            .insert(class_id.to_string());
        self
    }

    /// Load a `{ "actor": ["7A", "*"] }` file.
    pub fn load(path: &Path) -> Result<Self, std::io::Error> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

impl EditAuthorizer for StaticAuthorizer {
    fn can_edit(&self, actor: &str, class_id: &str) -> bool {
        self.grants
            .get(actor)
            .is_some_and(|classes| classes.contains(class_id) || classes.contains("*"))
    }
}
