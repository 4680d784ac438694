//! Named training sets and their registry.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use dryer_core::{ImagePair, ProductionRecord, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// One labelled example source: the dryer snapshot captured when the set was
/// added, and the images photographed for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSet {
    pub name: String,
    pub product_type: String,
    pub record: ProductionRecord,
    #[serde(flatten)]
    pub images: ImagePair,
}

impl TrainingSet {
    pub fn new(
        name: impl Into<String>,
        product_type: impl Into<String>,
        record: ProductionRecord,
        images: ImagePair,
    ) -> Self {
        Self {
            name: name.into(),
            product_type: product_type.into(),
            record,
            images,
        }
    }
}

/// Insertion-ordered list of training sets.
///
/// Names are not unique; lookups resolve to the most recently appended set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingSetRegistry {
    sets: Vec<TrainingSet>,
}

impl TrainingSetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, set: TrainingSet) {
        self.sets.push(set);
    }

    /// Suggested name for the next set.
    pub fn next_default_name(&self) -> String {
        format!("set_{}", self.sets.len() + 1)
    }

    pub fn find(&self, name: &str) -> Option<&TrainingSet> {
        self.sets.iter().rev().find(|s| s.name == name)
    }

    /// Distinct names, each listed once at the position of its latest set.
    pub fn display_names(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        let mut names: Vec<&str> = self
            .sets
            .iter()
            .rev()
            .filter(|s| seen.insert(s.name.as_str()))
            .map(|s| s.name.as_str())
            .collect();
        names.reverse();
        names
    }

    pub fn for_product<'a>(&'a self, product_type: &'a str) -> impl Iterator<Item = &'a TrainingSet> + 'a {
        self.sets.iter().filter(move |s| s.product_type == product_type)
    }

    pub fn sets(&self) -> &[TrainingSet] {
        &self.sets
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn clear(&mut self) {
        self.sets.clear();
    }

    pub fn export(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(&self.sets)?)?;
        info!(path = %path.display(), sets = self.sets.len(), "exported training sets");
        Ok(())
    }

    /// Replaces the registry with the sets stored at `path`.
    pub fn import(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let sets: Vec<TrainingSet> = serde_json::from_str(&text)?;
        info!(path = %path.display(), sets = sets.len(), "imported training sets");
        Ok(Self { sets })
    }
}

impl FromIterator<TrainingSet> for TrainingSetRegistry {
    fn from_iter<I: IntoIterator<Item = TrainingSet>>(iter: I) -> Self {
        Self {
            sets: iter.into_iter().collect(),
        }
    }
}
