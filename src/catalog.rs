//! The schema catalog: file-name patterns mapped to external schema URLs.
//!
//! This is pure data: a schemastore-derived table shipped as a bundled asset
//! rather than baked into code. An externally maintained copy can be loaded
//! from disk instead.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

const BUNDLED: &str = include_str!("../assets/schema-catalog.json");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Glob-style file name patterns this schema applies to. Entries without
    /// patterns are catalog-only and never matched by file name.
    #[serde(default, rename = "fileMatch", skip_serializing_if = "Vec::is_empty")]
    pub file_match: Vec<String>,
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub versions: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaCatalog {
    #[serde(default)]
    pub schemas: Vec<SchemaEntry>,
}

impl SchemaCatalog {
    /// The catalog shipped with the crate.
    pub fn bundled() -> Self {
        // Pinned by test; a parse failure here means a broken build asset.
        serde_json::from_str(BUNDLED).expect("bundled schema catalog is valid JSON")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}
