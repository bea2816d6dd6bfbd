//! Static backend configuration: which process to run for which languages.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Which scopes and syntaxes a language id covers for one backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LanguageSpec {
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub syntaxes: Vec<String>,
}

/// Immutable description of one backend: how to reach it and how to
/// configure it. Exactly one of a non-empty `command` or a `tcp_port` must
/// be set; `validate` enforces this at load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Unique key among registered configs.
    pub name: String,
    /// Argv for the subprocess; empty when `tcp_port` is used instead.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub tcp_port: Option<u16>,
    /// Language id to scope/syntax claims.
    #[serde(default)]
    pub languages: BTreeMap<String, LanguageSpec>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Opaque `initializationOptions` payload for `initialize`.
    #[serde(default)]
    pub init_options: Value,
    /// Opaque per-backend settings; the projector layers the schema catalog
    /// on top before sending.
    #[serde(default)]
    pub settings: Value,
    /// Environment overlay, merged over the inherited process environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_enabled() -> bool {
    true
}

impl ClientConfig {
    /// Built-in backend: `vscode-json-languageserver --stdio` claiming the
    /// `json` and `jsonc` language ids.
    pub fn json_language_server() -> Self {
        let mut languages = BTreeMap::new();
        languages.insert(
            "json".to_string(),
            LanguageSpec {
                scopes: vec!["source.json".to_string()],
                syntaxes: vec!["json".to_string()],
            },
        );
        languages.insert(
            "jsonc".to_string(),
            LanguageSpec {
                scopes: vec!["source.json.sublime".to_string()],
                syntaxes: vec!["sublime text".to_string()],
            },
        );
        ClientConfig {
            name: "json".to_string(),
            command: vec![
                "vscode-json-languageserver".to_string(),
                "--stdio".to_string(),
            ],
            tcp_port: None,
            languages,
            enabled: true,
            init_options: Value::Null,
            settings: Value::Null,
            env: BTreeMap::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidConfig {
                name: self.name.clone(),
                reason: "name must not be empty".to_string(),
            });
        }
        match (self.command.is_empty(), self.tcp_port) {
            (false, None) | (true, Some(_)) => Ok(()),
            (true, None) => Err(Error::InvalidConfig {
                name: self.name.clone(),
                reason: "either command or tcp_port must be set".to_string(),
            }),
            (false, Some(_)) => Err(Error::InvalidConfig {
                name: self.name.clone(),
                reason: "command and tcp_port are mutually exclusive".to_string(),
            }),
        }
    }

    pub fn claims_language(&self, language_id: &str) -> bool {
        self.languages.contains_key(language_id)
    }
}

/// Load a configuration table from a JSON file: an array of [`ClientConfig`]
/// records. Every record is validated and names must be unique.
pub fn load_table(path: &Path) -> Result<Vec<ClientConfig>> {
    let text = std::fs::read_to_string(path)?;
    let configs: Vec<ClientConfig> = serde_json::from_str(&text)?;

    let mut seen = BTreeSet::new();
    for config in &configs {
        config.validate()?;
        if !seen.insert(config.name.clone()) {
            return Err(Error::InvalidConfig {
                name: config.name.clone(),
                reason: "duplicate config name".to_string(),
            });
        }
    }
    Ok(configs)
}
