//! Capability registry: static lookup from a document's language id (with
//! scope as tie-break) to the config of the backend claiming it.

use crate::config::ClientConfig;
use crate::error::{Error, Result};

/// Ordered set of configs. Registration order is significant: when several
/// configs claim the same language or scope, the first registered one wins.
/// That tie-break is a documented guarantee, not an accident of iteration.
#[derive(Debug, Default)]
pub struct Registry {
    configs: Vec<ClientConfig>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn from_table(table: Vec<ClientConfig>) -> Result<Self> {
        let mut registry = Registry::new();
        for config in table {
            registry.register(config)?;
        }
        Ok(registry)
    }

    /// Register a config. Fails on a duplicate name or an invalid record.
    pub fn register(&mut self, config: ClientConfig) -> Result<()> {
        config.validate()?;
        if self.configs.iter().any(|c| c.name == config.name) {
            return Err(Error::InvalidConfig {
                name: config.name,
                reason: "duplicate config name".to_string(),
            });
        }
        self.configs.push(config);
        Ok(())
    }

    /// Resolve the backend for a document. A config whose language entry
    /// lists the document's scope beats one that merely claims the language
    /// id; within each class, first registered wins.
    pub fn resolve(&self, language_id: &str, scope: &str) -> Option<&ClientConfig> {
        self.configs
            .iter()
            .find(|config| {
                config.enabled
                    && config
                        .languages
                        .get(language_id)
                        .map_or(false, |lang| lang.scopes.iter().any(|s| s == scope))
            })
            .or_else(|| {
                self.configs
                    .iter()
                    .find(|config| config.enabled && config.claims_language(language_id))
            })
    }

    pub fn get(&self, name: &str) -> Option<&ClientConfig> {
        self.configs.iter().find(|config| config.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientConfig> {
        self.configs.iter()
    }
}
