//! Settings projector: pure functions from (config, catalog) to the
//! payloads a backend receives at `initialize` and on
//! `workspace/didChangeConfiguration`. No hidden state.

use lsp_types::{
    ClientCapabilities, ClientInfo, DidChangeConfigurationClientCapabilities,
    DidChangeConfigurationParams, InitializeParams, PublishDiagnosticsClientCapabilities,
    TextDocumentClientCapabilities, TextDocumentSyncClientCapabilities,
    WorkspaceClientCapabilities, WorkspaceFolder,
};
use serde_json::{json, Value};
use url::Url;

use crate::catalog::SchemaCatalog;
use crate::config::ClientConfig;

/// Assemble the `initialize` params for one backend. The config's opaque
/// `init_options` ride along as `initializationOptions`.
pub fn initialize_params(config: &ClientConfig, root: Option<&Url>) -> InitializeParams {
    let initialization_options = if config.init_options.is_null() {
        None
    } else {
        Some(config.init_options.clone())
    };

    InitializeParams {
        process_id: Some(std::process::id()),
        root_uri: root.cloned(),
        initialization_options,
        capabilities: ClientCapabilities {
            text_document: Some(TextDocumentClientCapabilities {
                // Servers like vscode-json-languageserver only publish
                // diagnostics when this capability is advertised.
                publish_diagnostics: Some(PublishDiagnosticsClientCapabilities {
                    related_information: Some(true),
                    ..Default::default()
                }),
                synchronization: Some(TextDocumentSyncClientCapabilities {
                    did_save: Some(true),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            workspace: Some(WorkspaceClientCapabilities {
                configuration: Some(true),
                did_change_configuration: Some(DidChangeConfigurationClientCapabilities {
                    dynamic_registration: Some(false),
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
        workspace_folders: root.map(|uri| {
            vec![WorkspaceFolder {
                uri: uri.clone(),
                name: "root".to_string(),
            }]
        }),
        client_info: Some(ClientInfo {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        }),
        ..Default::default()
    }
}

/// Merge the schema catalog into the config's settings. Catalog rows land
/// under `json.schemas`, the shape the JSON language server consumes, and
/// only for configs that claim a JSON language; other backends get their
/// settings verbatim. Config-provided schemas come first so they win over
/// catalog entries in the server's first-match resolution.
pub fn merged_settings(config: &ClientConfig, catalog: &SchemaCatalog) -> Value {
    let mut settings = match config.settings.clone() {
        Value::Null => json!({}),
        other => other,
    };

    let wants_catalog =
        config.claims_language("json") || config.claims_language("jsonc");
    if wants_catalog && !catalog.is_empty() {
        // A non-object settings root cannot take the catalog; pass it through.
        if let Some(root) = settings.as_object_mut() {
            let section = root.entry("json").or_insert_with(|| json!({}));
            if let Some(section) = section.as_object_mut() {
                let schemas = section.entry("schemas").or_insert_with(|| json!([]));
                if let Some(schemas) = schemas.as_array_mut() {
                    for entry in &catalog.schemas {
                        schemas.push(serde_json::to_value(entry).unwrap_or(Value::Null));
                    }
                }
            }
        }
    }
    settings
}

/// The `workspace/didChangeConfiguration` payload for one backend.
pub fn configuration_params(
    config: &ClientConfig,
    catalog: &SchemaCatalog,
) -> DidChangeConfigurationParams {
    DidChangeConfigurationParams {
        settings: merged_settings(config, catalog),
    }
}

/// Answer one `workspace/configuration` pull: one result per requested item,
/// resolved against the merged settings by dotted section path, `null` for
/// anything unknown.
pub fn configuration_response(
    config: &ClientConfig,
    catalog: &SchemaCatalog,
    params: Option<&Value>,
) -> Value {
    let settings = merged_settings(config, catalog);
    let items = params
        .and_then(|p| p.get("items"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let results: Vec<Value> = items
        .iter()
        .map(|item| {
            let section = item.get("section").and_then(Value::as_str).unwrap_or("");
            lookup_section(&settings, section)
        })
        .collect();
    Value::Array(results)
}

fn lookup_section(settings: &Value, section: &str) -> Value {
    if section.is_empty() {
        return settings.clone();
    }
    let mut current = settings;
    for part in section.split('.') {
        match current.get(part) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    current.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn json_config_with_settings(settings: Value) -> ClientConfig {
        let mut config = ClientConfig::json_language_server();
        config.settings = settings;
        config
    }

    #[test]
    fn catalog_schemas_land_under_json_section() {
        let config = ClientConfig::json_language_server();
        let catalog = SchemaCatalog::bundled();

        let settings = merged_settings(&config, &catalog);
        let schemas = settings["json"]["schemas"].as_array().unwrap();
        assert_eq!(schemas.len(), catalog.schemas.len());
        assert!(schemas[0]["url"].is_string());
    }

    #[test]
    fn config_schemas_precede_catalog_schemas() {
        let config = json_config_with_settings(json!({
            "json": {"schemas": [{"name": "mine", "fileMatch": ["mine.json"], "url": "file:///mine.schema.json"}]}
        }));
        let catalog = SchemaCatalog::bundled();

        let settings = merged_settings(&config, &catalog);
        let schemas = settings["json"]["schemas"].as_array().unwrap();
        assert_eq!(schemas[0]["name"], "mine");
        assert_eq!(schemas.len(), catalog.schemas.len() + 1);
    }

    #[test]
    fn non_json_backend_settings_pass_through() {
        let mut config = json_config_with_settings(json!({"yaml": {"validate": true}}));
        config.languages.clear();
        let catalog = SchemaCatalog::bundled();

        let settings = merged_settings(&config, &catalog);
        assert_eq!(settings, json!({"yaml": {"validate": true}}));
    }

    #[test]
    fn projection_is_pure() {
        let config = ClientConfig::json_language_server();
        let catalog = SchemaCatalog::bundled();
        assert_eq!(
            merged_settings(&config, &catalog),
            merged_settings(&config, &catalog)
        );
    }

    #[test]
    fn initialize_params_carry_init_options_and_root() {
        let mut config = ClientConfig::json_language_server();
        config.init_options = json!({"provideFormatter": true});
        let root = Url::parse("file:///workspace").unwrap();

        let params = initialize_params(&config, Some(&root));
        assert_eq!(
            params.initialization_options.unwrap()["provideFormatter"],
            true
        );
        assert_eq!(params.root_uri.unwrap(), root);
        assert_eq!(params.workspace_folders.unwrap()[0].name, "root");

        let bare = initialize_params(&ClientConfig::json_language_server(), None);
        assert!(bare.initialization_options.is_none());
        assert!(bare.workspace_folders.is_none());
    }

    #[test]
    fn configuration_response_matches_item_count() {
        let config = json_config_with_settings(json!({"json": {"validate": {"enable": true}}}));
        let catalog = SchemaCatalog::default();
        let params = json!({"items": [
            {"section": "json.validate"},
            {"section": "does.not.exist"},
            {}
        ]});

        let response = configuration_response(&config, &catalog, Some(&params));
        let results = response.as_array().unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0], json!({"enable": true}));
        assert_eq!(results[1], Value::Null);
        assert_eq!(results[2], json!({"json": {"validate": {"enable": true}}}));
    }
}
