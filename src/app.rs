use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use lsp_types::Url;
use tokio::time::sleep;
use tracing::info;

use crate::catalog::SchemaCatalog;
use crate::cli::Config;
use crate::config::{self, ClientConfig};
use crate::host::{DiagnosticsEvent, HostHooks};
use crate::registry::Registry;
use crate::router::Router;
use crate::supervisor::Supervisor;

/// Host that prints diagnostics and backend failures to the console.
struct PrintHost;

#[async_trait]
impl HostHooks for PrintHost {
    async fn diagnostics_updated(&self, event: DiagnosticsEvent) {
        if event.diagnostics.is_empty() {
            println!("{}: clean", event.uri);
            return;
        }
        for diagnostic in &event.diagnostics {
            println!(
                "{}:{}:{}: {}",
                event.uri,
                diagnostic.range.start.line + 1,
                diagnostic.range.start.character + 1,
                diagnostic.message
            );
        }
    }

    async fn backend_unavailable(&self, config_name: &str, reason: &str) {
        eprintln!("backend {config_name} unavailable: {reason}");
    }
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let registry = match &config.config_table {
        Some(path) => Registry::from_table(config::load_table(path)?)?,
        None => {
            let mut registry = Registry::new();
            registry.register(ClientConfig::json_language_server())?;
            registry
        }
    };

    let catalog = match &config.catalog {
        Some(path) => SchemaCatalog::load(path)?,
        None => SchemaCatalog::bundled(),
    };

    let root = std::env::current_dir()
        .ok()
        .and_then(|dir| Url::from_directory_path(dir).ok());

    let hooks: Arc<dyn HostHooks> = Arc::new(PrintHost);
    let supervisor = Arc::new(Supervisor::new(catalog, Arc::clone(&hooks), root));
    let mut router = Router::new(registry, Arc::clone(&supervisor), hooks);
    if let Some(timeout) = config.idle_timeout {
        router = router.with_idle_timeout(timeout);
    }
    let router = Arc::new(router);

    let mut opened = Vec::new();
    for path in &config.files {
        let path = path
            .canonicalize()
            .with_context(|| format!("cannot resolve {}", path.display()))?;
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("cannot read {}", path.display()))?;
        let uri = Url::from_file_path(&path)
            .map_err(|_| anyhow!("not a file path: {}", path.display()))?;
        let language_id = language_id_for(&path);

        if router
            .document_opened(&uri, &language_id, None, &text)
            .await?
        {
            info!("opened {uri} as {language_id}");
            opened.push(uri);
        } else {
            eprintln!("no backend claims {} ({language_id})", path.display());
        }
    }

    if !opened.is_empty() {
        sleep(config.wait).await;
    }

    for uri in &opened {
        router.document_closed(uri).await?;
    }
    supervisor.stop_all().await;
    Ok(())
}

fn language_id_for(path: &Path) -> String {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => "json".to_string(),
        Some("jsonc") | Some("sublime-settings") => "jsonc".to_string(),
        Some(other) => other.to_string(),
        None => "plaintext".to_string(),
    }
}
