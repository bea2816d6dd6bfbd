//! Maps document lifecycle events to backend sessions.
//!
//! The router owns the document table: which backend serves which open
//! document, and the synchronization version counter per document. Sessions
//! are started lazily on the first matching open and may be reaped after an
//! idle period once a backend's last document closes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use lsp_types::{PublishDiagnosticsParams, Url};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::Result;
use crate::host::{DiagnosticsEvent, HostHooks};
use crate::registry::Registry;
use crate::supervisor::Supervisor;

struct DocState {
    config_name: String,
    language_id: String,
    version: i32,
}

#[derive(Default)]
struct RouterState {
    docs: HashMap<Url, DocState>,
    open_counts: HashMap<String, usize>,
    /// Bumped on every open against a backend; an idle timer only fires if
    /// the generation it captured is still current.
    idle_gen: HashMap<String, u64>,
}

pub struct Router {
    registry: Registry,
    supervisor: Arc<Supervisor>,
    hooks: Arc<dyn HostHooks>,
    state: Mutex<RouterState>,
    /// `None` keeps idle backends alive until explicit shutdown.
    idle_timeout: Option<Duration>,
}

impl Router {
    pub fn new(
        registry: Registry,
        supervisor: Arc<Supervisor>,
        hooks: Arc<dyn HostHooks>,
    ) -> Self {
        Router {
            registry,
            supervisor,
            hooks,
            state: Mutex::new(RouterState::default()),
            idle_timeout: None,
        }
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Route a newly opened document. Documents with no matching enabled
    /// config are ignored. Returns whether a backend took the document.
    pub async fn document_opened(
        self: &Arc<Self>,
        uri: &Url,
        language_id: &str,
        scope: Option<&str>,
        text: &str,
    ) -> Result<bool> {
        let config = match self.registry.resolve(language_id, scope.unwrap_or("")) {
            Some(config) => config.clone(),
            None => {
                debug!("no backend claims {language_id} for {uri}");
                return Ok(false);
            }
        };

        // Check and reserve under one lock acquisition; a concurrent open of
        // the same document must not send a second didOpen.
        {
            let mut state = self.state.lock().await;
            if state.docs.contains_key(uri) {
                debug!("ignoring duplicate open for {uri}");
                return Ok(true);
            }
            state.docs.insert(
                uri.clone(),
                DocState {
                    config_name: config.name.clone(),
                    language_id: language_id.to_string(),
                    version: 1,
                },
            );
            *state.open_counts.entry(config.name.clone()).or_insert(0) += 1;
            *state.idle_gen.entry(config.name.clone()).or_insert(0) += 1;
        }

        if let Err(err) = self.open_on_backend(uri, language_id, text, &config).await {
            let mut state = self.state.lock().await;
            state.docs.remove(uri);
            if let Some(count) = state.open_counts.get_mut(&config.name) {
                *count = count.saturating_sub(1);
            }
            return Err(err);
        }
        Ok(true)
    }

    async fn open_on_backend(
        &self,
        uri: &Url,
        language_id: &str,
        text: &str,
        config: &ClientConfig,
    ) -> Result<()> {
        let session = self.supervisor.ensure_session(config).await?;

        // Wire diagnostics through to the host. Registered per ensure, so a
        // restarted backend gets a fresh handler.
        let hooks = Arc::clone(&self.hooks);
        session
            .on_notification(
                "textDocument/publishDiagnostics",
                Box::new(move |params| {
                    let params = match params {
                        Some(params) => params,
                        None => return,
                    };
                    match serde_json::from_value::<PublishDiagnosticsParams>(params) {
                        Ok(params) => {
                            let hooks = Arc::clone(&hooks);
                            tokio::spawn(async move {
                                hooks
                                    .diagnostics_updated(DiagnosticsEvent {
                                        uri: params.uri,
                                        diagnostics: params.diagnostics,
                                    })
                                    .await;
                            });
                        }
                        Err(err) => warn!("undecodable diagnostics: {err}"),
                    }
                }),
            )
            .await;

        session
            .notify(
                "textDocument/didOpen",
                Some(json!({
                    "textDocument": {
                        "uri": uri,
                        "languageId": language_id,
                        "version": 1,
                        "text": text,
                    }
                })),
            )
            .await
    }

    /// Full-text synchronization: each change replaces the whole document
    /// under a strictly increasing version.
    pub async fn document_changed(&self, uri: &Url, text: &str) -> Result<()> {
        let (config_name, version) = {
            let mut state = self.state.lock().await;
            let doc = match state.docs.get_mut(uri) {
                Some(doc) => doc,
                None => {
                    debug!("change for untracked document {uri}");
                    return Ok(());
                }
            };
            doc.version += 1;
            (doc.config_name.clone(), doc.version)
        };

        let session = match self.supervisor.session(&config_name).await {
            Some(session) => session,
            None => return Ok(()),
        };
        session
            .notify(
                "textDocument/didChange",
                Some(json!({
                    "textDocument": { "uri": uri, "version": version },
                    "contentChanges": [{ "text": text }],
                })),
            )
            .await
    }

    pub async fn document_closed(self: &Arc<Self>, uri: &Url) -> Result<()> {
        let (config_name, remaining, generation) = {
            let mut state = self.state.lock().await;
            let doc = match state.docs.remove(uri) {
                Some(doc) => doc,
                None => return Ok(()),
            };
            let count = state
                .open_counts
                .entry(doc.config_name.clone())
                .or_insert(1);
            *count = count.saturating_sub(1);
            let remaining = *count;
            let generation = *state.idle_gen.get(&doc.config_name).unwrap_or(&0);
            (doc.config_name, remaining, generation)
        };

        if let Some(session) = self.supervisor.session(&config_name).await {
            session
                .notify(
                    "textDocument/didClose",
                    Some(json!({ "textDocument": { "uri": uri } })),
                )
                .await?;
        }

        if remaining == 0 {
            if let Some(timeout) = self.idle_timeout {
                self.schedule_idle_stop(config_name, generation, timeout);
            }
        }
        Ok(())
    }

    /// The config name currently serving `uri`, if tracked.
    pub async fn backend_for(&self, uri: &Url) -> Option<String> {
        let state = self.state.lock().await;
        state.docs.get(uri).map(|doc| doc.config_name.clone())
    }

    fn schedule_idle_stop(self: &Arc<Self>, config_name: String, generation: u64, timeout: Duration) {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let still_idle = {
                let state = router.state.lock().await;
                let current = *state.idle_gen.get(&config_name).unwrap_or(&0);
                let open = *state.open_counts.get(&config_name).unwrap_or(&0);
                current == generation && open == 0
            };
            if still_idle {
                debug!("[{config_name}] idle timeout, stopping backend");
                router.supervisor.stop(&config_name).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SchemaCatalog;
    use crate::config::ClientConfig;
    use crate::host::NullHost;
    use crate::protocol::{self, Message, Notification, Response};
    use crate::transport::{read_frame, write_frame, Connection, Connector};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Mutex as StdMutex;
    use tokio::io::{duplex, WriteHalf};

    type SharedWriter = Arc<Mutex<WriteHalf<tokio::io::DuplexStream>>>;

    /// Scripted backend over a duplex pipe. Each spawned backend's write
    /// half is retained so tests can inject server-initiated notifications.
    struct FakeConnector {
        log: Arc<StdMutex<Vec<(String, Value)>>>,
        publishers: Arc<Mutex<Vec<SharedWriter>>>,
    }

    impl FakeConnector {
        fn new() -> Self {
            FakeConnector {
                log: Arc::new(StdMutex::new(Vec::new())),
                publishers: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self, _config: &ClientConfig) -> crate::error::Result<Connection> {
            let (client_io, server_io) = duplex(64 * 1024);
            let (mut reader, writer) = tokio::io::split(server_io);
            let writer: SharedWriter = Arc::new(Mutex::new(writer));
            self.publishers.lock().await.push(Arc::clone(&writer));

            let log = Arc::clone(&self.log);
            tokio::spawn(async move {
                loop {
                    let frame = match read_frame(&mut reader).await {
                        Ok(frame) => frame,
                        Err(_) => break,
                    };
                    match protocol::parse_message(&frame).unwrap() {
                        Message::Request(request) => {
                            log.lock().unwrap().push((
                                request.method.clone(),
                                request.params.clone().unwrap_or(Value::Null),
                            ));
                            let response = match request.method.as_str() {
                                "initialize" => Response::success(
                                    request.id,
                                    json!({"capabilities": {}}),
                                ),
                                _ => Response::success(request.id, Value::Null),
                            };
                            let mut writer = writer.lock().await;
                            write_frame(&mut *writer, &serde_json::to_vec(&response).unwrap())
                                .await
                                .unwrap();
                        }
                        Message::Notification(notification) => {
                            let params = notification.params.unwrap_or(Value::Null);
                            log.lock().unwrap().push((notification.method, params));
                        }
                        Message::Response(_) => {}
                    }
                }
            });

            let (client_reader, client_writer) = tokio::io::split(client_io);
            Ok(Connection {
                writer: Box::new(client_writer),
                reader: Box::new(client_reader),
                child: None,
            })
        }
    }

    fn test_uri(name: &str) -> Url {
        Url::parse(&format!("file:///tmp/{name}")).unwrap()
    }

    fn build_router(connector: Arc<dyn Connector>, hooks: Arc<dyn HostHooks>) -> Arc<Router> {
        let supervisor = Arc::new(Supervisor::with_connector(
            connector,
            SchemaCatalog::default(),
            Arc::clone(&hooks),
            None,
        ));
        let mut registry = Registry::new();
        registry
            .register(ClientConfig::json_language_server())
            .unwrap();
        Arc::new(Router::new(registry, supervisor, hooks))
    }

    #[tokio::test]
    async fn open_change_close_flow() {
        let connector = Arc::new(FakeConnector::new());
        let router = build_router(connector.clone(), Arc::new(NullHost));
        let uri = test_uri("settings.json");

        let routed = router
            .document_opened(&uri, "json", Some("source.json"), "{}")
            .await
            .unwrap();
        assert!(routed);
        assert_eq!(
            router.backend_for(&uri).await.as_deref(),
            Some("json")
        );

        router.document_changed(&uri, "{\"a\": 1}").await.unwrap();
        router.document_closed(&uri).await.unwrap();
        assert!(router.backend_for(&uri).await.is_none());

        // The fake backend logs frames from its own task; wait for the last
        // notification to land before asserting on the log.
        for _ in 0..200 {
            if connector
                .log
                .lock()
                .unwrap()
                .iter()
                .any(|(m, _)| m == "textDocument/didClose")
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let log = connector.log.lock().unwrap().clone();
        let methods: Vec<&str> = log.iter().map(|(m, _)| m.as_str()).collect();
        let position = |method: &str| methods.iter().position(|m| *m == method).unwrap();
        assert!(position("textDocument/didOpen") < position("textDocument/didChange"));
        assert!(position("textDocument/didChange") < position("textDocument/didClose"));

        let (_, open_params) = log
            .iter()
            .find(|(m, _)| m == "textDocument/didOpen")
            .unwrap();
        assert_eq!(open_params["textDocument"]["version"], 1);
        let (_, change_params) = log
            .iter()
            .find(|(m, _)| m == "textDocument/didChange")
            .unwrap();
        assert_eq!(change_params["textDocument"]["version"], 2);
        assert_eq!(change_params["contentChanges"][0]["text"], "{\"a\": 1}");
    }

    #[tokio::test]
    async fn unclaimed_language_is_ignored() {
        let connector = Arc::new(FakeConnector::new());
        let router = build_router(connector.clone(), Arc::new(NullHost));
        let uri = test_uri("main.zig");

        let routed = router
            .document_opened(&uri, "zig", None, "")
            .await
            .unwrap();
        assert!(!routed);
        assert!(connector.log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_open_is_a_noop() {
        let connector = Arc::new(FakeConnector::new());
        let router = build_router(connector.clone(), Arc::new(NullHost));
        let uri = test_uri("settings.json");

        router
            .document_opened(&uri, "json", None, "{}")
            .await
            .unwrap();
        router
            .document_opened(&uri, "json", None, "{}")
            .await
            .unwrap();

        // Let the fake backend's reader task drain the pipe before counting.
        for _ in 0..200 {
            if connector
                .log
                .lock()
                .unwrap()
                .iter()
                .any(|(m, _)| m == "textDocument/didOpen")
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let opens = connector
            .log
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == "textDocument/didOpen")
            .count();
        assert_eq!(opens, 1);
    }

    #[tokio::test]
    async fn concurrent_opens_send_one_did_open() {
        let connector = Arc::new(FakeConnector::new());
        let router = build_router(connector.clone(), Arc::new(NullHost));
        let uri = test_uri("settings.json");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let router = Arc::clone(&router);
            let uri = uri.clone();
            handles.push(tokio::spawn(async move {
                router.document_opened(&uri, "json", None, "{}").await.unwrap()
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap());
        }

        let opens = connector
            .log
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == "textDocument/didOpen")
            .count();
        assert_eq!(opens, 1);

        // One close fully releases the document.
        router.document_closed(&uri).await.unwrap();
        assert!(router.backend_for(&uri).await.is_none());
    }

    #[tokio::test]
    async fn diagnostics_reach_the_host() {
        struct CapturingHost {
            events: StdMutex<Vec<DiagnosticsEvent>>,
        }

        #[async_trait]
        impl HostHooks for CapturingHost {
            async fn diagnostics_updated(&self, event: DiagnosticsEvent) {
                self.events.lock().unwrap().push(event);
            }

            async fn backend_unavailable(&self, _config_name: &str, _reason: &str) {}
        }

        let connector = Arc::new(FakeConnector::new());
        let host = Arc::new(CapturingHost {
            events: StdMutex::new(Vec::new()),
        });
        let router = build_router(connector.clone(), host.clone());
        let uri = test_uri("settings.json");

        router
            .document_opened(&uri, "json", None, "{]")
            .await
            .unwrap();

        let publish = Notification::new(
            "textDocument/publishDiagnostics",
            Some(json!({
                "uri": uri,
                "diagnostics": [{
                    "range": {
                        "start": {"line": 0, "character": 1},
                        "end": {"line": 0, "character": 2}
                    },
                    "message": "expected value"
                }]
            })),
        );
        let writer = {
            let publishers = connector.publishers.lock().await;
            Arc::clone(publishers.last().unwrap())
        };
        let mut writer = writer.lock().await;
        write_frame(&mut *writer, &serde_json::to_vec(&publish).unwrap())
            .await
            .unwrap();
        drop(writer);

        for _ in 0..200 {
            if !host.events.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let events = host.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].uri, uri);
        assert_eq!(events[0].diagnostics[0].message, "expected value");
    }

    #[tokio::test]
    async fn idle_timeout_stops_backend_unless_reopened() {
        let connector = Arc::new(FakeConnector::new());
        let hooks: Arc<dyn HostHooks> = Arc::new(NullHost);
        let supervisor = Arc::new(Supervisor::with_connector(
            connector.clone(),
            SchemaCatalog::default(),
            Arc::clone(&hooks),
            None,
        ));
        let mut registry = Registry::new();
        registry
            .register(ClientConfig::json_language_server())
            .unwrap();
        let router = Arc::new(
            Router::new(registry, Arc::clone(&supervisor), hooks)
                .with_idle_timeout(Duration::from_millis(50)),
        );
        let uri = test_uri("settings.json");

        router
            .document_opened(&uri, "json", None, "{}")
            .await
            .unwrap();
        router.document_closed(&uri).await.unwrap();

        for _ in 0..200 {
            if supervisor.session("json").await.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(supervisor.session("json").await.is_none());

        // A reopen within the window must defeat a pending timer.
        router
            .document_opened(&uri, "json", None, "{}")
            .await
            .unwrap();
        let other = test_uri("other.json");
        router
            .document_opened(&other, "json", None, "{}")
            .await
            .unwrap();
        router.document_closed(&other).await.unwrap();
        // First doc is still open; closing the second must not arm a stop.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(supervisor.session("json").await.is_some());
    }
}
