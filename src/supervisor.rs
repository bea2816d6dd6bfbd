//! Owns the live-session table and enforces at most one running backend per
//! config name. Spawning happens outside the table lock; when two callers
//! race, one winner is kept and the loser's session is stopped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use lsp_types::Url;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::catalog::SchemaCatalog;
use crate::config::ClientConfig;
use crate::error::Result;
use crate::host::HostHooks;
use crate::session::{Session, SessionState};
use crate::settings;
use crate::transport::{Connector, ProcessConnector};

pub struct Supervisor {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    connector: Arc<dyn Connector>,
    /// Shared with the per-session `workspace/configuration` responders, so
    /// pull-based servers always read the current catalog. Synchronous lock:
    /// never held across an await.
    catalog: Arc<StdMutex<SchemaCatalog>>,
    hooks: Arc<dyn HostHooks>,
    root: Option<Url>,
}

fn lock_catalog(catalog: &StdMutex<SchemaCatalog>) -> MutexGuard<'_, SchemaCatalog> {
    catalog.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Supervisor {
    pub fn new(catalog: SchemaCatalog, hooks: Arc<dyn HostHooks>, root: Option<Url>) -> Self {
        Self::with_connector(Arc::new(ProcessConnector), catalog, hooks, root)
    }

    pub fn with_connector(
        connector: Arc<dyn Connector>,
        catalog: SchemaCatalog,
        hooks: Arc<dyn HostHooks>,
        root: Option<Url>,
    ) -> Self {
        Supervisor {
            sessions: Mutex::new(HashMap::new()),
            connector,
            catalog: Arc::new(StdMutex::new(catalog)),
            hooks,
            root,
        }
    }

    /// Return the live session for `config`, starting one if needed.
    /// Concurrent callers for the same name all receive the same session.
    pub async fn ensure_session(
        self: &Arc<Self>,
        config: &ClientConfig,
    ) -> Result<Arc<Session>> {
        if let Some(existing) = self.live_session(&config.name).await {
            return Ok(existing);
        }

        // Spawn and handshake outside the table lock; slow servers must not
        // stall lookups for other backends.
        let session = match self.spawn_and_initialize(config).await {
            Ok(session) => session,
            Err(err) => {
                self.hooks
                    .backend_unavailable(&config.name, &err.to_string())
                    .await;
                return Err(err);
            }
        };

        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(&config.name) {
            if !existing.state().is_terminal() {
                // Lost the race: keep the incumbent, discard ours.
                let winner = Arc::clone(existing);
                drop(sessions);
                debug!("[{}] concurrent start lost the race", config.name);
                session.stop().await;
                return Ok(winner);
            }
        }
        sessions.insert(config.name.clone(), Arc::clone(&session));
        drop(sessions);

        self.monitor(Arc::clone(&session));
        Ok(session)
    }

    /// The live session for `name`, if any. Terminal entries are evicted by
    /// the crash monitor, not here.
    pub async fn session(&self, name: &str) -> Option<Arc<Session>> {
        self.live_session(name).await
    }

    /// Replace the schema catalog and push refreshed settings to every live
    /// session whose config consumes it.
    pub async fn update_catalog(&self, catalog: SchemaCatalog) {
        *lock_catalog(&self.catalog) = catalog;
        let sessions: Vec<Arc<Session>> =
            self.sessions.lock().await.values().cloned().collect();
        for session in sessions {
            if session.state().is_terminal() {
                continue;
            }
            let params = {
                let catalog = lock_catalog(&self.catalog);
                settings::configuration_params(session.config(), &catalog)
            };
            let params = match serde_json::to_value(params) {
                Ok(params) => params,
                Err(err) => {
                    warn!("[{}] could not encode settings: {err}", session.name());
                    continue;
                }
            };
            if let Err(err) = session
                .notify("workspace/didChangeConfiguration", Some(params))
                .await
            {
                warn!("[{}] settings push failed: {err}", session.name());
            }
        }
    }

    pub async fn stop(&self, name: &str) {
        let session = self.sessions.lock().await.remove(name);
        if let Some(session) = session {
            session.stop().await;
        }
    }

    pub async fn stop_all(&self) {
        let sessions: Vec<Arc<Session>> =
            self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.stop().await;
        }
    }

    async fn live_session(&self, name: &str) -> Option<Arc<Session>> {
        let sessions = self.sessions.lock().await;
        let session = sessions.get(name)?;
        if session.state().is_terminal() {
            return None;
        }
        Some(Arc::clone(session))
    }

    async fn spawn_and_initialize(&self, config: &ClientConfig) -> Result<Arc<Session>> {
        info!("[{}] starting backend", config.name);
        let connection = self.connector.connect(config).await?;
        let session = Arc::new(Session::attach(config.clone(), connection));

        // The responder must exist before `initialize`: servers may pull
        // configuration during their own startup. It reads the live catalog,
        // so later `update_catalog` calls are visible to pulls too.
        let responder_config = config.clone();
        let catalog = Arc::clone(&self.catalog);
        session
            .on_request(
                "workspace/configuration",
                Box::new(move |params| {
                    let catalog = lock_catalog(&catalog);
                    Some(settings::configuration_response(
                        &responder_config,
                        &catalog,
                        params.as_ref(),
                    ))
                }),
            )
            .await;

        // A half-started backend must not outlive a failed handshake: the
        // reader task keeps its own handle on the session, so without an
        // explicit stop the subprocess would leak.
        if let Err(err) = self.handshake(&session, config).await {
            session.stop().await;
            return Err(err);
        }
        Ok(session)
    }

    async fn handshake(&self, session: &Session, config: &ClientConfig) -> Result<()> {
        let init_params = settings::initialize_params(config, self.root.as_ref());
        session
            .initialize(serde_json::to_value(init_params)?)
            .await?;

        // Projected settings go out before any document traffic can start.
        let params = {
            let catalog = lock_catalog(&self.catalog);
            serde_json::to_value(settings::configuration_params(config, &catalog))?
        };
        session
            .notify("workspace/didChangeConfiguration", Some(params))
            .await?;
        Ok(())
    }

    /// Watch one session until it terminates; evict crashed entries and
    /// surface them to the host. No automatic restart; the next
    /// `ensure_session` for the name starts fresh.
    fn monitor(self: &Arc<Self>, session: Arc<Session>) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut states = session.watch_state();
            loop {
                let state = *states.borrow_and_update();
                if state.is_terminal() {
                    break;
                }
                if states.changed().await.is_err() {
                    break;
                }
            }
            if session.state() == SessionState::Crashed {
                warn!("[{}] backend crashed", session.name());
                let mut sessions = supervisor.sessions.lock().await;
                if let Some(entry) = sessions.get(session.name()) {
                    if Arc::ptr_eq(entry, &session) {
                        sessions.remove(session.name());
                    }
                }
                drop(sessions);
                supervisor
                    .hooks
                    .backend_unavailable(session.name(), "backend crashed")
                    .await;
            }
        });
    }
}
