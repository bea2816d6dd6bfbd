//! Host-facing capability interface. The core never references a concrete
//! host type; each embedding implements this small adapter.

use async_trait::async_trait;
use lsp_types::Diagnostic;
use url::Url;

/// Diagnostics for one document, in the order the backend reported them.
/// Transient: consumed immediately by the host's presentation layer.
#[derive(Debug, Clone)]
pub struct DiagnosticsEvent {
    pub uri: Url,
    pub diagnostics: Vec<Diagnostic>,
}

/// Callbacks the session layer raises toward the host.
#[async_trait]
pub trait HostHooks: Send + Sync {
    async fn diagnostics_updated(&self, event: DiagnosticsEvent);

    /// A backend failed to start or crashed. `reason` is a single
    /// human-readable message naming the failure, never a protocol dump.
    async fn backend_unavailable(&self, config_name: &str, reason: &str);
}

/// Host adapter that ignores every event. Useful as a default and in tests.
pub struct NullHost;

#[async_trait]
impl HostHooks for NullHost {
    async fn diagnostics_updated(&self, _event: DiagnosticsEvent) {}
    async fn backend_unavailable(&self, _config_name: &str, _reason: &str) {}
}
