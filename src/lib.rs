//! Session management for language-server backends.
//!
//! The crate spawns configured language servers, speaks framed JSON-RPC to
//! them, keeps at most one live session per backend, and routes document
//! open/change/close traffic to the right session. Host integration happens
//! through [`host::HostHooks`].

pub mod app;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod error;
pub mod host;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod session;
pub mod settings;
pub mod supervisor;
pub mod transport;

pub use catalog::SchemaCatalog;
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use host::{DiagnosticsEvent, HostHooks, NullHost};
pub use registry::Registry;
pub use router::Router;
pub use session::{Session, SessionState};
pub use supervisor::Supervisor;
