use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Debug, Clone)]
pub struct Config {
    pub config_table: Option<PathBuf>,
    pub catalog: Option<PathBuf>,
    pub files: Vec<PathBuf>,
    pub wait: Duration,
    pub idle_timeout: Option<Duration>,
}

#[derive(Parser, Debug)]
#[command(name = "lsp_sessions")]
#[command(about = "Run configured language-server backends against a set of files", long_about = None)]
pub struct Cli {
    /// Files to open against their matching backends
    pub files: Vec<PathBuf>,

    /// JSON table of backend configurations; defaults to the built-in
    /// JSON language server entry
    #[arg(long)]
    pub config_table: Option<PathBuf>,

    /// Schema catalog file overriding the bundled one
    #[arg(long)]
    pub catalog: Option<PathBuf>,

    /// Seconds to wait for diagnostics before shutting down
    #[arg(long, default_value_t = 5)]
    pub wait_secs: u64,

    /// Stop a backend this many seconds after its last document closes
    #[arg(long)]
    pub idle_secs: Option<u64>,
}

impl Cli {
    pub fn from_args() -> Self {
        Self::parse()
    }

    pub fn into_config(self) -> Config {
        Config {
            config_table: self.config_table,
            catalog: self.catalog,
            files: self.files,
            wait: Duration::from_secs(self.wait_secs),
            idle_timeout: self.idle_secs.map(Duration::from_secs),
        }
    }
}
