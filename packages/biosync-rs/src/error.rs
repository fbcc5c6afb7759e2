use thiserror::Error;

/// Errors surfaced by the synchronizer lifecycle and registration API.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("session already started")]
    AlreadyStarted,

    #[error("session not started")]
    NotStarted,

    #[error("sink registration rejected while a session is running")]
    SessionActive,

    #[error("invalid grid spacing: {0} (delta must be > 0)")]
    InvalidDelta(f64),

    #[error("failed to spawn consumer thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Errors surfaced by the CSV export sink.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("exporter already running")]
    AlreadyRunning,

    #[error("signal CSV enabled but no exportable channels were provided")]
    EmptySchema,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid config at {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}
