use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameworkError {
    #[error("Framework failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Framework could not spawn the bridge interpreter {0}: {1}")]
    SpawnError(String, std::io::Error),
    #[error("Framework query '{command}' exited with {status}: {stderr}")]
    QueryFailed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("Framework query '{0}' produced no output")]
    EmptyResponse(String),
    #[error("Framework failed to parse a bridge response: {0}")]
    ParsingError(#[from] serde_json::Error),
    #[error("Framework bridge exited during startup with {0}")]
    ExitedDuringStartup(ExitStatus),
    #[error("Framework bridge was cancelled during startup")]
    CancelledDuringStartup,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse JSON: {0}")]
    ParsingError(#[from] serde_json::Error),
    #[error("Config failed to look up the instrument: {0}")]
    InstrumentLookup(#[source] FrameworkError),
    #[error("No instrument found in the configuration or Mantid.user.properties files")]
    NoInstrument,
    #[error("Config failed to query allowed accumulation methods: {0}")]
    AllowedValuesLookup(#[source] FrameworkError),
    #[error("ProcessingScriptFilename {0:?} does not exist")]
    MissingProcScript(PathBuf),
    #[error("ProcessingScriptFilename {0:?} is empty")]
    EmptyProcScript(PathBuf),
    #[error("PostProcessingScriptFilename {0:?} is empty")]
    EmptyPostProcScript(PathBuf),
    #[error("accumulation method '{method}' is not allowed {allowed:?}")]
    DisallowedAccumMethod {
        method: String,
        allowed: Vec<String>,
    },
    #[error("system_mem_limit_perc must be within [0, 100], found {0}")]
    BadMemoryLimit(f64),
    #[error("{0} must be a positive number of seconds, found {1}")]
    BadInterval(&'static str, f64),
    #[error("Unknown on_config_change policy '{0}'; expected 'shutdown' or 'reload'")]
    BadConfigChangePolicy(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Live session failed to start: {0}")]
    StartFailed(#[from] FrameworkError),
    #[error("Live session refused to start because shutdown has begun")]
    ShuttingDown,
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("File watcher failed due to notify error: {0}")]
    NotifyError(#[from] notify::Error),
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Supervisor failed due to Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Supervisor failed due to file watcher error: {0}")]
    WatchError(#[from] WatchError),
    #[error("Supervisor could not register signal handlers: {0}")]
    SignalError(#[source] std::io::Error),
}
