use super::signals::ShutdownSignal;

/// Messages sent to the supervisor's event loop from the other threads
#[derive(Debug)]
pub enum SupervisorEvent {
    /// Raw notification from the filesystem watcher
    FileSystem(notify::Result<notify::Event>),
    /// A shutdown signal was received and the session has already been stopped
    Signal(ShutdownSignal),
    /// The memory watchdog's restart could not start a new session
    RestartFailed(String),
}
