use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::config::{Config, ConfigChangePolicy, ConfigDocument};
use super::error::SupervisorError;
use super::framework::LiveFramework;
use super::memory::{MemoryWatchdog, SystemMemoryProbe};
use super::session::{LiveSession, SessionTiming};
use super::signals::SignalListener;
use super::supervisor_event::SupervisorEvent;
use super::watcher::{is_relevant, ScriptWatcher, WatchAction};

/// How a supervisor run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Clean,
    Interrupted,
    Fatal,
    StartFailed,
    /// The configuration changed and should be loaded again
    Reload,
}

impl Exit {
    /// Process exit code, None if the daemon keeps going
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Clean => Some(0),
            Self::Interrupted => Some(130),
            Self::Fatal => Some(1),
            Self::StartFailed => Some(-1),
            Self::Reload => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Configuring,
    Starting,
    Running,
    Restarting,
    ShuttingDown,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "INIT"),
            Self::Configuring => write!(f, "CONFIGURING"),
            Self::Starting => write!(f, "STARTING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Restarting => write!(f, "RESTARTING"),
            Self::ShuttingDown => write!(f, "SHUTTING_DOWN"),
        }
    }
}

/// Runs one live data session from configuration to exit.
///
/// The supervisor owns the event channel. The file watcher, the signal listener and the memory
/// watchdog all report into it, and the supervisor handles their events one at a time on the
/// calling thread.
pub struct Supervisor {
    config: Config,
    framework: Arc<dyn LiveFramework>,
    session: Arc<LiveSession>,
    watcher: ScriptWatcher,
    phase: Phase,
    catch_signals: bool,
    watchdog: Option<JoinHandle<()>>,
}

impl Supervisor {
    /// Resolve the configuration document against the framework and build a supervisor for it
    pub fn configure(
        doc: ConfigDocument,
        filename: Option<PathBuf>,
        framework: Arc<dyn LiveFramework>,
    ) -> Result<Self, SupervisorError> {
        spdlog::info!("Phase {} -> {}", Phase::Init, Phase::Configuring);
        let config = Config::resolve(doc, filename, framework.as_ref())?;
        match config.to_json() {
            Ok(json) => spdlog::info!("Configuration: {json}"),
            Err(e) => spdlog::warn!("Could not render configuration: {e}"),
        }
        Ok(Self::new(config, framework))
    }

    pub fn new(config: Config, framework: Arc<dyn LiveFramework>) -> Self {
        let session = Arc::new(LiveSession::new(
            framework.clone(),
            config.to_start_live_args(),
            SessionTiming::from_config(&config),
        ));
        let watcher = ScriptWatcher::new(&config);
        Self {
            config,
            framework,
            session,
            watcher,
            phase: Phase::Configuring,
            catch_signals: true,
            watchdog: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session(&self) -> &Arc<LiveSession> {
        &self.session
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn transition(&mut self, next: Phase) {
        spdlog::info!("Phase {} -> {}", self.phase, next);
        self.phase = next;
    }

    /// Start everything, then handle events until something ends the run.
    ///
    /// Whatever way the run ends, the session is stopped and the helper threads are finished
    /// before this returns.
    pub fn run(mut self) -> Result<Exit, SupervisorError> {
        let (tx, rx) = mpsc::channel::<SupervisorEvent>();
        let running = Arc::new(AtomicBool::new(true));
        self.transition(Phase::Starting);

        let mut listener = if self.catch_signals {
            Some(
                SignalListener::spawn(self.session.clone(), tx.clone())
                    .map_err(SupervisorError::SignalError)?,
            )
        } else {
            None
        };

        let result = self.serve(&tx, &rx, &running);

        self.transition(Phase::ShuttingDown);
        running.store(false, Ordering::SeqCst);
        self.session.begin_shutdown();
        if let Some(watchdog) = self.watchdog.take() {
            if watchdog.join().is_err() {
                spdlog::error!("Memory watchdog thread panicked");
            }
        }
        // The watchdog may have been mid-restart when shutdown began
        self.session.stop();
        if let Some(listener) = listener.as_mut() {
            listener.close();
        }

        match &result {
            Ok(exit) => spdlog::info!("Supervisor finished: {exit:?}"),
            Err(e) => spdlog::error!("{e}"),
        }
        result
    }

    fn serve(
        &mut self,
        tx: &Sender<SupervisorEvent>,
        rx: &Receiver<SupervisorEvent>,
        running: &Arc<AtomicBool>,
    ) -> Result<Exit, SupervisorError> {
        // Dropping the watcher at the end of the run stops the notifications
        let _fs_watcher = self.watcher.watch(tx.clone())?;

        if let Err(e) = self.session.start() {
            spdlog::error!("{e}");
            return Ok(self.pending_signal(rx).unwrap_or(Exit::StartFailed));
        }

        if self.config.mem_watchdog_enabled() {
            let probe = SystemMemoryProbe::new(self.framework.clone());
            let watchdog = MemoryWatchdog::new(probe, &self.config);
            self.watchdog = Some(watchdog.spawn(self.session.clone(), tx.clone(), running.clone()));
        } else {
            spdlog::info!("Memory watchdog disabled");
        }

        self.transition(Phase::Running);
        for event in rx.iter() {
            if let Some(exit) = self.handle_event(event) {
                return Ok(exit);
            }
        }
        Ok(Exit::Clean)
    }

    /// A start that failed because a signal arrived mid-start exits by the signal instead
    fn pending_signal(&self, rx: &Receiver<SupervisorEvent>) -> Option<Exit> {
        if !self.session.is_shutting_down() {
            return None;
        }
        while let Ok(event) = rx.recv_timeout(Duration::from_secs(1)) {
            if let SupervisorEvent::Signal(signal) = event {
                return Some(signal.exit());
            }
        }
        None
    }

    /// Handle one event from the channel. Returns how the run ends, or None to keep going.
    pub fn handle_event(&mut self, event: SupervisorEvent) -> Option<Exit> {
        match event {
            SupervisorEvent::FileSystem(Ok(event)) => {
                if !is_relevant(&event.kind) {
                    return None;
                }
                event
                    .paths
                    .iter()
                    .find_map(|path| self.handle_change(path))
            }
            SupervisorEvent::FileSystem(Err(e)) => {
                spdlog::error!("File watcher error: {e}");
                None
            }
            SupervisorEvent::Signal(signal) => {
                spdlog::info!("Exiting after {signal}");
                Some(signal.exit())
            }
            SupervisorEvent::RestartFailed(reason) => {
                spdlog::error!("Memory watchdog could not restart live data: {reason}");
                Some(Exit::StartFailed)
            }
        }
    }

    fn handle_change(&mut self, path: &Path) -> Option<Exit> {
        match self.watcher.classify(path) {
            WatchAction::Ignore => {
                spdlog::debug!("Ignoring change to {}", path.display());
                None
            }
            WatchAction::ConfigChanged => match self.config.on_config_change {
                ConfigChangePolicy::Shutdown => {
                    spdlog::warn!("Modifying configuration file is not supported - shutting down");
                    self.session.begin_shutdown();
                    Some(Exit::Clean)
                }
                ConfigChangePolicy::Reload => {
                    spdlog::warn!("Configuration file modified - reloading");
                    self.session.begin_shutdown();
                    Some(Exit::Reload)
                }
            },
            WatchAction::Unchanged(script) => {
                spdlog::info!(
                    "Processing script \"{}\" has not changed - not restarting",
                    script.display()
                );
                None
            }
            WatchAction::Restart(script) => {
                spdlog::info!("Processing script \"{}\" modified", script.display());
                self.transition(Phase::Restarting);
                match self.session.restart_and_clear() {
                    // A restart cut short by a shutdown signal leaves the exit to that signal's event
                    Ok(()) if self.session.is_shutting_down() => None,
                    Ok(()) => {
                        self.transition(Phase::Running);
                        None
                    }
                    Err(e) => {
                        spdlog::error!("{e}");
                        Some(Exit::StartFailed)
                    }
                }
            }
        }
    }
}
