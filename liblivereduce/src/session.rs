use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::config::Config;
use super::constants::{MONITOR_ALGORITHM, RESTART_GRACE_MS, STOP_POLL_MS};
use super::error::SessionError;
use super::framework::{LiveFramework, StartLiveArgs};

/// How a stop request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// There was never a session to stop
    NotStarted,
    Stopped,
    /// Cancellation was requested but the framework still reports the session as running
    TimedOut,
}

/// Timing of the stop/restart sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTiming {
    pub restart_grace: Duration,
    pub stop_timeout: Duration,
    pub stop_poll: Duration,
}

impl SessionTiming {
    pub fn from_config(config: &Config) -> Self {
        Self {
            restart_grace: Duration::from_millis(RESTART_GRACE_MS),
            stop_timeout: Duration::from_secs_f64(config.stop_timeout_sec),
            stop_poll: Duration::from_millis(STOP_POLL_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    Active { generation: u32 },
}

/// Owns the lifecycle of the one live data session.
///
/// Shared between the event loop, the memory watchdog and the signal listener. `stop` may be
/// called from any of them at any time; restarts are serialized.
pub struct LiveSession {
    framework: Arc<dyn LiveFramework>,
    args: StartLiveArgs,
    timing: SessionTiming,
    state: Mutex<SessionState>,
    generation: AtomicU32,
    restart_lock: Mutex<()>,
    shutting_down: AtomicBool,
}

impl LiveSession {
    pub fn new(
        framework: Arc<dyn LiveFramework>,
        args: StartLiveArgs,
        timing: SessionTiming,
    ) -> Self {
        Self {
            framework,
            args,
            timing,
            state: Mutex::new(SessionState::Idle),
            generation: AtomicU32::new(0),
            restart_lock: Mutex::new(()),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn args(&self) -> &StartLiveArgs {
        &self.args
    }

    /// Whether a session has been started and not stopped since
    pub fn is_active(&self) -> bool {
        matches!(*self.lock_state(), SessionState::Active { .. })
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Start live data processing.
    ///
    /// If the framework fails to come up, whatever was partially started is stopped again before
    /// the error is returned.
    pub fn start(&self) -> Result<(), SessionError> {
        if self.is_shutting_down() {
            return Err(SessionError::ShuttingDown);
        }
        match self.args.to_json() {
            Ok(json) => spdlog::info!("StartLiveData({json})"),
            Err(e) => spdlog::warn!("Could not render StartLiveData arguments: {e}"),
        }

        // Mark the session active before starting so a concurrent stop cancels it
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.lock_state() = SessionState::Active { generation };

        match self.framework.start_live_data(&self.args) {
            Ok(()) => {
                spdlog::info!("Live data session {generation} started");
                Ok(())
            }
            Err(e) => {
                spdlog::error!("Interrupted StartLiveData: {e}");
                self.stop();
                Err(SessionError::StartFailed(e))
            }
        }
    }

    /// Cancel the running session and wait (bounded) for it to report stopped. Idempotent.
    pub fn stop(&self) -> StopOutcome {
        let previous = std::mem::replace(&mut *self.lock_state(), SessionState::Idle);
        let generation = match previous {
            SessionState::Idle => {
                spdlog::info!("Live data not started - nothing to cleanup");
                return StopOutcome::NotStarted;
            }
            SessionState::Active { generation } => generation,
        };

        spdlog::info!("Stopping live data processing (session {generation})");
        self.framework.cancel_all();

        let deadline = Instant::now() + self.timing.stop_timeout;
        while self.framework.is_running(MONITOR_ALGORITHM) {
            if Instant::now() >= deadline {
                spdlog::error!(
                    "{MONITOR_ALGORITHM} still running {:?} after cancellation",
                    self.timing.stop_timeout
                );
                return StopOutcome::TimedOut;
            }
            std::thread::sleep(self.timing.stop_poll);
        }
        StopOutcome::Stopped
    }

    /// Stop, let the cancellation settle, drop all accumulated workspaces and start again
    pub fn restart_and_clear(&self) -> Result<(), SessionError> {
        let _guard = match self.restart_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if self.is_shutting_down() {
            spdlog::info!("Shutdown in progress - not restarting live data");
            return Ok(());
        }

        spdlog::info!("Restarting Live Data and clearing workspaces");
        if self.stop() == StopOutcome::TimedOut {
            spdlog::warn!("Restarting even though the previous session did not report stopped");
        }
        std::thread::sleep(self.timing.restart_grace);
        if self.is_shutting_down() {
            spdlog::info!("Shutdown began during restart - not starting live data again");
            return Ok(());
        }
        self.framework.clear_workspaces();
        match self.start() {
            // A shutdown that lands mid-start cancels it; that is not a failed restart
            Err(e) if self.is_shutting_down() => {
                spdlog::info!("Restart abandoned for shutdown: {e}");
                Ok(())
            }
            result => result,
        }
    }

    /// Refuse any further starts and stop what is running
    pub fn begin_shutdown(&self) -> StopOutcome {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.stop()
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::framework::testing::{Call, FakeFramework};
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;

    pub(crate) fn test_args() -> StartLiveArgs {
        StartLiveArgs {
            instrument: String::from("POWGEN"),
            update_every: 30,
            preserve_events: true,
            accumulation_method: String::from("Add"),
            output_workspace: String::from("result"),
            from_now: false,
            from_start_of_run: true,
            processing_script_filename: PathBuf::from("/tmp/reduce_PG3_live_proc.py"),
            accumulation_workspace: None,
            post_processing_script_filename: None,
            period_list: None,
            spectra_list: None,
        }
    }

    pub(crate) fn fast_timing() -> SessionTiming {
        SessionTiming {
            restart_grace: Duration::ZERO,
            stop_timeout: Duration::from_millis(50),
            stop_poll: Duration::from_millis(1),
        }
    }

    pub(crate) fn session(framework: &Arc<FakeFramework>) -> LiveSession {
        LiveSession::new(framework.clone(), test_args(), fast_timing())
    }

    #[test]
    fn test_stop_before_start_is_noop() {
        let framework = Arc::new(FakeFramework::default());
        let session = session(&framework);
        assert_eq!(session.stop(), StopOutcome::NotStarted);
        assert_eq!(session.stop(), StopOutcome::NotStarted);
        assert!(framework.calls().is_empty());
    }

    #[test]
    fn test_start_then_stop() {
        let framework = Arc::new(FakeFramework::default());
        let session = session(&framework);
        session.start().unwrap();
        assert!(session.is_active());
        assert_eq!(session.stop(), StopOutcome::Stopped);
        assert!(!session.is_active());
        assert_eq!(session.stop(), StopOutcome::NotStarted);
        assert_eq!(
            framework.calls(),
            vec![Call::Start(test_args()), Call::CancelAll]
        );
    }

    #[test]
    fn test_failed_start_stops() {
        let framework = Arc::new(FakeFramework::default());
        framework.fail_start.store(true, Ordering::SeqCst);
        let session = session(&framework);
        assert!(matches!(session.start(), Err(SessionError::StartFailed(_))));
        assert!(!session.is_active());
        assert_eq!(
            framework.calls(),
            vec![Call::Start(test_args()), Call::CancelAll]
        );
    }

    #[test]
    fn test_restart_order() {
        let framework = Arc::new(FakeFramework::default());
        let session = session(&framework);
        session.start().unwrap();
        session.restart_and_clear().unwrap();
        assert_eq!(
            framework.calls(),
            vec![
                Call::Start(test_args()),
                Call::CancelAll,
                Call::ClearWorkspaces,
                Call::Start(test_args()),
            ]
        );
        assert!(session.is_active());
    }

    #[test]
    fn test_stop_times_out() {
        let framework = Arc::new(FakeFramework::default());
        framework.ignore_cancel.store(true, Ordering::SeqCst);
        let session = session(&framework);
        session.start().unwrap();
        assert_eq!(session.stop(), StopOutcome::TimedOut);
        assert!(framework.running_polls.load(Ordering::SeqCst) > 1);
        // the handle is released either way, so a second stop does nothing
        assert_eq!(session.stop(), StopOutcome::NotStarted);
    }

    #[test]
    fn test_shutdown_during_restart_grace() {
        let framework = Arc::new(FakeFramework::default());
        let session = Arc::new(LiveSession::new(
            framework.clone(),
            test_args(),
            SessionTiming {
                restart_grace: Duration::from_millis(300),
                ..fast_timing()
            },
        ));
        session.start().unwrap();

        let signaller = {
            let session = session.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                session.begin_shutdown();
            })
        };
        session.restart_and_clear().unwrap();
        signaller.join().unwrap();

        assert!(!session.is_active());
        assert_eq!(framework.count(|c| matches!(c, Call::Start(_))), 1);
        assert_eq!(framework.count(|c| matches!(c, Call::ClearWorkspaces)), 0);
    }

    #[test]
    fn test_no_start_after_shutdown() {
        let framework = Arc::new(FakeFramework::default());
        let session = session(&framework);
        session.start().unwrap();
        assert_eq!(session.begin_shutdown(), StopOutcome::Stopped);
        assert!(matches!(session.start(), Err(SessionError::ShuttingDown)));
        session.restart_and_clear().unwrap();
        assert_eq!(framework.count(|c| matches!(c, Call::Start(_))), 1);
        assert_eq!(framework.count(|c| matches!(c, Call::ClearWorkspaces)), 0);
    }
}
