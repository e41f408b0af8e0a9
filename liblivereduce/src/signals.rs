use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::JoinHandle;

use super::session::LiveSession;
use super::supervisor::Exit;
use super::supervisor_event::SupervisorEvent;

// SIGHUP is caught only so that it can be ignored. SIGSTOP and SIGKILL can't be caught at all.
const CAUGHT_SIGNALS: [i32; 4] = [SIGINT, SIGQUIT, SIGTERM, SIGHUP];

/// The signals that end the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Quit,
    Terminate,
}

impl ShutdownSignal {
    pub fn from_raw(signal: i32) -> Option<Self> {
        match signal {
            SIGINT => Some(Self::Interrupt),
            SIGQUIT => Some(Self::Quit),
            SIGTERM => Some(Self::Terminate),
            _ => None,
        }
    }

    pub fn raw(&self) -> i32 {
        match self {
            Self::Interrupt => SIGINT,
            Self::Quit => SIGQUIT,
            Self::Terminate => SIGTERM,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Interrupt => "SIGINT",
            Self::Quit => "SIGQUIT",
            Self::Terminate => "SIGTERM",
        }
    }

    /// Interrupt is an orderly but unsuccessful exit, terminate is a clean exit and quit is fatal
    pub fn exit(&self) -> Exit {
        match self {
            Self::Interrupt => Exit::Interrupted,
            Self::Quit => Exit::Fatal,
            Self::Terminate => Exit::Clean,
        }
    }
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), self.raw())
    }
}

/// React to a delivered signal.
///
/// Shutdown signals stop the session right away, before anything else gets a chance to run.
/// Returns the signal to forward to the supervisor, or None if the signal is ignored.
pub fn handle_signal(signal: i32, session: &LiveSession) -> Option<ShutdownSignal> {
    match ShutdownSignal::from_raw(signal) {
        Some(shutdown) => {
            spdlog::info!("received {shutdown}");
            session.begin_shutdown();
            Some(shutdown)
        }
        None => {
            spdlog::info!("received signal {signal} - ignoring");
            None
        }
    }
}

/// Background thread turning process signals into supervisor events
pub struct SignalListener {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl SignalListener {
    pub fn spawn(
        session: Arc<LiveSession>,
        tx: Sender<SupervisorEvent>,
    ) -> Result<Self, std::io::Error> {
        let mut signals = Signals::new(CAUGHT_SIGNALS)?;
        spdlog::debug!("registered signals {CAUGHT_SIGNALS:?}");
        let handle = signals.handle();
        let thread = std::thread::spawn(move || {
            for signal in signals.forever() {
                if let Some(shutdown) = handle_signal(signal, &session) {
                    // Keep listening; later signals still stop the session
                    let _ = tx.send(SupervisorEvent::Signal(shutdown));
                }
            }
        });
        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    /// Stop listening and wait for the listener thread to finish
    pub fn close(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                spdlog::error!("Signal listener thread panicked");
            }
        }
    }
}

impl Drop for SignalListener {
    fn drop(&mut self) {
        self.close();
    }
}
