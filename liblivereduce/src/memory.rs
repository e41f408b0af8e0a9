use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use sysinfo::{Pid, ProcessesToUpdate, System};

use super::config::Config;
use super::error::SessionError;
use super::framework::LiveFramework;
use super::session::LiveSession;
use super::supervisor_event::SupervisorEvent;

/// Source of memory samples
pub trait MemoryProbe: Send {
    /// Total system memory in bytes
    fn total_memory(&mut self) -> u64;
    /// Resident memory of everything that belongs to the session, in bytes
    fn resident_memory(&mut self) -> u64;
}

/// Samples this process and the framework's worker processes using sysinfo
pub struct SystemMemoryProbe {
    system: System,
    own_pid: Pid,
    framework: Arc<dyn LiveFramework>,
}

impl SystemMemoryProbe {
    pub fn new(framework: Arc<dyn LiveFramework>) -> Self {
        Self {
            system: System::new(),
            own_pid: Pid::from_u32(std::process::id()),
            framework,
        }
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn total_memory(&mut self) -> u64 {
        self.system.refresh_memory();
        self.system.total_memory()
    }

    fn resident_memory(&mut self) -> u64 {
        let mut pids = vec![self.own_pid];
        pids.extend(self.framework.worker_pids().into_iter().map(Pid::from_u32));
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&pids), true);
        pids.iter()
            .filter_map(|pid| self.system.process(*pid))
            .map(|process| process.memory())
            .sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryCheck {
    Within { used: u64, limit: u64 },
    Exceeded { used: u64, limit: u64 },
}

/// Restarts the session when memory use goes over a fraction of system memory.
///
/// Runaway accumulation is the usual culprit, and clearing the workspaces cures it, so a breach
/// gets the same treatment as a changed script.
pub struct MemoryWatchdog<P: MemoryProbe> {
    probe: P,
    limit: u64,
    interval: Duration,
}

impl<P: MemoryProbe + 'static> MemoryWatchdog<P> {
    pub fn new(mut probe: P, config: &Config) -> Self {
        let total = probe.total_memory();
        let limit = config.mem_limit_bytes(total);
        spdlog::info!(
            "Memory limit set to {} ({}% of {})",
            human_bytes::human_bytes(limit as f64),
            config.system_mem_limit_perc,
            human_bytes::human_bytes(total as f64)
        );
        Self {
            probe,
            limit,
            interval: Duration::from_secs_f64(config.mem_check_interval_sec),
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Take one sample and compare it against the limit
    pub fn check(&mut self) -> MemoryCheck {
        let used = self.probe.resident_memory();
        if used > self.limit {
            MemoryCheck::Exceeded {
                used,
                limit: self.limit,
            }
        } else {
            MemoryCheck::Within {
                used,
                limit: self.limit,
            }
        }
    }

    /// Take one sample and restart the session if it is over the limit
    pub fn poll(&mut self, session: &LiveSession) -> Result<MemoryCheck, SessionError> {
        let check = self.check();
        if let MemoryCheck::Exceeded { used, limit } = check {
            spdlog::error!(
                "Memory usage {} exceeds limit {}",
                human_bytes::human_bytes(used as f64),
                human_bytes::human_bytes(limit as f64)
            );
            session.restart_and_clear()?;
        }
        Ok(check)
    }

    /// Run the watchdog on its own thread until `running` is cleared.
    ///
    /// A restart that fails to start a new session is reported to the supervisor, after which
    /// the watchdog gives up.
    pub fn spawn(
        mut self,
        session: Arc<LiveSession>,
        tx: Sender<SupervisorEvent>,
        running: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        std::thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                if let Err(e) = self.poll(&session) {
                    // The signal listener reports the shutdown itself
                    if !session.is_shutting_down() {
                        let _ = tx.send(SupervisorEvent::RestartFailed(e.to_string()));
                    }
                    break;
                }
                std::thread::sleep(self.interval);
            }
            spdlog::debug!("Memory watchdog finished");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigDocument;
    use crate::framework::testing::{Call, FakeFramework};
    use crate::session::tests::session;
    use std::collections::VecDeque;
    use std::sync::mpsc;

    struct FakeProbe {
        total: u64,
        samples: VecDeque<u64>,
    }

    impl MemoryProbe for FakeProbe {
        fn total_memory(&mut self) -> u64 {
            self.total
        }

        fn resident_memory(&mut self) -> u64 {
            // repeat the last sample forever
            if self.samples.len() > 1 {
                self.samples.pop_front().unwrap()
            } else {
                self.samples[0]
            }
        }
    }

    fn config(doc: &str) -> (tempfile::TempDir, Config) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("reduce_PG3_live_proc.py"), "pass").unwrap();
        let mut doc: ConfigDocument = serde_json::from_str(doc).unwrap();
        doc.script_dir = Some(dir.path().to_path_buf());
        let config = Config::resolve(doc, None, &FakeFramework::default()).unwrap();
        (dir, config)
    }

    fn probe(samples: &[u64]) -> FakeProbe {
        FakeProbe {
            total: 1_000_000,
            samples: samples.iter().copied().collect(),
        }
    }

    #[test]
    fn test_limit_from_percentage() {
        let (_dir, config) = config(r#"{"system_mem_limit_perc": 50}"#);
        let watchdog = MemoryWatchdog::new(probe(&[0]), &config);
        assert_eq!(watchdog.limit(), 500_000);
    }

    #[test]
    fn test_breach_restarts() {
        let (_dir, config) = config("{}");
        let framework = Arc::new(FakeFramework::default());
        let session = session(&framework);
        session.start().unwrap();

        let mut watchdog = MemoryWatchdog::new(probe(&[600_000, 800_000]), &config);
        assert_eq!(
            watchdog.poll(&session).unwrap(),
            MemoryCheck::Within {
                used: 600_000,
                limit: 700_000
            }
        );
        assert_eq!(framework.calls().len(), 1);

        assert_eq!(
            watchdog.poll(&session).unwrap(),
            MemoryCheck::Exceeded {
                used: 800_000,
                limit: 700_000
            }
        );
        let calls = framework.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[1], Call::CancelAll);
        assert_eq!(calls[2], Call::ClearWorkspaces);
        assert!(matches!(calls[3], Call::Start(_)));
    }

    #[test]
    fn test_failed_restart_is_reported() {
        let (_dir, config) = config(r#"{"mem_check_interval_sec": 0.01}"#);
        let framework = Arc::new(FakeFramework::default());
        let session = Arc::new(session(&framework));
        session.start().unwrap();
        framework.fail_start.store(true, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel();
        let running = Arc::new(AtomicBool::new(true));
        let handle = MemoryWatchdog::new(probe(&[900_000]), &config).spawn(
            session.clone(),
            tx,
            running.clone(),
        );
        match rx.recv_timeout(Duration::from_secs(5)) {
            Ok(SupervisorEvent::RestartFailed(_)) => (),
            other => panic!("expected a restart failure, got {other:?}"),
        }
        handle.join().unwrap();
    }

    #[test]
    fn test_breach_during_shutdown_is_not_reported() {
        let (_dir, config) = config(r#"{"mem_check_interval_sec": 0.01}"#);
        let framework = Arc::new(FakeFramework::default());
        let session = Arc::new(session(&framework));
        session.start().unwrap();
        session.begin_shutdown();

        let (tx, rx) = mpsc::channel();
        let running = Arc::new(AtomicBool::new(true));
        let handle = MemoryWatchdog::new(probe(&[900_000]), &config).spawn(
            session.clone(),
            tx,
            running.clone(),
        );
        std::thread::sleep(Duration::from_millis(100));
        running.store(false, Ordering::SeqCst);
        handle.join().unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(framework.count(|c| matches!(c, Call::Start(_))), 1);
    }

    #[test]
    fn test_stops_when_told() {
        let (_dir, config) = config(r#"{"mem_check_interval_sec": 0.01}"#);
        let framework = Arc::new(FakeFramework::default());
        let session = Arc::new(session(&framework));
        let (tx, _rx) = mpsc::channel();
        let running = Arc::new(AtomicBool::new(true));
        let handle = MemoryWatchdog::new(probe(&[1]), &config).spawn(session, tx, running.clone());
        running.store(false, Ordering::SeqCst);
        handle.join().unwrap();
        assert!(framework.calls().is_empty());
    }
}
