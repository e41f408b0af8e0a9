use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::error::FrameworkError;

/// Instrument information as reported by the framework's configuration service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentInfo {
    pub name: String,
    pub short_name: String,
    pub facility: String,
}

impl InstrumentInfo {
    pub fn new(name: &str, short_name: &str, facility: &str) -> Self {
        Self {
            name: name.to_string(),
            short_name: short_name.to_string(),
            facility: facility.to_string(),
        }
    }
}

impl std::fmt::Display for InstrumentInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.short_name)
    }
}

/// The keyword arguments handed to `StartLiveData`.
///
/// Serializes using the framework's property names. Optional properties are left out entirely
/// rather than passed as null, since the framework treats a present property as set.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StartLiveArgs {
    pub instrument: String,
    pub update_every: u32,
    pub preserve_events: bool,
    pub accumulation_method: String,
    pub output_workspace: String,
    pub from_now: bool,
    pub from_start_of_run: bool,
    pub processing_script_filename: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accumulation_workspace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_processing_script_filename: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period_list: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spectra_list: Option<Vec<u32>>,
}

impl StartLiveArgs {
    /// Pretty, key-sorted JSON for the log
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let value = serde_json::to_value(self)?;
        serde_json::to_string_pretty(&value)
    }
}

/// The narrow surface of the data reduction framework that the daemon relies on.
///
/// Everything the daemon does to the framework goes through here, so the real bridge can be
/// swapped for a double in tests. Implementations are shared between the event loop, the memory
/// watchdog and the signal listener, hence `Send + Sync`.
pub trait LiveFramework: Send + Sync {
    /// Look up an instrument by name, or the configured default instrument when `name` is None
    fn instrument(&self, name: Option<&str>) -> Result<InstrumentInfo, FrameworkError>;

    /// The allowed values of a property of an algorithm
    fn allowed_values(&self, algorithm: &str, property: &str)
        -> Result<Vec<String>, FrameworkError>;

    /// Start live data processing. Returns once the session is up and running.
    fn start_live_data(&self, args: &StartLiveArgs) -> Result<(), FrameworkError>;

    /// Request cancellation of every running algorithm
    fn cancel_all(&self);

    /// Whether the newest instance of `algorithm` is still running
    fn is_running(&self, algorithm: &str) -> bool;

    /// Drop every workspace held by the framework
    fn clear_workspaces(&self);

    /// Processes other than this one whose memory belongs to the session
    fn worker_pids(&self) -> Vec<u32> {
        Vec::new()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::constants::MONITOR_ALGORITHM;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        Start(StartLiveArgs),
        CancelAll,
        ClearWorkspaces,
    }

    /// In-memory framework that records what was asked of it
    #[derive(Debug)]
    pub struct FakeFramework {
        pub default_instrument: InstrumentInfo,
        pub allowed: Vec<String>,
        pub calls: Mutex<Vec<Call>>,
        pub running: AtomicBool,
        pub fail_start: AtomicBool,
        pub ignore_cancel: AtomicBool,
        pub running_polls: AtomicUsize,
    }

    impl Default for FakeFramework {
        fn default() -> Self {
            Self {
                default_instrument: InstrumentInfo::new("POWGEN", "PG3", "SNS"),
                allowed: vec![
                    String::from("Add"),
                    String::from("Replace"),
                    String::from("Append"),
                ],
                calls: Mutex::new(vec![]),
                running: AtomicBool::new(false),
                fail_start: AtomicBool::new(false),
                ignore_cancel: AtomicBool::new(false),
                running_polls: AtomicUsize::new(0),
            }
        }
    }

    impl FakeFramework {
        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub fn count(&self, matcher: fn(&Call) -> bool) -> usize {
            self.calls().iter().filter(|c| matcher(c)).count()
        }
    }

    impl LiveFramework for FakeFramework {
        fn instrument(&self, name: Option<&str>) -> Result<InstrumentInfo, FrameworkError> {
            match name {
                None => Ok(self.default_instrument.clone()),
                Some("PG3") | Some("POWGEN") => Ok(InstrumentInfo::new("POWGEN", "PG3", "SNS")),
                Some("NOM") | Some("NOMAD") => Ok(InstrumentInfo::new("NOMAD", "NOM", "SNS")),
                Some(other) => Err(FrameworkError::EmptyResponse(format!("instrument {other}"))),
            }
        }

        fn allowed_values(
            &self,
            _algorithm: &str,
            _property: &str,
        ) -> Result<Vec<String>, FrameworkError> {
            Ok(self.allowed.clone())
        }

        fn start_live_data(&self, args: &StartLiveArgs) -> Result<(), FrameworkError> {
            self.calls.lock().unwrap().push(Call::Start(args.clone()));
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(FrameworkError::CancelledDuringStartup);
            }
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn cancel_all(&self) {
            self.calls.lock().unwrap().push(Call::CancelAll);
            if !self.ignore_cancel.load(Ordering::SeqCst) {
                self.running.store(false, Ordering::SeqCst);
            }
        }

        fn is_running(&self, algorithm: &str) -> bool {
            assert_eq!(algorithm, MONITOR_ALGORITHM);
            self.running_polls.fetch_add(1, Ordering::SeqCst);
            self.running.load(Ordering::SeqCst)
        }

        fn clear_workspaces(&self) {
            self.calls.lock().unwrap().push(Call::ClearWorkspaces);
        }
    }
}
