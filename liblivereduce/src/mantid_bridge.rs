use serde::de::DeserializeOwned;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::config::ConfigDocument;
use super::constants::{BRIDGE_POLL_MS, BRIDGE_SETTLE_MS, DEFAULT_PYTHON};
use super::error::FrameworkError;
use super::framework::{InstrumentInfo, LiveFramework, StartLiveArgs};

/// Load the bridge program for windows
#[cfg(target_family = "windows")]
fn load_bridge_script() -> &'static str {
    include_str!("data\\livereduce_bridge.py")
}

/// Load the bridge program for macos and linux
#[cfg(target_family = "unix")]
fn load_bridge_script() -> &'static str {
    include_str!("data/livereduce_bridge.py")
}

/// How to launch the Python interpreter that hosts Mantid
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeOptions {
    pub python: String,
    /// Extra location prepended to PYTHONPATH, for installs outside of the environment
    pub mantid_loc: Option<PathBuf>,
}

impl BridgeOptions {
    pub fn from_document(doc: &ConfigDocument) -> Self {
        Self {
            python: doc
                .python
                .clone()
                .unwrap_or_else(|| String::from(DEFAULT_PYTHON)),
            mantid_loc: doc.mantid_loc.clone(),
        }
    }
}

/// Drives Mantid through a Python child process.
///
/// Queries are one-shot invocations of the bridge. A live session is a long-running bridge
/// process that calls `StartLiveData` and stays alive for as long as `MonitorLiveData` runs, so
/// the child being alive is what "running" means here, and the workspaces go away with it.
#[derive(Debug)]
pub struct MantidBridge {
    options: BridgeOptions,
    child: Mutex<Option<Child>>,
    settle: Duration,
}

impl MantidBridge {
    pub fn new(options: BridgeOptions) -> Self {
        Self {
            options,
            child: Mutex::new(None),
            settle: Duration::from_millis(BRIDGE_SETTLE_MS),
        }
    }

    /// Change how long a new session must survive before start reports success
    pub fn with_settle_time(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn options(&self) -> &BridgeOptions {
        &self.options
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.options.python);
        cmd.arg("-u").arg("-c").arg(load_bridge_script());
        if let Some(loc) = &self.options.mantid_loc {
            let mut python_path = loc.as_os_str().to_owned();
            if let Some(existing) = std::env::var_os("PYTHONPATH") {
                python_path.push(":");
                python_path.push(existing);
            }
            cmd.env("PYTHONPATH", python_path);
        }
        cmd
    }

    /// Run a one-shot bridge command and parse the last line it printed as JSON
    fn query<T: DeserializeOwned>(&self, args: &[&str]) -> Result<T, FrameworkError> {
        let command = args.join(" ");
        spdlog::debug!("Querying framework: {command}");
        let output = self
            .command()
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| FrameworkError::SpawnError(self.options.python.clone(), e))?;
        if !output.status.success() {
            return Err(FrameworkError::QueryFailed {
                command,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| FrameworkError::EmptyResponse(command.clone()))?;
        Ok(serde_json::from_str::<T>(line)?)
    }

    fn lock_child(&self) -> MutexGuard<'_, Option<Child>> {
        match self.child.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Copy the child's output into our log, one line at a time
    fn forward_output<R: Read + Send + 'static>(stream: R, is_stderr: bool) {
        std::thread::spawn(move || {
            for line in BufReader::new(stream).lines() {
                match line {
                    Ok(line) if is_stderr => spdlog::warn!("[Mantid] {line}"),
                    Ok(line) => spdlog::info!("[Mantid] {line}"),
                    Err(_) => break,
                }
            }
        });
    }

    /// Ask the bridge to cancel everything and exit
    fn terminate(child: &mut Child) {
        #[cfg(unix)]
        unsafe {
            libc::kill(child.id() as i32, libc::SIGTERM);
        }
        #[cfg(not(unix))]
        let _ = child.kill();
    }

    /// Kill a child that is still around and reap it
    fn kill_and_reap(mut child: Child) {
        let pid = child.id();
        match child.try_wait() {
            Ok(Some(_)) => (),
            Ok(None) => {
                spdlog::warn!("Killing live data process {pid}");
                if let Err(e) = child.kill() {
                    spdlog::warn!("Error killing live data process {pid}: {e}");
                }
            }
            Err(e) => spdlog::warn!("Error checking live data process {pid} status: {e}"),
        }
        if let Err(e) = child.wait() {
            spdlog::warn!("Error reaping live data process {pid}: {e}");
        }
    }
}

impl LiveFramework for MantidBridge {
    fn instrument(&self, name: Option<&str>) -> Result<InstrumentInfo, FrameworkError> {
        match name {
            Some(n) => self.query(&["instrument", n]),
            None => self.query(&["instrument"]),
        }
    }

    fn allowed_values(
        &self,
        algorithm: &str,
        property: &str,
    ) -> Result<Vec<String>, FrameworkError> {
        self.query(&["allowed-values", algorithm, property])
    }

    fn start_live_data(&self, args: &StartLiveArgs) -> Result<(), FrameworkError> {
        let args_json = serde_json::to_string(args)?;

        let mut guard = self.lock_child();
        if let Some(old) = guard.take() {
            Self::kill_and_reap(old);
        }
        let mut child = self
            .command()
            .arg("start")
            .arg(args_json)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| FrameworkError::SpawnError(self.options.python.clone(), e))?;
        spdlog::info!("Started live data process {}", child.id());
        if let Some(stdout) = child.stdout.take() {
            Self::forward_output(stdout, false);
        }
        if let Some(stderr) = child.stderr.take() {
            Self::forward_output(stderr, true);
        }
        *guard = Some(child);
        drop(guard);

        // The bridge has no readiness handshake, so surviving the settle time counts as started
        let deadline = Instant::now() + self.settle;
        while Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(BRIDGE_POLL_MS).min(self.settle));
            let mut guard = self.lock_child();
            match guard.as_mut() {
                None => return Err(FrameworkError::CancelledDuringStartup),
                Some(child) => {
                    if let Some(status) = child.try_wait()? {
                        guard.take();
                        return Err(FrameworkError::ExitedDuringStartup(status));
                    }
                }
            }
        }
        Ok(())
    }

    fn cancel_all(&self) {
        let mut guard = self.lock_child();
        if let Some(child) = guard.as_mut() {
            if let Ok(None) = child.try_wait() {
                spdlog::info!("Cancelling live data process {}", child.id());
                Self::terminate(child);
            }
        }
    }

    fn is_running(&self, algorithm: &str) -> bool {
        spdlog::trace!("Checking whether {algorithm} is running");
        let mut guard = self.lock_child();
        let status = match guard.as_mut() {
            None => return false,
            Some(child) => child.try_wait(),
        };
        match status {
            Ok(None) => true,
            Ok(Some(status)) => {
                spdlog::info!("Live data process exited with {status}");
                guard.take();
                false
            }
            Err(e) => {
                spdlog::warn!("Error checking live data process status: {e}");
                false
            }
        }
    }

    fn clear_workspaces(&self) {
        // Workspaces live in the bridge process; whatever survived cancellation goes now
        spdlog::info!("Clearing workspaces");
        if let Some(child) = self.lock_child().take() {
            Self::kill_and_reap(child);
        }
    }

    fn worker_pids(&self) -> Vec<u32> {
        self.lock_child().iter().map(|child| child.id()).collect()
    }
}

impl Drop for MantidBridge {
    fn drop(&mut self) {
        if let Some(mut child) = self.lock_child().take() {
            Self::terminate(&mut child);
            let _ = child.wait();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::constants::MONITOR_ALGORITHM;
    use crate::session::tests::test_args;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    /// A stand-in interpreter that ignores its arguments and runs `body`
    fn fake_python(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    fn bridge(python: String) -> MantidBridge {
        MantidBridge::new(BridgeOptions {
            python,
            mantid_loc: None,
        })
        .with_settle_time(Duration::from_millis(200))
    }

    #[test]
    fn test_options_from_document() {
        let options = BridgeOptions::from_document(&ConfigDocument::default());
        assert_eq!(options.python, "python3");
        assert_eq!(options.mantid_loc, None);
    }

    // One test so the fake interpreters are all written before anything is spawned
    #[test]
    fn test_bridge_processes() {
        let dir = tempfile::tempdir().unwrap();
        let instrument = fake_python(
            dir.path(),
            "instrument",
            r#"echo "FrameworkManager-[Notice] Welcome"
echo '{"name": "POWGEN", "short_name": "PG3", "facility": "SNS"}'"#,
        );
        let failing = fake_python(dir.path(), "failing", "echo 'no mantid' >&2\nexit 1");
        let crashing = fake_python(dir.path(), "crashing", "exit 3");
        let long_running = fake_python(dir.path(), "long_running", "exec sleep 30");

        // queries parse the last line
        let info = bridge(instrument).instrument(Some("PG3")).unwrap();
        assert_eq!(info, InstrumentInfo::new("POWGEN", "PG3", "SNS"));

        match bridge(failing).allowed_values("StartLiveData", "AccumulationMethod") {
            Err(FrameworkError::QueryFailed { stderr, .. }) => assert_eq!(stderr, "no mantid"),
            other => panic!("expected a failed query, got {other:?}"),
        }

        let crashing = bridge(crashing);
        assert!(matches!(
            crashing.start_live_data(&test_args()),
            Err(FrameworkError::ExitedDuringStartup(_))
        ));
        assert!(!crashing.is_running(MONITOR_ALGORITHM));

        let live = bridge(long_running);
        live.start_live_data(&test_args()).unwrap();
        assert!(live.is_running(MONITOR_ALGORITHM));
        assert_eq!(live.worker_pids().len(), 1);
        live.cancel_all();
        let deadline = Instant::now() + Duration::from_secs(5);
        while live.is_running(MONITOR_ALGORITHM) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!live.is_running(MONITOR_ALGORITHM));
        assert!(live.worker_pids().is_empty());
        live.clear_workspaces();

        // a session that is still running when the workspaces are cleared gets killed
        live.start_live_data(&test_args()).unwrap();
        assert!(live.is_running(MONITOR_ALGORITHM));
        live.clear_workspaces();
        assert!(live.worker_pids().is_empty());
        assert!(!live.is_running(MONITOR_ALGORITHM));
    }

    const FAKE_KERNEL: &str = r#"
class _Facility:
    def name(self):
        return "SNS"

class _Instrument:
    def name(self):
        return "POWGEN"
    def shortName(self):
        return "PG3"
    def facility(self):
        return _Facility()
    def __str__(self):
        return "PG3"

class _ConfigService:
    def getInstrument(self, name=None):
        return _Instrument()
    def getFacility(self):
        return _Facility()
    def setFacility(self, name):
        pass
    def __setitem__(self, key, value):
        pass

ConfigService = _ConfigService()

class UsageService:
    @staticmethod
    def setApplicationName(name):
        pass
"#;

    const FAKE_API: &str = r#"
class AlgorithmManager:
    @staticmethod
    def newestInstanceOf(name):
        return None
    @staticmethod
    def cancelAll():
        pass
"#;

    const FAKE_SIMPLEAPI: &str = r#"
def StartLiveData(**kwargs):
    print("StartLiveData " + kwargs["Instrument"], flush=True)
"#;

    #[test]
    fn test_bridge_script_against_stand_in_mantid() {
        let has_python = Command::new("python3")
            .arg("--version")
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false);
        if !has_python {
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        let package = dir.path().join("mantid");
        std::fs::create_dir(&package).unwrap();
        std::fs::write(package.join("__init__.py"), "").unwrap();
        std::fs::write(package.join("kernel.py"), FAKE_KERNEL).unwrap();
        std::fs::write(package.join("api.py"), FAKE_API).unwrap();
        std::fs::write(package.join("simpleapi.py"), FAKE_SIMPLEAPI).unwrap();
        let bridge = MantidBridge::new(BridgeOptions {
            python: String::from("python3"),
            mantid_loc: Some(dir.path().to_path_buf()),
        });

        let info = bridge.instrument(Some("PG3")).unwrap();
        assert_eq!(info, InstrumentInfo::new("POWGEN", "PG3", "SNS"));

        // starting sets the default instrument without printing the instrument query's answer
        let output = bridge
            .command()
            .arg("start")
            .arg(serde_json::to_string(&test_args()).unwrap())
            .output()
            .unwrap();
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("StartLiveData POWGEN"), "{stdout}");
        assert!(stdout.contains("MonitorLiveData is no longer running"), "{stdout}");
        assert!(!stdout.lines().any(|l| l.trim_start().starts_with('{')), "{stdout}");
    }
}
