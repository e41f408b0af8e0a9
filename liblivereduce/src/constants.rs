// Names used by the framework. These must match the Mantid algorithm and property names.
pub const START_ALGORITHM: &str = "StartLiveData";
pub const MONITOR_ALGORITHM: &str = "MonitorLiveData";
pub const ACCUM_METHOD_PROPERTY: &str = "AccumulationMethod";
pub const OUTPUT_WORKSPACE: &str = "result";
pub const ACCUMULATION_WORKSPACE: &str = "accumulation";

/// Config file used when none is given on the command line
pub const DEFAULT_CONFIG_PATH: &str = "/etc/livereduce.conf";

// Configuration defaults
pub const DEFAULT_CONDA_ENV: &str = "mantid-dev";
pub const DEFAULT_UPDATE_EVERY_SEC: u32 = 30;
pub const DEFAULT_ACCUM_METHOD: &str = "Add";
pub const DEFAULT_MEM_LIMIT_PERC: f64 = 70.0;
pub const DEFAULT_MEM_CHECK_INTERVAL_SEC: f64 = 1.0;
pub const DEFAULT_STOP_TIMEOUT_SEC: f64 = 30.0;
pub const DEFAULT_PYTHON: &str = "python3";

/// Time given to a cancelled session to settle before the workspaces are cleared
pub const RESTART_GRACE_MS: u64 = 1_000;
/// How often a cancelled session is polled while waiting for it to stop
pub const STOP_POLL_MS: u64 = 100;
/// How long a freshly spawned bridge has to survive before start is considered successful
pub const BRIDGE_SETTLE_MS: u64 = 2_000;
pub const BRIDGE_POLL_MS: u64 = 100;

pub const SCRIPT_PREFIX: &str = "reduce_";
pub const PROC_SCRIPT_SUFFIX: &str = "_live_proc.py";
pub const POST_PROC_SCRIPT_SUFFIX: &str = "_live_post_proc.py";

// Log file locations
pub const SERVICE_USER: &str = "snsdata";
pub const SERVICE_LOG_FILE: &str = "/var/log/SNS_applications/livereduce.log";
pub const LOCAL_LOG_FILE: &str = "livereduce.log";
