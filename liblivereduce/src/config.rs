use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::constants::*;
use super::error::ConfigError;
use super::framework::{InstrumentInfo, LiveFramework, StartLiveArgs};

/// What to do when the config file itself changes on disk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfigChangePolicy {
    /// Stop everything and exit; the service manager brings us back with the new config
    #[default]
    Shutdown,
    /// Stop the session, re-read the config and start again in-process
    Reload,
}

impl FromStr for ConfigChangePolicy {
    type Err = ConfigError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shutdown" => Ok(Self::Shutdown),
            "reload" => Ok(Self::Reload),
            _ => Err(ConfigError::BadConfigChangePolicy(s.to_string())),
        }
    }
}

impl std::fmt::Display for ConfigChangePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shutdown => write!(f, "shutdown"),
            Self::Reload => write!(f, "reload"),
        }
    }
}

/// The configuration file as written by the user. Every key is optional.
///
/// Unknown keys are ignored so that one file can be shared with older versions of the daemon.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instrument: Option<String>,
    #[serde(rename = "CONDA_ENV", skip_serializing_if = "Option::is_none")]
    pub conda_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub python: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mantid_loc: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_every: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preserve_events: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accum_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub periods: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spectra: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_process: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_mem_limit_perc: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_check_interval_sec: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_config_change: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_timeout_sec: Option<f64>,
}

impl ConfigDocument {
    /// Parse a JSON configuration file
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let json_str = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str::<Self>(&json_str)?)
    }

    /// Load the document at `path` if it is usable, otherwise fall back to an empty document.
    ///
    /// Returns the document and the absolute path it came from (None when defaults are used).
    pub fn load(path: Option<&Path>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        match path {
            Some(p) if is_usable_config(p) => {
                spdlog::info!("Loading configuration from '{}'", p.display());
                let doc = Self::read(p)?;
                spdlog::debug!("{}", serde_json::to_string(&doc)?);
                spdlog::info!("Finished parsing configuration");
                Ok((doc, Some(std::path::absolute(p)?)))
            }
            _ => {
                spdlog::info!("Using default configuration");
                Ok((Self::default(), None))
            }
        }
    }

    /// A document with every option spelled out at its default value
    pub fn template() -> Self {
        Self {
            instrument: Some(String::new()),
            conda_env: Some(String::from(DEFAULT_CONDA_ENV)),
            python: Some(String::from(DEFAULT_PYTHON)),
            mantid_loc: None,
            script_dir: None,
            update_every: Some(DEFAULT_UPDATE_EVERY_SEC),
            preserve_events: Some(true),
            accum_method: Some(String::from(DEFAULT_ACCUM_METHOD)),
            periods: None,
            spectra: None,
            post_process: Some(true),
            system_mem_limit_perc: Some(DEFAULT_MEM_LIMIT_PERC),
            mem_check_interval_sec: Some(DEFAULT_MEM_CHECK_INTERVAL_SEC),
            on_config_change: Some(ConfigChangePolicy::default().to_string()),
            stop_timeout_sec: Some(DEFAULT_STOP_TIMEOUT_SEC),
        }
    }
}

/// A config file is only used if it exists and has something in it
pub fn is_usable_config(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.len() > 0,
        Err(_) => false,
    }
}

/// Pick the config file: the command line argument first, then the system-wide default
pub fn find_config_file(cli_path: Option<&Path>) -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(p) = cli_path {
        candidates.push(p.to_path_buf());
    }
    candidates.push(PathBuf::from(DEFAULT_CONFIG_PATH));
    candidates.into_iter().find(|p| is_usable_config(p))
}

/// A script the framework runs, and whether it was found
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptFile {
    pub path: PathBuf,
    pub exists: bool,
}

impl ScriptFile {
    /// Check for the script on disk. The returned flag is true when it exists but is empty.
    fn probe(path: PathBuf) -> Result<(Self, bool), std::io::Error> {
        match std::fs::metadata(&path) {
            Ok(meta) => {
                let is_empty = meta.len() == 0;
                Ok((Self { path, exists: true }, is_empty))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let script = Self {
                    path,
                    exists: false,
                };
                Ok((script, false))
            }
            Err(e) => Err(e),
        }
    }
}

/// The resolved, validated configuration. Never changes once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub filename: Option<PathBuf>,
    pub instrument: InstrumentInfo,
    pub conda_env: String,
    pub script_dir: PathBuf,
    pub proc_script: ScriptFile,
    pub post_proc_script: ScriptFile,
    pub post_process: bool,
    pub update_every: u32,
    pub preserve_events: bool,
    pub accum_method: String,
    pub periods: Option<Vec<u32>>,
    pub spectra: Option<Vec<u32>>,
    pub system_mem_limit_perc: f64,
    pub mem_check_interval_sec: f64,
    pub stop_timeout_sec: f64,
    pub on_config_change: ConfigChangePolicy,
}

impl Config {
    /// Fill in defaults, look up the instrument, locate the scripts and validate everything
    pub fn resolve(
        doc: ConfigDocument,
        filename: Option<PathBuf>,
        framework: &dyn LiveFramework,
    ) -> Result<Self, ConfigError> {
        let conda_env = doc
            .conda_env
            .unwrap_or_else(|| String::from(DEFAULT_CONDA_ENV));
        spdlog::info!("CONDA_ENV = {conda_env}");

        let instrument = Self::get_instrument(doc.instrument.as_deref(), framework)?;
        spdlog::info!("instrument=\"{}\"", instrument);

        let system_mem_limit_perc = doc.system_mem_limit_perc.unwrap_or(DEFAULT_MEM_LIMIT_PERC);
        if !(0.0..=100.0).contains(&system_mem_limit_perc) {
            return Err(ConfigError::BadMemoryLimit(system_mem_limit_perc));
        }
        let mem_check_interval_sec = positive_seconds(
            "mem_check_interval_sec",
            doc.mem_check_interval_sec
                .unwrap_or(DEFAULT_MEM_CHECK_INTERVAL_SEC),
        )?;
        let stop_timeout_sec = positive_seconds(
            "stop_timeout_sec",
            doc.stop_timeout_sec.unwrap_or(DEFAULT_STOP_TIMEOUT_SEC),
        )?;
        let on_config_change = match doc.on_config_change.as_deref() {
            Some(policy) => ConfigChangePolicy::from_str(policy)?,
            None => ConfigChangePolicy::default(),
        };

        let script_dir = match doc.script_dir {
            Some(dir) => std::path::absolute(dir)?,
            None => default_script_dir(&instrument),
        };

        let post_process = doc.post_process.unwrap_or(true);
        let (proc_script, post_proc_script) =
            Self::determine_script_names(&script_dir, &instrument, post_process)?;

        let accum_method = doc
            .accum_method
            .unwrap_or_else(|| String::from(DEFAULT_ACCUM_METHOD));
        Self::validate_accum_method(&accum_method, framework)?;

        Ok(Self {
            filename,
            instrument,
            conda_env,
            script_dir,
            proc_script,
            post_proc_script,
            post_process,
            update_every: doc.update_every.unwrap_or(DEFAULT_UPDATE_EVERY_SEC),
            preserve_events: doc.preserve_events.unwrap_or(true),
            accum_method,
            periods: doc.periods,
            spectra: doc.spectra,
            system_mem_limit_perc,
            mem_check_interval_sec,
            stop_timeout_sec,
            on_config_change,
        })
    }

    fn get_instrument(
        name: Option<&str>,
        framework: &dyn LiveFramework,
    ) -> Result<InstrumentInfo, ConfigError> {
        match name.map(str::trim).filter(|n| !n.is_empty()) {
            None => {
                spdlog::info!("Using default instrument");
                let instrument = framework
                    .instrument(None)
                    .map_err(ConfigError::InstrumentLookup)?;
                if instrument.name.trim().is_empty() {
                    return Err(ConfigError::NoInstrument);
                }
                Ok(instrument)
            }
            Some(n) => {
                spdlog::info!("Converting instrument {n} using the framework configuration");
                framework
                    .instrument(Some(n))
                    .map_err(ConfigError::InstrumentLookup)
            }
        }
    }

    fn determine_script_names(
        script_dir: &Path,
        instrument: &InstrumentInfo,
        post_process: bool,
    ) -> Result<(ScriptFile, ScriptFile), ConfigError> {
        let stem = format!("{SCRIPT_PREFIX}{}", instrument.short_name);

        // script for processing each chunk
        let (proc_script, proc_empty) =
            ScriptFile::probe(script_dir.join(format!("{stem}{PROC_SCRIPT_SUFFIX}")))?;
        if !proc_script.exists {
            return Err(ConfigError::MissingProcScript(proc_script.path));
        }
        if proc_empty {
            return Err(ConfigError::EmptyProcScript(proc_script.path));
        }

        // script for processing the accumulation
        let (post_proc_script, post_empty) =
            ScriptFile::probe(script_dir.join(format!("{stem}{POST_PROC_SCRIPT_SUFFIX}")))?;
        if post_process && post_empty {
            return Err(ConfigError::EmptyPostProcScript(post_proc_script.path));
        }
        if !post_process {
            spdlog::info!("Post-processing disabled in the configuration");
        } else if !post_proc_script.exists {
            spdlog::info!(
                "PostProcessingScriptFilename '{}' does not exist - not running post-processing",
                post_proc_script.path.display()
            );
        }

        Ok((proc_script, post_proc_script))
    }

    fn validate_accum_method(
        accum_method: &str,
        framework: &dyn LiveFramework,
    ) -> Result<(), ConfigError> {
        let allowed = framework
            .allowed_values(START_ALGORITHM, ACCUM_METHOD_PROPERTY)
            .map_err(ConfigError::AllowedValuesLookup)?;
        if allowed.iter().any(|m| m == accum_method) {
            Ok(())
        } else {
            Err(ConfigError::DisallowedAccumMethod {
                method: accum_method.to_string(),
                allowed,
            })
        }
    }

    /// Whether the post-processing script is handed to the framework
    pub fn uses_post_proc_script(&self) -> bool {
        self.post_process && self.post_proc_script.exists
    }

    /// The scripts whose contents matter to the running session
    pub fn watched_scripts(&self) -> Vec<&Path> {
        let mut scripts = vec![self.proc_script.path.as_path()];
        if self.post_process {
            scripts.push(self.post_proc_script.path.as_path());
        }
        scripts
    }

    /// The memory watchdog is off when the limit is zero
    pub fn mem_watchdog_enabled(&self) -> bool {
        self.system_mem_limit_perc > 0.0
    }

    /// Memory limit in bytes for a system with `total_bytes` of memory
    pub fn mem_limit_bytes(&self, total_bytes: u64) -> u64 {
        (total_bytes as f64 * self.system_mem_limit_perc / 100.0) as u64
    }

    pub fn to_start_live_args(&self) -> StartLiveArgs {
        spdlog::info!(
            "Using ProcessingScriptFilename '{}'",
            self.proc_script.path.display()
        );
        let (accumulation_workspace, post_processing_script_filename) =
            if self.uses_post_proc_script() {
                spdlog::info!(
                    "Using PostProcessingScriptFilename '{}'",
                    self.post_proc_script.path.display()
                );
                (
                    Some(String::from(ACCUMULATION_WORKSPACE)),
                    Some(self.post_proc_script.path.clone()),
                )
            } else {
                (None, None)
            };

        StartLiveArgs {
            instrument: self.instrument.name.clone(),
            update_every: self.update_every,
            preserve_events: self.preserve_events,
            accumulation_method: self.accum_method.clone(),
            output_workspace: String::from(OUTPUT_WORKSPACE),
            // these must be in agreement with each other
            from_now: false,
            from_start_of_run: true,
            processing_script_filename: self.proc_script.path.clone(),
            accumulation_workspace,
            post_processing_script_filename,
            period_list: self.periods.clone(),
            spectra_list: self.spectra.clone(),
        }
    }

    /// The effective configuration as pretty JSON with sorted keys
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let mut values = serde_json::json!({
            "instrument": self.instrument.short_name,
            "CONDA_ENV": self.conda_env,
            "script_dir": self.script_dir,
            "update_every": self.update_every,
            "preserve_events": self.preserve_events,
            "accum_method": self.accum_method,
            "post_process": self.uses_post_proc_script(),
            "system_mem_limit_perc": self.system_mem_limit_perc,
            "mem_check_interval_sec": self.mem_check_interval_sec,
            "stop_timeout_sec": self.stop_timeout_sec,
            "on_config_change": self.on_config_change.to_string(),
        });
        if let Some(periods) = &self.periods {
            values["periods"] = serde_json::to_value(periods)?;
        }
        if let Some(spectra) = &self.spectra {
            values["spectra"] = serde_json::to_value(spectra)?;
        }
        serde_json::to_string_pretty(&values)
    }
}

/// Scripts live in the instrument's shared area unless configured otherwise
pub fn default_script_dir(instrument: &InstrumentInfo) -> PathBuf {
    PathBuf::from(format!(
        "/{}/{}/shared/livereduce",
        instrument.facility, instrument.short_name
    ))
}

fn positive_seconds(name: &'static str, value: f64) -> Result<f64, ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(ConfigError::BadInterval(name, value))
    }
}
