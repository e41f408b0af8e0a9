use fxhash::FxHashMap;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;

use super::config::Config;
use super::error::WatchError;
use super::supervisor_event::SupervisorEvent;

/// What a change to a single path means for the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchAction {
    /// Not a file we care about
    Ignore,
    /// The config file changed
    ConfigChanged,
    /// A script was touched but its contents are the same
    Unchanged(PathBuf),
    /// A script's contents changed; the session needs a restart
    Restart(PathBuf),
}

/// Fast content fingerprint of a file, None if it can't be read.
///
/// Only used to tell whether the bytes changed, not to authenticate anything.
pub fn fingerprint(path: &Path) -> Option<u64> {
    std::fs::read(path).ok().map(|bytes| fxhash::hash64(&bytes))
}

/// Only creation, modification and removal are interesting
pub fn is_relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// Tracks the watched files and decides what each change means.
///
/// Scripts are keyed by path with the fingerprint of their last known contents, so that editors
/// which rewrite a file without changing it don't cause a restart.
#[derive(Debug)]
pub struct ScriptWatcher {
    config_file: Option<PathBuf>,
    script_dir: PathBuf,
    scripts: FxHashMap<PathBuf, Option<u64>>,
}

impl ScriptWatcher {
    pub fn new(config: &Config) -> Self {
        let scripts = config
            .watched_scripts()
            .into_iter()
            .map(|p| (p.to_path_buf(), fingerprint(p)))
            .collect();
        Self {
            config_file: config.filename.clone(),
            script_dir: config.script_dir.clone(),
            scripts,
        }
    }

    /// Paths handed to the filesystem watcher
    pub fn files_to_watch(&self) -> Vec<&Path> {
        let mut paths = vec![self.script_dir.as_path()];
        if let Some(config_file) = &self.config_file {
            paths.push(config_file.as_path());
        }
        paths
    }

    /// Start watching. Every filesystem event is forwarded into the supervisor's channel.
    ///
    /// The returned watcher must be kept alive for as long as events are wanted.
    pub fn watch(&self, tx: Sender<SupervisorEvent>) -> Result<RecommendedWatcher, WatchError> {
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            // The receiver only goes away when the supervisor is done
            let _ = tx.send(SupervisorEvent::FileSystem(res));
        })?;
        watcher.watch(&self.script_dir, RecursiveMode::Recursive)?;
        if let Some(config_file) = &self.config_file {
            watcher.watch(config_file, RecursiveMode::NonRecursive)?;
        }
        let watched: Vec<String> = self
            .files_to_watch()
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        spdlog::info!("WATCHING: {watched:?}");
        Ok(watcher)
    }

    /// Decide what a change to `path` means, updating the recorded fingerprint on a real change
    pub fn classify(&mut self, path: &Path) -> WatchAction {
        if self.config_file.as_deref() == Some(path) {
            return WatchAction::ConfigChanged;
        }

        match self.scripts.get_mut(path) {
            Some(recorded) => {
                let current = fingerprint(path);
                if current == *recorded {
                    WatchAction::Unchanged(path.to_path_buf())
                } else {
                    *recorded = current;
                    WatchAction::Restart(path.to_path_buf())
                }
            }
            None => WatchAction::Ignore,
        }
    }
}
