//! # livereduce
//!
//! livereduce is the daemon that keeps Mantid live data reduction running for an
//! instrument. It starts `StartLiveData` with the instrument's processing scripts, watches
//! those scripts for changes, restarts the reduction when they change, and restarts it
//! when memory use gets out of hand.
//!
//! ## Installation
//!
//! The daemon is built from source. If you have not used Rust before, see the
//! [Rust docs](https://www.rust-lang.org/tools/install) for instructions on installing the
//! tool chain.
//!
//! ### Mantid
//!
//! The daemon talks to Mantid through a small Python program that ships inside the binary.
//! It needs a Python interpreter that can `import mantid`. By default `python3` from the
//! environment the daemon runs in is used; set `python` in the configuration to point at the
//! interpreter of a specific environment (for example the `mantid-dev` conda environment),
//! and `mantid_loc` if Mantid is installed somewhere that is not on that interpreter's path.
//!
//! ### Building & Install
//!
//! To build and install the daemon use `cargo install --path ./livereduce` from the top level
//! livereduce repository. A systemd unit is provided in `livereduce/livereduce.service`.
//!
//! ## Configuration
//!
//! The configuration is a JSON file. It is read from the path given as the first command
//! line argument, or from `/etc/livereduce.conf`. A missing or empty file means all defaults
//! are used. A template can be written with `livereduce new <PATH>`.
//!
//! ```json
//! {
//!   "instrument": "PG3",
//!   "CONDA_ENV": "mantid-dev",
//!   "script_dir": "/SNS/PG3/shared/livereduce",
//!   "update_every": 30,
//!   "preserve_events": true,
//!   "accum_method": "Add",
//!   "periods": null,
//!   "spectra": null,
//!   "post_process": true,
//!   "system_mem_limit_perc": 70.0,
//!   "mem_check_interval_sec": 1.0,
//!   "stop_timeout_sec": 30.0,
//!   "on_config_change": "shutdown",
//!   "python": "python3",
//!   "mantid_loc": null
//! }
//! ```
//!
//! - `instrument`: instrument name or short name. Missing or blank uses Mantid's default
//! instrument.
//! - `script_dir`: where the scripts live. Defaults to
//! `/<facility>/<short name>/shared/livereduce`.
//! - `accum_method`: must be one of the accumulation methods `StartLiveData` allows.
//! - `system_mem_limit_perc`: percentage of system memory at which the session is restarted.
//! 0 turns the memory watchdog off.
//! - `on_config_change`: `shutdown` exits when the configuration file changes, `reload` reads
//! it again and starts a fresh session.
//!
//! The processing script `reduce_<SHORT>_live_proc.py` must exist and must not be empty. The
//! post-processing script `reduce_<SHORT>_live_post_proc.py` is optional. When it is present
//! the accumulated data is kept in the `accumulation` workspace and the post-processed result
//! in `result`.
//!
//! ## Logging
//!
//! Logs go to the terminal and to a log file: `/var/log/SNS_applications/livereduce.log` when
//! running as `snsdata`, `./livereduce.log` otherwise, or the path given with `--log-file`.
//!
//! ## Signals and Exit Codes
//!
//! SIGINT, SIGQUIT and SIGTERM stop the live data session before the daemon exits. SIGHUP is
//! ignored.
//!
//! | Exit code | Reason |
//! |-----------|--------|
//! | 0 | normal exit, SIGTERM, or the configuration file changed |
//! | 130 | SIGINT |
//! | 1 | SIGQUIT or a configuration error |
//! | 255 | the live data session failed to start or restart |
pub mod config;
pub mod constants;
pub mod error;
pub mod framework;
pub mod mantid_bridge;
pub mod memory;
pub mod session;
pub mod signals;
pub mod supervisor;
pub mod supervisor_event;
pub mod watcher;
