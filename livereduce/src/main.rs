use clap::{value_parser, Arg, Command};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use liblivereduce::config::{find_config_file, ConfigDocument};
use liblivereduce::constants::{LOCAL_LOG_FILE, SERVICE_LOG_FILE, SERVICE_USER};
use liblivereduce::framework::LiveFramework;
use liblivereduce::mantid_bridge::{BridgeOptions, MantidBridge};
use liblivereduce::supervisor::{Exit, Supervisor};

fn make_template_config(path: &Path) -> Result<(), std::io::Error> {
    let json_str = serde_json::to_string_pretty(&ConfigDocument::template())?;
    let mut file = File::create(path)?;
    file.write_all(json_str.as_bytes())?;
    Ok(())
}

/// The service account logs to the shared log directory, everyone else to the working directory
fn default_log_file() -> PathBuf {
    match std::env::var("USER") {
        Ok(user) if user == SERVICE_USER => PathBuf::from(SERVICE_LOG_FILE),
        _ => PathBuf::from(LOCAL_LOG_FILE),
    }
}

/// Log to the file and to stdout, and pick up anything dependencies send through `log`
fn setup_logging(log_path: &Path) -> Result<(), spdlog::Error> {
    let formatter = || {
        spdlog::formatter::PatternFormatter::new(spdlog::formatter::pattern!(
            "[{date_short} {time_short}] - [thread: {tid}] - [{^{level}}] - {payload}{eol}"
        ))
    };
    let file_sink = Arc::new(
        spdlog::sink::FileSink::builder()
            .path(log_path)
            .formatter(Box::new(formatter()))
            .truncate(false)
            .build()?,
    );
    let stdout_sink = Arc::new(
        spdlog::sink::StdStreamSink::builder()
            .std_stream(spdlog::sink::StdStream::Stdout)
            .formatter(Box::new(formatter()))
            .build()?,
    );
    let logger = Arc::new(
        spdlog::Logger::builder()
            .flush_level_filter(spdlog::LevelFilter::All)
            .sink(file_sink)
            .sink(stdout_sink)
            .build()?,
    );
    spdlog::set_default_logger(logger);
    if let Err(e) = spdlog::init_log_crate_proxy() {
        spdlog::warn!("Could not route log records: {e}");
    }
    log::set_max_level(log::LevelFilter::Info);
    Ok(())
}

/// Configure and supervise one session. Returns the process exit code, or None to go again.
fn run_once(cli_config: Option<&Path>) -> Option<i32> {
    let config_path = find_config_file(cli_config);
    let (doc, filename) = match ConfigDocument::load(config_path.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            spdlog::error!("{e}");
            return Exit::Fatal.code();
        }
    };

    let options = BridgeOptions::from_document(&doc);
    spdlog::info!("using python interpreter {}", options.python);
    if let Some(loc) = &options.mantid_loc {
        spdlog::info!("using mantid from {}", loc.display());
    }
    let framework: Arc<dyn LiveFramework> = Arc::new(MantidBridge::new(options));

    let supervisor = match Supervisor::configure(doc, filename, framework) {
        Ok(s) => s,
        Err(e) => {
            spdlog::error!("{e}");
            return Exit::Fatal.code();
        }
    };
    match supervisor.run() {
        Ok(exit) => exit.code(),
        Err(e) => {
            spdlog::error!("{e}");
            Exit::Fatal.code()
        }
    }
}

fn main() {
    // Create a cli
    let matches = Command::new("livereduce")
        .about("Run Mantid live data reduction for an instrument")
        .version(env!("CARGO_PKG_VERSION"))
        .args_conflicts_with_subcommands(true)
        .subcommand(
            Command::new("new")
                .about("Make a template configuration file")
                .arg(
                    Arg::new("path")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Path to the file"),
                ),
        )
        .arg(
            Arg::new("config")
                .value_parser(value_parser!(PathBuf))
                .help("Path to the configuration file [default: /etc/livereduce.conf]"),
        )
        .arg(
            Arg::new("log-file")
                .long("log-file")
                .value_parser(value_parser!(PathBuf))
                .help("Path to the log file"),
        )
        .get_matches();

    if let Some(("new", sub)) = matches.subcommand() {
        let Some(path) = sub.get_one::<PathBuf>("path") else {
            return;
        };
        spdlog::info!("Making a template config at {}...", path.display());
        match make_template_config(path) {
            Ok(()) => spdlog::info!("Done."),
            Err(e) => {
                spdlog::error!("Could not write template config: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    // Initialize feedback
    let log_path = matches
        .get_one::<PathBuf>("log-file")
        .cloned()
        .unwrap_or_else(default_log_file);
    if let Err(e) = setup_logging(&log_path) {
        eprintln!("Could not create log file {}: {e}", log_path.display());
        std::process::exit(1);
    }
    let user = std::env::var("USER").unwrap_or_else(|_| String::from("unknown"));
    spdlog::info!("logging started by user '{user}'");
    spdlog::info!("livereduce version {}", env!("CARGO_PKG_VERSION"));

    let cli_config = matches.get_one::<PathBuf>("config");
    loop {
        if let Some(code) = run_once(cli_config.map(PathBuf::as_path)) {
            spdlog::info!("Exiting with code {code}");
            spdlog::default_logger().flush();
            std::process::exit(code);
        }
        spdlog::info!("Reloading configuration");
    }
}
