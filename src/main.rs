use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;

use facegroup::config::{Config, LiveConfig};
use facegroup::db::{Database, EmbeddingStore};
use facegroup::faces::OnnxDetectorFactory;
use facegroup::logging;
use facegroup::tasks::{ChannelSink, Coordinator, StatusEvent};

#[derive(Default)]
struct Args {
    config_path: Option<PathBuf>,
    threshold: Option<u32>,
    recluster: bool,
    verbose: bool,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("facegroup {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    parsed.config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--threshold" | "-t" => match args.get(i + 1).and_then(|v| v.parse::<u32>().ok()) {
                Some(value) if value <= 100 => {
                    parsed.threshold = Some(value);
                    i += 1;
                }
                _ => {
                    eprintln!("Error: --threshold requires a number from 0 to 100");
                    std::process::exit(1);
                }
            },
            "--recluster" | "-r" => parsed.recluster = true,
            "--verbose" | "-v" => parsed.verbose = true,
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    parsed
}

fn print_help() {
    println!(
        r#"facegroup - find and group faces in a photo library

USAGE:
    facegroup [OPTIONS]

Scans the configured folders for new photos, then re-clusters faces into
persons when the library changed.

OPTIONS:
    --config, -c PATH     Path to config file
    --threshold, -t N     Save similarity threshold N (0-100) and re-cluster
    --recluster, -r       Skip the scan and re-cluster at the saved threshold
    --verbose, -v         Log to stderr instead of the journal/log file
    --version, -V         Show version
    --help, -h            Show this help message

ENVIRONMENT:
    FACEGROUP_CONFIG      Path to config file (overrides default location)
    FACEGROUP_LOG         Log filter (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/facegroup/config.toml"#
    );
}

fn main() -> Result<()> {
    let args = parse_args();

    if args.verbose {
        logging::init_stderr()?;
    } else {
        let _ = logging::init(None);
    }

    let config_path = args.config_path.clone().unwrap_or_else(Config::config_path);
    let config = Config::load(Some(config_path.as_path()))?;

    let db = Arc::new(
        Database::open(&config.metadata_path())
            .with_context(|| format!("Failed to open {}", config.metadata_path().display()))?,
    );
    let store = Arc::new(
        EmbeddingStore::open(&config.embeddings_path())
            .with_context(|| format!("Failed to open {}", config.embeddings_path().display()))?,
    );
    let detectors = Arc::new(OnnxDetectorFactory::from_config(&config));
    let live = Arc::new(LiveConfig::new(config, Some(config_path)));
    let (sink, events) = ChannelSink::new();

    let coordinator = Coordinator::new(db, store, live, Arc::new(sink), detectors);

    let started = match (args.threshold, args.recluster) {
        (Some(threshold), _) => coordinator.recalibrate(threshold),
        (None, true) => coordinator.start_cluster(),
        (None, false) => coordinator.start_scan(),
    };
    if !started {
        anyhow::bail!("Another run is already in progress");
    }

    let mut clustered = false;
    loop {
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(StatusEvent::Status(message)) => println!("{}", message),
            Ok(StatusEvent::Progress { current, total }) => {
                tracing::trace!(current, total, "Progress");
            }
            Ok(StatusEvent::ScanComplete) => {}
            Ok(StatusEvent::ClusterComplete) => clustered = true,
            Err(RecvTimeoutError::Timeout) => {
                if !coordinator.tasks().has_running_tasks() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    // Anything sent between the last event and the idle check.
    for event in events.try_iter() {
        match event {
            StatusEvent::Status(message) => println!("{}", message),
            StatusEvent::ClusterComplete => clustered = true,
            _ => {}
        }
    }

    if !clustered {
        std::process::exit(1);
    }
    Ok(())
}
