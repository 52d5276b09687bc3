use std::env;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use volindex_core::control::{self, ControlServer};
use volindex_core::logging::{self, Verbosity};
use volindex_core::signals;
use volindex_core::{NotifySource, Orchestrator, PlainTextExtractor, Settings, TantivyEngine};

#[derive(Debug, Default)]
struct Args {
    settings: Option<PathBuf>,
    socket: Option<PathBuf>,
    interval_secs: Option<u64>,
    watch_removable: bool,
    verbose: bool,
    quiet: bool,
}

impl Args {
    fn parse() -> Result<Self, String> {
        let mut args = env::args_os();
        let _program = args.next();
        let mut config = Args::default();

        while let Some(arg) = args.next() {
            let arg_str = arg.to_string_lossy();
            match arg_str.as_ref() {
                "--help" | "-h" => {
                    print_usage();
                    std::process::exit(0);
                }
                "--settings" => {
                    config.settings = Some(PathBuf::from(next_value(&mut args, "--settings")?));
                }
                "--socket" => {
                    config.socket = Some(PathBuf::from(next_value(&mut args, "--socket")?));
                }
                "--interval" => {
                    let value = next_value(&mut args, "--interval")?;
                    let secs = value
                        .to_string_lossy()
                        .parse::<u64>()
                        .map_err(|_| "--interval expects seconds".to_string())?;
                    if secs == 0 {
                        return Err("--interval must be greater than 0".into());
                    }
                    config.interval_secs = Some(secs);
                }
                "--watch-removable" => config.watch_removable = true,
                "--verbose" | "-v" => config.verbose = true,
                "--quiet" | "-q" => config.quiet = true,
                unknown => return Err(format!("unknown argument: {unknown}")),
            }
        }

        Ok(config)
    }
}

fn next_value(args: &mut impl Iterator<Item = OsString>, flag: &str) -> Result<OsString, String> {
    args.next().ok_or_else(|| format!("missing value for {flag}"))
}

fn print_usage() {
    eprintln!("volindexd: keeps a full-text index per mounted volume up to date");
    eprintln!("\nUsage:");
    eprintln!("  volindexd [options]\n");
    eprintln!("Options:");
    eprintln!("  --settings <path>   Settings file (default $XDG_CONFIG_HOME/volindex/settings.json)");
    eprintln!("  --socket <path>     Control socket (default $XDG_RUNTIME_DIR/volindex.sock)");
    eprintln!("  --interval <secs>   Seconds between update cycles (default 30)");
    eprintln!("  --watch-removable   Also index removable volumes");
    eprintln!("  -v, --verbose       Debug logging");
    eprintln!("  -q, --quiet         Errors only");
    eprintln!("  -h, --help          Show this message");
}

fn main() -> Result<()> {
    let args = Args::parse().unwrap_or_else(|err| {
        eprintln!("error: {err}");
        eprintln!("Use --help to see available options.");
        std::process::exit(2);
    });
    logging::init(Verbosity::from_flags(args.verbose, args.quiet));

    let settings_path = args.settings.unwrap_or_else(Settings::default_path);
    let mut settings = Settings::load(&settings_path).unwrap_or_else(|err| {
        warn!(path = %settings_path.display(), error = %err, "unreadable settings, using defaults");
        Settings::default()
    });
    if let Some(secs) = args.interval_secs {
        settings.update_interval_secs = secs;
    }
    if args.watch_removable {
        settings.watch_removable_volumes = true;
    }

    let (tx, rx) = crossbeam_channel::unbounded();

    let socket_path = args.socket.unwrap_or_else(control::socket_path);
    let _server = ControlServer::bind(&socket_path, tx.clone())
        .with_context(|| format!("failed to listen on {}", socket_path.display()))?;
    let _signals =
        signals::forward_termination(tx.clone()).context("failed to install signal handlers")?;

    let source = Arc::new(NotifySource::new(settings.mount_poll_interval()));
    let engine = Arc::new(TantivyEngine::new(settings.writer));
    let extractor = Arc::new(PlainTextExtractor::new(&settings.extractor));
    let mut orchestrator =
        Orchestrator::new(source, engine, extractor, settings).with_settings_path(settings_path);

    let report = orchestrator
        .start(tx)
        .context("failed to start watching volumes")?;
    info!(
        volumes = orchestrator.controllers().count(),
        updates = report.routed_updates,
        "volindexd running"
    );

    orchestrator.run(rx);
    Ok(())
}
