use std::env;
use std::ffi::OsString;
use std::path::PathBuf;

use anyhow::{Context, Result};

use volindex_core::control::{self, send_request, Delivery};
use volindex_core::{ControlRequest, ControlResponse};

fn parse() -> Result<(Vec<ControlRequest>, Option<PathBuf>), String> {
    let mut args = env::args_os();
    let _program = args.next();
    let mut requests = Vec::new();
    let mut socket = None;

    while let Some(arg) = args.next() {
        let arg_str = arg.to_string_lossy();
        let request = match arg_str.as_ref() {
            "-h" | "--help" => {
                print_usage();
                std::process::exit(0);
            }
            "--socket" => {
                socket = Some(PathBuf::from(next_value(&mut args, "--socket")?));
                continue;
            }
            "-p" => ControlRequest::TogglePause,
            "-q" => ControlRequest::Quit,
            "-s" => ControlRequest::Status,
            "-call" => ControlRequest::Commit { volume: None },
            "-rall" => ControlRequest::Reindex { volume: None },
            "-c" => ControlRequest::Commit {
                volume: Some(PathBuf::from(next_value(&mut args, "-c")?)),
            },
            "-r" => ControlRequest::Reindex {
                volume: Some(PathBuf::from(next_value(&mut args, "-r")?)),
            },
            "-e" => ControlRequest::Exclude {
                path: PathBuf::from(next_value(&mut args, "-e")?),
                permanent: false,
            },
            "-E" => ControlRequest::Exclude {
                path: PathBuf::from(next_value(&mut args, "-E")?),
                permanent: true,
            },
            unknown => return Err(format!("unknown argument: {unknown}")),
        };
        requests.push(request);
    }

    if requests.is_empty() {
        return Err("no command given".into());
    }
    Ok((requests, socket))
}

fn next_value(args: &mut impl Iterator<Item = OsString>, flag: &str) -> Result<OsString, String> {
    args.next().ok_or_else(|| format!("missing value for {flag}"))
}

fn print_usage() {
    eprintln!("volindexctl: control a running volindexd");
    eprintln!("\nUsage:");
    eprintln!("  volindexctl [--socket <path>] <command>...\n");
    eprintln!("Commands:");
    eprintln!("  -p            Toggle indexing on/off");
    eprintln!("  -q            Stop the daemon");
    eprintln!("  -c <volume>   Commit the volume containing <volume> now");
    eprintln!("  -call         Commit every volume now");
    eprintln!("  -r <volume>   Rebuild the index of the volume containing <volume>");
    eprintln!("  -rall         Rebuild every index");
    eprintln!("  -e <path>     Exclude <path> until the daemon restarts");
    eprintln!("  -E <path>     Exclude <path> permanently");
    eprintln!("  -s            Show daemon status");
    eprintln!("  -h            Show this message");
}

fn print_response(response: &ControlResponse) -> bool {
    match response {
        ControlResponse::Ack { message } => {
            println!("{message}");
            true
        }
        ControlResponse::Error { message } => {
            eprintln!("error: {message}");
            false
        }
        ControlResponse::Status {
            paused,
            pending_updates,
            pending_removals,
            volumes,
        } => {
            println!(
                "indexing {} ({} updates, {} removals queued)",
                if *paused { "paused" } else { "active" },
                pending_updates,
                pending_removals
            );
            for volume in volumes {
                println!(
                    "  {:<24} {:<8} {:?} docs={} adds={} deletes={}",
                    volume.root.display(),
                    volume.device,
                    volume.status,
                    volume.documents,
                    volume.pending_adds,
                    volume.pending_deletes
                );
            }
            true
        }
    }
}

fn main() -> Result<()> {
    let (requests, socket) = parse().unwrap_or_else(|err| {
        eprintln!("error: {err}");
        print_usage();
        std::process::exit(2);
    });
    let socket = socket.unwrap_or_else(control::socket_path);

    let mut ok = true;
    for request in &requests {
        let delivery = send_request(&socket, request)
            .with_context(|| format!("request to {} failed", socket.display()))?;
        match delivery {
            Delivery::Delivered(response) => ok &= print_response(&response),
            Delivery::NotRunning => {
                eprintln!("volindexd is not running");
                std::process::exit(1);
            }
        }
    }

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
