//! Control channel between `volindexctl` and the running daemon.
//!
//! One JSON object per line in each direction over a Unix socket: the client
//! writes a [`ControlRequest`], the daemon answers with a [`ControlResponse`]
//! and closes the connection.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::controller::ControllerStatus;
use crate::error::{IndexError, Result};
use crate::volume::DeviceId;

pub const SOCKET_ENV: &str = "VOLINDEX_SOCKET";
const SOCKET_NAME: &str = "volindex.sock";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlRequest {
    TogglePause,
    Quit,
    /// Commit now, either the volume containing `volume` or every volume.
    Commit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        volume: Option<PathBuf>,
    },
    /// Throw away and rebuild the index of one volume or of every volume.
    Reindex {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        volume: Option<PathBuf>,
    },
    Exclude {
        path: PathBuf,
        #[serde(default)]
        permanent: bool,
    },
    Status,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "snake_case")]
pub enum ControlResponse {
    Ack {
        message: String,
    },
    Status {
        paused: bool,
        pending_updates: usize,
        pending_removals: usize,
        volumes: Vec<VolumeStatus>,
    },
    Error {
        message: String,
    },
}

impl ControlResponse {
    pub fn ack(message: impl Into<String>) -> Self {
        ControlResponse::Ack {
            message: message.into(),
        }
    }

    pub fn error(message: impl ToString) -> Self {
        ControlResponse::Error {
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeStatus {
    pub device: DeviceId,
    pub name: String,
    pub root: PathBuf,
    pub status: ControllerStatus,
    pub pending_adds: usize,
    pub pending_deletes: usize,
    pub documents: u64,
}

pub fn encode_line<T: Serialize>(message: &T) -> Result<String> {
    let mut line = serde_json::to_string(message)
        .map_err(|err| IndexError::Control(format!("encode: {err}")))?;
    line.push('\n');
    Ok(line)
}

pub fn decode_line<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T> {
    serde_json::from_str(line.trim()).map_err(|err| IndexError::Control(format!("decode: {err}")))
}

/// `$VOLINDEX_SOCKET`, else `$XDG_RUNTIME_DIR/volindex.sock`, else a
/// per-user path under `/tmp`.
pub fn socket_path() -> PathBuf {
    if let Some(path) = std::env::var_os(SOCKET_ENV).filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }
    if let Some(dir) = std::env::var_os("XDG_RUNTIME_DIR").filter(|p| !p.is_empty()) {
        return PathBuf::from(dir).join(SOCKET_NAME);
    }
    PathBuf::from(format!("/tmp/volindex-{}.sock", user_id()))
}

#[cfg(unix)]
fn user_id() -> u32 {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata("/proc/self").map_or(0, |metadata| metadata.uid())
}

#[cfg(not(unix))]
fn user_id() -> u32 {
    0
}

#[cfg(unix)]
pub use unix::{send_request, ControlServer, Delivery};

#[cfg(unix)]
mod unix {
    use std::fs;
    use std::io::{self, BufRead, BufReader, Write};
    use std::os::unix::fs::PermissionsExt;
    use std::os::unix::net::{UnixListener, UnixStream};
    use std::path::{Path, PathBuf};
    use std::thread;
    use std::time::Duration;

    use crossbeam_channel::Sender;
    use tracing::{debug, info, warn};

    use super::{decode_line, encode_line, ControlRequest, ControlResponse};
    use crate::error::{IndexError, Result};
    use crate::orchestrator::DaemonMessage;

    const IO_TIMEOUT: Duration = Duration::from_secs(30);
    /// Commits and reindexing run on the daemon loop, so replies can take a while.
    const REPLY_TIMEOUT: Duration = Duration::from_secs(600);

    /// Listening socket. The socket file is removed on drop.
    pub struct ControlServer {
        path: PathBuf,
    }

    impl ControlServer {
        /// Binds `path` and serves requests on a background thread, handing
        /// each one to the daemon loop through `tx`.
        pub fn bind(path: &Path, tx: Sender<DaemonMessage>) -> Result<Self> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            if path.exists() {
                if UnixStream::connect(path).is_ok() {
                    return Err(IndexError::Control(format!(
                        "another daemon is listening on {}",
                        path.display()
                    )));
                }
                fs::remove_file(path)?;
            }

            let listener = UnixListener::bind(path)?;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
            info!(socket = %path.display(), "control socket listening");

            thread::Builder::new()
                .name("volindex-control".into())
                .spawn(move || {
                    for stream in listener.incoming() {
                        match stream {
                            Ok(stream) => {
                                if let Err(err) = serve(stream, &tx) {
                                    debug!(error = %err, "control connection failed");
                                }
                            }
                            Err(err) => warn!(error = %err, "control accept failed"),
                        }
                    }
                })?;

            Ok(Self {
                path: path.to_path_buf(),
            })
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl Drop for ControlServer {
        fn drop(&mut self) {
            let _ = fs::remove_file(&self.path);
        }
    }

    fn serve(stream: UnixStream, tx: &Sender<DaemonMessage>) -> Result<()> {
        stream.set_read_timeout(Some(IO_TIMEOUT))?;
        stream.set_write_timeout(Some(IO_TIMEOUT))?;

        let mut line = String::new();
        BufReader::new(stream.try_clone()?).read_line(&mut line)?;

        let response = match decode_line::<ControlRequest>(&line) {
            Ok(request) => dispatch(request, tx),
            Err(err) => ControlResponse::error(err),
        };

        let mut writer = stream;
        writer.write_all(encode_line(&response)?.as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    fn dispatch(request: ControlRequest, tx: &Sender<DaemonMessage>) -> ControlResponse {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        let message = DaemonMessage::Control {
            request,
            reply: Some(reply_tx),
        };
        if tx.send(message).is_err() {
            return ControlResponse::error("daemon is shutting down");
        }
        reply_rx
            .recv_timeout(REPLY_TIMEOUT)
            .unwrap_or_else(|_| ControlResponse::error("no reply from daemon"))
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Delivery {
        Delivered(ControlResponse),
        NotRunning,
    }

    /// Sends one request and waits for the reply. A missing or refusing
    /// socket means the daemon is not running.
    pub fn send_request(path: &Path, request: &ControlRequest) -> Result<Delivery> {
        let stream = match UnixStream::connect(path) {
            Ok(stream) => stream,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
                ) =>
            {
                return Ok(Delivery::NotRunning);
            }
            Err(err) => return Err(err.into()),
        };
        stream.set_write_timeout(Some(IO_TIMEOUT))?;
        stream.set_read_timeout(Some(REPLY_TIMEOUT))?;

        let mut writer = stream.try_clone()?;
        writer.write_all(encode_line(request)?.as_bytes())?;
        writer.flush()?;

        let mut line = String::new();
        BufReader::new(stream).read_line(&mut line)?;
        if line.trim().is_empty() {
            return Err(IndexError::Control("daemon closed the connection".into()));
        }
        Ok(Delivery::Delivered(decode_line(&line)?))
    }
}
