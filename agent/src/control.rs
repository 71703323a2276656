//! Local control plane for adding and removing watched directories.
//!
//! The daemon listens on a loopback TCP socket. Requests and responses are
//! length-prefixed frames:
//!
//! ```text
//! request:  [len: u16 BE][command: u8][path: UTF-8 bytes]
//! response: [0x00 0x01][status: u8]
//! ```
//!
//! | Command | Meaning                                          |
//! |---------|--------------------------------------------------|
//! | `W`     | register the path as an assignment and watch it  |
//! | `X`     | stop watching the path                           |
//!
//! Status is `A` (accepted) or `R` (rejected). A connection may carry any
//! number of requests and ends at EOF. Malformed requests (empty frame,
//! unknown command, non-UTF-8 path) are rejected without closing the
//! connection.
//!
//! The bound port is written to `daemon.port` in the data directory so the
//! CLI can find the daemon.

use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::history::EditHistoryLog;
use crate::watcher::DirectoryWatcher;

/// File in the data directory holding the control port.
pub const PORT_FILE_NAME: &str = "daemon.port";

/// Largest payload a frame can carry.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

const CMD_WATCH: u8 = b'W';
const CMD_UNWATCH: u8 = b'X';
const STATUS_ACCEPTED: u8 = b'A';
const STATUS_REJECTED: u8 = b'R';

/// Errors that can occur on the control plane.
#[derive(Error, Debug)]
pub enum ControlError {
    /// Socket or file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The payload does not fit in a frame.
    #[error("frame too large: {0} bytes (max {MAX_FRAME_LEN})")]
    FrameTooLarge(usize),

    /// A request frame had no payload.
    #[error("empty request frame")]
    EmptyFrame,

    /// A request named an unknown command byte.
    #[error("unknown command byte 0x{0:02x}")]
    UnknownCommand(u8),

    /// A request path was not UTF-8.
    #[error("request path is not valid UTF-8")]
    InvalidPath,

    /// The daemon answered with something other than a status frame.
    #[error("invalid response frame: {0:?}")]
    InvalidResponse(Vec<u8>),

    /// The daemon closed the connection before answering.
    #[error("connection closed before a response was received")]
    NoResponse,

    /// The port file is missing or malformed.
    #[error("cannot read daemon port from {path}: {reason}")]
    PortFile { path: PathBuf, reason: String },
}

/// Result type for control plane operations.
pub type Result<T> = std::result::Result<T, ControlError>;

/// A decoded control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Register the directory as an assignment and watch it.
    Watch(PathBuf),
    /// Stop watching the directory.
    Unwatch(PathBuf),
}

impl Command {
    fn code(&self) -> u8 {
        match self {
            Self::Watch(_) => CMD_WATCH,
            Self::Unwatch(_) => CMD_UNWATCH,
        }
    }

    fn path(&self) -> &Path {
        match self {
            Self::Watch(path) | Self::Unwatch(path) => path,
        }
    }

    /// Encodes the request payload (without the length prefix).
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::InvalidPath`] for a non-UTF-8 path and
    /// [`ControlError::FrameTooLarge`] if the path is too long.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let path = self.path().to_str().ok_or(ControlError::InvalidPath)?;
        let mut payload = Vec::with_capacity(1 + path.len());
        payload.push(self.code());
        payload.extend_from_slice(path.as_bytes());
        if payload.len() > MAX_FRAME_LEN {
            return Err(ControlError::FrameTooLarge(payload.len()));
        }
        Ok(payload)
    }

    /// Decodes a request payload.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::EmptyFrame`], [`ControlError::UnknownCommand`]
    /// or [`ControlError::InvalidPath`].
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let (&code, path) = payload.split_first().ok_or(ControlError::EmptyFrame)?;
        let path = std::str::from_utf8(path).map_err(|_| ControlError::InvalidPath)?;
        let path = PathBuf::from(path);

        match code {
            CMD_WATCH => Ok(Self::Watch(path)),
            CMD_UNWATCH => Ok(Self::Unwatch(path)),
            other => Err(ControlError::UnknownCommand(other)),
        }
    }
}

/// Response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Accepted,
    Rejected,
}

impl Status {
    fn code(self) -> u8 {
        match self {
            Self::Accepted => STATUS_ACCEPTED,
            Self::Rejected => STATUS_REJECTED,
        }
    }

    fn decode(payload: &[u8]) -> Result<Self> {
        match payload {
            [STATUS_ACCEPTED] => Ok(Self::Accepted),
            [STATUS_REJECTED] => Ok(Self::Rejected),
            other => Err(ControlError::InvalidResponse(other.to_vec())),
        }
    }
}

/// Reads one length-prefixed frame.
///
/// Returns `None` when the peer closes the connection between frames.
///
/// # Errors
///
/// Returns an I/O error if the connection fails or closes mid-frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len = [0u8; 2];
    match reader.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let mut payload = vec![0u8; usize::from(u16::from_be_bytes(len))];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Writes one length-prefixed frame and flushes it.
///
/// # Errors
///
/// Returns [`ControlError::FrameTooLarge`] or an I/O error.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u16::try_from(payload.len()).map_err(|_| ControlError::FrameTooLarge(payload.len()))?;
    let mut frame = Vec::with_capacity(2 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Executes control commands against the running watcher and log.
pub struct Controller {
    watcher: DirectoryWatcher,
    log: Arc<dyn EditHistoryLog>,
}

impl Controller {
    /// Creates a controller for the given watcher and log.
    pub fn new(watcher: DirectoryWatcher, log: Arc<dyn EditHistoryLog>) -> Self {
        Self { watcher, log }
    }

    /// Executes one command.
    pub fn execute(&self, command: &Command) -> Status {
        match command {
            Command::Watch(path) => self.watch(path),
            Command::Unwatch(path) => {
                self.watcher.remove_directory(path);
                Status::Accepted
            }
        }
    }

    fn watch(&self, path: &Path) -> Status {
        if !path.is_absolute() || !path.is_dir() {
            warn!(path = %path.display(), "Rejecting watch of non-directory or relative path");
            return Status::Rejected;
        }

        // Registered first so the initial import is already routed.
        let assignment = match self.log.register_assignment(path) {
            Ok(id) => id,
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to register assignment");
                return Status::Rejected;
            }
        };

        match self.watcher.add_directory(path) {
            Ok(()) => {
                info!(path = %path.display(), assignment = %assignment, "Watch request accepted");
                Status::Accepted
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to watch directory");
                Status::Rejected
            }
        }
    }
}

/// Serves requests on one connection until the peer closes it.
///
/// # Errors
///
/// Returns an error only when the connection itself fails.
pub async fn handle_connection<S>(stream: &mut S, controller: &Controller) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(payload) = read_frame(stream).await? {
        let status = match Command::decode(&payload) {
            Ok(command) => {
                debug!(command = ?command, "Control request");
                controller.execute(&command)
            }
            Err(e) => {
                warn!(error = %e, "Malformed control request");
                Status::Rejected
            }
        };
        write_frame(stream, &[status.code()]).await?;
    }
    Ok(())
}

/// Accepts connections forever, serving each on its own task.
pub async fn serve(listener: TcpListener, controller: Arc<Controller>) {
    loop {
        let (mut stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Failed to accept control connection");
                continue;
            }
        };

        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            debug!(peer = %peer, "Control connection opened");
            if let Err(e) = handle_connection(&mut stream, &controller).await {
                warn!(peer = %peer, error = %e, "Control connection failed");
            }
        });
    }
}

/// Sends one command to the daemon at `addr` and returns its answer.
///
/// # Errors
///
/// Returns a [`ControlError`] if the daemon is unreachable or answers with
/// a malformed frame.
pub async fn send_command(addr: SocketAddr, command: &Command) -> Result<Status> {
    let mut stream = TcpStream::connect(addr).await?;
    write_frame(&mut stream, &command.encode()?).await?;

    let payload = read_frame(&mut stream)
        .await?
        .ok_or(ControlError::NoResponse)?;
    Status::decode(&payload)
}

/// Writes the bound control port into the data directory.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be written.
pub fn write_port_file(data_dir: &Path, port: u16) -> io::Result<PathBuf> {
    fs::create_dir_all(data_dir)?;
    let path = data_dir.join(PORT_FILE_NAME);
    fs::write(&path, port.to_string())?;
    Ok(path)
}

/// Reads the control port written by a running daemon.
///
/// # Errors
///
/// Returns [`ControlError::PortFile`] if the file is missing or malformed.
pub fn read_port_file(data_dir: &Path) -> Result<u16> {
    let path = data_dir.join(PORT_FILE_NAME);
    let text = fs::read_to_string(&path).map_err(|e| ControlError::PortFile {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    text.trim().parse().map_err(|e: std::num::ParseIntError| ControlError::PortFile {
        path,
        reason: e.to_string(),
    })
}
