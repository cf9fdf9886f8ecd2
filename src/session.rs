//! Per-connection echo session.
//!
//! Line-oriented protocol:
//! - Client sends: `<text>\n` (a trailing `\r` is tolerated)
//! - Server responds: `Server received: <text> at <timestamp>\n`
//!
//! The line `quit` (any ASCII case) ends the session. It is answered like
//! any other line before the connection is closed.
//!
//! ```text
//! Request:  ping\n
//! Response: Server received: ping at 2024-05-01T10:00:00.123+02:00\n
//! ```

use crate::tuning::{self, ConnectionOptions};
use bytes::BytesMut;
use chrono::{DateTime, Local, SecondsFormat, TimeZone};
use socket2::SockRef;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Line that terminates a session.
pub const SENTINEL: &str = "quit";

const RESPONSE_PREFIX: &str = "Server received: ";

const INITIAL_LINE_CAPACITY: usize = 1024;

/// Longest accepted line, terminator included.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Why a session stopped reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer sent the sentinel line.
    Sentinel,
    /// The peer closed its side of the connection.
    EndOfStream,
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Closing(CloseReason),
    Closed,
}

/// Summary of a completed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    /// Lines answered, including the sentinel.
    pub lines: u64,
    pub reason: CloseReason,
}

/// I/O failure inside a single session. Never escapes the session task.
#[derive(Debug)]
pub enum SessionError {
    Io(io::Error),
    Timeout(Duration),
    LineTooLong(usize),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Io(e) => write!(f, "Session I/O error: {e}"),
            SessionError::Timeout(limit) => write!(f, "Session timed out after {limit:?}"),
            SessionError::LineTooLong(limit) => {
                write!(f, "Line exceeds {limit} bytes without a newline")
            }
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Io(e) => Some(e),
            SessionError::Timeout(_) | SessionError::LineTooLong(_) => None,
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self {
        SessionError::Io(e)
    }
}

/// Returns true if `line` is the session terminator.
pub fn is_sentinel(line: &str) -> bool {
    line.trim().eq_ignore_ascii_case(SENTINEL)
}

/// Build the acknowledgment for `line`, newline terminated.
pub fn format_response<Tz>(line: &str, at: &DateTime<Tz>) -> BytesMut
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    let timestamp = at.to_rfc3339_opts(SecondsFormat::Millis, false);
    let mut response =
        BytesMut::with_capacity(RESPONSE_PREFIX.len() + line.len() + timestamp.len() + 5);
    response.extend_from_slice(RESPONSE_PREFIX.as_bytes());
    response.extend_from_slice(line.as_bytes());
    response.extend_from_slice(b" at ");
    response.extend_from_slice(timestamp.as_bytes());
    response.extend_from_slice(b"\n");
    response
}

/// Strip the line terminator and decode, replacing invalid UTF-8.
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

async fn bounded<F, T>(limit: Option<Duration>, fut: F) -> Result<T, SessionError>
where
    F: Future<Output = io::Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| SessionError::Timeout(limit))?
            .map_err(SessionError::Io),
        None => fut.await.map_err(SessionError::Io),
    }
}

/// Echo protocol state machine over any byte stream.
pub struct EchoSession<R, W> {
    reader: BufReader<R>,
    writer: W,
    read_timeout: Duration,
    write_timeout: Option<Duration>,
    state: SessionState,
    lines: u64,
}

impl<R, W> EchoSession<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, options: &ConnectionOptions) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
            read_timeout: options.read_timeout,
            write_timeout: options.write_timeout,
            state: SessionState::Active,
            lines: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Give back the stream halves. Unread buffered input is discarded.
    pub fn into_inner(self) -> (R, W) {
        (self.reader.into_inner(), self.writer)
    }

    /// Drive the session until the sentinel, end of stream or an error.
    pub async fn run(&mut self) -> Result<SessionSummary, SessionError> {
        let mut line = Vec::with_capacity(INITIAL_LINE_CAPACITY);

        loop {
            match self.state {
                SessionState::Active => {
                    self.state = match self.step(&mut line).await {
                        Ok(next) => next,
                        Err(e) => {
                            self.state = SessionState::Closed;
                            return Err(e);
                        }
                    };
                }
                SessionState::Closing(reason) => {
                    if let Err(e) = self.writer.shutdown().await {
                        debug!(error = %e, "Shutdown after close failed");
                    }
                    self.state = SessionState::Closed;
                    return Ok(SessionSummary {
                        lines: self.lines,
                        reason,
                    });
                }
                SessionState::Closed => {
                    return Err(SessionError::Io(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "session already closed",
                    )));
                }
            }
        }
    }

    /// Read one line and answer it.
    async fn step(&mut self, line: &mut Vec<u8>) -> Result<SessionState, SessionError> {
        line.clear();

        let mut limited = (&mut self.reader).take(MAX_LINE_LENGTH as u64);
        let n = bounded(Some(self.read_timeout), limited.read_until(b'\n', line)).await?;
        if n == 0 {
            return Ok(SessionState::Closing(CloseReason::EndOfStream));
        }
        if n == MAX_LINE_LENGTH && line.last() != Some(&b'\n') {
            return Err(SessionError::LineTooLong(MAX_LINE_LENGTH));
        }

        let text = decode_line(line);
        debug!(line = %text, "Received line");

        let response = format_response(&text, &Local::now());
        let writer = &mut self.writer;
        bounded(self.write_timeout, async move {
            writer.write_all(&response).await?;
            writer.flush().await
        })
        .await?;
        self.lines += 1;

        if is_sentinel(&text) {
            Ok(SessionState::Closing(CloseReason::Sentinel))
        } else {
            Ok(SessionState::Active)
        }
    }
}

/// Serve one accepted connection; the stream is released on every path.
pub async fn serve(stream: TcpStream, peer: SocketAddr, options: ConnectionOptions) {
    {
        let sock = SockRef::from(&stream);
        tuning::apply(&*sock, &options);
        match tuning::describe(&*sock) {
            Ok(snapshot) => snapshot.log("server"),
            Err(e) => warn!(peer = %peer, error = %e, "Could not read socket options"),
        }
    }

    let (reader, writer) = stream.into_split();
    let mut session = EchoSession::new(reader, writer, &options);

    match session.run().await {
        Ok(summary) => match summary.reason {
            CloseReason::Sentinel => {
                info!(peer = %peer, lines = summary.lines, "Client requested disconnect")
            }
            CloseReason::EndOfStream => {
                info!(peer = %peer, lines = summary.lines, "Client disconnected")
            }
        },
        Err(e) => warn!(peer = %peer, error = %e, "Session ended with error"),
    }
    debug!(peer = %peer, state = ?session.state(), "Session finished");

    let (reader, writer) = session.into_inner();
    match reader.reunite(writer) {
        Ok(stream) => tuning::release(stream).await,
        Err(e) => warn!(peer = %peer, error = %e, "Could not reunite stream halves"),
    }
}
