//! Socket option tuning for echo connections.
//!
//! Applies a fixed set of TCP/socket options to every connection before any
//! application data is exchanged, and reads the live values back for
//! diagnostics:
//! - `TCP_NODELAY`: disable Nagle coalescing so small lines go out at once
//! - `SO_SNDBUF` / `SO_RCVBUF`: kernel buffer sizes (Linux doubles them)
//! - `SO_KEEPALIVE` (+ `TCP_KEEPIDLE`): detect dead peers on idle links
//! - `SO_RCVTIMEO` / `SO_SNDTIMEO`: read and write timeouts
//! - `SO_LINGER`: bounded flush on close
//! - `SO_REUSEADDR`: listener rebinding while in TIME_WAIT
//!
//! Tuning is best effort per option: a failed option is logged and recorded
//! in the [`TuningReport`], and the remaining options are still attempted.

use socket2::{Socket, TcpKeepalive};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Default kernel buffer size requested for both directions.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Default read timeout.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Default linger on close.
pub const DEFAULT_LINGER: Duration = Duration::from_secs(5);

/// Default idle time before keepalive packets are sent.
pub const DEFAULT_KEEPALIVE_IDLE: Duration = Duration::from_secs(30);

/// Socket options applied to each connection.
///
/// Built once at startup and cloned into every session; never mutated after
/// construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Disable Nagle's algorithm (`TCP_NODELAY`).
    pub nodelay: bool,
    /// Requested `SO_SNDBUF` in bytes.
    pub send_buffer_size: usize,
    /// Requested `SO_RCVBUF` in bytes.
    pub recv_buffer_size: usize,
    /// Enable `SO_KEEPALIVE`.
    pub keepalive: bool,
    /// Idle time before the first keepalive packet, if overridden.
    pub keepalive_idle: Option<Duration>,
    /// How long a read may block before the connection is abandoned.
    pub read_timeout: Duration,
    /// How long a write may block, `None` for no limit.
    pub write_timeout: Option<Duration>,
    /// `SO_LINGER` timeout, `None` leaves the OS default (no linger).
    pub linger: Option<Duration>,
    /// `SO_REUSEADDR` on the listening socket.
    pub reuse_address: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            nodelay: true,
            send_buffer_size: DEFAULT_BUFFER_SIZE,
            recv_buffer_size: DEFAULT_BUFFER_SIZE,
            keepalive: true,
            keepalive_idle: Some(DEFAULT_KEEPALIVE_IDLE),
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: Some(DEFAULT_READ_TIMEOUT),
            linger: Some(DEFAULT_LINGER),
            reuse_address: true,
        }
    }
}

/// The individual options the tuner knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    NoDelay,
    SendBuffer,
    RecvBuffer,
    KeepAlive,
    KeepAliveIdle,
    ReadTimeout,
    WriteTimeout,
    Linger,
    ReuseAddress,
    Address,
}

impl SocketOption {
    /// Name of the underlying socket option.
    pub fn name(&self) -> &'static str {
        match self {
            SocketOption::NoDelay => "TCP_NODELAY",
            SocketOption::SendBuffer => "SO_SNDBUF",
            SocketOption::RecvBuffer => "SO_RCVBUF",
            SocketOption::KeepAlive => "SO_KEEPALIVE",
            SocketOption::KeepAliveIdle => "TCP_KEEPIDLE",
            SocketOption::ReadTimeout => "SO_RCVTIMEO",
            SocketOption::WriteTimeout => "SO_SNDTIMEO",
            SocketOption::Linger => "SO_LINGER",
            SocketOption::ReuseAddress => "SO_REUSEADDR",
            SocketOption::Address => "address",
        }
    }
}

impl fmt::Display for SocketOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single socket option could not be set or read.
#[derive(Debug)]
pub enum TuningError {
    Set(SocketOption, io::Error),
    Read(SocketOption, io::Error),
}

impl TuningError {
    /// The option involved in the failure.
    pub fn option(&self) -> SocketOption {
        match self {
            TuningError::Set(option, _) | TuningError::Read(option, _) => *option,
        }
    }
}

impl fmt::Display for TuningError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TuningError::Set(option, e) => write!(f, "Failed to set {option}: {e}"),
            TuningError::Read(option, e) => write!(f, "Failed to read {option}: {e}"),
        }
    }
}

impl std::error::Error for TuningError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TuningError::Set(_, e) | TuningError::Read(_, e) => Some(e),
        }
    }
}

/// Outcome of a single [`apply`] call.
#[derive(Debug, Default)]
pub struct TuningReport {
    /// Options that were set successfully, in application order.
    pub applied: Vec<SocketOption>,
    /// Options that failed; the connection keeps running without them.
    pub failures: Vec<TuningError>,
}

impl TuningReport {
    /// True when every attempted option was applied.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, option: SocketOption, result: io::Result<()>) {
        match result {
            Ok(()) => {
                debug!(option = %option, "Socket option applied");
                self.applied.push(option);
            }
            Err(e) => {
                let err = TuningError::Set(option, e);
                warn!(option = %err.option(), error = %err, "Socket option not applied");
                self.failures.push(err);
            }
        }
    }
}

/// Live option values read back from a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionsSnapshot {
    pub local_addr: Option<SocketAddr>,
    pub peer_addr: Option<SocketAddr>,
    pub nodelay: bool,
    pub send_buffer_size: usize,
    pub recv_buffer_size: usize,
    pub keepalive: bool,
    pub keepalive_idle: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub linger: Option<Duration>,
    pub reuse_address: bool,
}

impl OptionsSnapshot {
    /// Emit the snapshot as a single structured log event.
    pub fn log(&self, role: &str) {
        info!(
            role,
            local = ?self.local_addr,
            peer = ?self.peer_addr,
            nodelay = self.nodelay,
            sndbuf = self.send_buffer_size,
            rcvbuf = self.recv_buffer_size,
            keepalive = self.keepalive,
            keepalive_idle = ?self.keepalive_idle,
            read_timeout = ?self.read_timeout,
            write_timeout = ?self.write_timeout,
            linger = ?self.linger,
            reuse_address = self.reuse_address,
            "Current socket options"
        );
        debug!("Current socket information ({}):\n{}", role, self);
    }
}

impl fmt::Display for OptionsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn addr(a: &Option<SocketAddr>) -> String {
            a.map_or_else(|| "-".to_string(), |a| a.to_string())
        }
        fn enabled(on: bool) -> &'static str {
            if on {
                "ENABLED"
            } else {
                "DISABLED"
            }
        }

        writeln!(f, "local address: {}", addr(&self.local_addr))?;
        writeln!(f, "peer address: {}", addr(&self.peer_addr))?;
        writeln!(f, "TCP_NODELAY: {}", enabled(self.nodelay))?;
        writeln!(f, "SO_SNDBUF: {} bytes", self.send_buffer_size)?;
        writeln!(f, "SO_RCVBUF: {} bytes", self.recv_buffer_size)?;
        writeln!(f, "SO_KEEPALIVE: {}", enabled(self.keepalive))?;
        writeln!(f, "TCP_KEEPIDLE: {:?}", self.keepalive_idle)?;
        writeln!(f, "SO_RCVTIMEO: {:?}", self.read_timeout)?;
        writeln!(f, "SO_SNDTIMEO: {:?}", self.write_timeout)?;
        writeln!(f, "SO_LINGER: {:?}", self.linger)?;
        write!(f, "SO_REUSEADDR: {}", enabled(self.reuse_address))
    }
}

/// Socket option access used by the tuner.
///
/// Implemented for [`socket2::Socket`]; tokio streams are tuned through a
/// borrowed `socket2::SockRef`.
pub trait TunableSocket {
    fn set_nodelay(&self, on: bool) -> io::Result<()>;
    fn nodelay(&self) -> io::Result<bool>;
    fn set_send_buffer_size(&self, size: usize) -> io::Result<()>;
    fn send_buffer_size(&self) -> io::Result<usize>;
    fn set_recv_buffer_size(&self, size: usize) -> io::Result<()>;
    fn recv_buffer_size(&self) -> io::Result<usize>;
    fn set_keepalive(&self, on: bool) -> io::Result<()>;
    fn keepalive(&self) -> io::Result<bool>;
    fn set_keepalive_idle(&self, idle: Duration) -> io::Result<()>;
    /// `None` where the platform does not report the idle time.
    fn keepalive_idle(&self) -> io::Result<Option<Duration>>;
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
    fn read_timeout(&self) -> io::Result<Option<Duration>>;
    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
    fn write_timeout(&self) -> io::Result<Option<Duration>>;
    fn set_linger(&self, linger: Option<Duration>) -> io::Result<()>;
    fn linger(&self) -> io::Result<Option<Duration>>;
    fn set_reuse_address(&self, on: bool) -> io::Result<()>;
    fn reuse_address(&self) -> io::Result<bool>;
    fn local_addr(&self) -> io::Result<Option<SocketAddr>>;
    fn peer_addr(&self) -> io::Result<Option<SocketAddr>>;
}

impl TunableSocket for Socket {
    fn set_nodelay(&self, on: bool) -> io::Result<()> {
        Socket::set_nodelay(self, on)
    }

    fn nodelay(&self) -> io::Result<bool> {
        Socket::nodelay(self)
    }

    fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
        Socket::set_send_buffer_size(self, size)
    }

    fn send_buffer_size(&self) -> io::Result<usize> {
        Socket::send_buffer_size(self)
    }

    fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        Socket::set_recv_buffer_size(self, size)
    }

    fn recv_buffer_size(&self) -> io::Result<usize> {
        Socket::recv_buffer_size(self)
    }

    fn set_keepalive(&self, on: bool) -> io::Result<()> {
        Socket::set_keepalive(self, on)
    }

    fn keepalive(&self) -> io::Result<bool> {
        Socket::keepalive(self)
    }

    fn set_keepalive_idle(&self, idle: Duration) -> io::Result<()> {
        self.set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    fn keepalive_idle(&self) -> io::Result<Option<Duration>> {
        self.keepalive_time().map(Some)
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    fn keepalive_idle(&self) -> io::Result<Option<Duration>> {
        Ok(None)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        Socket::set_read_timeout(self, timeout)
    }

    fn read_timeout(&self) -> io::Result<Option<Duration>> {
        Socket::read_timeout(self)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        Socket::set_write_timeout(self, timeout)
    }

    fn write_timeout(&self) -> io::Result<Option<Duration>> {
        Socket::write_timeout(self)
    }

    fn set_linger(&self, linger: Option<Duration>) -> io::Result<()> {
        Socket::set_linger(self, linger)
    }

    fn linger(&self) -> io::Result<Option<Duration>> {
        Socket::linger(self)
    }

    fn set_reuse_address(&self, on: bool) -> io::Result<()> {
        Socket::set_reuse_address(self, on)
    }

    fn reuse_address(&self) -> io::Result<bool> {
        Socket::reuse_address(self)
    }

    fn local_addr(&self) -> io::Result<Option<SocketAddr>> {
        Socket::local_addr(self).map(|addr| addr.as_socket())
    }

    fn peer_addr(&self) -> io::Result<Option<SocketAddr>> {
        Socket::peer_addr(self).map(|addr| addr.as_socket())
    }
}

/// Apply connection options in a fixed order.
///
/// Every option is attempted even if an earlier one failed.
pub fn apply<S: TunableSocket + ?Sized>(socket: &S, options: &ConnectionOptions) -> TuningReport {
    let mut report = TuningReport::default();

    report.record(SocketOption::NoDelay, socket.set_nodelay(options.nodelay));
    report.record(
        SocketOption::SendBuffer,
        socket.set_send_buffer_size(options.send_buffer_size),
    );
    report.record(
        SocketOption::RecvBuffer,
        socket.set_recv_buffer_size(options.recv_buffer_size),
    );
    report.record(SocketOption::KeepAlive, socket.set_keepalive(options.keepalive));
    if let (true, Some(idle)) = (options.keepalive, options.keepalive_idle) {
        report.record(SocketOption::KeepAliveIdle, socket.set_keepalive_idle(idle));
    }
    report.record(
        SocketOption::ReadTimeout,
        socket.set_read_timeout(Some(options.read_timeout)),
    );
    report.record(
        SocketOption::WriteTimeout,
        socket.set_write_timeout(options.write_timeout),
    );
    report.record(SocketOption::Linger, socket.set_linger(options.linger));

    if report.is_complete() {
        info!(applied = report.applied.len(), "TCP optimizations applied");
    } else {
        warn!(
            applied = report.applied.len(),
            failed = report.failures.len(),
            "TCP optimizations partially applied"
        );
    }

    report
}

/// Read back the live values of the options [`apply`] sets.
pub fn describe<S: TunableSocket + ?Sized>(socket: &S) -> Result<OptionsSnapshot, TuningError> {
    fn read<T>(option: SocketOption, result: io::Result<T>) -> Result<T, TuningError> {
        result.map_err(|e| TuningError::Read(option, e))
    }

    Ok(OptionsSnapshot {
        local_addr: read(SocketOption::Address, socket.local_addr())?,
        // Unconnected sockets have no peer.
        peer_addr: socket.peer_addr().ok().flatten(),
        nodelay: read(SocketOption::NoDelay, socket.nodelay())?,
        send_buffer_size: read(SocketOption::SendBuffer, socket.send_buffer_size())?,
        recv_buffer_size: read(SocketOption::RecvBuffer, socket.recv_buffer_size())?,
        keepalive: read(SocketOption::KeepAlive, socket.keepalive())?,
        keepalive_idle: read(SocketOption::KeepAliveIdle, socket.keepalive_idle())?,
        read_timeout: read(SocketOption::ReadTimeout, socket.read_timeout())?,
        write_timeout: read(SocketOption::WriteTimeout, socket.write_timeout())?,
        linger: read(SocketOption::Linger, socket.linger())?,
        reuse_address: read(SocketOption::ReuseAddress, socket.reuse_address())?,
    })
}

/// Options for a listening socket; must run before `bind`.
pub fn apply_listener_options<S: TunableSocket + ?Sized>(
    socket: &S,
    options: &ConnectionOptions,
) -> Result<(), TuningError> {
    socket
        .set_reuse_address(options.reuse_address)
        .map_err(|e| TuningError::Set(SocketOption::ReuseAddress, e))?;
    info!(enabled = options.reuse_address, "SO_REUSEADDR configured");
    Ok(())
}

/// Close a tuned stream on the blocking pool.
///
/// With `SO_LINGER` set, `close()` blocks until unsent data is acknowledged
/// or the linger time runs out, even on a non-blocking socket. Dropping the
/// stream on a runtime worker would stall every task scheduled there.
pub async fn release(stream: TcpStream) {
    let stream = match stream.into_std() {
        Ok(stream) => stream,
        Err(e) => {
            debug!(error = %e, "Could not detach stream from the runtime");
            return;
        }
    };

    if let Err(e) = tokio::task::spawn_blocking(move || drop(stream)).await {
        warn!(error = %e, "Stream release task failed");
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::cell::{Cell, RefCell};

    /// In-memory socket whose setters fail for selected options.
    #[derive(Default)]
    pub(crate) struct FakeSocket {
        failing: Vec<SocketOption>,
        pub(crate) calls: RefCell<Vec<SocketOption>>,
        nodelay: Cell<bool>,
        sndbuf: Cell<usize>,
        rcvbuf: Cell<usize>,
        keepalive: Cell<bool>,
        idle: Cell<Option<Duration>>,
        read_timeout: Cell<Option<Duration>>,
        write_timeout: Cell<Option<Duration>>,
        linger: Cell<Option<Duration>>,
        reuse: Cell<bool>,
    }

    impl FakeSocket {
        pub(crate) fn failing(options: &[SocketOption]) -> Self {
            Self {
                failing: options.to_vec(),
                ..Default::default()
            }
        }

        fn set<T: Copy>(&self, option: SocketOption, cell: &Cell<T>, value: T) -> io::Result<()> {
            self.calls.borrow_mut().push(option);
            if self.failing.contains(&option) {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "refused"));
            }
            cell.set(value);
            Ok(())
        }
    }

    impl TunableSocket for FakeSocket {
        fn set_nodelay(&self, on: bool) -> io::Result<()> {
            self.set(SocketOption::NoDelay, &self.nodelay, on)
        }
        fn nodelay(&self) -> io::Result<bool> {
            Ok(self.nodelay.get())
        }
        fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
            self.set(SocketOption::SendBuffer, &self.sndbuf, size)
        }
        fn send_buffer_size(&self) -> io::Result<usize> {
            Ok(self.sndbuf.get())
        }
        fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
            self.set(SocketOption::RecvBuffer, &self.rcvbuf, size)
        }
        fn recv_buffer_size(&self) -> io::Result<usize> {
            Ok(self.rcvbuf.get())
        }
        fn set_keepalive(&self, on: bool) -> io::Result<()> {
            self.set(SocketOption::KeepAlive, &self.keepalive, on)
        }
        fn keepalive(&self) -> io::Result<bool> {
            Ok(self.keepalive.get())
        }
        fn set_keepalive_idle(&self, idle: Duration) -> io::Result<()> {
            self.set(SocketOption::KeepAliveIdle, &self.idle, Some(idle))
        }
        fn keepalive_idle(&self) -> io::Result<Option<Duration>> {
            Ok(self.idle.get())
        }
        fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
            self.set(SocketOption::ReadTimeout, &self.read_timeout, timeout)
        }
        fn read_timeout(&self) -> io::Result<Option<Duration>> {
            Ok(self.read_timeout.get())
        }
        fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
            self.set(SocketOption::WriteTimeout, &self.write_timeout, timeout)
        }
        fn write_timeout(&self) -> io::Result<Option<Duration>> {
            Ok(self.write_timeout.get())
        }
        fn set_linger(&self, linger: Option<Duration>) -> io::Result<()> {
            self.set(SocketOption::Linger, &self.linger, linger)
        }
        fn linger(&self) -> io::Result<Option<Duration>> {
            Ok(self.linger.get())
        }
        fn set_reuse_address(&self, on: bool) -> io::Result<()> {
            self.set(SocketOption::ReuseAddress, &self.reuse, on)
        }
        fn reuse_address(&self) -> io::Result<bool> {
            Ok(self.reuse.get())
        }
        fn local_addr(&self) -> io::Result<Option<SocketAddr>> {
            Ok(None)
        }
        fn peer_addr(&self) -> io::Result<Option<SocketAddr>> {
            Err(io::Error::from(io::ErrorKind::NotConnected))
        }
    }
}
