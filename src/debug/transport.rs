//! TCP debug transport
//!
//! Provides a TCP server socket which one debug client can connect to.
//! After that, data is just passed through.
//!
//! Lifecycle:
//!
//! ```text
//! new(port) ─init()─▶ listening ─wait_for_connection()─▶ connected ─I/O fault─▶ closed
//! ```
//!
//! Port 0 disables the transport entirely. The listening socket is closed as
//! soon as the first client is accepted, so a second debugger can never
//! attach, not even after the first one disconnects. There are no socket
//! timeouts: a peer that vanishes without a FIN/RST ("black hole") is only
//! noticed through the operating system's keep-alive behaviour.

use std::io::{self, Read};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info};

use super::DebugChannel;

const TOPIC: &str = "transport.socket";

/// Only one debugger client is ever expected
const LISTEN_BACKLOG: i32 = 1;

/// Failures while setting up the debug connection
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to create server socket: {0}")]
    Create(#[source] io::Error),

    #[error("failed to set SO_REUSEADDR for server socket: {0}")]
    ReuseAddress(#[source] io::Error),

    #[error("failed to bind server socket on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("failed to listen on port {port}: {source}")]
    Listen {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("accept() failed on port {port}: {source}")]
    Accept {
        port: u16,
        #[source]
        source: io::Error,
    },
}

/// Faults on an established connection; logged and absorbed, never returned
#[derive(Debug, thiserror::Error)]
enum IoFault {
    #[error("debug {op} request with empty buffer, closing connection")]
    EmptyBuffer { op: &'static str },

    #[error("debug {op} failed, closing connection: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("debug read failed, peer closed the connection (EOF), closing connection")]
    Eof,

    #[error("debug write failed, nothing written, closing connection")]
    NothingWritten,

    #[error("debug {op} failed, count too large ({got} > {requested}), closing connection")]
    Overflow {
        op: &'static str,
        got: usize,
        requested: usize,
    },

    #[error("poll failed, closing connection: {0}")]
    Poll(#[source] io::Error),
}

/// Single-client TCP byte pipe for the engine debugger
#[derive(Debug)]
pub struct DebugTransport {
    port: u16,
    listener: Option<Socket>,
    client: Option<Socket>,
}

impl DebugTransport {
    /// Create a transport for `port`; nothing is opened until [`init`](Self::init)
    pub fn new(port: u16) -> Self {
        Self {
            port,
            listener: None,
            client: None,
        }
    }

    /// `false` when the transport was created with port 0
    pub fn is_active(&self) -> bool {
        self.port != 0
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    /// Bind and listen on `0.0.0.0:port`
    ///
    /// No-op when the transport is disabled. On failure the partially
    /// created socket is released and the transport stays without a
    /// listener.
    pub fn init(&mut self) -> Result<(), TransportError> {
        if !self.is_active() {
            return Ok(());
        }
        self.listener = None;
        match bind_listener(self.port) {
            Ok(listener) => {
                debug!(topic = TOPIC, port = self.port, "debug server socket listening");
                self.listener = Some(listener);
                Ok(())
            }
            Err(err) => {
                error!(topic = TOPIC, port = self.port, "{err}");
                Err(err)
            }
        }
    }

    /// Block until one debugger client connects, then stop listening
    ///
    /// Without a listening socket this logs and returns `Ok(())`: debugging
    /// is simply unavailable.
    pub fn wait_for_connection(&mut self) -> Result<(), TransportError> {
        let Some(listener) = self.listener.as_ref() else {
            info!(topic = TOPIC, port = self.port, "no server socket, skip waiting for connection");
            return Ok(());
        };
        self.client = None;

        info!(
            topic = TOPIC,
            thread = ?std::thread::current().id(),
            port = self.port,
            "waiting for debug connection"
        );
        match listener.accept() {
            Ok((client, peer)) => {
                #[cfg(any(target_os = "macos", target_os = "ios"))]
                if let Err(err) = client.set_nosigpipe(true) {
                    error!(topic = TOPIC, "failed to set SO_NOSIGPIPE: {err}");
                }
                info!(
                    topic = TOPIC,
                    port = self.port,
                    peer = ?peer.as_socket(),
                    "debug connection established"
                );
                self.client = Some(client);
                // single attach: no further connections are accepted
                self.listener = None;
                Ok(())
            }
            Err(source) => {
                let err = TransportError::Accept {
                    port: self.port,
                    source,
                };
                error!(topic = TOPIC, "{err}");
                Err(err)
            }
        }
    }

    fn fail_closed(
        &mut self,
        fault: IoFault,
    ) -> usize {
        self.client = None;
        error!(topic = TOPIC, port = self.port, "{fault}");
        0
    }
}

impl DebugChannel for DebugTransport {
    /// Possibly partial read
    fn read(
        &mut self,
        buf: &mut [u8],
    ) -> usize {
        if self.client.is_none() {
            return 0;
        }
        let requested = buf.len();
        if requested == 0 {
            return self.fail_closed(IoFault::EmptyBuffer { op: "read" });
        }

        let result = match self.client.as_mut() {
            Some(client) => client.read(buf),
            None => return 0,
        };
        match result {
            Ok(0) => self.fail_closed(IoFault::Eof),
            Ok(got) if got > requested => self.fail_closed(IoFault::Overflow {
                op: "read",
                got,
                requested,
            }),
            Ok(got) => got,
            Err(source) => self.fail_closed(IoFault::Os { op: "read", source }),
        }
    }

    /// Possibly partial write
    fn write(
        &mut self,
        buf: &[u8],
    ) -> usize {
        if self.client.is_none() {
            return 0;
        }
        let requested = buf.len();
        if requested == 0 {
            return self.fail_closed(IoFault::EmptyBuffer { op: "write" });
        }

        let result = match self.client.as_ref() {
            Some(client) => send_no_signal(client, buf),
            None => return 0,
        };
        match result {
            Ok(0) => self.fail_closed(IoFault::NothingWritten),
            Ok(got) if got > requested => self.fail_closed(IoFault::Overflow {
                op: "write",
                got,
                requested,
            }),
            Ok(got) => got,
            Err(source) => self.fail_closed(IoFault::Os { op: "write", source }),
        }
    }

    fn peek(&mut self) -> usize {
        let Some(client) = self.client.as_ref() else {
            return 0;
        };
        match poll_readable(client) {
            Ok(0) => 0,
            Ok(1) => 1,
            Ok(ready) => {
                // one descriptor polled, should never happen
                error!(topic = TOPIC, ready, "poll returned > 1, treating like 1");
                1
            }
            Err(err) => self.fail_closed(IoFault::Poll(err)),
        }
    }
}

fn bind_listener(port: u16) -> Result<Socket, TransportError> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(TransportError::Create)?;
    socket
        .set_reuse_address(true)
        .map_err(TransportError::ReuseAddress)?;

    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    socket
        .bind(&addr.into())
        .map_err(|source| TransportError::Bind { port, source })?;
    socket
        .listen(LISTEN_BACKLOG)
        .map_err(|source| TransportError::Listen { port, source })?;
    Ok(socket)
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn send_no_signal(
    socket: &Socket,
    buf: &[u8],
) -> io::Result<usize> {
    socket.send_with_flags(buf, libc::MSG_NOSIGNAL)
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn send_no_signal(
    socket: &Socket,
    buf: &[u8],
) -> io::Result<usize> {
    // SO_NOSIGPIPE is set on accept where the platform has it
    socket.send(buf)
}

#[cfg(unix)]
fn poll_readable(socket: &Socket) -> io::Result<usize> {
    use std::os::fd::AsRawFd;

    let mut fds = [libc::pollfd {
        fd: socket.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    }];
    // SAFETY: `fds` is a valid, exclusively borrowed array for the whole call.
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, 0) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as usize)
    }
}

#[cfg(not(unix))]
fn poll_readable(socket: &Socket) -> io::Result<usize> {
    use std::mem::MaybeUninit;

    socket.set_nonblocking(true)?;
    let mut byte = [MaybeUninit::<u8>::uninit(); 1];
    let result = socket.peek(&mut byte);
    socket.set_nonblocking(false)?;
    match result {
        Ok(_) => Ok(1),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
        Err(err) => Err(err),
    }
}
