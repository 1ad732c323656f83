use crate::error::{GateError, GateResult};
use crate::net::poll::{PollEntry, SocketPoll};

use socket2::{Domain, Socket, Type};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

const LISTEN_BACKLOG: i32 = 64;

/// How many successive ports to try past the configured one.
const PORT_WALK_LIMIT: u16 = 100;

/// Wraps a freshly-accepted fd in a socket + initial handler.
pub trait SocketFactory: Send + Sync {
    fn create(&self, fd: RawFd) -> Result<PollEntry, String>;
}

/// A listening socket plus the accept loop that feeds accepted fds,
/// wrapped by a factory, into a target poll.
pub struct ServerSocket {
    listener: Socket,
    port: u16,
    name: String,
}

impl ServerSocket {
    /// Bind and listen, walking up from `port` while EADDRINUSE.
    pub fn bind(host: &str, port: u16, name: &str) -> GateResult<ServerSocket> {
        let mut candidate = port;

        loop {
            match Self::try_bind(host, candidate) {
                Ok(listener) => {
                    log::info!("Listening for {name} connections on {host}:{candidate}");
                    return Ok(ServerSocket {
                        listener,
                        port: candidate,
                        name: name.to_string(),
                    });
                }
                Err(e) if e.raw_os_error() == Some(libc::EADDRINUSE) => {
                    log::info!("{name} port {candidate} is busy, trying {}", candidate + 1);
                    if candidate - port >= PORT_WALK_LIMIT {
                        return Err(GateError::from(format!(
                            "No free {name} port in [{port}..{candidate}]"
                        )));
                    }
                    candidate += 1;
                }
                Err(e) => {
                    return Err(GateError::from(format!(
                        "Failed to bind {name} socket to {host}:{candidate}: {e}"
                    )))
                }
            }
        }
    }

    fn try_bind(host: &str, port: u16) -> std::io::Result<Socket> {
        let address: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{e}")))?;

        let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;

        // The address may briefly linger from idle client connections
        // when we stop and start.
        socket.set_reuse_address(true)?;
        socket.bind(&address.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        socket.set_nonblocking(true)?;

        Ok(socket)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Spawn the accept thread.  Accepted fds are wrapped by `factory`
    /// and inserted into `target`.
    pub fn start_thread(
        self,
        factory: Arc<dyn SocketFactory>,
        target: Arc<SocketPoll>,
        stop: Arc<AtomicBool>,
    ) -> thread::JoinHandle<()> {
        let name = format!("{}_accept", self.name);
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || self.accept_loop(factory, target, stop))
            .unwrap_or_else(|e| panic!("Cannot start accept thread [{name}]: {e}"))
    }

    fn accept_loop(
        self,
        factory: Arc<dyn SocketFactory>,
        target: Arc<SocketPoll>,
        stop: Arc<AtomicBool>,
    ) {
        let listen_fd = self.listener.as_raw_fd();

        while !stop.load(Ordering::SeqCst) {
            let mut fds = [libc::pollfd {
                fd: listen_fd,
                events: libc::POLLIN,
                revents: 0,
            }];

            let rc = unsafe { libc::poll(fds.as_mut_ptr(), 1, 1000) };
            if rc <= 0 {
                continue;
            }

            // Accept everything pending before polling again.
            loop {
                match self.listener.accept() {
                    Ok((accepted, peer)) => {
                        let fd = accepted.into_raw_fd();
                        log::debug!(
                            "Accepted {} connection #{fd} from {:?}",
                            self.name,
                            peer.as_socket()
                        );

                        match factory.create(fd) {
                            Ok(entry) => target.insert_new_socket(entry),
                            Err(e) => {
                                log::error!("Cannot set up accepted socket #{fd}: {e}");
                                unsafe {
                                    libc::close(fd);
                                }
                            }
                        }
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log::error!("Accept failed on {} socket: {e}", self.name);
                        break;
                    }
                }
            }
        }

        log::debug!("Accept loop [{}] exiting", self.name);
    }
}
