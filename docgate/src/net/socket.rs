use crate::net::tls::{TlsStream, TlsWants};

use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

/// Sockets are shared so they can survive handoff between polls; at any
/// poll-cycle boundary exactly one poll's entry set holds a given socket.
pub type SocketRef = Arc<Mutex<StreamSocket>>;

/// Result of a kernel-facing read or write pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SocketStatus {
    /// Progress was made (possibly zero bytes); try again next cycle.
    Ok,
    /// EAGAIN/EINTR; retry next poll cycle.
    Retry,
    /// Peer closed cleanly.
    Disconnect,
    /// Unrecoverable error; drop the socket.
    Fatal,
}

/// A non-blocking data-streaming socket: one fd plus input and output byte
/// buffers.  Buffers append monotonically and compact on consumption; the
/// handler decides frame boundaries, never this layer.
pub struct StreamSocket {
    fd: RawFd,
    pub in_buffer: Vec<u8>,
    out_buffer: Vec<u8>,
    shutdown_signalled: bool,
    closed: bool,
    tls: Option<TlsStream>,
}

impl StreamSocket {
    pub fn plain(fd: RawFd) -> StreamSocket {
        set_nonblocking(fd);
        StreamSocket {
            fd,
            in_buffer: Vec::new(),
            out_buffer: Vec::new(),
            shutdown_signalled: false,
            closed: false,
            tls: None,
        }
    }

    pub fn tls(fd: RawFd, config: Arc<rustls::ServerConfig>) -> Result<StreamSocket, String> {
        let mut socket = StreamSocket::plain(fd);
        socket.tls = Some(TlsStream::new(config)?);
        Ok(socket)
    }

    pub fn wrap(self) -> SocketRef {
        Arc::new(Mutex::new(self))
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_shutdown_signalled(&self) -> bool {
        self.shutdown_signalled
    }

    pub fn out_buffer_len(&self) -> usize {
        self.out_buffer.len()
    }

    /// Append bytes for delivery.  Drained FIFO by the owning poll.
    pub fn send(&mut self, data: &[u8]) {
        if !self.closed && !self.shutdown_signalled {
            self.out_buffer.extend_from_slice(data);
        }
    }

    /// Consume `count` parsed bytes from the front of the input buffer.
    pub fn consume_input(&mut self, count: usize) {
        self.in_buffer.drain(..count.min(self.in_buffer.len()));
    }

    /// Close once the output buffer has drained.
    pub fn shutdown(&mut self) {
        self.shutdown_signalled = true;
        if let Some(ref mut tls) = self.tls {
            tls.signal_close_notify();
        }
    }

    pub fn close_now(&mut self) {
        if !self.closed {
            self.closed = true;
            unsafe {
                libc::close(self.fd);
            }
        }
    }

    /// Read everything the kernel has for us into the input buffer.
    pub fn read_incoming(&mut self) -> SocketStatus {
        if self.closed {
            return SocketStatus::Disconnect;
        }

        if self.tls.is_some() {
            let mut tls = self.tls.take().unwrap();
            let status = tls.read_incoming(self.fd, &mut self.in_buffer);
            self.tls = Some(tls);
            return status;
        }

        let mut chunk = [0u8; 16 * 1024];
        loop {
            let rc = unsafe { libc::read(self.fd, chunk.as_mut_ptr() as *mut libc::c_void, chunk.len()) };
            if rc > 0 {
                self.in_buffer.extend_from_slice(&chunk[..rc as usize]);
            } else if rc == 0 {
                return SocketStatus::Disconnect;
            } else {
                return match last_errno() {
                    libc::EAGAIN => SocketStatus::Ok,
                    libc::EINTR => continue,
                    errno => {
                        log::debug!("Socket #{} read failed: errno {errno}", self.fd);
                        SocketStatus::Fatal
                    }
                };
            }
        }
    }

    /// Drain as much of the output buffer as the kernel accepts.
    pub fn write_outgoing(&mut self) -> SocketStatus {
        if self.closed {
            return SocketStatus::Disconnect;
        }

        let status = if self.tls.is_some() {
            let mut tls = self.tls.take().unwrap();
            let status = tls.write_outgoing(self.fd, &mut self.out_buffer);
            self.tls = Some(tls);
            status
        } else {
            self.write_plain()
        };

        if self.shutdown_signalled && self.out_buffer.is_empty() {
            self.close_now();
        }

        status
    }

    fn write_plain(&mut self) -> SocketStatus {
        while !self.out_buffer.is_empty() {
            let rc = unsafe {
                libc::write(
                    self.fd,
                    self.out_buffer.as_ptr() as *const libc::c_void,
                    self.out_buffer.len(),
                )
            };

            if rc > 0 {
                self.out_buffer.drain(..rc as usize);
            } else {
                return match last_errno() {
                    libc::EAGAIN => SocketStatus::Retry,
                    libc::EINTR => continue,
                    errno => {
                        log::debug!("Socket #{} write failed: errno {errno}", self.fd);
                        SocketStatus::Fatal
                    }
                };
            }
        }

        SocketStatus::Ok
    }

    /// The events this socket wants from the next poll, given what its
    /// handler asked for.  A TLS stream mid-want overrides everything:
    /// the library cannot make progress until its preferred direction is
    /// ready.
    pub fn poll_events(&self, handler_events: i16) -> i16 {
        masked_poll_events(
            self.tls.as_ref().map(|t| t.wants()),
            handler_events,
            !self.out_buffer.is_empty(),
            self.shutdown_signalled,
        )
    }
}

impl Drop for StreamSocket {
    fn drop(&mut self) {
        self.close_now();
    }
}

/// Combine the handler's mask with buffer state and any TLS want.
/// A pending want forces the mask to exactly that direction: the library
/// is waiting on it before it can do anything else.
pub(crate) fn masked_poll_events(
    wants: Option<TlsWants>,
    handler_events: i16,
    out_pending: bool,
    close_pending: bool,
) -> i16 {
    match wants {
        Some(TlsWants::Read) => return libc::POLLIN,
        Some(TlsWants::Write) => return libc::POLLOUT,
        _ => {}
    }

    let mut events = handler_events | libc::POLLIN;
    if out_pending || close_pending {
        events |= libc::POLLOUT;
    }
    events
}

pub fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

pub fn set_nonblocking(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn buffers_drain_fifo() {
        let (a, b) = socketpair();
        let mut left = StreamSocket::plain(a);
        let mut right = StreamSocket::plain(b);

        left.send(b"hello ");
        left.send(b"world");
        assert_eq!(left.out_buffer_len(), 11);
        assert_eq!(left.write_outgoing(), SocketStatus::Ok);
        assert_eq!(left.out_buffer_len(), 0);

        assert_eq!(right.read_incoming(), SocketStatus::Ok);
        assert_eq!(&right.in_buffer, b"hello world");

        right.consume_input(6);
        assert_eq!(&right.in_buffer, b"world");
    }

    #[test]
    fn disconnect_is_reported() {
        let (a, b) = socketpair();
        let mut right = StreamSocket::plain(b);
        unsafe {
            libc::close(a);
        }
        assert_eq!(right.read_incoming(), SocketStatus::Disconnect);
    }

    #[test]
    fn pollout_only_with_pending_output() {
        let (a, b) = socketpair();
        let mut sock = StreamSocket::plain(a);
        let _other = StreamSocket::plain(b);

        assert_eq!(sock.poll_events(libc::POLLIN), libc::POLLIN);

        sock.send(b"x");
        assert_eq!(
            sock.poll_events(libc::POLLIN),
            libc::POLLIN | libc::POLLOUT
        );
    }

    #[test]
    fn tls_wants_force_exact_direction() {
        // wants=Read suppresses even an explicit handler POLLOUT; the
        // library must see readable data before it can write.
        assert_eq!(
            masked_poll_events(Some(TlsWants::Read), libc::POLLOUT, true, false),
            libc::POLLIN
        );
        assert_eq!(
            masked_poll_events(Some(TlsWants::Write), libc::POLLIN, false, false),
            libc::POLLOUT
        );
        assert_eq!(
            masked_poll_events(Some(TlsWants::Neither), libc::POLLIN, true, false),
            libc::POLLIN | libc::POLLOUT
        );
    }

    #[test]
    fn shutdown_closes_after_drain() {
        let (a, b) = socketpair();
        let mut sock = StreamSocket::plain(a);
        let _other = StreamSocket::plain(b);

        sock.send(b"bye");
        sock.shutdown();
        assert!(!sock.is_closed());
        sock.write_outgoing();
        assert!(sock.is_closed());
    }
}
