//! Worker-callback handling: freshly-forked workers connect to the
//! loopback master port and announce `GET /?pid=P&version=V`.

use crate::gateway::Gateway;
use crate::net::http;
use crate::net::poll::{HandlerOutcome, PollEntry, SocketHandler, SocketPoll};
use crate::net::server::SocketFactory;
use crate::net::socket::{SocketRef, StreamSocket};
use crate::net::ws::WsProto;

use procpool::ChildProcess;
use std::os::unix::io::RawFd;
use std::sync::Arc;

/// Initial handler for a worker's callback socket: parse exactly one
/// announcement request, register the worker with the pool, and release
/// the socket until a broker claims it.
pub struct PrisonerRequestDispatcher {
    gateway: Arc<Gateway>,
}

impl PrisonerRequestDispatcher {
    pub fn new(gateway: Arc<Gateway>) -> PrisonerRequestDispatcher {
        PrisonerRequestDispatcher { gateway }
    }

    fn reject(&self, socket: &SocketRef, why: &str) -> HandlerOutcome {
        log::error!("Invalid worker announcement: {why}");
        let mut sock = socket.lock().unwrap();
        sock.send(&http::error_response(400, &[]));
        sock.shutdown();
        HandlerOutcome::Close
    }
}

impl SocketHandler for PrisonerRequestDispatcher {
    fn handle_incoming(&mut self, socket: &SocketRef, _poll: &Arc<SocketPoll>) -> HandlerOutcome {
        let parsed = {
            let sock = socket.lock().unwrap();
            http::parse_request(&sock.in_buffer)
        };

        let (request, used) = match parsed {
            Ok(Some(parsed)) => parsed,
            Ok(None) => return HandlerOutcome::Continue, // not enough data yet
            Err(e) => return self.reject(socket, &format!("{e}")),
        };

        if request.method != "GET" || request.path() != "/" {
            return self.reject(
                socket,
                &format!("{} {}", request.method, request.uri),
            );
        }

        let mut pid: i32 = -1;
        let mut version = String::new();
        for (key, value) in request.query_params() {
            match key.as_str() {
                "pid" => pid = value.parse().unwrap_or(-1),
                "version" => version = value,
                _ => {}
            }
        }

        if pid <= 0 {
            return self.reject(socket, &format!("bad pid in [{}]", request.uri));
        }

        log::info!("New child [{pid}] (worker version [{version}])");

        {
            let mut sock = socket.lock().unwrap();

            // Workers speak websocket frames after announcing; complete
            // the upgrade when they ask for one.
            if request.is_websocket_upgrade() {
                match WsProto::upgrade_response(&request) {
                    Ok(response) => sock.send(&response),
                    Err(e) => {
                        drop(sock);
                        return self.reject(socket, &format!("{e}"));
                    }
                }
            }

            sock.consume_input(used);
        }

        self.gateway.set_worker_version(&version);

        let spares = self
            .gateway
            .pool
            .on_child_announce(ChildProcess::new(pid, socket.clone()));
        log::info!("Have {spares} spare children after adding [{pid}]");

        // No traffic expected until a broker claims this worker and its
        // socket joins that broker's poll.
        HandlerOutcome::Release
    }

    fn on_disconnect(&mut self, _socket: &SocketRef) {
        log::debug!("Worker callback connection closed before registration");
    }
}

pub struct PrisonerSocketFactory {
    gateway: Arc<Gateway>,
}

impl PrisonerSocketFactory {
    pub fn new(gateway: Arc<Gateway>) -> PrisonerSocketFactory {
        PrisonerSocketFactory { gateway }
    }
}

impl SocketFactory for PrisonerSocketFactory {
    fn create(&self, fd: RawFd) -> Result<PollEntry, String> {
        Ok(PollEntry {
            socket: StreamSocket::plain(fd).wrap(),
            handler: Box::new(PrisonerRequestDispatcher::new(self.gateway.clone())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::gateway::Limits;

    fn socketpair_refs() -> (SocketRef, RawFd) {
        let mut fds = [0; 2];
        let rc =
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        (StreamSocket::plain(fds[0]).wrap(), fds[1])
    }

    fn feed(gateway: &Arc<Gateway>, bytes: &[u8]) -> (HandlerOutcome, SocketRef, RawFd) {
        let (socket, peer) = socketpair_refs();
        socket.lock().unwrap().in_buffer.extend_from_slice(bytes);

        let mut handler = PrisonerRequestDispatcher::new(gateway.clone());
        let poll = crate::net::poll::SocketPoll::new("prisoner_test_poll");
        let outcome = handler.handle_incoming(&socket, &poll);
        (outcome, socket, peer)
    }

    #[test]
    fn valid_announcement_registers_the_worker() {
        let gateway = Gateway::new(Config::default(), Limits::default());
        gateway.pool.note_spawn_request(1);

        let announce = b"GET /?pid=4321&version=5.3.1 HTTP/1.1\r\n\r\n";
        let (outcome, _socket, peer) = feed(&gateway, announce);

        assert!(matches!(outcome, HandlerOutcome::Release));
        assert_eq!(gateway.pool.available_count(), 1);
        assert_eq!(gateway.pool.outstanding_forks(), 0);
        assert_eq!(gateway.worker_version(), "5.3.1");
        unsafe { libc::close(peer) };
    }

    #[test]
    fn bad_announcement_is_rejected() {
        let gateway = Gateway::new(Config::default(), Limits::default());

        let bogus = b"GET /something-else HTTP/1.1\r\n\r\n";
        let (outcome, socket, peer) = feed(&gateway, bogus);

        assert!(matches!(outcome, HandlerOutcome::Close));
        assert_eq!(gateway.pool.available_count(), 0);

        socket.lock().unwrap().write_outgoing();
        let mut buf = [0u8; 256];
        let count = unsafe { libc::read(peer, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        assert!(String::from_utf8_lossy(&buf[..count as usize]).starts_with("HTTP/1.1 400"));
        unsafe { libc::close(peer) };
    }

    #[test]
    fn missing_pid_is_rejected() {
        let gateway = Gateway::new(Config::default(), Limits::default());
        let (outcome, _socket, peer) = feed(&gateway, b"GET /?version=5.3 HTTP/1.1\r\n\r\n");
        assert!(matches!(outcome, HandlerOutcome::Close));
        unsafe { libc::close(peer) };
    }
}
