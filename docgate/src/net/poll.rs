use crate::limits::DEFAULT_POLL_TIMEOUT_MS;
use crate::net::socket::{SocketRef, SocketStatus};

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

/// What a handler wants done with its socket after a callback.
pub enum HandlerOutcome {
    Continue,
    /// Flush pending output, then close.
    Close,
    /// Remove from the poll set without closing the fd; some other owner
    /// (a child-process record, a broker) holds the socket now.
    Release,
    /// Remove from this poll and hand the socket to another poll under a
    /// new handler.  The migration handoff for upgrades.
    Migrate {
        target: Arc<SocketPoll>,
        handler: Box<dyn SocketHandler>,
    },
}

/// Per-socket protocol logic attached to a poll entry.
///
/// All callbacks run on the owning poll's thread, serialized per socket
/// within a cycle.
pub trait SocketHandler: Send {
    /// Called when the socket enters a poll's set.
    fn on_connect(&mut self, _socket: &SocketRef, _poll: &Arc<SocketPoll>) {}

    /// Called after fresh bytes landed in the input buffer.  The handler
    /// consumes zero or more complete messages.
    fn handle_incoming(&mut self, socket: &SocketRef, poll: &Arc<SocketPoll>) -> HandlerOutcome;

    /// The poll mask this handler wants, and a chance to lower the cycle
    /// timeout.
    fn poll_events(&mut self, _now: Instant, _timeout_ms: &mut i32) -> i16 {
        libc::POLLIN
    }

    /// Called once per cycle regardless of readiness; lets handlers
    /// enforce idle timeouts.
    fn check_timeout(&mut self, _socket: &SocketRef, _now: Instant) -> HandlerOutcome {
        HandlerOutcome::Continue
    }

    /// Called exactly once when the socket leaves the world.
    fn on_disconnect(&mut self, _socket: &SocketRef) {}
}

pub struct PollEntry {
    pub socket: SocketRef,
    pub handler: Box<dyn SocketHandler>,
}

enum PollAction {
    Insert(PollEntry),
    Defer(Box<dyn FnOnce() + Send>),
}

enum Removal {
    Release(usize),
    Migrate(usize, Arc<SocketPoll>),
}

impl Removal {
    fn index(&self) -> usize {
        match self {
            Removal::Release(i) => *i,
            Removal::Migrate(i, _) => *i,
        }
    }
}

/// A single-threaded reactor owning a set of non-blocking sockets.
///
/// One cycle: poll -> read ready sockets -> dispatch handlers -> drain
/// output -> run deferred cross-thread actions -> prune the closed.
/// Other threads interact only through `insert_new_socket`, `defer` and
/// `wakeup`, all of which enqueue work consumed at the next wakeup.
pub struct SocketPoll {
    name: String,
    entries: Mutex<Vec<PollEntry>>,
    actions: Mutex<Vec<PollAction>>,
    wakeup_read: RawFd,
    wakeup_write: RawFd,
    stop: AtomicBool,
}

impl SocketPoll {
    pub fn new(name: &str) -> Arc<SocketPoll> {
        let mut fds = [0; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert!(rc == 0, "Cannot create wakeup pipe");

        crate::net::socket::set_nonblocking(fds[0]);
        crate::net::socket::set_nonblocking(fds[1]);

        Arc::new(SocketPoll {
            name: name.to_string(),
            entries: Mutex::new(Vec::new()),
            actions: Mutex::new(Vec::new()),
            wakeup_read: fds[0],
            wakeup_write: fds[1],
            stop: AtomicBool::new(false),
        })
    }

    pub fn socket_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Queue a socket+handler for adoption by this poll and wake it.
    pub fn insert_new_socket(&self, entry: PollEntry) {
        self.actions.lock().unwrap().push(PollAction::Insert(entry));
        self.wakeup();
    }

    /// Run a closure on this poll's thread at the next wakeup.
    pub fn defer(&self, f: impl FnOnce() + Send + 'static) {
        self.actions.lock().unwrap().push(PollAction::Defer(Box::new(f)));
        self.wakeup();
    }

    /// One byte down the pipe interrupts a poll() in progress.
    pub fn wakeup(&self) {
        let byte = [1u8];
        unsafe {
            libc::write(self.wakeup_write, byte.as_ptr() as *const libc::c_void, 1);
        }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.wakeup();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Run the reactor until stopped, invoking `wakeup_hook` once per
    /// cycle (forkit supervision, broker housekeeping, stat sampling).
    pub fn run(self: &Arc<Self>, mut wakeup_hook: impl FnMut()) {
        log::debug!("Poll [{}] starting", self.name);

        while !self.is_stopped() {
            self.poll_once(DEFAULT_POLL_TIMEOUT_MS);
            wakeup_hook();
        }

        // One last zero-timeout cycle so actions queued alongside the stop
        // request (close frames, final flushes) still run.
        self.poll_once(0);

        // Drop (and thereby close) whatever is left.
        let remaining = std::mem::take(&mut *self.entries.lock().unwrap());
        log::debug!(
            "Poll [{}] exiting with {} sockets still open",
            self.name,
            remaining.len()
        );
    }

    /// Spawn the dedicated, named reactor thread.
    pub fn start_thread(
        self: &Arc<Self>,
        wakeup_hook: impl FnMut() + Send + 'static,
    ) -> thread::JoinHandle<()> {
        let this = self.clone();
        let name = self.name.clone();
        thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || this.run(wakeup_hook))
            .unwrap_or_else(|e| panic!("Cannot start poll thread [{name}]: {e}"))
    }

    /// A single poll cycle.  Public so tests can drive a poll inline.
    pub fn poll_once(self: &Arc<Self>, max_timeout_ms: i32) {
        let mut entries = self.entries.lock().unwrap();

        // Adopt sockets queued before this cycle.
        self.drain_actions(&mut entries);

        let now = Instant::now();
        let mut timeout_ms = max_timeout_ms;

        let mut fds: Vec<libc::pollfd> = Vec::with_capacity(entries.len() + 1);
        fds.push(libc::pollfd {
            fd: self.wakeup_read,
            events: libc::POLLIN,
            revents: 0,
        });

        for entry in entries.iter_mut() {
            let mask = entry.handler.poll_events(now, &mut timeout_ms);
            let socket = entry.socket.lock().unwrap();
            fds.push(libc::pollfd {
                fd: socket.fd(),
                events: socket.poll_events(mask),
                revents: 0,
            });
        }

        let polled = fds.len() - 1;

        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 && crate::net::socket::last_errno() != libc::EINTR {
            log::error!(
                "Poll [{}] failed: errno {}",
                self.name,
                crate::net::socket::last_errno()
            );
            return;
        }

        if fds[0].revents & libc::POLLIN != 0 {
            self.drain_wakeup();
        }

        // Cross-thread work queued while we slept.  Entries appended here
        // land beyond `polled` and are serviced next cycle.
        self.drain_actions(&mut entries);

        let mut removals: Vec<Removal> = Vec::new();

        for i in 0..polled {
            let revents = fds[i + 1].revents;
            let entry = &mut entries[i];

            if entry.socket.lock().unwrap().is_closed() {
                continue;
            }

            let mut outcome = entry.handler.check_timeout(&entry.socket, now);

            if matches!(outcome, HandlerOutcome::Continue)
                && revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0
            {
                let status = entry.socket.lock().unwrap().read_incoming();
                let has_data = !entry.socket.lock().unwrap().in_buffer.is_empty();

                // Deliver what we have, even ahead of a close.
                if has_data {
                    outcome = entry.handler.handle_incoming(&entry.socket, self);
                }

                match status {
                    SocketStatus::Ok | SocketStatus::Retry => {
                        if !has_data
                            && revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0
                        {
                            entry.socket.lock().unwrap().close_now();
                        }
                    }
                    SocketStatus::Disconnect | SocketStatus::Fatal => {
                        entry.socket.lock().unwrap().close_now();
                    }
                }
            }

            // Drain output on POLLOUT or whenever the handler queued bytes.
            {
                let mut socket = entry.socket.lock().unwrap();
                if !socket.is_closed()
                    && (revents & libc::POLLOUT != 0
                        || socket.out_buffer_len() > 0
                        || socket.is_shutdown_signalled())
                {
                    if socket.write_outgoing() == SocketStatus::Fatal {
                        socket.close_now();
                    }
                }
            }

            match outcome {
                HandlerOutcome::Continue => {}
                HandlerOutcome::Close => {
                    let mut socket = entry.socket.lock().unwrap();
                    socket.shutdown();
                    if socket.out_buffer_len() == 0 {
                        socket.close_now();
                    }
                }
                HandlerOutcome::Release => removals.push(Removal::Release(i)),
                HandlerOutcome::Migrate { target, handler } => {
                    entry.handler = handler;
                    removals.push(Removal::Migrate(i, target));
                }
            }
        }

        // Take released/migrated entries out, highest index first so the
        // earlier indices stay valid.
        removals.sort_by(|a, b| b.index().cmp(&a.index()));
        for removal in removals {
            match removal {
                Removal::Release(i) => {
                    entries.remove(i);
                }
                Removal::Migrate(i, target) => {
                    let entry = entries.remove(i);
                    target.insert_new_socket(entry);
                }
            }
        }

        // Prune closed sockets, notifying each handler exactly once.
        entries.retain_mut(|entry| {
            let closed = entry.socket.lock().unwrap().is_closed();
            if closed {
                entry.handler.on_disconnect(&entry.socket);
            }
            !closed
        });
    }

    fn drain_wakeup(&self) {
        let mut sink = [0u8; 128];
        loop {
            let rc = unsafe {
                libc::read(
                    self.wakeup_read,
                    sink.as_mut_ptr() as *mut libc::c_void,
                    sink.len(),
                )
            };
            if rc <= 0 {
                break;
            }
        }
    }

    fn drain_actions(self: &Arc<Self>, entries: &mut Vec<PollEntry>) {
        loop {
            let action = {
                let mut actions = self.actions.lock().unwrap();
                if actions.is_empty() {
                    return;
                }
                actions.remove(0)
            };

            match action {
                PollAction::Insert(mut entry) => {
                    entry.handler.on_connect(&entry.socket, self);
                    entries.push(entry);
                }
                PollAction::Defer(f) => f(),
            }
        }
    }
}

impl Drop for SocketPoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wakeup_read);
            libc::close(self.wakeup_write);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::socket::StreamSocket;
    use std::sync::mpsc;

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let rc =
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    /// Reports every received chunk over a channel and echoes it back.
    struct EchoHandler {
        seen: mpsc::Sender<Vec<u8>>,
    }

    impl SocketHandler for EchoHandler {
        fn handle_incoming(&mut self, socket: &SocketRef, _poll: &Arc<SocketPoll>) -> HandlerOutcome {
            let mut sock = socket.lock().unwrap();
            let data = std::mem::take(&mut sock.in_buffer);
            sock.send(&data);
            self.seen.send(data).ok();
            HandlerOutcome::Continue
        }
    }

    /// Migrates its socket to `target` on the first message.
    struct MigratingHandler {
        target: Arc<SocketPoll>,
        seen: mpsc::Sender<Vec<u8>>,
    }

    impl SocketHandler for MigratingHandler {
        fn handle_incoming(&mut self, socket: &SocketRef, _poll: &Arc<SocketPoll>) -> HandlerOutcome {
            socket.lock().unwrap().consume_input(usize::MAX);
            HandlerOutcome::Migrate {
                target: self.target.clone(),
                handler: Box::new(EchoHandler {
                    seen: self.seen.clone(),
                }),
            }
        }
    }

    fn raw_write(fd: RawFd, data: &[u8]) {
        let rc = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
        assert_eq!(rc, data.len() as isize);
    }

    fn raw_read(fd: RawFd) -> Vec<u8> {
        let mut buf = [0u8; 1024];
        let rc = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        assert!(rc >= 0);
        buf[..rc as usize].to_vec()
    }

    #[test]
    fn echo_roundtrip_through_one_cycle() {
        let poll = SocketPoll::new("test_poll");
        let (ours, theirs) = socketpair();
        let (tx, rx) = mpsc::channel();

        poll.insert_new_socket(PollEntry {
            socket: StreamSocket::plain(ours).wrap(),
            handler: Box::new(EchoHandler { seen: tx }),
        });

        raw_write(theirs, b"ping");
        poll.poll_once(100);

        assert_eq!(rx.try_recv().unwrap(), b"ping");
        assert_eq!(raw_read(theirs), b"ping");
        assert_eq!(poll.socket_count(), 1);

        unsafe { libc::close(theirs) };
    }

    #[test]
    fn migration_moves_ownership_to_exactly_one_poll() {
        let source = SocketPoll::new("source_poll");
        let target = SocketPoll::new("target_poll");
        let (ours, theirs) = socketpair();
        let (tx, rx) = mpsc::channel();

        source.insert_new_socket(PollEntry {
            socket: StreamSocket::plain(ours).wrap(),
            handler: Box::new(MigratingHandler {
                target: target.clone(),
                seen: tx,
            }),
        });

        raw_write(theirs, b"upgrade");
        source.poll_once(100);

        // At the cycle boundary the socket belongs to the target only.
        assert_eq!(source.socket_count(), 0);
        target.poll_once(0);
        assert_eq!(target.socket_count(), 1);

        // And the replacement handler services it there.
        raw_write(theirs, b"after");
        target.poll_once(100);
        assert_eq!(rx.try_recv().unwrap(), b"after");

        unsafe { libc::close(theirs) };
    }

    #[test]
    fn disconnect_prunes_the_socket() {
        let poll = SocketPoll::new("prune_poll");
        let (ours, theirs) = socketpair();
        let (tx, _rx) = mpsc::channel();

        poll.insert_new_socket(PollEntry {
            socket: StreamSocket::plain(ours).wrap(),
            handler: Box::new(EchoHandler { seen: tx }),
        });
        poll.poll_once(0);
        assert_eq!(poll.socket_count(), 1);

        unsafe { libc::close(theirs) };
        poll.poll_once(100);
        assert_eq!(poll.socket_count(), 0);
    }

    #[test]
    fn deferred_actions_run_on_the_poll_cycle() {
        let poll = SocketPoll::new("defer_poll");
        let (tx, rx) = mpsc::channel();

        poll.defer(move || {
            tx.send(42).ok();
        });
        poll.poll_once(100);

        assert_eq!(rx.try_recv().unwrap(), 42);
    }
}
