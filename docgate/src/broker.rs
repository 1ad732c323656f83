//! Per-document actor: owns one worker process link and N client
//! sessions, serializes all document traffic on its own poll thread.

use crate::admin::Admin;
use crate::limits::JAILED_DOCUMENT_ROOT;
use crate::net::http;
use crate::net::poll::{HandlerOutcome, PollEntry, SocketHandler, SocketPoll};
use crate::net::socket::SocketRef;
use crate::net::ws::{WsOpcode, WsProto};
use crate::trace::TraceFileWriter;

use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Created -> Loading -> Ready -> Closing -> Dead.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BrokerStatus {
    Created,
    Loading,
    Ready,
    Closing,
    Dead,
}

/// Verdict of one cleaner pass over a broker.
#[derive(Debug, PartialEq)]
pub enum Cleanup {
    /// Broker busy; skip and retry next pass.
    Busy,
    Keep,
    /// Terminated; remove from the broker map.
    Remove,
}

struct SessionInfo {
    socket: SocketRef,
}

/// Where to stream a conversion result once the worker reports saveas
/// completion.
struct SaveAsTarget {
    socket: SocketRef,
    format: String,
    upload_dir: Option<PathBuf>,
}

struct BrokerState {
    status: BrokerStatus,
    child_pid: i32,
    worker_socket: Option<SocketRef>,
    sessions: HashMap<u32, SessionInfo>,
    save_as: Option<SaveAsTarget>,
    last_activity: Instant,
    marked_to_destroy: bool,
    load_sent: bool,
}

pub struct DocumentBroker {
    doc_key: String,
    public_uri: String,
    child_root: String,
    poll: Arc<SocketPoll>,
    admin: Arc<Admin>,
    trace: Option<Arc<Mutex<TraceFileWriter>>>,
    inner: Mutex<BrokerState>,
}

/// Canonical document identity: the percent-decoded path of the public
/// URI.  Two requests with the same effective URI share a broker.
pub fn derive_doc_key(public_uri: &str) -> String {
    let decoded = percent_decode_str(public_uri).decode_utf8_lossy();
    let without_query = match decoded.split_once('?') {
        Some((path, _)) => path.to_string(),
        None => decoded.to_string(),
    };

    // Strip the scheme+authority down to the path for URL-shaped URIs.
    if let Ok(url) = url::Url::parse(&without_query) {
        if url.scheme() == "http" || url.scheme() == "https" || url.scheme() == "file" {
            return url.path().to_string();
        }
    }

    without_query
}

/// Decode the percent-encoded public URI a client put in its websocket
/// path, dropping the query string.
pub fn sanitize_uri(raw: &str) -> String {
    let decoded = percent_decode_str(raw).decode_utf8_lossy().to_string();
    match decoded.split_once('?') {
        Some((path, _)) => path.to_string(),
        None => decoded,
    }
}

impl DocumentBroker {
    pub fn new(
        doc_key: &str,
        public_uri: &str,
        child_root: &str,
        admin: Arc<Admin>,
        trace: Option<Arc<Mutex<TraceFileWriter>>>,
    ) -> Arc<DocumentBroker> {
        log::debug!("New DocumentBroker for docKey [{doc_key}]");

        Arc::new(DocumentBroker {
            doc_key: doc_key.to_string(),
            public_uri: public_uri.to_string(),
            child_root: child_root.to_string(),
            poll: SocketPoll::new("docbroker_poll"),
            admin,
            trace,
            inner: Mutex::new(BrokerState {
                status: BrokerStatus::Created,
                child_pid: -1,
                worker_socket: None,
                sessions: HashMap::new(),
                save_as: None,
                last_activity: Instant::now(),
                marked_to_destroy: false,
                load_sent: false,
            }),
        })
    }

    pub fn doc_key(&self) -> &str {
        &self.doc_key
    }

    pub fn public_uri(&self) -> &str {
        &self.public_uri
    }

    pub fn poll(&self) -> &Arc<SocketPoll> {
        &self.poll
    }

    pub fn status(&self) -> BrokerStatus {
        self.inner.lock().unwrap().status
    }

    pub fn child_pid(&self) -> i32 {
        self.inner.lock().unwrap().child_pid
    }

    /// The jail id is the worker's decimal pid; jail paths hang off it.
    pub fn jail_id(&self) -> String {
        let pid = self.child_pid();
        if pid > 0 {
            pid.to_string()
        } else {
            String::new()
        }
    }

    pub fn jail_document_root(&self) -> PathBuf {
        let mut root = PathBuf::from(&self.child_root);
        root.push(self.jail_id());
        root.push(JAILED_DOCUMENT_ROOT.trim_start_matches('/'));
        root
    }

    pub fn is_alive(&self) -> bool {
        self.inner.lock().unwrap().status != BrokerStatus::Dead
    }

    /// A load has at least been requested; only freshly-created brokers
    /// are unloaded.
    pub fn is_loaded(&self) -> bool {
        self.status() != BrokerStatus::Created
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    pub fn idle_time_secs(&self) -> u64 {
        self.inner.lock().unwrap().last_activity.elapsed().as_secs()
    }

    pub fn is_marked_to_destroy(&self) -> bool {
        self.inner.lock().unwrap().marked_to_destroy
    }

    pub fn mark_to_destroy(&self) {
        self.inner.lock().unwrap().marked_to_destroy = true;
    }

    /// Spin up the broker's reactor thread.
    pub fn start_thread(self: &Arc<Self>) -> std::thread::JoinHandle<()> {
        let this = self.clone();
        self.poll.start_thread(move || this.housekeep())
    }

    fn housekeep(&self) {
        if crate::gateway::is_termination_requested() {
            self.poll.stop();
            return;
        }

        let state = self.inner.lock().unwrap();
        if state.status == BrokerStatus::Dead && state.sessions.is_empty() {
            self.poll.stop();
        }
    }

    /// Register a client session whose socket the dispatcher has already
    /// migrated into our poll, and wake the broker.
    pub fn queue_session(&self, session_id: u32, socket: SocketRef, read_only: bool) {
        log::info!(
            "DocBroker [{}] queueing {} session {session_id}",
            self.doc_key,
            if read_only { "readonly" } else { "writable" }
        );

        let mut state = self.inner.lock().unwrap();
        state.sessions.insert(session_id, SessionInfo { socket });
        state.last_activity = Instant::now();

        if state.status == BrokerStatus::Created {
            state.status = BrokerStatus::Loading;
        }

        let pid = state.child_pid;
        let want_load = !state.load_sent && state.worker_socket.is_some();
        if want_load {
            state.load_sent = true;
        }
        drop(state);

        if want_load {
            self.send_load();
        }

        if pid > 0 {
            self.admin
                .add_document(&self.doc_key, pid, &self.public_uri, session_id);
        }

        self.poll.wakeup();
    }

    /// Adopt a worker from the pool: its socket joins our poll under a
    /// WorkerLink and the document load begins.
    pub fn assign_child(self: &Arc<Self>, pid: i32, socket: SocketRef) {
        log::info!(
            "Assigning child [{pid}] to DocumentBroker for docKey [{}]",
            self.doc_key
        );

        let mut state = self.inner.lock().unwrap();
        state.child_pid = pid;
        state.worker_socket = Some(socket.clone());

        let want_load = !state.load_sent && !state.sessions.is_empty();
        if want_load {
            state.load_sent = true;
        }
        drop(state);

        self.poll.insert_new_socket(PollEntry {
            socket,
            handler: Box::new(WorkerLink {
                broker: self.clone(),
                ws: WsProto::new(),
            }),
        });

        if want_load {
            self.send_load();
        }
    }

    fn send_load(&self) {
        let encoded = utf8_percent_encode(&self.public_uri, NON_ALPHANUMERIC).to_string();
        self.forward_to_worker(format!("load url={encoded}"));
    }

    /// Queue one framed text line for the worker.  Safe from any thread:
    /// the append happens on the broker's poll.
    pub fn forward_to_worker(&self, message: String) {
        let socket = match self.inner.lock().unwrap().worker_socket.clone() {
            Some(socket) => socket,
            None => {
                log::warn!(
                    "DocBroker [{}] has no worker for message [{message}]",
                    self.doc_key
                );
                return;
            }
        };

        self.poll.defer(move || {
            let mut sock = socket.lock().unwrap();
            WsProto::send_frame(&mut sock, WsOpcode::Text, message.as_bytes());
        });
    }

    /// A client command arrives; stamp it with the session envelope and
    /// relay in arrival order.
    pub fn forward_client_command(&self, session_id: u32, command: &str) {
        self.inner.lock().unwrap().last_activity = Instant::now();
        self.admin.update_last_activity(&self.doc_key);
        self.forward_to_worker(format!("msg {session_id} {command}"));
    }

    /// One assembled message from the worker.  Runs on the broker poll.
    pub fn handle_worker_message(&self, payload: &[u8]) {
        let text = String::from_utf8_lossy(payload).to_string();
        log::trace!("DocBroker [{}] worker message [{text}]", self.doc_key);

        self.inner.lock().unwrap().last_activity = Instant::now();

        let mut tokens = text.splitn(3, ' ');
        match tokens.next().unwrap_or("") {
            "status:" => {
                let mut state = self.inner.lock().unwrap();
                if state.status == BrokerStatus::Loading {
                    state.status = BrokerStatus::Ready;
                    log::info!("DocBroker [{}] is ready", self.doc_key);
                }
                drop(state);
                self.trace_event(&text);
                self.broadcast(&text);
            }
            "statusindicator:" => {
                self.trace_event(&text);
                self.broadcast(&text);
            }
            "msg" => {
                // Routed back to the originating session.
                let id = tokens.next().and_then(|t| t.parse::<u32>().ok());
                let rest = tokens.next().unwrap_or("");
                match id {
                    Some(id) => self.send_to_session(id, rest),
                    None => log::warn!(
                        "DocBroker [{}] worker message with bad session id: [{text}]",
                        self.doc_key
                    ),
                }
            }
            "propchange" => {
                // propchange mem <dirty>: telemetry for the console, not
                // for browser sessions.
                let dirty = match (tokens.next(), tokens.next()) {
                    (Some("mem"), Some(value)) => value.trim().parse::<usize>().ok(),
                    _ => None,
                };
                match dirty {
                    Some(dirty) => self.admin.update_memory_dirty(&self.doc_key, dirty),
                    None => log::warn!(
                        "DocBroker [{}] malformed propchange: [{text}]",
                        self.doc_key
                    ),
                }
            }
            "saveas:" => self.complete_save_as(&text),
            _ => self.broadcast(&text),
        }
    }

    fn trace_event(&self, data: &str) {
        if let Some(ref trace) = self.trace {
            trace.lock().unwrap().event(&self.doc_key, "", data);
        }
    }

    /// Send one text frame to every attached session.  Broker thread only.
    fn broadcast(&self, message: &str) {
        let state = self.inner.lock().unwrap();
        for (session_id, info) in state.sessions.iter() {
            if let Some(ref trace) = self.trace {
                trace
                    .lock()
                    .unwrap()
                    .outgoing(&self.doc_key, &session_id.to_string(), message);
            }
            let mut sock = info.socket.lock().unwrap();
            WsProto::send_frame(&mut sock, WsOpcode::Text, message.as_bytes());
        }
    }

    fn send_to_session(&self, session_id: u32, message: &str) {
        let state = self.inner.lock().unwrap();
        if let Some(info) = state.sessions.get(&session_id) {
            if let Some(ref trace) = self.trace {
                trace
                    .lock()
                    .unwrap()
                    .outgoing(&self.doc_key, &session_id.to_string(), message);
            }
            let mut sock = info.socket.lock().unwrap();
            WsProto::send_frame(&mut sock, WsOpcode::Text, message.as_bytes());
        }
    }

    /// Thread-safe "notify every session" used by the gateway for
    /// disk-full and shutdown alerts.
    pub fn alert_all_users(self: &Arc<Self>, message: &str) {
        let this = self.clone();
        let message = message.to_string();
        self.poll.defer(move || this.broadcast(&message));
    }

    /// A session's socket went away.  Runs on the broker poll.
    pub fn remove_session(&self, session_id: u32) {
        let mut state = self.inner.lock().unwrap();
        if state.sessions.remove(&session_id).is_none() {
            return;
        }

        log::debug!(
            "DocBroker [{}] removed session {session_id}; {} remain",
            self.doc_key,
            state.sessions.len()
        );
        state.last_activity = Instant::now();

        if state.sessions.is_empty() && state.status != BrokerStatus::Dead {
            state.status = BrokerStatus::Closing;
        }
        drop(state);

        self.admin.remove_document_view(&self.doc_key, session_id);
    }

    /// The worker socket ended: every session loses its document.
    pub fn child_socket_terminated(&self) {
        let mut state = self.inner.lock().unwrap();
        if state.status == BrokerStatus::Dead {
            return;
        }

        log::warn!(
            "DocBroker [{}] worker [{}] socket terminated",
            self.doc_key,
            state.child_pid
        );
        state.status = BrokerStatus::Dead;
        state.worker_socket = None;

        let sessions: Vec<SocketRef> =
            state.sessions.values().map(|s| s.socket.clone()).collect();
        drop(state);

        for socket in sessions {
            let mut sock = socket.lock().unwrap();
            WsProto::send_frame(
                &mut sock,
                WsOpcode::Text,
                b"error: cmd=internal kind=unexpected",
            );
            let mut ws = WsProto::new();
            ws.shutdown(&mut sock, crate::net::ws::STATUS_GOING_AWAY, "");
        }

        self.admin.remove_document(&self.doc_key);
    }

    /// Kill the worker and close everything down.  `reason` is "idle"
    /// for reaped-idle documents, empty for unexpected deaths.
    pub fn terminate_child(&self, reason: &str) {
        let mut state = self.inner.lock().unwrap();
        log::info!(
            "DocBroker [{}] terminating child [{}] with reason [{reason}]",
            self.doc_key,
            state.child_pid
        );

        if state.child_pid > 0 {
            unsafe {
                libc::kill(state.child_pid, libc::SIGTERM);
            }
        }

        state.status = BrokerStatus::Dead;
        let worker = state.worker_socket.take();
        let sessions: Vec<SocketRef> =
            state.sessions.values().map(|s| s.socket.clone()).collect();
        state.sessions.clear();
        drop(state);

        let reason = reason.to_string();
        self.poll.defer(move || {
            for socket in &sessions {
                let mut sock = socket.lock().unwrap();
                let mut ws = WsProto::new();
                ws.shutdown(&mut sock, crate::net::ws::STATUS_GOING_AWAY, &reason);
            }
            if let Some(worker) = worker {
                worker.lock().unwrap().shutdown();
            }
        });

        self.admin.remove_document(&self.doc_key);
        self.poll.stop();
    }

    /// One cleaner pass.  A busy broker is skipped rather than waited on.
    pub fn cleanup_pass(&self, idle_limit: Duration) -> Cleanup {
        let state = match self.inner.try_lock() {
            Ok(state) => state,
            Err(_) => return Cleanup::Busy,
        };

        let idle = state.last_activity.elapsed() >= idle_limit;
        let child_dead =
            state.child_pid > 0 && unsafe { libc::kill(state.child_pid, 0) != 0 };
        let dead = state.status == BrokerStatus::Dead || child_dead;
        let loaded = !matches!(state.status, BrokerStatus::Created);
        // An in-flight conversion holds the broker open like a session.
        let unused = state.sessions.is_empty() && state.save_as.is_none();
        let eligible = (loaded || state.marked_to_destroy) && (unused || dead || idle);

        drop(state);

        if eligible {
            log::info!(
                "Terminating {} DocumentBroker for docKey [{}]",
                if idle { "idle" } else { "dead" },
                self.doc_key
            );
            self.terminate_child(if idle { "idle" } else { "" });
            Cleanup::Remove
        } else {
            Cleanup::Keep
        }
    }

    /// Arm the conversion driver: load the uploaded document, ask the
    /// worker to save it in the target format, and remember where the
    /// artifact gets streamed once the worker reports completion.
    pub fn start_conversion(&self, socket: SocketRef, format: &str, upload_dir: Option<PathBuf>) {
        {
            let mut state = self.inner.lock().unwrap();
            state.save_as = Some(SaveAsTarget {
                socket,
                format: format.to_string(),
                upload_dir,
            });
            if state.status == BrokerStatus::Created {
                state.status = BrokerStatus::Loading;
            }
            state.load_sent = true;
        }

        self.send_load();

        let filename = Path::new(&self.public_uri)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "document".to_string());
        let to_url = format!("file://{JAILED_DOCUMENT_ROOT}{filename}.{format}");
        let encoded = utf8_percent_encode(&to_url, NON_ALPHANUMERIC).to_string();

        self.forward_to_worker(format!("saveas url={encoded} format={format} options="));
    }

    /// The worker finished a saveas; stream the artifact back as the
    /// HTTP response on the stashed conversion socket.
    fn complete_save_as(&self, message: &str) {
        let target = match self.inner.lock().unwrap().save_as.take() {
            Some(target) => target,
            None => {
                log::warn!(
                    "DocBroker [{}] unexpected saveas completion [{message}]",
                    self.doc_key
                );
                return;
            }
        };

        // saveas: url=<encoded file url>
        let url = message
            .split_whitespace()
            .find_map(|t| t.strip_prefix("url="))
            .map(|u| percent_decode_str(u).decode_utf8_lossy().to_string())
            .unwrap_or_default();

        let jail_relative = url
            .strip_prefix("file://")
            .unwrap_or(&url)
            .trim_start_matches(JAILED_DOCUMENT_ROOT)
            .to_string();
        let artifact = self.jail_document_root().join(&jail_relative);

        log::info!(
            "DocBroker [{}] conversion artifact at [{}]",
            self.doc_key,
            artifact.display()
        );

        let response = match std::fs::read(&artifact) {
            Ok(body) => http::ok_response(
                content_type_for_format(&target.format),
                &body,
                &[(
                    "Content-Disposition",
                    format!("attachment; filename=\"{jail_relative}\""),
                )],
            ),
            Err(e) => {
                log::error!(
                    "DocBroker [{}] cannot read conversion artifact: {e}",
                    self.doc_key
                );
                http::error_response(500, &[])
            }
        };

        {
            let mut sock = target.socket.lock().unwrap();
            sock.send(&response);
            sock.shutdown();
        }

        // Remove the upload staging directory and the jail artifact.
        std::fs::remove_file(&artifact).ok();
        if let Some(dir) = target.upload_dir {
            std::fs::remove_dir_all(dir).ok();
        }

        self.mark_to_destroy();
        self.admin.remove_document(&self.doc_key);
    }
}

pub fn content_type_for_format(format: &str) -> &'static str {
    match format {
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "html" => "text/html",
        "png" => "image/png",
        "svg" => "image/svg+xml",
        "docx" => {
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        }
        "odt" => "application/vnd.oasis.opendocument.text",
        _ => "application/octet-stream",
    }
}

/// Poll handler for the worker's socket while attached to a broker.
pub struct WorkerLink {
    broker: Arc<DocumentBroker>,
    ws: WsProto,
}

impl SocketHandler for WorkerLink {
    fn handle_incoming(&mut self, socket: &SocketRef, _poll: &Arc<SocketPoll>) -> HandlerOutcome {
        let mut messages: Vec<Vec<u8>> = Vec::new();

        let result = {
            let mut sock = socket.lock().unwrap();
            self.ws.read_messages(&mut sock, &mut |opcode, payload| {
                if opcode == WsOpcode::Text {
                    messages.push(payload);
                }
            })
        };

        for payload in &messages {
            self.broker.handle_worker_message(payload);
        }

        match result {
            Ok(false) => HandlerOutcome::Continue,
            Ok(true) => HandlerOutcome::Close,
            Err(e) => {
                log::error!(
                    "DocBroker [{}] worker websocket error: {e}",
                    self.broker.doc_key()
                );
                HandlerOutcome::Close
            }
        }
    }

    fn on_disconnect(&mut self, _socket: &SocketRef) {
        self.broker.child_socket_terminated();
    }
}

/// No-op handler parked on a conversion client's socket while the worker
/// produces the artifact; the broker writes the HTTP response through the
/// stashed socket reference.
pub struct ConvertWaiter;

impl SocketHandler for ConvertWaiter {
    fn handle_incoming(&mut self, socket: &SocketRef, _poll: &Arc<SocketPoll>) -> HandlerOutcome {
        // Anything further from the client is noise; drop it.
        socket.lock().unwrap().consume_input(usize::MAX);
        HandlerOutcome::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_key_is_deterministic_and_query_free() {
        let a = derive_doc_key("http%3A%2F%2Fx%2Fa.odt");
        let b = derive_doc_key("http://x/a.odt");
        assert_eq!(a, b);
        assert_eq!(a, "/a.odt");

        let c = derive_doc_key("http://x/a.odt?permission=readonly");
        assert_eq!(c, a);
    }

    #[test]
    fn doc_key_for_plain_paths() {
        assert_eq!(derive_doc_key("/tmp/up/hello.txt"), "/tmp/up/hello.txt");
    }

    #[test]
    fn sanitize_strips_query() {
        assert_eq!(
            sanitize_uri("http%3A%2F%2Fx%2Fa.odt%3Ffoo%3Dbar"),
            "http://x/a.odt"
        );
    }

    #[test]
    fn content_types() {
        assert_eq!(content_type_for_format("pdf"), "application/pdf");
        assert_eq!(content_type_for_format("zzz"), "application/octet-stream");
    }

    #[test]
    fn broker_lifecycle_states() {
        let admin = Admin::new();
        let broker = DocumentBroker::new("/a.odt", "http://x/a.odt", "/tmp/jails", admin, None);
        assert_eq!(broker.status(), BrokerStatus::Created);
        assert!(broker.is_alive());
        assert!(!broker.is_loaded());
        assert_eq!(broker.session_count(), 0);
        assert_eq!(broker.jail_id(), "");
    }

    #[test]
    fn propchange_goes_to_the_console_not_to_sessions() {
        let admin = Admin::new();
        let broker = DocumentBroker::new("/a.odt", "http://x/a.odt", "/tmp/jails", admin, None);

        let mut fds = [0; 2];
        let rc =
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        let session_socket = crate::net::socket::StreamSocket::plain(fds[0]).wrap();

        broker.queue_session(1, session_socket.clone(), false);

        // Telemetry lines are routed to the admin model, never framed to
        // browser sessions.
        broker.handle_worker_message(b"propchange mem 2048");
        assert_eq!(session_socket.lock().unwrap().out_buffer_len(), 0);

        // Indicator lines do reach sessions.
        broker.handle_worker_message(b"statusindicator: ok");
        assert!(session_socket.lock().unwrap().out_buffer_len() > 0);

        unsafe { libc::close(fds[1]) };
    }

    #[test]
    fn cleanup_pass_skips_fresh_brokers_and_reaps_marked_ones() {
        let admin = Admin::new();
        let broker = DocumentBroker::new("/a.odt", "http://x/a.odt", "/tmp/jails", admin, None);

        // Fresh, unloaded, unmarked: kept.
        assert_eq!(broker.cleanup_pass(Duration::from_secs(3600)), Cleanup::Keep);

        broker.mark_to_destroy();
        assert_eq!(
            broker.cleanup_pass(Duration::from_secs(3600)),
            Cleanup::Remove
        );
        assert_eq!(broker.status(), BrokerStatus::Dead);
    }

    #[test]
    fn busy_broker_is_skipped_not_blocked() {
        let admin = Admin::new();
        let broker = DocumentBroker::new("/a.odt", "http://x/a.odt", "/tmp/jails", admin, None);

        let guard = broker.inner.lock().unwrap();
        assert_eq!(broker.cleanup_pass(Duration::from_secs(0)), Cleanup::Busy);
        drop(guard);
    }
}
