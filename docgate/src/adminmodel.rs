//! In-memory reflection of gateway state for the admin console.

use crate::net::socket::StreamSocket;
use crate::net::ws::{self, WsOpcode};

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, Weak};
use std::time::Instant;

const DEFAULT_MEM_STATS_SIZE: usize = 100;
const DEFAULT_CPU_STATS_SIZE: usize = 100;

fn encode_token(token: &str) -> String {
    // Keep admin payload tokens single-word.
    utf8_percent_encode(token, NON_ALPHANUMERIC).to_string()
}

#[derive(Debug)]
struct View {
    expired: bool,
}

/// Per-document statistics mirrored for the console.
pub struct DocumentStats {
    pid: i32,
    filename: String,
    memory_dirty: usize,
    views: HashMap<String, View>,
    active_views: usize,
    start: Instant,
    last_activity: Instant,
    expired: bool,
}

impl DocumentStats {
    fn new(pid: i32, filename: &str) -> DocumentStats {
        DocumentStats {
            pid,
            filename: filename.to_string(),
            memory_dirty: 0,
            views: HashMap::new(),
            active_views: 0,
            start: Instant::now(),
            last_activity: Instant::now(),
            expired: false,
        }
    }

    fn add_view(&mut self, session_id: &str) {
        if self
            .views
            .insert(session_id.to_string(), View { expired: false })
            .is_some()
        {
            log::warn!("View with session [{session_id}] already exists");
        } else {
            self.active_views += 1;
        }
    }

    /// Expire one view; expires the document itself when it was the last.
    fn expire_view(&mut self, session_id: &str) -> usize {
        if let Some(view) = self.views.get_mut(session_id) {
            if !view.expired {
                view.expired = true;
                self.active_views -= 1;
                if self.active_views == 0 {
                    // Terminal timestamp for an expired document.
                    self.expired = true;
                    self.last_activity = Instant::now();
                }
            }
        }

        self.active_views
    }

    fn elapsed_secs(&self) -> u64 {
        self.start.elapsed().as_secs()
    }

    fn idle_secs(&self) -> u64 {
        self.last_activity.elapsed().as_secs()
    }
}

/// One admin console connection and the event prefixes it wants.
pub struct Subscriber {
    session_id: u32,
    socket: Weak<Mutex<StreamSocket>>,
    subscriptions: HashSet<String>,
}

impl Subscriber {
    fn new(session_id: u32, socket: Weak<Mutex<StreamSocket>>) -> Subscriber {
        Subscriber {
            session_id,
            socket,
            subscriptions: HashSet::new(),
        }
    }

    /// Returns true when newly added; repeat subscriptions are no-ops.
    pub fn subscribe(&mut self, command: &str) -> bool {
        self.subscriptions.insert(command.to_string())
    }

    pub fn unsubscribe(&mut self, command: &str) {
        self.subscriptions.remove(command);
    }

    /// Best-effort delivery.  Returns false when the back-reference is
    /// dead, which removes this subscriber.
    fn notify(&self, message: &str) -> bool {
        let socket = match self.socket.upgrade() {
            Some(socket) => socket,
            None => return false,
        };

        let first = message.split_whitespace().next().unwrap_or("");
        if !self.subscriptions.contains(first) {
            // Not subscribed to this event; keep the subscriber.
            return true;
        }

        let mut sock = socket.lock().unwrap();
        if sock.is_closed() {
            return false;
        }

        ws::WsProto::send_frame(&mut sock, WsOpcode::Text, message.as_bytes());
        true
    }
}

/// Pure in-memory reflector of documents, views and resource samples.
/// Mutated only on the admin poll's thread.
pub struct AdminModel {
    documents: HashMap<String, DocumentStats>,
    subscribers: HashMap<u32, Subscriber>,
    mem_stats: VecDeque<usize>,
    cpu_stats: VecDeque<usize>,
    mem_stats_size: usize,
    cpu_stats_size: usize,
}

impl Default for AdminModel {
    fn default() -> Self {
        Self::new()
    }
}

impl AdminModel {
    pub fn new() -> AdminModel {
        AdminModel {
            documents: HashMap::new(),
            subscribers: HashMap::new(),
            mem_stats: VecDeque::new(),
            cpu_stats: VecDeque::new(),
            mem_stats_size: DEFAULT_MEM_STATS_SIZE,
            cpu_stats_size: DEFAULT_CPU_STATS_SIZE,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    pub fn subscribe(&mut self, session_id: u32, socket: Weak<Mutex<StreamSocket>>) {
        if self.subscribers.contains_key(&session_id) {
            log::warn!("Subscriber {session_id} already exists");
            return;
        }
        self.subscribers
            .insert(session_id, Subscriber::new(session_id, socket));
    }

    pub fn subscribe_command(&mut self, session_id: u32, command: &str) {
        if let Some(subscriber) = self.subscribers.get_mut(&session_id) {
            subscriber.subscribe(command);
        }
    }

    pub fn unsubscribe_command(&mut self, session_id: u32, command: &str) {
        if let Some(subscriber) = self.subscribers.get_mut(&session_id) {
            subscriber.unsubscribe(command);
        }
    }

    pub fn remove_subscriber(&mut self, session_id: u32) {
        self.subscribers.remove(&session_id);
    }

    pub fn subscriptions_of(&self, session_id: u32) -> Vec<String> {
        self.subscribers
            .get(&session_id)
            .map(|s| {
                let mut subs: Vec<String> = s.subscriptions.iter().cloned().collect();
                subs.sort();
                subs
            })
            .unwrap_or_default()
    }

    /// Fan a message out to every interested subscriber, dropping the
    /// dead ones inline.
    pub fn notify(&mut self, message: &str) {
        if self.subscribers.is_empty() {
            return;
        }

        log::trace!("Message to admin console: {message}");
        self.subscribers.retain(|_, subscriber| {
            let alive = subscriber.notify(message);
            if !alive {
                log::debug!("Removing dead admin subscriber {}", subscriber.session_id);
            }
            alive
        });
    }

    pub fn add_document(&mut self, doc_key: &str, pid: i32, filename: &str, session_id: &str) {
        let document = self
            .documents
            .entry(doc_key.to_string())
            .or_insert_with(|| DocumentStats::new(pid, filename));
        document.add_view(session_id);
        log::debug!("Added admin document [{doc_key}]");

        // The worker has not reported its memory yet; estimate until the
        // first sample-driven update.
        let mem_estimate = if self.documents.len() < 2 {
            self.mem_stats.back().map(|m| m / 2).unwrap_or(0)
        } else {
            self.documents
                .values()
                .next()
                .map(|d| d.memory_dirty)
                .unwrap_or(0)
        };

        let message = format!(
            "adddoc {pid} {} {session_id} {mem_estimate}",
            encode_token(filename)
        );
        self.notify(&message);
    }

    /// Remove one view; erases the document once no views remain.
    pub fn remove_document_view(&mut self, doc_key: &str, session_id: &str) {
        if let Some(document) = self.documents.get_mut(doc_key) {
            if document.expired {
                return;
            }

            let message = format!("rmdoc {} {session_id}", document.pid);
            if document.expire_view(session_id) == 0 {
                self.documents.remove(doc_key);
            }
            self.notify(&message);
        }
    }

    /// Remove the whole document, notifying once per remaining view.
    pub fn remove_document(&mut self, doc_key: &str) {
        if let Some(document) = self.documents.remove(doc_key) {
            let pid = document.pid;
            for session_id in document.views.keys() {
                self.notify(&format!("rmdoc {pid} {session_id}"));
            }
            log::debug!("Removed admin document [{doc_key}]");
        }
    }

    pub fn add_mem_stats(&mut self, sample: usize) {
        self.mem_stats.push_back(sample);
        while self.mem_stats.len() > self.mem_stats_size {
            self.mem_stats.pop_front();
        }
        self.notify(&format!("mem_stats {sample}"));
    }

    pub fn add_cpu_stats(&mut self, sample: usize) {
        self.cpu_stats.push_back(sample);
        while self.cpu_stats.len() > self.cpu_stats_size {
            self.cpu_stats.pop_front();
        }
        self.notify(&format!("cpu_stats {sample}"));
    }

    pub fn set_mem_stats_size(&mut self, size: usize) {
        while self.mem_stats.len() > size {
            self.mem_stats.pop_front();
        }
        self.mem_stats_size = size;
        self.notify(&format!("settings mem_stats_size={size}"));
    }

    pub fn set_cpu_stats_size(&mut self, size: usize) {
        while self.cpu_stats.len() > size {
            self.cpu_stats.pop_front();
        }
        self.cpu_stats_size = size;
        self.notify(&format!("settings cpu_stats_size={size}"));
    }

    pub fn update_memory_dirty(&mut self, doc_key: &str, dirty: usize) {
        if let Some(document) = self.documents.get_mut(doc_key) {
            if document.memory_dirty != dirty {
                document.memory_dirty = dirty;
                let pid = document.pid;
                self.notify(&format!("propchange {pid} mem {dirty}"));
            }
        }
    }

    /// Mark activity on a document; emits `resetidle` when the document
    /// had been idle for a while.
    pub fn update_last_activity(&mut self, doc_key: &str) {
        if let Some(document) = self.documents.get_mut(doc_key) {
            if document.idle_secs() >= 10 {
                document.last_activity = Instant::now();
                let pid = document.pid;
                self.notify(&format!("resetidle {pid}"));
            }
        }
    }

    /// Synchronous snapshot queries for the admin protocol.
    pub fn query(&self, command: &str) -> String {
        let token = command.split_whitespace().next().unwrap_or("");
        match token {
            "documents" => self.get_documents(),
            "active_users_count" => self.total_active_views().to_string(),
            "active_docs_count" => self.documents.len().to_string(),
            "mem_stats" => join_stats(&self.mem_stats),
            "mem_stats_size" => self.mem_stats_size.to_string(),
            "cpu_stats" => join_stats(&self.cpu_stats),
            "cpu_stats_size" => self.cpu_stats_size.to_string(),
            _ => String::new(),
        }
    }

    pub fn total_active_views(&self) -> usize {
        self.documents
            .values()
            .filter(|d| !d.expired)
            .map(|d| d.active_views)
            .sum()
    }

    /// Total memory attributed to live workers, for the sampler.
    pub fn total_kit_memory(&self) -> usize {
        self.documents
            .values()
            .filter(|d| !d.expired)
            .map(|d| d.memory_dirty)
            .sum()
    }

    pub fn kit_pids(&self) -> Vec<i32> {
        self.documents
            .values()
            .filter(|d| !d.expired)
            .map(|d| d.pid)
            .collect()
    }

    fn get_documents(&self) -> String {
        let mut out = String::new();
        for document in self.documents.values().filter(|d| !d.expired) {
            out.push_str(&format!(
                "{} {} {} {} {} {} \n ",
                document.pid,
                encode_token(&document.filename),
                document.active_views,
                document.memory_dirty,
                document.elapsed_secs(),
                document.idle_secs()
            ));
        }
        out
    }
}

fn join_stats(stats: &VecDeque<usize>) -> String {
    stats.iter().map(|s| format!("{s},")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::socket::SocketRef;
    use std::os::unix::io::RawFd;
    use std::sync::Arc;

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let rc =
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    fn subscriber_socket() -> SocketRef {
        let (a, _b) = socketpair();
        StreamSocket::plain(a).wrap()
    }

    #[test]
    fn add_then_remove_all_views_erases_the_document() {
        let mut model = AdminModel::new();

        model.add_document("k1", 4242, "report.odt", "1");
        model.add_document("k1", 4242, "report.odt", "2");
        assert_eq!(model.document_count(), 1);
        assert_eq!(model.total_active_views(), 2);

        model.remove_document_view("k1", "1");
        assert_eq!(model.document_count(), 1);
        model.remove_document_view("k1", "2");
        assert_eq!(model.document_count(), 0);
    }

    #[test]
    fn duplicate_subscribe_is_idempotent() {
        let mut model = AdminModel::new();
        let socket = subscriber_socket();
        model.subscribe(7, Arc::downgrade(&socket));

        model.subscribe_command(7, "adddoc");
        model.subscribe_command(7, "adddoc");

        assert_eq!(model.subscriptions_of(7), vec!["adddoc".to_string()]);
    }

    #[test]
    fn dead_subscribers_are_pruned_on_notify() {
        let mut model = AdminModel::new();

        {
            let socket = subscriber_socket();
            model.subscribe(1, Arc::downgrade(&socket));
            model.subscribe_command(1, "mem_stats");
            // socket dropped here; the weak ref goes dead.
        }

        let live = subscriber_socket();
        model.subscribe(2, Arc::downgrade(&live));
        model.subscribe_command(2, "mem_stats");

        assert_eq!(model.subscriber_count(), 2);
        model.add_mem_stats(512);
        assert_eq!(model.subscriber_count(), 1);

        // And the live subscriber got the frame.
        assert!(live.lock().unwrap().out_buffer_len() > 0);
    }

    #[test]
    fn ring_buffers_cap_with_youngest_at_tail() {
        let mut model = AdminModel::new();
        model.set_mem_stats_size(3);

        for sample in 1..=5 {
            model.add_mem_stats(sample);
        }

        assert_eq!(model.mem_stats.len(), 3);
        assert_eq!(model.mem_stats.back(), Some(&5));
        assert_eq!(model.query("mem_stats"), "3,4,5,");
        assert_eq!(model.query("mem_stats_size"), "3");
    }

    #[test]
    fn documents_query_row_format() {
        let mut model = AdminModel::new();
        model.add_document("k1", 99, "a b.odt", "1");
        model.update_memory_dirty("k1", 2048);

        let rows = model.query("documents");
        assert!(rows.starts_with("99 a%20b%2Eodt 1 2048 "));
    }

    #[test]
    fn query_counts() {
        let mut model = AdminModel::new();
        model.add_document("k1", 1, "x.odt", "1");
        model.add_document("k2", 2, "y.odt", "2");
        model.add_document("k2", 2, "y.odt", "3");

        assert_eq!(model.query("active_docs_count"), "2");
        assert_eq!(model.query("active_users_count"), "3");
        assert_eq!(model.query("bogus"), "");
    }

    #[test]
    fn propchange_only_on_change() {
        let mut model = AdminModel::new();
        let socket = subscriber_socket();
        model.subscribe(1, Arc::downgrade(&socket));
        model.subscribe_command(1, "propchange");
        model.add_document("k1", 5, "doc.odt", "1");

        model.update_memory_dirty("k1", 100);
        let first = socket.lock().unwrap().out_buffer_len();
        assert!(first > 0);

        model.update_memory_dirty("k1", 100);
        assert_eq!(socket.lock().unwrap().out_buffer_len(), first);
    }
}
