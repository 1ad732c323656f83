//! Admin console endpoint: telemetry subscriptions and queries over a
//! dedicated poll thread.

use crate::adminmodel::AdminModel;
use crate::net::poll::{HandlerOutcome, SocketHandler, SocketPoll};
use crate::net::socket::SocketRef;
use crate::net::ws::{WsOpcode, WsProto, WsState};

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const MEM_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);
const CPU_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// The admin singleton: its reactor, its model, and the resource sampler
/// driven from the reactor's wakeup hook.
pub struct Admin {
    poll: Arc<SocketPoll>,
    model: Mutex<AdminModel>,
    forkit_pid: AtomicI32,
    last_mem_sample: Mutex<Instant>,
    last_cpu_sample: Mutex<Instant>,
}

impl Admin {
    pub fn new() -> Arc<Admin> {
        Arc::new(Admin {
            poll: SocketPoll::new("admin_poll"),
            model: Mutex::new(AdminModel::new()),
            forkit_pid: AtomicI32::new(-1),
            last_mem_sample: Mutex::new(Instant::now()),
            last_cpu_sample: Mutex::new(Instant::now()),
        })
    }

    pub fn poll(&self) -> &Arc<SocketPoll> {
        &self.poll
    }

    pub fn set_forkit_pid(&self, pid: i32) {
        self.forkit_pid.store(pid, Ordering::SeqCst);
    }

    pub fn start(self: &Arc<Self>) -> thread::JoinHandle<()> {
        let this = self.clone();
        self.poll.start_thread(move || this.sample_resources())
    }

    pub fn stop(&self) {
        self.poll.stop();
    }

    /// Run a model operation on the admin thread.  All model mutation
    /// funnels through here so subscriber sockets are only touched by
    /// their owning poll.
    pub fn with_model(self: &Arc<Self>, f: impl FnOnce(&mut AdminModel) + Send + 'static) {
        let this = self.clone();
        self.poll.defer(move || {
            let mut model = this.model.lock().unwrap();
            f(&mut model);
        });
    }

    pub fn add_document(self: &Arc<Self>, doc_key: &str, pid: i32, filename: &str, session_id: u32) {
        let (doc_key, filename) = (doc_key.to_string(), filename.to_string());
        self.with_model(move |model| {
            model.add_document(&doc_key, pid, &filename, &session_id.to_string())
        });
    }

    pub fn remove_document_view(self: &Arc<Self>, doc_key: &str, session_id: u32) {
        let doc_key = doc_key.to_string();
        self.with_model(move |model| {
            model.remove_document_view(&doc_key, &session_id.to_string())
        });
    }

    pub fn remove_document(self: &Arc<Self>, doc_key: &str) {
        let doc_key = doc_key.to_string();
        self.with_model(move |model| model.remove_document(&doc_key));
    }

    pub fn update_last_activity(self: &Arc<Self>, doc_key: &str) {
        let doc_key = doc_key.to_string();
        self.with_model(move |model| model.update_last_activity(&doc_key));
    }

    pub fn update_memory_dirty(self: &Arc<Self>, doc_key: &str, dirty: usize) {
        let doc_key = doc_key.to_string();
        self.with_model(move |model| model.update_memory_dirty(&doc_key, dirty));
    }

    /// Periodic CPU/memory sampling, run from the poll's wakeup hook.
    fn sample_resources(&self) {
        let now = Instant::now();

        let mut base_pids = vec![std::process::id() as i32];
        let forkit = self.forkit_pid.load(Ordering::SeqCst);
        if forkit > 0 {
            base_pids.push(forkit);
        }

        {
            let mut last = self.last_mem_sample.lock().unwrap();
            if now.duration_since(*last) >= MEM_SAMPLE_INTERVAL {
                *last = now;
                drop(last);

                let mut model = self.model.lock().unwrap();
                let mut pids = base_pids.clone();
                pids.extend(model.kit_pids());
                let total_kb: usize = pids.iter().filter_map(|p| proc_mem_kb(*p)).sum();
                model.add_mem_stats(total_kb);
            }
        }

        {
            let mut last = self.last_cpu_sample.lock().unwrap();
            if now.duration_since(*last) >= CPU_SAMPLE_INTERVAL {
                *last = now;
                drop(last);

                let mut model = self.model.lock().unwrap();
                let mut pids = base_pids;
                pids.extend(model.kit_pids());
                let jiffies: usize = pids.iter().filter_map(|p| proc_cpu_jiffies(*p)).sum();
                model.add_cpu_stats(jiffies);
            }
        }
    }
}

/// Resident memory of one process in KB, from /proc statm.
fn proc_mem_kb(pid: i32) -> Option<usize> {
    let statm = std::fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
    let resident_pages: usize = statm.split_whitespace().nth(1)?.parse().ok()?;
    let page_kb = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize / 1024;
    Some(resident_pages * page_kb)
}

/// utime+stime jiffies of one process, from /proc stat.
fn proc_cpu_jiffies(pid: i32) -> Option<usize> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // Fields after the parenthesized comm, which may itself hold spaces.
    let after_comm = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    let utime: usize = fields.get(11)?.parse().ok()?;
    let stime: usize = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

/// Websocket handler for one admin console connection.  Lives on the
/// admin poll after the dispatcher migrates the upgraded socket here.
pub struct AdminSocketHandler {
    admin: Arc<Admin>,
    session_id: u32,
    ws: WsProto,
}

impl AdminSocketHandler {
    pub fn new(admin: Arc<Admin>, session_id: u32) -> AdminSocketHandler {
        AdminSocketHandler {
            admin,
            session_id,
            ws: WsProto::new(),
        }
    }

    fn handle_command(&mut self, socket: &SocketRef, line: &str) {
        let mut tokens = line.split_whitespace();
        let command = match tokens.next() {
            Some(c) => c,
            None => return,
        };

        log::debug!("Admin session {} command: {command}", self.session_id);

        let mut model = self.admin.model.lock().unwrap();
        match command {
            "subscribe" => {
                for token in tokens {
                    model.subscribe_command(self.session_id, token);
                }
            }
            "unsubscribe" => {
                for token in tokens {
                    model.unsubscribe_command(self.session_id, token);
                }
            }
            "set" => {
                // set mem_stats_size=N cpu_stats_size=N
                for token in tokens {
                    let (name, value) = match token.split_once('=') {
                        Some(pair) => pair,
                        None => {
                            log::warn!("Malformed admin setting [{token}]");
                            continue;
                        }
                    };
                    let size: usize = match value.parse() {
                        Ok(size) => size,
                        Err(_) => {
                            log::warn!("Invalid admin setting value [{token}]");
                            continue;
                        }
                    };
                    match name {
                        "mem_stats_size" => model.set_mem_stats_size(size),
                        "cpu_stats_size" => model.set_cpu_stats_size(size),
                        _ => log::warn!("Unknown admin setting [{name}]"),
                    }
                }
            }
            "documents" | "active_users_count" | "active_docs_count" | "mem_stats"
            | "mem_stats_size" | "cpu_stats" | "cpu_stats_size" => {
                let result = model.query(line);
                drop(model);
                let reply = format!("{command} {result}");
                let mut sock = socket.lock().unwrap();
                WsProto::send_frame(&mut sock, WsOpcode::Text, reply.as_bytes());
            }
            "settings" => {
                let reply = format!(
                    "settings mem_stats_size={} cpu_stats_size={}",
                    model.query("mem_stats_size"),
                    model.query("cpu_stats_size")
                );
                drop(model);
                let mut sock = socket.lock().unwrap();
                WsProto::send_frame(&mut sock, WsOpcode::Text, reply.as_bytes());
            }
            _ => {
                log::warn!("Unknown admin command [{command}]");
            }
        }
    }
}

impl SocketHandler for AdminSocketHandler {
    fn on_connect(&mut self, socket: &SocketRef, _poll: &Arc<SocketPoll>) {
        log::info!("Admin session {} connected", self.session_id);
        self.admin
            .model
            .lock()
            .unwrap()
            .subscribe(self.session_id, Arc::downgrade(socket));
    }

    fn handle_incoming(&mut self, socket: &SocketRef, _poll: &Arc<SocketPoll>) -> HandlerOutcome {
        let mut lines: Vec<String> = Vec::new();

        {
            let mut sock = socket.lock().unwrap();
            let result = self.ws.read_messages(&mut sock, &mut |opcode, payload| {
                if opcode == WsOpcode::Text {
                    lines.push(String::from_utf8_lossy(&payload).to_string());
                }
            });

            match result {
                Ok(false) => {}
                Ok(true) => return HandlerOutcome::Close,
                Err(e) => {
                    log::error!("Admin session {} websocket error: {e}", self.session_id);
                    return HandlerOutcome::Close;
                }
            }
        }

        for line in lines {
            self.handle_command(socket, &line);
        }

        if matches!(self.ws.state(), WsState::Closing | WsState::Closed) {
            HandlerOutcome::Close
        } else {
            HandlerOutcome::Continue
        }
    }

    fn on_disconnect(&mut self, _socket: &SocketRef) {
        log::info!("Admin session {} disconnected", self.session_id);
        self.admin
            .model
            .lock()
            .unwrap()
            .remove_subscriber(self.session_id);
    }
}
