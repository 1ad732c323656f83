//! Process-wide context: the broker map, the child pool, connection
//! counters and the shutdown flags, with the lock order DocBrokers ->
//! pool -> broker enforced by convention throughout.

use crate::admin::Admin;
use crate::broker::{Cleanup, DocumentBroker};
use crate::config::Config;
use crate::limits;
use crate::net::poll::SocketPoll;
use crate::net::socket::SocketRef;
use crate::trace::TraceFileWriter;

use procpool::{ChildPool, Forkit, CHILD_TIMEOUT_MS};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// SIGINT/SIGTERM observed; start an orderly shutdown.
pub static SHUTDOWN_REQUEST_FLAG: AtomicBool = AtomicBool::new(false);
/// Users alerted; drain in progress.
pub static SHUTDOWN_FLAG: AtomicBool = AtomicBool::new(false);
/// Hard stop.
pub static TERMINATION_FLAG: AtomicBool = AtomicBool::new(false);

pub fn is_shutdown_requested() -> bool {
    SHUTDOWN_REQUEST_FLAG.load(Ordering::SeqCst)
}

pub fn is_termination_requested() -> bool {
    TERMINATION_FLAG.load(Ordering::SeqCst)
}

pub fn request_termination() {
    TERMINATION_FLAG.store(true, Ordering::SeqCst);
}

/// Admission caps, carried on the gateway so tests can shrink them.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_documents: usize,
    pub max_connections: usize,
}

impl Default for Limits {
    fn default() -> Limits {
        Limits {
            max_documents: limits::MAX_DOCUMENTS,
            max_connections: limits::MAX_CONNECTIONS,
        }
    }
}

pub struct Gateway {
    pub config: Config,
    pub limits: Limits,

    pub doc_brokers: Mutex<HashMap<String, Arc<DocumentBroker>>>,
    pub pool: ChildPool<SocketRef>,
    pub forkit: Forkit,

    pub num_connections: AtomicUsize,
    next_session_id: AtomicU32,

    pub web_poll: Arc<SocketPoll>,
    pub prisoner_poll: Arc<SocketPoll>,
    pub admin: Arc<Admin>,

    pub trace: Option<Arc<Mutex<TraceFileWriter>>>,

    worker_version: Mutex<String>,
    last_disk_alert: Mutex<Option<Instant>>,
}

impl Gateway {
    pub fn new(config: Config, limits: Limits) -> Arc<Gateway> {
        let forkit_args = vec![
            format!("--losubpath={}", config.lo_jail_subpath),
            format!("--systemplate={}", config.sys_template_path),
            format!("--lotemplate={}", config.lo_template_path),
            format!("--childroot={}", config.child_root_path),
            format!("--clientport={}", config.client_port),
            format!("--masterport={}", config.master_port),
        ];
        let forkit = Forkit::new(&config.forkit_path, forkit_args).with_env(
            "MAX_CONCURRENCY",
            &config.per_document_max_concurrency.to_string(),
        );

        let trace = TraceFileWriter::from_config(&config).map(|t| Arc::new(Mutex::new(t)));

        Arc::new(Gateway {
            pool: ChildPool::new(Duration::from_millis(CHILD_TIMEOUT_MS)),
            forkit,
            doc_brokers: Mutex::new(HashMap::new()),
            num_connections: AtomicUsize::new(0),
            next_session_id: AtomicU32::new(0),
            web_poll: SocketPoll::new("websrv_poll"),
            prisoner_poll: SocketPoll::new("prisoner_poll"),
            admin: Admin::new(),
            trace,
            worker_version: Mutex::new(String::new()),
            last_disk_alert: Mutex::new(None),
            config,
            limits,
        })
    }

    /// Session ids are process-monotonic.
    pub fn next_session_id(&self) -> u32 {
        self.next_session_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn set_worker_version(&self, version: &str) {
        if !version.is_empty() {
            *self.worker_version.lock().unwrap() = version.to_string();
        }
    }

    pub fn worker_version(&self) -> String {
        self.worker_version.lock().unwrap().clone()
    }

    pub fn broker_count(&self) -> usize {
        self.doc_brokers.lock().unwrap().len()
    }

    pub fn connection_count(&self) -> usize {
        self.num_connections.load(Ordering::SeqCst)
    }

    /// Remove dead and idle brokers.  Returns true if any were removed.
    /// Busy brokers are skipped, not waited on.
    pub fn cleanup_doc_brokers(&self) -> bool {
        let mut brokers = self.doc_brokers.lock().unwrap();
        Self::cleanup_locked(&mut brokers)
    }

    pub(crate) fn cleanup_locked(brokers: &mut HashMap<String, Arc<DocumentBroker>>) -> bool {
        let before = brokers.len();
        let idle_limit = Duration::from_secs(limits::IDLE_DOC_TIMEOUT_SECS);

        brokers.retain(|doc_key, broker| match broker.cleanup_pass(idle_limit) {
            Cleanup::Busy | Cleanup::Keep => true,
            Cleanup::Remove => {
                log::info!("Removing DocumentBroker for docKey [{doc_key}]");
                false
            }
        });

        before != brokers.len()
    }

    /// Broadcast a message to every session of every document.
    pub fn alert_all_users(&self, message: &str) {
        log::info!("Alerting all users: [{message}]");
        let brokers = self.doc_brokers.lock().unwrap();
        for broker in brokers.values() {
            broker.alert_all_users(message);
        }
    }

    /// Keep a reserve of spare workers.  Best-effort: if either the
    /// broker map or the pool is busy, skip and retry on the next tick.
    pub fn prespawn_children(&self) -> bool {
        {
            let mut brokers = match self.doc_brokers.try_lock() {
                Ok(guard) => guard,
                Err(_) => return false, // busy, try again later
            };
            Self::cleanup_locked(&mut brokers);
        }

        self.check_disk_space();

        self.pool
            .prespawn(self.config.num_prespawn_children.max(1), &self.forkit)
    }

    /// The prisoner poll's per-cycle hook: supervise the forkit, then
    /// keep the reserve stocked.
    pub fn prisoner_wakeup(&self) {
        match self.forkit.check_and_restore() {
            Ok(true) => {
                // Relaunch loses all in-flight spawns; the new forkit
                // spawns one child unprompted.
                self.pool.reset_outstanding();
                self.pool.note_spawn_request(1);
                if let Some(pid) = self.forkit.pid() {
                    self.admin.set_forkit_pid(pid);
                }
            }
            Ok(false) => {}
            Err(e) => {
                log::error!("Failed to restore forkit: {e}");
                request_termination();
                return;
            }
        }

        self.prespawn_children();
    }

    /// Alert every user when a watched filesystem runs low, at most once
    /// a minute.
    pub fn check_disk_space(&self) {
        let paths = [&self.config.child_root_path, &self.config.tile_cache_path];
        let Some(short) = paths.iter().find(|p| filesystem_is_low(p)) else {
            return;
        };

        let mut last = self.last_disk_alert.lock().unwrap();
        if let Some(at) = *last {
            if at.elapsed() < Duration::from_secs(60) {
                return;
            }
        }
        *last = Some(Instant::now());
        drop(last);

        log::warn!("File system of [{short}] is dangerously low on disk space");
        self.alert_all_users(limits::PAYLOAD_DISKFULL);
    }

    /// Stop every reactor and terminate children.  The final act.
    pub fn shutdown(&self) {
        log::info!("Stopping gateway polls");
        self.web_poll.stop();
        self.prisoner_poll.stop();
        self.admin.stop();

        log::info!("Cleaning up lingering documents");
        let brokers = std::mem::take(&mut *self.doc_brokers.lock().unwrap());
        for broker in brokers.values() {
            broker.terminate_child("");
        }

        log::info!("Requesting child processes to terminate");
        for child in self.pool.drain() {
            child.terminate(false);
        }

        self.forkit.terminate();

        // Don't leave jails behind if the forkit didn't clean up.
        let child_root = &self.config.child_root_path;
        if let Ok(entries) = std::fs::read_dir(child_root) {
            for entry in entries.flatten() {
                log::info!("Removing jail [{}]", entry.path().display());
                std::fs::remove_dir_all(entry.path()).ok();
            }
        }
    }

    /// Summarize live state into the log, for operators in trouble.
    pub fn dump_state(&self) {
        let brokers = self.doc_brokers.lock().unwrap();
        log::info!(
            "Gateway state: connections={} brokers={} spare_children={} outstanding_forks={} \
             shutdown={} termination={}",
            self.connection_count(),
            brokers.len(),
            self.pool.available_count(),
            self.pool.outstanding_forks(),
            is_shutdown_requested(),
            is_termination_requested(),
        );
        for (doc_key, broker) in brokers.iter() {
            log::info!(
                "  DocBroker [{doc_key}]: status={:?} sessions={} pid={}",
                broker.status(),
                broker.session_count(),
                broker.child_pid(),
            );
        }
    }
}

/// Less than 5% or under 1GiB free counts as dangerously low.
fn filesystem_is_low(path: &str) -> bool {
    let cpath = match std::ffi::CString::new(path) {
        Ok(cpath) => cpath,
        Err(_) => return false,
    };

    let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(cpath.as_ptr(), &mut stats) } != 0 {
        return false;
    }

    if stats.f_blocks == 0 {
        return false;
    }

    let free = stats.f_bavail as u128 * stats.f_frsize as u128;
    let total = stats.f_blocks as u128 * stats.f_frsize as u128;

    free < 1024 * 1024 * 1024 && free * 20 < total
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_gateway(limits: Limits) -> Arc<Gateway> {
        Gateway::new(Config::default(), limits)
    }

    #[test]
    fn session_ids_are_monotonic() {
        let gateway = test_gateway(Limits::default());
        let a = gateway.next_session_id();
        let b = gateway.next_session_id();
        assert!(b > a);
    }

    #[test]
    fn broker_map_insert_find_cleanup() {
        let gateway = test_gateway(Limits::default());

        let broker = DocumentBroker::new(
            "/a.odt",
            "http://x/a.odt",
            &gateway.config.child_root_path,
            gateway.admin.clone(),
            None,
        );
        gateway
            .doc_brokers
            .lock()
            .unwrap()
            .insert(broker.doc_key().to_string(), broker.clone());
        assert_eq!(gateway.broker_count(), 1);

        // A live, unmarked broker survives cleanup.
        assert!(!gateway.cleanup_doc_brokers());
        assert_eq!(gateway.broker_count(), 1);

        // A marked one is terminated and removed.
        broker.mark_to_destroy();
        assert!(gateway.cleanup_doc_brokers());
        assert_eq!(gateway.broker_count(), 0);
        assert!(!broker.is_alive());
    }

    #[test]
    fn tiny_limits_are_carried() {
        let gateway = test_gateway(Limits {
            max_documents: 1,
            max_connections: 2,
        });
        assert_eq!(gateway.limits.max_documents, 1);
        assert_eq!(gateway.limits.max_connections, 2);
    }
}
