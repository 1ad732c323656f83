use crate::child::ChildProcess;
use crate::forkit::Forkit;

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// The set of spare workers waiting to be matched with a document, plus the
/// accounting needed to keep the pool at its target size.
///
/// All mutation of the spare list happens under one mutex; `acquire()` pairs
/// that mutex with a condvar and is the only blocking entry point.  It is
/// called from the request dispatcher thread, never from a reactor cycle.
pub struct ChildPool<S> {
    spares: Mutex<Vec<ChildProcess<S>>>,
    available: Condvar,

    outstanding_forks: AtomicI32,
    last_fork_request: Mutex<Instant>,

    child_timeout: Duration,
}

impl<S> ChildPool<S> {
    pub fn new(child_timeout: Duration) -> ChildPool<S> {
        ChildPool {
            spares: Mutex::new(Vec::new()),
            available: Condvar::new(),
            outstanding_forks: AtomicI32::new(0),
            last_fork_request: Mutex::new(Instant::now()),
            child_timeout,
        }
    }

    pub fn available_count(&self) -> usize {
        self.spares.lock().unwrap().len()
    }

    pub fn outstanding_forks(&self) -> i32 {
        self.outstanding_forks.load(Ordering::SeqCst)
    }

    /// Record that `count` forks were requested out-of-band (the forkit
    /// spawns one worker unprompted at launch).
    pub fn note_spawn_request(&self, count: i32) {
        self.outstanding_forks.fetch_add(count, Ordering::SeqCst);
        *self.last_fork_request.lock().unwrap() = Instant::now();
    }

    /// Forget all outstanding fork requests.  Used when the forkit is
    /// relaunched and any in-flight spawns are lost.
    pub fn reset_outstanding(&self) {
        self.outstanding_forks.store(0, Ordering::SeqCst);
    }

    /// A worker announced itself.  Outstanding strictly decreases, bounded
    /// below by zero.  Returns the spare count after adding.
    pub fn on_child_announce(&self, child: ChildProcess<S>) -> usize {
        self.outstanding_forks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some((n - 1).max(0)))
            .ok();

        let mut spares = self.spares.lock().unwrap();
        log::info!("Adding spare child [{}]", child.pid());
        spares.push(child);
        let count = spares.len();
        drop(spares);

        self.available.notify_one();
        count
    }

    /// Remove dead spares.  Returns true if any were removed.
    fn cleanup_locked(spares: &mut Vec<ChildProcess<S>>) -> bool {
        let before = spares.len();
        spares.retain(|child| {
            if child.is_alive() {
                true
            } else {
                log::warn!("Removing dead spare child [{}]", child.pid());
                false
            }
        });
        before != spares.len()
    }

    /// Decide how many workers need spawning and request them.
    ///
    /// Returns the number requested.  A spawn request older than the child
    /// timeout with no announcement is presumed lost and the outstanding
    /// count is reset before rebalancing.
    fn rebalance_locked(
        &self,
        spares: &mut Vec<ChildProcess<S>>,
        target: usize,
        forkit: &Forkit,
    ) -> Result<usize, String> {
        let cleaned = Self::cleanup_locked(spares);

        let since_last = self.last_fork_request.lock().unwrap().elapsed();
        let outstanding = self.outstanding_forks.load(Ordering::SeqCst);
        if outstanding > 0 && since_last >= self.child_timeout {
            log::warn!(
                "Forkit not responsive for {} ms forking {} children. Resetting.",
                since_last.as_millis(),
                outstanding
            );
            self.outstanding_forks.store(0, Ordering::SeqCst);
        }

        let outstanding = self.outstanding_forks.load(Ordering::SeqCst);
        let deficit = compute_deficit(target, spares.len(), outstanding);

        if deficit > 0 && (cleaned || outstanding == 0) {
            log::debug!(
                "Rebalance: have {} spare, {} outstanding, forking {} more",
                spares.len(),
                outstanding,
                deficit
            );
            forkit.request_spawn(deficit as usize)?;
            self.note_spawn_request(deficit);
            return Ok(deficit as usize);
        }

        Ok(0)
    }

    pub fn rebalance(&self, target: usize, forkit: &Forkit) -> Result<usize, String> {
        let mut spares = self.spares.lock().unwrap();
        self.rebalance_locked(&mut *spares, target, forkit)
    }

    /// Best-effort periodic balancing.  If the pool is busy, skip entirely
    /// and let the next tick retry.
    pub fn prespawn(&self, target: usize, forkit: &Forkit) -> bool {
        let mut spares = match self.spares.try_lock() {
            Ok(guard) => guard,
            Err(_) => return false,
        };

        match self.rebalance_locked(&mut *spares, target, forkit) {
            Ok(n) => n > 0,
            Err(e) => {
                log::error!("Cannot rebalance children: {e}");
                false
            }
        }
    }

    /// Block until a live spare worker is available, up to four child
    /// timeouts.  Returns None when none appears in time or when spawn
    /// requests cannot be delivered.
    pub fn acquire(&self, target: usize, forkit: &Forkit) -> Option<ChildProcess<S>> {
        let start = Instant::now();

        loop {
            let mut spares = self.spares.lock().unwrap();

            // Replace the one we are about to dispatch.
            if let Err(e) = self.rebalance_locked(&mut *spares, target + 1, forkit) {
                log::error!("acquire: rebalancing of children failed: {e}");
                return None;
            }

            let (mut spares, _) = self
                .available
                .wait_timeout_while(spares, self.child_timeout, |s| s.is_empty())
                .unwrap();

            if let Some(child) = spares.pop() {
                let remaining = spares.len();
                drop(spares);

                // Validate before returning.
                if child.is_alive() {
                    log::debug!(
                        "acquire: have {remaining} spare children after popping [{}]",
                        child.pid()
                    );
                    return Some(child);
                }

                log::warn!("acquire: popped dead child [{}], need another", child.pid());
            } else {
                log::warn!("acquire: no available child yet, spawn requested");
            }

            if start.elapsed() >= self.child_timeout * 4 {
                log::debug!("acquire: timed out waiting for a new child");
                return None;
            }
        }
    }

    /// Take every spare out of the pool (shutdown path).
    pub fn drain(&self) -> Vec<ChildProcess<S>> {
        std::mem::take(&mut *self.spares.lock().unwrap())
    }
}

/// target + in-progress replacements, minus what we have and what is
/// already on the way.
fn compute_deficit(target: usize, available: usize, outstanding: i32) -> i32 {
    target as i32 - available as i32 - outstanding
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn live_child() -> ChildProcess<()> {
        ChildProcess::new(std::process::id() as i32, ())
    }

    #[test]
    fn deficit_math() {
        assert_eq!(compute_deficit(4, 1, 2), 1);
        assert_eq!(compute_deficit(4, 4, 0), 0);
        assert_eq!(compute_deficit(1, 0, 3), -2);
    }

    #[test]
    fn announce_decrements_outstanding_with_floor() {
        let pool: ChildPool<()> = ChildPool::new(Duration::from_millis(50));
        pool.note_spawn_request(1);
        assert_eq!(pool.outstanding_forks(), 1);

        pool.on_child_announce(live_child());
        assert_eq!(pool.outstanding_forks(), 0);

        // A surprise announcement must not take the count negative.
        pool.on_child_announce(live_child());
        assert_eq!(pool.outstanding_forks(), 0);
        assert_eq!(pool.available_count(), 2);
    }

    #[test]
    fn acquire_returns_announced_child() {
        let pool: Arc<ChildPool<()>> = Arc::new(ChildPool::new(Duration::from_millis(200)));
        let forkit = Forkit::new("/bin/cat", vec![]);
        forkit.launch().expect("launch stand-in forkit");
        pool.note_spawn_request(1);

        let announcer = {
            let pool = pool.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                pool.on_child_announce(live_child());
            })
        };

        let child = pool.acquire(1, &forkit);
        announcer.join().unwrap();
        forkit.terminate();

        assert!(child.is_some());
        assert_eq!(child.unwrap().pid(), std::process::id() as i32);
    }

    #[test]
    fn acquire_times_out_without_children() {
        let pool: ChildPool<()> = ChildPool::new(Duration::from_millis(20));
        let forkit = Forkit::new("/bin/cat", vec![]);
        forkit.launch().expect("launch stand-in forkit");

        let start = Instant::now();
        assert!(pool.acquire(1, &forkit).is_none());
        assert!(start.elapsed() >= Duration::from_millis(80));
        forkit.terminate();
    }

    #[test]
    fn dead_spares_are_cleaned_at_rebalance() {
        let pool: ChildPool<()> = ChildPool::new(Duration::from_millis(50));
        pool.on_child_announce(ChildProcess::new(0x3fff_fff0, ()));
        assert_eq!(pool.available_count(), 1);

        let forkit = Forkit::new("/bin/cat", vec![]);
        forkit.launch().expect("launch stand-in forkit");
        pool.rebalance(0, &forkit).unwrap();
        forkit.terminate();

        assert_eq!(pool.available_count(), 0);
    }
}
