use std::fmt;
use std::time::Instant;

/// One spare worker process: the pid it announced and the socket it
/// announced on.  The socket type is supplied by the caller since this
/// crate does not own the I/O layer.
pub struct ChildProcess<S> {
    pid: i32,
    socket: S,
    birth: Instant,
}

impl<S> ChildProcess<S> {
    pub fn new(pid: i32, socket: S) -> ChildProcess<S> {
        ChildProcess {
            pid,
            socket,
            birth: Instant::now(),
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// A worker is alive while signal 0 can be delivered to its pid.
    pub fn is_alive(&self) -> bool {
        unsafe { libc::kill(self.pid, 0) == 0 }
    }

    /// Ask the worker to exit.  SIGKILL when `force`.
    pub fn terminate(&self, force: bool) {
        let sig = if force { libc::SIGKILL } else { libc::SIGTERM };
        unsafe {
            libc::kill(self.pid, sig);
        }
    }

    /// Unpack into the pieces a document broker takes ownership of.
    pub fn into_parts(self) -> (i32, S) {
        (self.pid, self.socket)
    }
}

impl<S> fmt::Display for ChildProcess<S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "ChildProcess pid={} age={}s",
            self.pid,
            self.birth.elapsed().as_secs()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn our_own_pid_is_alive() {
        let child = ChildProcess::new(std::process::id() as i32, ());
        assert!(child.is_alive());
    }

    #[test]
    fn bogus_pid_is_dead() {
        // pid_max on Linux defaults to well under 2^22.
        let child = ChildProcess::new(0x3fff_fff0, ());
        assert!(!child.is_alive());
    }
}
