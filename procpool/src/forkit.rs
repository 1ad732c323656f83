use std::io::Write;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;

/// Handle on the forkit supervisor process.
///
/// The forkit is launched with its stdin piped; spawn requests are plain
/// `spawn <N>\n` lines written to that pipe.  When the forkit dies we
/// relaunch it and the caller drains its pool accounting.
pub struct Forkit {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    child: Mutex<Option<Child>>,
}

impl Forkit {
    pub fn new(program: &str, args: Vec<String>) -> Forkit {
        Forkit {
            program: program.to_string(),
            args,
            envs: Vec::new(),
            child: Mutex::new(None),
        }
    }

    /// Environment passed down to the forkit (and so to its workers).
    pub fn with_env(mut self, key: &str, value: &str) -> Forkit {
        self.envs.push((key.to_string(), value.to_string()));
        self
    }

    /// Launch the forkit process.  Returns its pid.
    ///
    /// The forkit forks one worker unprompted on startup, so the caller
    /// should account for one outstanding fork.
    pub fn launch(&self) -> Result<i32, String> {
        let mut guard = self.child.lock().unwrap();

        // Reap whatever was there before, in case we haven't yet.
        if let Some(old) = guard.as_mut() {
            old.try_wait().ok();
        }

        log::info!("Launching forkit process: {} {}", self.program, self.args.join(" "));

        let child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| format!("Cannot launch forkit [{}]: {e}", self.program))?;

        let pid = child.id() as i32;
        *guard = Some(child);

        log::info!("Forkit process launched: {pid}");
        Ok(pid)
    }

    pub fn pid(&self) -> Option<i32> {
        self.child.lock().unwrap().as_ref().map(|c| c.id() as i32)
    }

    /// Write a `spawn <N>` request down the pipe.
    pub fn request_spawn(&self, count: usize) -> Result<(), String> {
        let mut guard = self.child.lock().unwrap();
        let child = guard
            .as_mut()
            .ok_or_else(|| "No forkit pipe while rebalancing children".to_string())?;

        let stdin = child
            .stdin
            .as_mut()
            .ok_or_else(|| "Forkit stdin pipe is gone".to_string())?;

        let message = format!("spawn {count}\n");
        log::debug!("MasterToForkit: {}", message.trim_end());

        stdin
            .write_all(message.as_bytes())
            .map_err(|e| format!("Error writing to forkit pipe: {e}"))
    }

    /// Non-blocking supervision pass.  Returns Ok(true) if the forkit had
    /// died and was relaunched; the caller must treat outstanding forks as
    /// lost when that happens.
    pub fn check_and_restore(&self) -> Result<bool, String> {
        let dead = {
            let mut guard = self.child.lock().unwrap();
            match guard.as_mut() {
                None => true,
                Some(child) => match child.try_wait() {
                    Ok(Some(status)) => {
                        log::error!("Forkit process [{}] exited: {status}", child.id());
                        *guard = None;
                        true
                    }
                    Ok(None) => false,
                    Err(e) => {
                        log::error!("Forkit waitpid failed: {e}");
                        *guard = None;
                        true
                    }
                },
            }
        };

        if dead {
            self.launch()?;
        }

        Ok(dead)
    }

    /// Ask the forkit to terminate and reap it.
    pub fn terminate(&self) {
        let mut guard = self.child.lock().unwrap();
        if let Some(mut child) = guard.take() {
            let pid = child.id() as i32;
            log::info!("Requesting forkit process {pid} to terminate");
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
            child.wait().ok();
        }
    }
}
