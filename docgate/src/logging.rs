use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;

/// Main logging structure.
///
/// Writes to stderr, optionally with ANSI colors, and optionally to a log
/// file as configured by the `logging.*` keys.
pub struct Logger {
    loglevel: log::LevelFilter,
    color: bool,
    file: Option<Mutex<File>>,
    application: String,
}

impl Logger {
    pub fn new(level: &str, color: bool, file_path: Option<&str>) -> Result<Self, String> {
        let loglevel = match level {
            "none" => log::LevelFilter::Off,
            "fatal" | "error" => log::LevelFilter::Error,
            "warning" | "warn" => log::LevelFilter::Warn,
            "information" | "info" => log::LevelFilter::Info,
            "debug" => log::LevelFilter::Debug,
            "trace" => log::LevelFilter::Trace,
            _ => return Err(format!("Unknown log level [{level}]")),
        };

        let file = match file_path {
            Some(path) => {
                let handle = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| format!("Cannot open log file [{path}]: {e}"))?;
                Some(Mutex::new(handle))
            }
            None => None,
        };

        Ok(Logger {
            loglevel,
            // Colors only make sense on a terminal.
            color: color && unsafe { libc::isatty(libc::STDERR_FILENO) == 1 },
            file,
            application: Logger::find_app_name(),
        })
    }

    fn find_app_name() -> String {
        if let Ok(p) = std::env::current_exe() {
            if let Some(f) = p.file_name() {
                if let Some(n) = f.to_str() {
                    return n.to_string();
                }
            }
        }

        "docgate".to_string()
    }

    /// Install as the process-wide logger.
    pub fn init(self) -> Result<(), log::SetLoggerError> {
        log::set_max_level(self.loglevel);
        log::set_boxed_logger(Box::new(self))
    }

    fn level_tag(level: log::Level) -> &'static str {
        match level {
            log::Level::Error => "ERR",
            log::Level::Warn => "WRN",
            log::Level::Info => "INF",
            log::Level::Debug => "DBG",
            log::Level::Trace => "TRC",
        }
    }

    fn level_color(level: log::Level) -> &'static str {
        match level {
            log::Level::Error => "\x1b[31m",
            log::Level::Warn => "\x1b[33m",
            log::Level::Info => "\x1b[32m",
            log::Level::Debug => "\x1b[36m",
            log::Level::Trace => "\x1b[90m",
        }
    }
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.loglevel
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let stamp = chrono::Local::now().format("%H:%M:%S%.3f");
        let tag = Self::level_tag(record.level());
        let line = format!(
            "{}-{:05} {} [ {} ] {}",
            self.application,
            std::process::id(),
            stamp,
            tag,
            record.args()
        );

        if self.color {
            let color = Self::level_color(record.level());
            eprintln!("{color}{line}\x1b[0m");
        } else {
            eprintln!("{line}");
        }

        if let Some(ref file) = self.file {
            let mut handle = file.lock().unwrap();
            writeln!(handle, "{line}").ok();
        }
    }

    fn flush(&self) {
        if let Some(ref file) = self.file {
            file.lock().unwrap().flush().ok();
        }
    }
}
