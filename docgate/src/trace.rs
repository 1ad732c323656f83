//! Optional command tracing to a (possibly compressed) event file.

use crate::config::Config;

use flate2::write::GzEncoder;
use flate2::Compression;
use regex::Regex;
use std::fs::File;
use std::io::Write;
use std::time::Instant;

pub struct TraceFileWriter {
    out: Box<dyn Write + Send>,
    record_outgoing: bool,
    filters: Vec<Regex>,
    epoch: Instant,
}

impl TraceFileWriter {
    /// Build from config; None when tracing is disabled or unusable.
    pub fn from_config(config: &Config) -> Option<TraceFileWriter> {
        if !config.trace_enable || config.trace_path.is_empty() {
            return None;
        }

        let mut filters = Vec::new();
        for pattern in &config.trace_filters {
            match Regex::new(pattern) {
                Ok(regex) => filters.push(regex),
                Err(e) => log::warn!("Ignoring bad trace filter [{pattern}]: {e}"),
            }
        }

        let file = match File::create(&config.trace_path) {
            Ok(file) => file,
            Err(e) => {
                log::error!("Cannot create trace file [{}]: {e}", config.trace_path);
                return None;
            }
        };

        let out: Box<dyn Write + Send> = if config.trace_compress {
            Box::new(GzEncoder::new(file, Compression::default()))
        } else {
            Box::new(file)
        };

        log::info!("Command trace dumping enabled to file: {}", config.trace_path);

        Some(TraceFileWriter {
            out,
            record_outgoing: config.trace_outgoing_record,
            filters,
            epoch: Instant::now(),
        })
    }

    fn wanted(&self, data: &str) -> bool {
        self.filters.is_empty() || self.filters.iter().any(|f| f.is_match(data))
    }

    fn write_line(&mut self, kind: char, id: &str, session_id: &str, data: &str) {
        let micros = self.epoch.elapsed().as_micros();
        writeln!(self.out, "{micros}{kind}{id}+{session_id}+{data}").ok();
    }

    pub fn new_session(&mut self, id: &str, session_id: &str, uri: &str) {
        self.write_line('+', id, session_id, uri);
    }

    pub fn end_session(&mut self, id: &str, session_id: &str, uri: &str) {
        self.write_line('-', id, session_id, uri);
    }

    pub fn event(&mut self, id: &str, session_id: &str, data: &str) {
        if self.wanted(data) {
            self.write_line('~', id, session_id, data);
        }
    }

    pub fn incoming(&mut self, id: &str, session_id: &str, data: &str) {
        if self.wanted(data) {
            self.write_line('>', id, session_id, data);
        }
    }

    pub fn outgoing(&mut self, id: &str, session_id: &str, data: &str) {
        if self.record_outgoing && self.wanted(data) {
            self.write_line('<', id, session_id, data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn traced_config(dir: &tempfile::TempDir, filters: Vec<String>) -> Config {
        let mut config = Config::default();
        config.trace_enable = true;
        config.trace_path = dir
            .path()
            .join("trace.log")
            .to_string_lossy()
            .to_string();
        config.trace_outgoing_record = false;
        config.trace_filters = filters;
        config
    }

    #[test]
    fn disabled_trace_is_none() {
        assert!(TraceFileWriter::from_config(&Config::default()).is_none());
    }

    #[test]
    fn filters_select_messages() {
        let dir = tempfile::tempdir().unwrap();
        let config = traced_config(&dir, vec!["^tile ".to_string()]);
        let mut writer = TraceFileWriter::from_config(&config).unwrap();

        writer.incoming("1", "2", "tile part=0");
        writer.incoming("1", "2", "key type=input");
        // Outgoing disabled entirely.
        writer.outgoing("1", "2", "tile part=1");
        drop(writer);

        let text = std::fs::read_to_string(&config.trace_path).unwrap();
        assert!(text.contains("tile part=0"));
        assert!(!text.contains("key type=input"));
        assert!(!text.contains("tile part=1"));
    }
}
