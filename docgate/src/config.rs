use crate::error::{GateError, GateResult};
use crate::limits;

use std::collections::HashMap;
use std::fs;
use std::sync::OnceLock;
use yaml_rust::Yaml;
use yaml_rust::YamlLoader;

static CONFIG: OnceLock<Config> = OnceLock::new();

pub fn global() -> &'static Config {
    CONFIG
        .get()
        .unwrap_or_else(|| panic!("No configuration has been applied"))
}

/// One WOPI storage host rule.
#[derive(Debug, Clone)]
pub struct WopiHost {
    pub host: String,
    pub allow: bool,
}

/// Gateway configuration.
///
/// Parsed from a YAML file, then adjusted by `--override key=value` pairs
/// using the flattened key names (`ssl.enable`, `logging.file.enable`, ...).
/// Bracketed attribute spellings (`logging.file[@enable]`) are accepted and
/// normalized.
#[derive(Debug, Clone)]
pub struct Config {
    pub filename: String,

    pub client_port: u16,
    pub master_port: u16,

    pub ssl_enable: bool,
    pub ssl_termination: bool,
    pub ssl_cert_file_path: String,
    pub ssl_key_file_path: String,
    pub ssl_ca_file_path: String,

    pub tile_cache_path: String,
    pub sys_template_path: String,
    pub lo_template_path: String,
    pub child_root_path: String,
    pub lo_jail_subpath: String,
    pub server_name: String,
    pub file_server_root_path: String,
    pub forkit_path: String,

    pub num_prespawn_children: usize,
    pub per_document_max_concurrency: usize,

    pub loleaflet_html: String,
    pub loleaflet_logging: bool,

    pub logging_level: String,
    pub logging_color: bool,
    pub logging_file_enable: bool,
    pub logging_file_properties: HashMap<String, String>,

    pub admin_console_username: String,
    pub admin_console_password: String,

    pub storage_filesystem_allow: bool,
    pub storage_wopi_allow: bool,
    pub storage_wopi_hosts: Vec<WopiHost>,
    pub storage_wopi_max_file_size: usize,

    pub trace_enable: bool,
    pub trace_path: String,
    pub trace_outgoing_record: bool,
    pub trace_compress: bool,
    pub trace_snapshot: bool,
    pub trace_filters: Vec<String>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            filename: String::new(),
            client_port: limits::DEFAULT_CLIENT_PORT,
            master_port: limits::DEFAULT_MASTER_PORT,
            ssl_enable: true,
            ssl_termination: true,
            ssl_cert_file_path: "etc/cert.pem".to_string(),
            ssl_key_file_path: "etc/key.pem".to_string(),
            ssl_ca_file_path: "etc/ca-chain.cert.pem".to_string(),
            tile_cache_path: "cache".to_string(),
            sys_template_path: "systemplate".to_string(),
            lo_template_path: "/opt/office".to_string(),
            child_root_path: "jails".to_string(),
            lo_jail_subpath: "lo".to_string(),
            server_name: String::new(),
            file_server_root_path: "loleaflet/..".to_string(),
            forkit_path: "docgate-forkit".to_string(),
            num_prespawn_children: 1,
            per_document_max_concurrency: 4,
            loleaflet_html: "loleaflet.html".to_string(),
            loleaflet_logging: false,
            logging_level: "trace".to_string(),
            logging_color: true,
            logging_file_enable: false,
            logging_file_properties: HashMap::from([
                ("path".to_string(), "docgate.log".to_string()),
                ("rotation".to_string(), "never".to_string()),
                ("compress".to_string(), "true".to_string()),
                ("flush".to_string(), "false".to_string()),
            ]),
            admin_console_username: String::new(),
            admin_console_password: String::new(),
            storage_filesystem_allow: false,
            storage_wopi_allow: true,
            storage_wopi_hosts: vec![WopiHost {
                host: "localhost".to_string(),
                allow: true,
            }],
            storage_wopi_max_file_size: 0,
            trace_enable: false,
            trace_path: String::new(),
            trace_outgoing_record: false,
            trace_compress: false,
            trace_snapshot: false,
            trace_filters: Vec::new(),
        }
    }
}

impl Config {
    /// Publish this configuration process-wide.
    pub fn apply(self) {
        if CONFIG.set(self).is_err() {
            panic!("Global configuration already applied");
        }
    }

    /// Like apply(), but tolerant of repeat application.  Test harnesses
    /// initialize the global more than once across test functions.
    pub fn apply_if_unset(self) {
        CONFIG.set(self).ok();
    }

    pub fn log_file_path(&self) -> Option<&str> {
        if self.logging_file_enable {
            self.logging_file_properties.get("path").map(|s| s.as_str())
        } else {
            None
        }
    }

    /// Whether connections to clients are encrypted (directly or by a
    /// terminating proxy in front of us).
    pub fn is_ssl_visible(&self) -> bool {
        self.ssl_enable || self.ssl_termination
    }

    pub fn wopi_host_allowed(&self, host: &str) -> bool {
        if !self.storage_wopi_allow {
            return false;
        }
        self.storage_wopi_hosts
            .iter()
            .find(|h| h.host == host)
            .map(|h| h.allow)
            .unwrap_or(false)
    }

    /// Parse a YAML configuration file.  Missing keys keep their defaults.
    pub fn from_yaml(filename: &str) -> GateResult<Self> {
        let yaml_text = fs::read_to_string(filename)
            .map_err(|e| format!("Error reading config [{filename}]: {e}"))?;

        let mut conf = Self::from_yaml_string(&yaml_text)?;
        conf.filename = filename.to_string();
        Ok(conf)
    }

    pub fn from_yaml_string(yaml_text: &str) -> GateResult<Self> {
        let mut conf = Config::default();

        let yaml_docs = YamlLoader::load_from_str(yaml_text)
            .map_err(|e| format!("Error parsing config: {e}"))?;

        let root = match yaml_docs.first() {
            Some(v) => &v["docgate"],
            None => return Ok(conf),
        };

        if let Some(v) = root["server_name"].as_str() {
            conf.server_name = v.to_string();
        }
        if let Some(v) = root["tile_cache_path"].as_str() {
            conf.tile_cache_path = v.to_string();
        }
        if let Some(v) = root["sys_template_path"].as_str() {
            conf.sys_template_path = v.to_string();
        }
        if let Some(v) = root["lo_template_path"].as_str() {
            conf.lo_template_path = v.to_string();
        }
        if let Some(v) = root["child_root_path"].as_str() {
            conf.child_root_path = v.to_string();
        }
        if let Some(v) = root["lo_jail_subpath"].as_str() {
            conf.lo_jail_subpath = v.to_string();
        }
        if let Some(v) = root["file_server_root_path"].as_str() {
            conf.file_server_root_path = v.to_string();
        }
        if let Some(v) = root["forkit_path"].as_str() {
            conf.forkit_path = v.to_string();
        }
        if let Some(v) = root["num_prespawn_children"].as_i64() {
            conf.num_prespawn_children = v as usize;
        }
        if let Some(v) = root["loleaflet_html"].as_str() {
            conf.loleaflet_html = v.to_string();
        }
        if let Some(v) = root["loleaflet_logging"].as_bool() {
            conf.loleaflet_logging = v;
        }

        let per_doc = &root["per_document"];
        if let Some(v) = per_doc["max_concurrency"].as_i64() {
            conf.per_document_max_concurrency = v as usize;
        }

        let ssl = &root["ssl"];
        if let Some(v) = ssl["enable"].as_bool() {
            conf.ssl_enable = v;
        }
        if let Some(v) = ssl["termination"].as_bool() {
            conf.ssl_termination = v;
        }
        if let Some(v) = ssl["cert_file_path"].as_str() {
            conf.ssl_cert_file_path = v.to_string();
        }
        if let Some(v) = ssl["key_file_path"].as_str() {
            conf.ssl_key_file_path = v.to_string();
        }
        if let Some(v) = ssl["ca_file_path"].as_str() {
            conf.ssl_ca_file_path = v.to_string();
        }

        let logging = &root["logging"];
        if let Some(v) = logging["level"].as_str() {
            conf.logging_level = v.to_string();
        }
        if let Some(v) = logging["color"].as_bool() {
            conf.logging_color = v;
        }
        let logfile = &logging["file"];
        if let Some(v) = logfile["enable"].as_bool() {
            conf.logging_file_enable = v;
        }
        if let Yaml::Hash(ref props) = logfile["properties"] {
            for (key, val) in props {
                if let (Some(k), Some(v)) = (key.as_str(), val.as_str()) {
                    conf.logging_file_properties
                        .insert(k.to_string(), v.to_string());
                }
            }
        }

        let admin = &root["admin_console"];
        if let Some(v) = admin["username"].as_str() {
            conf.admin_console_username = v.to_string();
        }
        if let Some(v) = admin["password"].as_str() {
            conf.admin_console_password = v.to_string();
        }

        let storage = &root["storage"];
        if let Some(v) = storage["filesystem"]["allow"].as_bool() {
            conf.storage_filesystem_allow = v;
        }
        let wopi = &storage["wopi"];
        if let Some(v) = wopi["allow"].as_bool() {
            conf.storage_wopi_allow = v;
        }
        if let Some(v) = wopi["max_file_size"].as_i64() {
            conf.storage_wopi_max_file_size = v as usize;
        }
        if let Yaml::Array(ref hosts) = wopi["hosts"] {
            conf.storage_wopi_hosts.clear();
            for entry in hosts {
                let host = entry["host"]
                    .as_str()
                    .map(|s| s.to_string())
                    .ok_or_else(|| GateError::from("WOPI host entry requires a 'host' value"))?;
                let allow = entry["allow"].as_bool().unwrap_or(false);
                conf.storage_wopi_hosts.push(WopiHost { host, allow });
            }
        }

        let trace = &root["trace"];
        if let Some(v) = trace["enable"].as_bool() {
            conf.trace_enable = v;
        }
        if let Some(v) = trace["path"].as_str() {
            conf.trace_path = v.to_string();
        }
        if let Some(v) = trace["compress"].as_bool() {
            conf.trace_compress = v;
        }
        if let Some(v) = trace["snapshot"].as_bool() {
            conf.trace_snapshot = v;
        }
        if let Some(v) = trace["outgoing"]["record"].as_bool() {
            conf.trace_outgoing_record = v;
        }
        if let Yaml::Array(ref filters) = trace["filter"]["messages"] {
            for f in filters {
                if let Some(v) = f.as_str() {
                    conf.trace_filters.push(v.to_string());
                }
            }
        }

        Ok(conf)
    }

    /// Apply one `--override key=value` pair.
    ///
    /// Keys use the flattened dotted names; `[@attr]` spellings and
    /// `[N]` indices are normalized first, so
    /// `logging.file[@enable]=true` and `storage.wopi.host[0]=example.org`
    /// both work.
    pub fn set_key(&mut self, key: &str, value: &str) -> GateResult<()> {
        let norm = normalize_key(key);

        let parse_bool = |v: &str| -> GateResult<bool> {
            match v {
                "true" | "yes" | "1" => Ok(true),
                "false" | "no" | "0" => Ok(false),
                _ => Err(format!("Invalid boolean for [{key}]: {v}").into()),
            }
        };

        match norm.as_str() {
            "server_name" => self.server_name = value.to_string(),
            "tile_cache_path" => self.tile_cache_path = value.to_string(),
            "sys_template_path" => self.sys_template_path = value.to_string(),
            "lo_template_path" => self.lo_template_path = value.to_string(),
            "child_root_path" => self.child_root_path = value.to_string(),
            "lo_jail_subpath" => self.lo_jail_subpath = value.to_string(),
            "file_server_root_path" => self.file_server_root_path = value.to_string(),
            "forkit_path" => self.forkit_path = value.to_string(),
            "loleaflet_html" => self.loleaflet_html = value.to_string(),
            "loleaflet_logging" => self.loleaflet_logging = parse_bool(value)?,
            "num_prespawn_children" => {
                self.num_prespawn_children = value
                    .parse()
                    .map_err(|_| format!("Invalid number for [{key}]: {value}"))?
            }
            "per_document.max_concurrency" => {
                self.per_document_max_concurrency = value
                    .parse()
                    .map_err(|_| format!("Invalid number for [{key}]: {value}"))?
            }
            "ssl.enable" => self.ssl_enable = parse_bool(value)?,
            "ssl.termination" => self.ssl_termination = parse_bool(value)?,
            "ssl.cert_file_path" => self.ssl_cert_file_path = value.to_string(),
            "ssl.key_file_path" => self.ssl_key_file_path = value.to_string(),
            "ssl.ca_file_path" => self.ssl_ca_file_path = value.to_string(),
            "logging.level" => self.logging_level = value.to_string(),
            "logging.color" => self.logging_color = parse_bool(value)?,
            "logging.file.enable" => self.logging_file_enable = parse_bool(value)?,
            "admin_console.username" => self.admin_console_username = value.to_string(),
            "admin_console.password" => self.admin_console_password = value.to_string(),
            "storage.filesystem.allow" => self.storage_filesystem_allow = parse_bool(value)?,
            "storage.wopi.allow" => self.storage_wopi_allow = parse_bool(value)?,
            "storage.wopi.max_file_size" => {
                self.storage_wopi_max_file_size = value
                    .parse()
                    .map_err(|_| format!("Invalid number for [{key}]: {value}"))?
            }
            "trace.enable" => self.trace_enable = parse_bool(value)?,
            "trace.path" => self.trace_path = value.to_string(),
            "trace.path.compress" => self.trace_compress = parse_bool(value)?,
            "trace.path.snapshot" => self.trace_snapshot = parse_bool(value)?,
            "trace.outgoing.record" => self.trace_outgoing_record = parse_bool(value)?,
            _ => {
                // Indexed keys: storage.wopi.host.N[.allow],
                // logging.file.property.N, trace.filter.message.N
                if let Some(rest) = norm.strip_prefix("storage.wopi.host.") {
                    return self.set_wopi_host_key(key, rest, value, &parse_bool);
                }
                if let Some(rest) = norm.strip_prefix("trace.filter.message.") {
                    let idx: usize = rest
                        .parse()
                        .map_err(|_| format!("Invalid filter index in [{key}]"))?;
                    if idx >= self.trace_filters.len() {
                        self.trace_filters.resize(idx + 1, String::new());
                    }
                    self.trace_filters[idx] = value.to_string();
                    return Ok(());
                }
                return Err(format!("Unknown configuration key [{key}]").into());
            }
        }

        Ok(())
    }

    fn set_wopi_host_key(
        &mut self,
        key: &str,
        rest: &str,
        value: &str,
        parse_bool: &dyn Fn(&str) -> GateResult<bool>,
    ) -> GateResult<()> {
        let (idx_str, attr) = match rest.split_once('.') {
            Some((i, a)) => (i, Some(a)),
            None => (rest, None),
        };

        let idx: usize = idx_str
            .parse()
            .map_err(|_| format!("Invalid host index in [{key}]"))?;

        while self.storage_wopi_hosts.len() <= idx {
            self.storage_wopi_hosts.push(WopiHost {
                host: String::new(),
                allow: false,
            });
        }

        match attr {
            None => self.storage_wopi_hosts[idx].host = value.to_string(),
            Some("allow") => self.storage_wopi_hosts[idx].allow = parse_bool(value)?,
            Some(other) => {
                return Err(format!("Unknown WOPI host attribute [{other}] in [{key}]").into())
            }
        }

        Ok(())
    }
}

/// `logging.file[@enable]` -> `logging.file.enable`;
/// `storage.wopi.host[0][@allow]` -> `storage.wopi.host.0.allow`.
fn normalize_key(key: &str) -> String {
    key.replace("[@", ".").replace('[', ".").replace(']', "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_yaml_roundtrip() {
        let yaml = r#"
docgate:
  server_name: docs.example.org
  num_prespawn_children: 4
  ssl:
    enable: false
    termination: true
  logging:
    level: debug
    file:
      enable: true
      properties:
        path: /tmp/dg.log
  admin_console:
    username: admin
    password: s3cret
  storage:
    wopi:
      allow: true
      max_file_size: 1048576
      hosts:
        - host: wopi.example.org
          allow: true
        - host: evil.example.org
          allow: false
"#;
        let conf = Config::from_yaml_string(yaml).unwrap();
        assert_eq!(conf.server_name, "docs.example.org");
        assert_eq!(conf.num_prespawn_children, 4);
        assert!(!conf.ssl_enable);
        assert!(conf.ssl_termination);
        assert!(conf.is_ssl_visible());
        assert_eq!(conf.logging_level, "debug");
        assert_eq!(conf.log_file_path(), Some("/tmp/dg.log"));
        assert_eq!(conf.admin_console_password, "s3cret");
        assert_eq!(conf.storage_wopi_max_file_size, 1048576);
        assert!(conf.wopi_host_allowed("wopi.example.org"));
        assert!(!conf.wopi_host_allowed("evil.example.org"));
        assert!(!conf.wopi_host_allowed("unknown.example.org"));

        // Untouched keys keep their defaults.
        assert_eq!(conf.child_root_path, "jails");
        assert_eq!(conf.per_document_max_concurrency, 4);
    }

    #[test]
    fn overrides_and_bracket_normalization() {
        let mut conf = Config::default();

        conf.set_key("ssl.enable", "false").unwrap();
        assert!(!conf.ssl_enable);

        conf.set_key("logging.file[@enable]", "true").unwrap();
        assert!(conf.logging_file_enable);

        conf.set_key("storage.wopi.host[1]", "other.example.org").unwrap();
        conf.set_key("storage.wopi.host[1][@allow]", "true").unwrap();
        assert_eq!(conf.storage_wopi_hosts[1].host, "other.example.org");
        assert!(conf.storage_wopi_hosts[1].allow);

        conf.set_key("trace.filter.message[0]", "tile .*").unwrap();
        assert_eq!(conf.trace_filters[0], "tile .*");

        assert!(conf.set_key("no.such.key", "x").is_err());
        assert!(conf.set_key("ssl.enable", "maybe").is_err());
    }
}
