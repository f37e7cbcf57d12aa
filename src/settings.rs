//! Engine configuration.
//!
//! Settings come from three sources, later ones overriding earlier: hard-coded
//! defaults, an INI file with `[category]` sections, and command-line pairs of
//! the form `-EngineConnectToServer=1`. Keys are case-insensitive everywhere;
//! booleans accept `1/0`, `true/false` and `on/off`.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use log::LevelFilter;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed line {line}: {text:?}")]
    Malformed { line: usize, text: String },
}

/// Options consumed by the engine core.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Connect to the tool server; remote VFS mounts require this.
    pub connect_to_server: bool,
    /// `host:port` of the tool server.
    pub remote_services_url: String,
    /// Doubles alignments and enables validation in the TLSF/bump allocators.
    pub debug_allocations: bool,
    /// Log filter applied by the harness.
    pub log_level: LevelFilter,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            connect_to_server: false,
            remote_services_url: "127.0.0.1:6006".to_string(),
            debug_allocations: false,
            log_level: LevelFilter::Info,
        }
    }
}

/// Options for the tooling side (the server end of remote services).
#[derive(Debug, Clone)]
pub struct ToolingSettings {
    /// Start the remote-services server thread.
    pub enable_server: bool,
    /// Listen port.
    pub server_port: u16,
}

impl Default for ToolingSettings {
    fn default() -> Self {
        Self {
            enable_server: false,
            server_port: 6006,
        }
    }
}

/// The full settings store: typed categories plus free-form user keys.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub engine: EngineSettings,
    pub tooling: ToolingSettings,
    custom: BTreeMap<String, String>,
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" => Some(true),
        "0" | "false" | "off" => Some(false),
        _ => None,
    }
}

fn parse_log_level(value: &str) -> Option<LevelFilter> {
    match value.trim().to_ascii_lowercase().as_str() {
        "off" => Some(LevelFilter::Off),
        "error" => Some(LevelFilter::Error),
        "warning" | "warn" => Some(LevelFilter::Warn),
        "info" => Some(LevelFilter::Info),
        "debug" | "verbose" => Some(LevelFilter::Debug),
        "trace" => Some(LevelFilter::Trace),
        _ => None,
    }
}

impl Settings {
    /// Apply one `category/key/value` triple. Unknown keys land in the custom
    /// store as `category.key`.
    fn apply(&mut self, category: &str, key: &str, value: &str) {
        let cat = category.to_ascii_lowercase();
        let k = key.to_ascii_lowercase();
        match (cat.as_str(), k.as_str()) {
            ("engine", "connecttoserver") => {
                if let Some(b) = parse_bool(value) {
                    self.engine.connect_to_server = b;
                }
            }
            ("engine", "remoteservicesurl") => {
                self.engine.remote_services_url = value.trim().to_string();
            }
            ("engine", "debugallocations") => {
                if let Some(b) = parse_bool(value) {
                    self.engine.debug_allocations = b;
                }
            }
            ("engine", "loglevel") => {
                if let Some(l) = parse_log_level(value) {
                    self.engine.log_level = l;
                }
            }
            ("tooling", "enableserver") => {
                if let Some(b) = parse_bool(value) {
                    self.tooling.enable_server = b;
                }
            }
            ("tooling", "serverport") => {
                if let Ok(port) = value.trim().parse::<u16>() {
                    self.tooling.server_port = port;
                }
            }
            _ => {
                let full_key = if category.is_empty() {
                    k
                } else {
                    format!("{}.{}", cat, k)
                };
                self.custom.insert(full_key, value.trim().to_string());
            }
        }
    }

    /// Parse INI text into this store.
    pub fn load_ini_str(&mut self, text: &str) -> Result<(), SettingsError> {
        let mut section = String::new();
        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[') {
                let name = name.strip_suffix(']').ok_or(SettingsError::Malformed {
                    line: index + 1,
                    text: raw.to_string(),
                })?;
                section = name.trim().to_string();
                continue;
            }
            let (key, value) = line.split_once('=').ok_or(SettingsError::Malformed {
                line: index + 1,
                text: raw.to_string(),
            })?;
            self.apply(&section, key.trim(), value);
        }
        Ok(())
    }

    /// Load and parse an INI file.
    pub fn load_ini_file(&mut self, path: impl AsRef<Path>) -> Result<(), SettingsError> {
        let text = std::fs::read_to_string(path)?;
        self.load_ini_str(&text)
    }

    /// Ingest command-line pairs of the form `-EngineConnectToServer=1`.
    /// Arguments that match no typed setting become custom keys.
    pub fn apply_command_line<'a>(&mut self, args: impl IntoIterator<Item = &'a str>) {
        const CATEGORIES: &[&str] = &["engine", "tooling"];
        for arg in args {
            let Some(arg) = arg.strip_prefix('-') else {
                continue;
            };
            let (key, value) = match arg.split_once('=') {
                Some((k, v)) => (k, v),
                None => (arg, "1"),
            };
            let lower = key.to_ascii_lowercase();
            let category = CATEGORIES
                .iter()
                .find(|c| lower.starts_with(**c) && lower.len() > c.len());
            match category {
                Some(c) => self.apply(c, &lower[c.len()..], value),
                None => self.apply("", key, value),
            }
        }
    }

    /// Serialise to INI text. Custom keys come first, then the typed sections.
    pub fn save_ini(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.custom {
            match key.split_once('.') {
                // Sectioned custom keys are re-emitted under their section at
                // the end; only bare keys belong to the header.
                Some(_) => {}
                None => {
                    let _ = writeln!(out, "{}={}", key, value);
                }
            }
        }

        let _ = writeln!(out, "[engine]");
        let _ = writeln!(out, "connectToServer={}", self.engine.connect_to_server as u8);
        let _ = writeln!(out, "remoteServicesUrl={}", self.engine.remote_services_url);
        let _ = writeln!(out, "debugAllocations={}", self.engine.debug_allocations as u8);
        let _ = writeln!(out, "logLevel={}", level_name(self.engine.log_level));

        let _ = writeln!(out, "[tooling]");
        let _ = writeln!(out, "enableServer={}", self.tooling.enable_server as u8);
        let _ = writeln!(out, "serverPort={}", self.tooling.server_port);

        let mut last_section = "";
        for (key, value) in &self.custom {
            if let Some((section, bare)) = key.split_once('.') {
                if section != last_section {
                    let _ = writeln!(out, "[{}]", section);
                    last_section = section;
                }
                let _ = writeln!(out, "{}={}", bare, value);
            }
        }
        out
    }

    pub fn save_ini_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        std::fs::write(path, self.save_ini())
    }

    /// Set a free-form user key.
    pub fn set_value(&mut self, key: &str, value: &str) {
        self.custom
            .insert(key.to_ascii_lowercase(), value.to_string());
    }

    /// Read a free-form user key, falling back to `default`.
    pub fn value<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.custom
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
            .unwrap_or(default)
    }
}

fn level_name(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warning",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ini_parse_typed_sections() {
        let mut settings = Settings::default();
        settings
            .load_ini_str(
                "userkey=somevalue\n\
                 [engine]\n\
                 connectToServer=ON\n\
                 remoteServicesUrl=10.0.0.5:7000\n\
                 [tooling]\n\
                 enableServer=true\n\
                 serverPort=7000\n",
            )
            .unwrap();

        assert!(settings.engine.connect_to_server);
        assert_eq!(settings.engine.remote_services_url, "10.0.0.5:7000");
        assert!(settings.tooling.enable_server);
        assert_eq!(settings.tooling.server_port, 7000);
        assert_eq!(settings.value("userkey", ""), "somevalue");
    }

    #[test]
    fn test_bool_forms() {
        for (text, expected) in [
            ("1", true),
            ("0", false),
            ("TRUE", true),
            ("False", false),
            ("on", true),
            ("OFF", false),
        ] {
            assert_eq!(parse_bool(text), Some(expected), "{}", text);
        }
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_command_line_pairs() {
        let mut settings = Settings::default();
        settings.apply_command_line([
            "-EngineConnectToServer=1",
            "-ToolingServerPort=9001",
            "-customFlag=yes",
            "positional",
        ]);
        assert!(settings.engine.connect_to_server);
        assert_eq!(settings.tooling.server_port, 9001);
        assert_eq!(settings.value("customflag", ""), "yes");
    }

    #[test]
    fn test_save_load_roundtrip() {
        let mut settings = Settings::default();
        settings.engine.connect_to_server = true;
        settings.tooling.server_port = 8123;
        settings.set_value("project", "sandbox");

        let text = settings.save_ini();
        let mut reloaded = Settings::default();
        reloaded.load_ini_str(&text).unwrap();
        assert!(reloaded.engine.connect_to_server);
        assert_eq!(reloaded.tooling.server_port, 8123);
        assert_eq!(reloaded.value("project", ""), "sandbox");
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.ini");

        let mut settings = Settings::default();
        settings.engine.debug_allocations = true;
        settings.set_value("lastScene", "sponza");
        settings.save_ini_file(&path).unwrap();

        let mut reloaded = Settings::default();
        reloaded.load_ini_file(&path).unwrap();
        assert!(reloaded.engine.debug_allocations);
        assert_eq!(reloaded.value("lastscene", ""), "sponza");
    }

    #[test]
    fn test_malformed_line_reports_position() {
        let mut settings = Settings::default();
        let err = settings.load_ini_str("[engine]\nnot a pair\n").unwrap_err();
        match err {
            SettingsError::Malformed { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {other}"),
        }
    }
}
