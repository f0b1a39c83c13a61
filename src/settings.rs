//! Persisted settings: one TOML file holding named profiles.
//!
//! The file has a `[default]` section plus one section per profile. The
//! `active` key of `[default]` names the profile in effect; reads and writes
//! go to that profile, and a key missing there is looked up in `[default]`.
//!
//! ```toml
//! [default]
//! active = "inetman"
//! on = "pon"
//!
//! [inetman]
//! on = "pon"
//! off = "poff"
//! check_interface = "ppp0"
//! cumulative_time = 3600
//! ```
use std::path::{Path, PathBuf};
use std::time::Duration;
use toml::{Table, Value};

/// Section holding fallback values and the active-profile pointer.
pub const DEFAULT_SECTION: &str = "default";

/// Profile created on first run.
pub const DEFAULT_PROFILE: &str = "inetman";

/// Default location of the settings file.
pub const DEFAULT_CONFIG_PATH: &str = "/opt/inetman/inetman.toml";

/// Setting names.
pub mod keys {
    pub const ACTIVE: &str = "active";
    pub const ON: &str = "on";
    pub const OFF: &str = "off";
    pub const CHECK_INTERFACE: &str = "check_interface";
    pub const RUN_OFF_IF_FAILS: &str = "run_off_if_fails";
    pub const RUN_OFF_AT_EXIT: &str = "run_off_at_exit";
    pub const CHECK_INTERVAL: &str = "check_interval";
    pub const CHECK_GRACE_TIME: &str = "check_grace_time";
    pub const CUMULATIVE_TIME: &str = "cumulative_time";
    pub const CUMULATIVE_TIME_SLOT: &str = "cumulative_time_slot";
    pub const AUTO_CONNECT: &str = "auto_connect";
    pub const CONNECT_TIMEOUT: &str = "connect_timeout";
    pub const STATUS_FILE: &str = "status_file";
}

/// Values written into every new profile.
fn profile_defaults() -> Table {
    let mut t = Table::new();
    // Commands to run.
    t.insert(keys::ON.into(), Value::from("pon"));
    t.insert(keys::OFF.into(), Value::from("poff"));
    t.insert(keys::CHECK_INTERFACE.into(), Value::from("ppp0"));
    // Run `off` when the interface goes away on its own.
    t.insert(keys::RUN_OFF_IF_FAILS.into(), Value::from(true));
    // Run `off` at exit if the link is still up.
    t.insert(keys::RUN_OFF_AT_EXIT.into(), Value::from(true));
    t.insert(keys::CHECK_INTERVAL.into(), Value::from(1800));
    // Keep it larger than the time the link needs to come up.
    t.insert(keys::CHECK_GRACE_TIME.into(), Value::from(900));
    t.insert(keys::CUMULATIVE_TIME.into(), Value::from(0));
    t.insert(keys::CUMULATIVE_TIME_SLOT.into(), Value::from(1));
    t.insert(keys::AUTO_CONNECT.into(), Value::from(true));
    t.insert(keys::CONNECT_TIMEOUT.into(), Value::from(20));
    t.insert(keys::STATUS_FILE.into(), Value::from(""));
    t
}

/// Document written on first run.
fn default_document() -> Table {
    let mut default = profile_defaults();
    default.insert(keys::ACTIVE.into(), Value::from(DEFAULT_PROFILE));

    let mut doc = Table::new();
    doc.insert(DEFAULT_SECTION.into(), Value::Table(default));
    doc.insert(DEFAULT_PROFILE.into(), Value::Table(profile_defaults()));
    doc
}

/// Conversion from a stored value, `None` when it does not fit.
pub trait FromSetting: Sized {
    fn from_setting(value: &Value) -> Option<Self>;
}

impl FromSetting for String {
    fn from_setting(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Integer(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Boolean(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

impl FromSetting for u64 {
    fn from_setting(value: &Value) -> Option<Self> {
        match value {
            Value::Integer(i) => u64::try_from(*i).ok(),
            Value::Float(f) if f.is_finite() && *f >= 0.0 => Some(*f as u64),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl FromSetting for bool {
    fn from_setting(value: &Value) -> Option<Self> {
        match value {
            Value::Boolean(b) => Some(*b),
            Value::Integer(0) => Some(false),
            Value::Integer(1) => Some(true),
            Value::String(s) => parse_bool(s),
            _ => None,
        }
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "yes" | "true" | "on" => Some(true),
        "0" | "no" | "false" | "off" => Some(false),
        _ => None,
    }
}

/// Settings backed by a file on disk.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
    doc: Table,
}

impl SettingsStore {
    /// Read the settings file, creating it with defaults if it is missing.
    pub fn load_or_create(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        if path.exists() {
            return Self::load(path);
        }

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| SettingsError::Create {
                path: dir.to_path_buf(),
                source: e,
            })?;
        }
        let store = Self::with_defaults(path);
        store.save()?;
        tracing::info!(path = %store.path.display(), "created settings file with defaults");
        Ok(store)
    }

    /// Read an existing settings file.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let contents = std::fs::read_to_string(&path).map_err(|e| SettingsError::Read {
            path: path.clone(),
            source: e,
        })?;
        let doc: Table = toml::from_str(&contents).map_err(|e| SettingsError::Parse {
            path: path.clone(),
            source: e,
        })?;
        tracing::debug!(path = %path.display(), "loaded settings");
        Ok(Self { path, doc })
    }

    /// Default settings that will be saved to `path`; nothing touches disk.
    pub fn with_defaults(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            doc: default_document(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Name of the profile in effect (`default` when unset or dangling).
    pub fn active_section(&self) -> &str {
        let named = self
            .section(DEFAULT_SECTION)
            .and_then(|t| t.get(keys::ACTIVE))
            .and_then(Value::as_str)
            .filter(|name| self.section(name).is_some());
        named.unwrap_or(DEFAULT_SECTION)
    }

    fn section(&self, name: &str) -> Option<&Table> {
        self.doc.get(name).and_then(Value::as_table)
    }

    /// Look `key` up in the active profile, then `[default]`.
    ///
    /// Missing keys, empty strings and values that do not convert to `T`
    /// all yield `default`.
    pub fn get_value<T: FromSetting>(&self, key: &str, default: T) -> T {
        let active = self.active_section();
        let raw = self
            .section(active)
            .and_then(|t| t.get(key))
            .or_else(|| self.section(DEFAULT_SECTION).and_then(|t| t.get(key)));

        match raw {
            None => default,
            Some(Value::String(s)) if s.is_empty() => default,
            Some(value) => T::from_setting(value).unwrap_or_else(|| {
                tracing::warn!(key, section = active, value = %value, "invalid setting, using default");
                default
            }),
        }
    }

    /// Set `key` in the active profile (in memory; see [`save`](Self::save)).
    pub fn set_value(&mut self, key: &str, value: impl Into<Value>) {
        let active = self.active_section().to_string();
        self.section_mut(&active).insert(key.to_string(), value.into());
    }

    fn section_mut(&mut self, name: &str) -> &mut Table {
        let entry = self
            .doc
            .entry(name.to_string())
            .or_insert_with(|| Value::Table(Table::new()));
        if !entry.is_table() {
            *entry = Value::Table(Table::new());
        }
        match entry {
            Value::Table(t) => t,
            _ => unreachable!("entry was just replaced with a table"),
        }
    }

    /// Add a profile populated with default values. Existing profiles are left alone.
    pub fn add_section(&mut self, name: &str) -> bool {
        if self.section(name).is_some() {
            return false;
        }
        self.doc
            .insert(name.to_string(), Value::Table(profile_defaults()));
        true
    }

    /// Make `name` the active profile, creating it if needed.
    pub fn set_active(&mut self, name: &str) {
        if name != DEFAULT_SECTION && self.add_section(name) {
            tracing::info!(profile = name, "created profile");
        }
        self.section_mut(DEFAULT_SECTION)
            .insert(keys::ACTIVE.to_string(), Value::from(name));
    }

    /// Atomically write the settings back to their file.
    pub fn save(&self) -> Result<(), SettingsError> {
        let contents =
            toml::to_string_pretty(&self.doc).map_err(|e| SettingsError::Serialize { source: e })?;

        let dir = match self.path.parent() {
            Some(d) if !d.as_os_str().is_empty() => d,
            _ => Path::new("."),
        };
        let write_err = |e: std::io::Error| SettingsError::Write {
            path: self.path.clone(),
            source: e,
        };

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
        std::io::Write::write_all(&mut tmp, contents.as_bytes()).map_err(write_err)?;
        tmp.persist(&self.path).map_err(|e| write_err(e.error))?;
        Ok(())
    }
}

/// Tunables of the active profile, converted to their working types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunables {
    pub on_command: String,
    pub off_command: String,
    pub interface: String,
    pub run_off_if_fails: bool,
    pub run_off_at_exit: bool,
    pub check_interval: Duration,
    pub check_grace_time: Duration,
    /// Seconds per credited slot; never zero.
    pub cumulative_time_slot: u64,
    pub auto_connect: bool,
    pub connect_timeout: Duration,
    pub status_file: Option<PathBuf>,
}

impl Tunables {
    pub fn from_store(store: &SettingsStore) -> Self {
        let status_file: String = store.get_value(keys::STATUS_FILE, String::new());
        Self {
            on_command: store.get_value(keys::ON, "pon".to_string()),
            off_command: store.get_value(keys::OFF, "poff".to_string()),
            interface: store.get_value(keys::CHECK_INTERFACE, "ppp0".to_string()),
            run_off_if_fails: store.get_value(keys::RUN_OFF_IF_FAILS, true),
            run_off_at_exit: store.get_value(keys::RUN_OFF_AT_EXIT, true),
            // A zero interval would spin the loop.
            check_interval: Duration::from_secs(store.get_value(keys::CHECK_INTERVAL, 1800u64).max(1)),
            check_grace_time: Duration::from_secs(store.get_value(keys::CHECK_GRACE_TIME, 900u64)),
            cumulative_time_slot: store.get_value(keys::CUMULATIVE_TIME_SLOT, 1u64).max(1),
            auto_connect: store.get_value(keys::AUTO_CONNECT, true),
            connect_timeout: Duration::from_secs(store.get_value(keys::CONNECT_TIMEOUT, 20u64)),
            status_file: (!status_file.is_empty()).then(|| PathBuf::from(status_file)),
        }
    }
}

impl Default for Tunables {
    fn default() -> Self {
        Self::from_store(&SettingsStore::with_defaults(DEFAULT_CONFIG_PATH))
    }
}

/// Errors from reading or writing the settings file.
#[derive(Debug)]
pub enum SettingsError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Create {
        path: PathBuf,
        source: std::io::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Serialize {
        source: toml::ser::Error,
    },
}

impl std::fmt::Display for SettingsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettingsError::Read { path, source } => {
                write!(f, "failed to read settings {}: {source}", path.display())
            }
            SettingsError::Parse { path, source } => {
                write!(f, "failed to parse settings {}: {source}", path.display())
            }
            SettingsError::Create { path, source } => {
                write!(
                    f,
                    "failed to create settings directory {}: {source}",
                    path.display()
                )
            }
            SettingsError::Write { path, source } => {
                write!(f, "failed to write settings {}: {source}", path.display())
            }
            SettingsError::Serialize { source } => {
                write!(f, "failed to serialize settings: {source}")
            }
        }
    }
}

impl std::error::Error for SettingsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SettingsError::Read { source, .. } => Some(source),
            SettingsError::Parse { source, .. } => Some(source),
            SettingsError::Create { source, .. } => Some(source),
            SettingsError::Write { source, .. } => Some(source),
            SettingsError::Serialize { source } => Some(source),
        }
    }
}
