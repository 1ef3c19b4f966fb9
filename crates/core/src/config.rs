use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Shortest flush period the settings loader accepts.
pub const MIN_INTERVAL_SECONDS: u64 = 10;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_bool(profile: &str, key: &str, default: bool) -> bool {
    match profiled_env_opt(profile, key).as_deref() {
        Some("1") | Some("true") | Some("yes") => true,
        Some("0") | Some("false") | Some("no") => false,
        _ => default,
    }
}

fn profiled_env_usize(profile: &str, key: &str, default: usize) -> usize {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Worker (host process) config ──────────────────────────────

/// Host-level settings for the autoscan worker process.
///
/// These are fixed for the lifetime of the process. The ingest settings that
/// change at runtime live in [`IngestConfig`] and arrive through the settings
/// stream instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Active profile name (empty = default).
    pub profile: String,
    /// Application data directory: ledger file, trash, default storage.
    pub data_dir: PathBuf,
    /// TOML document holding the live [`IngestConfig`].
    pub settings_path: PathBuf,
    /// Window in which bursts of settings changes are merged into one pass.
    pub coalesce_ms: u64,
    /// Upper bound for a single filesystem move or delete.
    pub fs_timeout_secs: u64,
    /// Capacity of the outbound event channel.
    pub event_capacity: usize,
    /// Send deletes to the host trash before falling back to `trash_dir`.
    pub system_trash: bool,
}

impl WorkerConfig {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `AUTOSCAN_PROFILE`. When set (e.g. `DEV`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("AUTOSCAN_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        let data_dir = PathBuf::from(
            profiled_env_opt(p, "AUTOSCAN_DATA_DIR").unwrap_or_else(|| "data".to_string()),
        );
        let settings_path = profiled_env_opt(p, "AUTOSCAN_SETTINGS")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("autoscan.toml"));
        Self {
            profile: p.to_string(),
            data_dir,
            settings_path,
            coalesce_ms: profiled_env_u64(p, "AUTOSCAN_COALESCE_MS", 500),
            fs_timeout_secs: profiled_env_u64(p, "AUTOSCAN_FS_TIMEOUT_SECS", 30),
            event_capacity: profiled_env_usize(p, "AUTOSCAN_EVENT_CAPACITY", 256),
            system_trash: profiled_env_bool(p, "AUTOSCAN_SYSTEM_TRASH", true),
        }
    }

    /// Point the worker at another data directory.
    ///
    /// The settings path follows only while it is the default one under the
    /// old data directory; an explicitly chosen settings path is kept.
    pub fn set_data_dir(&mut self, dir: impl Into<PathBuf>) {
        let dir = dir.into();
        if self.settings_path == self.data_dir.join("autoscan.toml") {
            self.settings_path = dir.join("autoscan.toml");
        }
        self.data_dir = dir;
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Location of the pending-transfer ledger document.
    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("pending-transfers.json")
    }

    /// Directory receiving recoverably deleted files.
    pub fn trash_dir(&self) -> PathBuf {
        self.data_dir.join("trash")
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  data_dir:    {}", self.data_dir.display());
        tracing::info!("  settings:    {}", self.settings_path.display());
        tracing::info!("  coalesce:    {}ms", self.coalesce_ms);
        tracing::info!("  fs_timeout:  {}s", self.fs_timeout_secs);
        tracing::info!("  sys_trash:   {}", self.system_trash);
    }
}

// ── Ingest settings (live) ────────────────────────────────────

/// Live ingest settings delivered through the configuration stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestConfig {
    pub autoscan: AutoscanSettings,
    pub manager: ManagerSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoscanSettings {
    pub enabled: bool,
    /// Watched directory.
    pub path: PathBuf,
    pub interval_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerSettings {
    pub enabled: bool,
    /// Root of application-managed storage; holds `pending/` and `files/`.
    pub storage_location: PathBuf,
    #[serde(default)]
    pub target: ManagerTarget,
}

/// Which imports the file manager takes ownership of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagerTarget {
    #[default]
    Autoscan,
    All,
}

impl IngestConfig {
    /// Defaults used when no settings document exists yet.
    ///
    /// Autoscan starts disabled and points at `<Downloads>/Knowledge`.
    pub fn defaults(data_dir: &Path) -> Self {
        let base = dirs::download_dir().unwrap_or_else(|| data_dir.to_path_buf());
        Self {
            autoscan: AutoscanSettings {
                enabled: false,
                path: absolutize(&base.join("Knowledge")),
                interval_seconds: 15,
            },
            manager: ManagerSettings {
                enabled: true,
                storage_location: absolutize(data_dir),
                target: ManagerTarget::Autoscan,
            },
        }
    }

    /// Parse settings from a TOML string, apply env overrides and validate.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load settings from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply environment variable overrides.
    ///
    /// - `AUTOSCAN_ENABLED` → `autoscan.enabled`
    /// - `AUTOSCAN_PATH` → `autoscan.path`
    /// - `AUTOSCAN_INTERVAL_SECS` → `autoscan.intervalSeconds`
    /// - `AUTOSCAN_STORAGE_LOCATION` → `manager.storageLocation`
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_opt("AUTOSCAN_ENABLED") {
            self.autoscan.enabled = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Some(v) = env_opt("AUTOSCAN_PATH") {
            self.autoscan.path = PathBuf::from(v);
        }
        if let Some(v) = env_opt("AUTOSCAN_INTERVAL_SECS") {
            if let Ok(secs) = v.parse::<u64>() {
                self.autoscan.interval_seconds = secs;
            }
        }
        if let Some(v) = env_opt("AUTOSCAN_STORAGE_LOCATION") {
            self.manager.storage_location = PathBuf::from(v);
        }
    }

    /// Check the invariants the reconciler relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.autoscan.interval_seconds < MIN_INTERVAL_SECONDS {
            return Err(ConfigError::Invalid(format!(
                "autoscan.intervalSeconds must be at least {MIN_INTERVAL_SECONDS}, got {}",
                self.autoscan.interval_seconds
            )));
        }
        if !self.autoscan.path.is_absolute() {
            return Err(ConfigError::Invalid(format!(
                "autoscan.path must be absolute: '{}'",
                self.autoscan.path.display()
            )));
        }
        if !self.manager.storage_location.is_absolute() {
            return Err(ConfigError::Invalid(format!(
                "manager.storageLocation must be absolute: '{}'",
                self.manager.storage_location.display()
            )));
        }
        if self.manager.storage_location.starts_with(&self.autoscan.path) {
            return Err(ConfigError::Invalid(format!(
                "manager.storageLocation '{}' must not be inside autoscan.path '{}'",
                self.manager.storage_location.display(),
                self.autoscan.path.display()
            )));
        }
        Ok(())
    }
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_SETTINGS: &str = r#"
[autoscan]
enabled = true
path = "/home/user/Downloads/Knowledge"
intervalSeconds = 15

[manager]
enabled = true
storageLocation = "/home/user/.canvas"
target = "all"
"#;

    #[test]
    fn parse_settings_document() {
        let config: IngestConfig = toml::from_str(VALID_SETTINGS).unwrap();
        config.validate().unwrap();
        assert!(config.autoscan.enabled);
        assert_eq!(config.autoscan.interval_seconds, 15);
        assert_eq!(config.manager.storage_location, PathBuf::from("/home/user/.canvas"));
        assert_eq!(config.manager.target, ManagerTarget::All);
    }

    #[test]
    fn target_defaults_to_autoscan() {
        let doc = VALID_SETTINGS.replace("target = \"all\"\n", "");
        let config: IngestConfig = toml::from_str(&doc).unwrap();
        assert_eq!(config.manager.target, ManagerTarget::Autoscan);
    }

    #[test]
    fn short_interval_is_rejected() {
        let doc = VALID_SETTINGS.replace("intervalSeconds = 15", "intervalSeconds = 5");
        let config: IngestConfig = toml::from_str(&doc).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("at least 10"));
    }

    #[test]
    fn relative_paths_are_rejected() {
        let doc = VALID_SETTINGS.replace("/home/user/.canvas", "relative/store");
        let config: IngestConfig = toml::from_str(&doc).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn storage_inside_watched_directory_is_rejected() {
        let doc = VALID_SETTINGS.replace(
            "storageLocation = \"/home/user/.canvas\"",
            "storageLocation = \"/home/user/Downloads/Knowledge/store\"",
        );
        let config: IngestConfig = toml::from_str(&doc).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must not be inside autoscan.path"));

        let doc = VALID_SETTINGS.replace("/home/user/.canvas", "/home/user/Downloads/Knowledge");
        let config: IngestConfig = toml::from_str(&doc).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn toml_roundtrip_keeps_camel_case_keys() {
        let config: IngestConfig = toml::from_str(VALID_SETTINGS).unwrap();
        let text = config.to_toml().unwrap();
        assert!(text.contains("intervalSeconds"));
        assert!(text.contains("storageLocation"));
        let back: IngestConfig = toml::from_str(&text).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn defaults_are_valid_and_disabled() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = IngestConfig::defaults(dir.path());
        config.validate().unwrap();
        assert!(!config.autoscan.enabled);
        assert!(config.autoscan.path.ends_with("Knowledge"));
        assert_eq!(config.manager.storage_location, dir.path());
    }

    #[test]
    fn worker_paths_derive_from_data_dir() {
        let config = WorkerConfig {
            profile: String::new(),
            data_dir: PathBuf::from("/var/lib/canvas"),
            settings_path: PathBuf::from("/var/lib/canvas/autoscan.toml"),
            coalesce_ms: 500,
            fs_timeout_secs: 30,
            event_capacity: 16,
            system_trash: true,
        };
        assert_eq!(config.ledger_path(), PathBuf::from("/var/lib/canvas/pending-transfers.json"));
        assert_eq!(config.trash_dir(), PathBuf::from("/var/lib/canvas/trash"));
        assert_eq!(config.profile_label(), "default");
    }

    fn worker(data_dir: &str, settings_path: &str) -> WorkerConfig {
        WorkerConfig {
            profile: "DEV".to_string(),
            data_dir: PathBuf::from(data_dir),
            settings_path: PathBuf::from(settings_path),
            coalesce_ms: 500,
            fs_timeout_secs: 30,
            event_capacity: 16,
            system_trash: false,
        }
    }

    #[test]
    fn data_dir_override_moves_default_settings_path() {
        let mut config = worker("/var/lib/canvas", "/var/lib/canvas/autoscan.toml");
        config.set_data_dir("/srv/canvas");
        assert_eq!(config.data_dir, PathBuf::from("/srv/canvas"));
        assert_eq!(config.settings_path, PathBuf::from("/srv/canvas/autoscan.toml"));
    }

    #[test]
    fn data_dir_override_keeps_explicit_settings_path() {
        let mut config = worker("/var/lib/canvas", "/etc/canvas/dev-autoscan.toml");
        config.set_data_dir("/srv/canvas");
        assert_eq!(config.data_dir, PathBuf::from("/srv/canvas"));
        assert_eq!(config.settings_path, PathBuf::from("/etc/canvas/dev-autoscan.toml"));
        assert_eq!(config.ledger_path(), PathBuf::from("/srv/canvas/pending-transfers.json"));
    }
}
