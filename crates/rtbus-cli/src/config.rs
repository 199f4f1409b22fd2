//! CLI configuration – reads/writes `~/.rtbus/config.toml`.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use rtbus_types::{BusConfig, MessageOrder};

/// Parameters of the `rtbus run` demo system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DemoConfig {
    /// Slots in the sensor topic ring.
    #[serde(default = "default_topic_capacity")]
    pub topic_capacity: usize,

    /// Sensor publish period.
    #[serde(default = "default_publish_period_ms")]
    pub publish_period_ms: u64,

    /// How long `rtbus run` runs before stopping the nodes.
    #[serde(default = "default_run_secs")]
    pub run_secs: u64,

    /// Deadline of the controller's hard real-time subscription.
    #[serde(default = "default_hrt_deadline_ms")]
    pub hrt_deadline_ms: u64,

    /// Deadline of the controller's firm real-time motor requests.
    #[serde(default = "default_service_deadline_ms")]
    pub service_deadline_ms: u64,
}

fn default_topic_capacity() -> usize {
    8
}
fn default_publish_period_ms() -> u64 {
    10
}
fn default_run_secs() -> u64 {
    5
}
fn default_hrt_deadline_ms() -> u64 {
    50
}
fn default_service_deadline_ms() -> u64 {
    20
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            topic_capacity: default_topic_capacity(),
            publish_period_ms: default_publish_period_ms(),
            run_secs: default_run_secs(),
            hrt_deadline_ms: default_hrt_deadline_ms(),
            service_deadline_ms: default_service_deadline_ms(),
        }
    }
}

/// Persisted configuration stored in `~/.rtbus/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub demo: DemoConfig,
}

/// Return the path to `~/.rtbus/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".rtbus").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `RTBUS_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `RTBUS_MESSAGE_ORDER` | `bus.message_order` (`pubtime` / `msgtime`) |
/// | `RTBUS_PUBLISH_TIMEOUT_MS` | `bus.publish_timeout_ms` |
/// | `RTBUS_RUN_SECS` | `demo.run_secs` |
/// | `RTBUS_PUBLISH_PERIOD_MS` | `demo.publish_period_ms` |
///
/// Unparsable values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |name| std::env::var(name).ok());
}

pub(crate) fn apply_overrides(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("RTBUS_MESSAGE_ORDER") {
        match v.to_ascii_lowercase().as_str() {
            "pubtime" => cfg.bus.message_order = MessageOrder::PubTime,
            "msgtime" => cfg.bus.message_order = MessageOrder::MsgTime,
            _ => {}
        }
    }
    if let Some(v) = lookup("RTBUS_PUBLISH_TIMEOUT_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.bus.publish_timeout_ms = Some(ms);
    }
    if let Some(v) = lookup("RTBUS_RUN_SECS")
        && let Ok(secs) = v.parse::<u64>()
    {
        cfg.demo.run_secs = secs;
    }
    if let Some(v) = lookup("RTBUS_PUBLISH_PERIOD_MS")
        && let Ok(ms) = v.parse::<u64>()
        && ms > 0
    {
        cfg.demo.publish_period_ms = ms;
    }
}

/// Save the config to disk, creating `~/.rtbus/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

/// JSON schema of [`Config`], pretty printed.
pub fn schema_json() -> Result<String, String> {
    let schema = schemars::schema_for!(Config);
    serde_json::to_string_pretty(&schema).map_err(|e| format!("Failed to render schema: {}", e))
}
