use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// User settings persisted between runs.
///
/// Every field is optional; unset fields fall back to compiled defaults
/// when the bridge is configured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeSettings {
    /// Engine module location (URL or filesystem path).
    #[serde(default)]
    pub module: Option<String>,
    /// Name of the registered engine runtime.
    #[serde(default)]
    pub runtime: Option<String>,
    /// Whether to prefer the background worker.
    #[serde(default)]
    pub prefer_worker: Option<bool>,
    /// Readiness ceiling in milliseconds.
    #[serde(default)]
    pub readiness_timeout_ms: Option<u64>,
}

impl BridgeSettings {
    fn normalize(&mut self) {
        self.module = self.module.as_ref().map(|s| s.trim().to_string());
        if matches!(self.module.as_deref(), Some(s) if s.is_empty()) {
            self.module = None;
        }

        self.runtime = self.runtime.as_ref().map(|s| s.trim().to_string());
        if matches!(self.runtime.as_deref(), Some(s) if s.is_empty()) {
            self.runtime = None;
        }

        if self.readiness_timeout_ms == Some(0) {
            self.readiness_timeout_ms = None;
        }
    }
}

fn xdg_config_home() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME") {
        let dir = PathBuf::from(dir);
        if dir.as_os_str().is_empty() {
            anyhow::bail!("XDG_CONFIG_HOME is set but empty");
        }
        return Ok(dir);
    }

    let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        anyhow::bail!("HOME is set but empty");
    }
    Ok(home.join(".config"))
}

/// Location of the settings file.
pub fn settings_path() -> anyhow::Result<PathBuf> {
    Ok(xdg_config_home()?.join("solver-bridge").join("config.json"))
}

/// Load settings, returning `None` when no file exists yet.
pub fn load_settings() -> anyhow::Result<Option<BridgeSettings>> {
    load_settings_from(&settings_path()?)
}

/// Persist settings atomically.
pub fn save_settings(settings: &BridgeSettings) -> anyhow::Result<()> {
    save_settings_to(&settings_path()?, settings)
}

fn load_settings_from(path: &std::path::Path) -> anyhow::Result<Option<BridgeSettings>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    let mut settings: BridgeSettings = serde_json::from_str(&raw)?;
    settings.normalize();
    Ok(Some(settings))
}

fn save_settings_to(path: &std::path::Path, settings: &BridgeSettings) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid config path: {}", path.display()))?;
    std::fs::create_dir_all(dir)?;

    let mut settings = settings.clone();
    settings.normalize();

    let json = serde_json::to_string_pretty(&settings)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}
