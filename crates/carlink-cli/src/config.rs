//! `~/.carlink/config.toml` – load, override, save.

use std::fs;
use std::path::{Path, PathBuf};

use carlink_runtime::config::{AgentConfig, LinkTuning, ServerConfig, VisionConfig};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// Everything the `carlink` binary can be configured with.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub link: LinkTuning,
    #[serde(default)]
    pub vision: VisionConfig,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("agent", &self.agent)
            .field("server", &self.server)
            .field("link", &self.link)
            .field("vision", &self.vision)
            .finish()
    }
}

impl Drop for Config {
    fn drop(&mut self) {
        self.vision.api_key.zeroize();
    }
}

impl Config {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.agent.validate().map_err(|e| e.to_string())?;
        self.server.validate().map_err(|e| e.to_string())?;
        self.link.validate().map_err(|e| e.to_string())?;
        self.vision.validate().map_err(|e| e.to_string())
    }
}

pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".carlink").join("config.toml")
}

/// The file at `path` (or defaults when absent) with environment overrides
/// applied.
pub fn load_effective(path: &Path) -> Result<Config, String> {
    let mut cfg = load_from(path)?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Parse the file at `path`.  `Ok(None)` when it does not exist.
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

/// Apply `CARLINK_*` environment overrides.
///
/// | Variable | Field |
/// |---|---|
/// | `CARLINK_SERVER_ADDR` | `agent.server_addr` |
/// | `CARLINK_LISTEN_ADDR` | `server.listen_addr` |
/// | `CARLINK_VISION_URL` | `vision.base_url` |
/// | `CARLINK_MODEL` | `vision.model` |
/// | `CARLINK_API_KEY` | `vision.api_key` |
/// | `CARLINK_TARGET_FPS` | `agent.target_fps` and `server.target_fps` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("CARLINK_SERVER_ADDR") {
        cfg.agent.server_addr = v;
    }
    if let Ok(v) = std::env::var("CARLINK_LISTEN_ADDR") {
        cfg.server.listen_addr = v;
    }
    if let Ok(v) = std::env::var("CARLINK_VISION_URL") {
        cfg.vision.base_url = v;
    }
    if let Ok(v) = std::env::var("CARLINK_MODEL") {
        cfg.vision.model = v;
    }
    if let Ok(v) = std::env::var("CARLINK_API_KEY") {
        cfg.vision.api_key = v;
    }
    if let Ok(v) = std::env::var("CARLINK_TARGET_FPS")
        && let Ok(fps) = v.trim().parse::<u32>()
    {
        cfg.agent.target_fps = fps;
        cfg.server.target_fps = fps;
    }
}

/// Write `cfg` to `path` with owner-only permissions on Unix.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
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

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_path(dir: &tempfile::TempDir) -> PathBuf {
        config_path_for_home(&dir.path().to_string_lossy())
    }

    #[test]
    fn debug_redacts_api_key() {
        let mut cfg = Config::default();
        cfg.vision.api_key = "sk-very-secret".to_string();
        let shown = format!("{cfg:?}");
        assert!(!shown.contains("sk-very-secret"));
        assert!(shown.contains("<redacted>"));
    }

    #[test]
    fn path_points_into_carlink_dir() {
        let p = config_path_for_home("/home/driver");
        assert_eq!(p, PathBuf::from("/home/driver/.carlink/config.toml"));
    }

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().expect("tmp dir");
        assert!(load_from(&tmp_path(&dir)).expect("no error").is_none());
    }

    #[test]
    fn saved_defaults_load_back() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = tmp_path(&dir);
        save_to(&Config::default(), &path).expect("save");

        let loaded = load_from(&path).expect("load").expect("present");
        assert_eq!(loaded, Config::default());
        assert_eq!(loaded.agent.watchdog_timeout_ms, 200);
        assert_eq!(loaded.server.inbound_queue_depth, 2);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = tmp_path(&dir);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(
            &path,
            "[agent]\nserver_addr = \"10.0.0.7:5555\"\n\n[link]\nread_timeout_ms = 3000\n",
        )
        .expect("write");

        let cfg = load_from(&path).expect("load").expect("present");
        assert_eq!(cfg.agent.server_addr, "10.0.0.7:5555");
        assert_eq!(cfg.agent.target_fps, 10);
        assert_eq!(cfg.link.read_timeout_ms, 3000);
        assert_eq!(cfg.link.write_timeout_ms, 1000);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = tmp_path(&dir);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(&path, "[agent\nserver_addr = ").expect("write");
        assert!(load_from(&path).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn saved_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = tmp_path(&dir);
        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("meta").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = std::fs::metadata(path.parent().expect("parent"))
            .expect("meta")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn env_overrides_apply() {
        // SAFETY: the only test in this binary touching CARLINK_* variables.
        unsafe {
            std::env::set_var("CARLINK_SERVER_ADDR", "192.168.4.1:6000");
            std::env::set_var("CARLINK_MODEL", "llava");
            std::env::set_var("CARLINK_TARGET_FPS", "15");
            std::env::set_var("CARLINK_LISTEN_ADDR", "");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.agent.server_addr, "192.168.4.1:6000");
        assert_eq!(cfg.vision.model, "llava");
        assert_eq!(cfg.agent.target_fps, 15);
        assert_eq!(cfg.server.target_fps, 15);
        assert!(cfg.validate().is_err(), "empty listen address must not validate");

        unsafe {
            std::env::set_var("CARLINK_TARGET_FPS", "fast");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.agent.target_fps, 10);

        unsafe {
            for key in [
                "CARLINK_SERVER_ADDR",
                "CARLINK_MODEL",
                "CARLINK_TARGET_FPS",
                "CARLINK_LISTEN_ADDR",
            ] {
                std::env::remove_var(key);
            }
        }
    }
}
