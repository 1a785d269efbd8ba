use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::error;

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// Path of the SQLite account database (default: `{data_dir}/accounts.db`).
    db_path: Option<PathBuf>,
    /// HTTP(S) proxy URL applied to accounts without their own.
    proxy: Option<String>,
    /// Dump every response to a per-process temp directory.
    debug: Option<bool>,
    /// Give up instead of waiting when no active account can serve a queue.
    raise_when_no_account: Option<bool>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── PoolConfig ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub data_dir: PathBuf,
    /// SQLite account database (single file).
    pub db_path: PathBuf,
    /// Pool-level proxy; an account's own proxy wins over this.
    pub proxy: Option<String>,
    pub debug: bool,
    pub raise_when_no_account: bool,
}

impl PoolConfig {
    /// Build config from an optional explicit data dir + env + TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. env — `AVIARY_DB`, `AVIARY_PROXY`, `AVIARY_DEBUG`
    ///   2. TOML file at `{data_dir}/config.toml`
    ///   3. Built-in defaults
    pub fn load(data_dir: Option<PathBuf>) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let db_path = std::env::var("AVIARY_DB")
            .ok()
            .map(PathBuf::from)
            .or(toml.db_path)
            .unwrap_or_else(|| data_dir.join("accounts.db"));

        let proxy = std::env::var("AVIARY_PROXY")
            .ok()
            .filter(|p| !p.is_empty())
            .or(toml.proxy);

        let debug = std::env::var("AVIARY_DEBUG")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .or(toml.debug)
            .unwrap_or(false);

        Self {
            data_dir,
            db_path,
            proxy,
            debug,
            raise_when_no_account: toml.raise_when_no_account.unwrap_or(false),
        }
    }

    /// Directory for the per-day rate-limit JSONL files.
    pub fn rate_log_dir(&self) -> PathBuf {
        self.data_dir.join("rate_limit_logs")
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::load(None)
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        // ~/Library/Application Support/aviary
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("aviary");
        }
    }
    #[cfg(target_os = "linux")]
    {
        // $XDG_DATA_HOME/aviary or ~/.local/share/aviary
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("aviary");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("aviary");
        }
    }
    #[cfg(target_os = "windows")]
    {
        // %APPDATA%\aviary
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("aviary");
        }
    }
    // Fallback
    PathBuf::from(".aviary")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_no_file_or_env() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = PoolConfig::load(Some(dir.path().to_path_buf()));
        assert_eq!(cfg.db_path, dir.path().join("accounts.db"));
        assert!(cfg.proxy.is_none());
        assert!(!cfg.debug);
        assert!(!cfg.raise_when_no_account);
        assert_eq!(cfg.rate_log_dir(), dir.path().join("rate_limit_logs"));
    }

    #[test]
    fn toml_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "proxy = \"http://127.0.0.1:8080\"\ndebug = true\nraise_when_no_account = true\n",
        )
        .unwrap();
        let cfg = PoolConfig::load(Some(dir.path().to_path_buf()));
        assert_eq!(cfg.proxy.as_deref(), Some("http://127.0.0.1:8080"));
        assert!(cfg.debug);
        assert!(cfg.raise_when_no_account);
    }

    #[test]
    fn malformed_toml_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "debug = {{{{").unwrap();
        let cfg = PoolConfig::load(Some(dir.path().to_path_buf()));
        assert!(!cfg.debug);
    }
}
