//! Configuration file management for mise.
//!
//! Provides a TOML-based config file at `~/.config/mise/config.toml` and a
//! resolution chain for the database URL: CLI flag > env var > config file >
//! default. Engine settings (`[finalization]`, `[worker]`, ...) live in the
//! same file and fall back to their defaults table by table.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use mise_core::config::EngineConfig;
use mise_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(flatten)]
    pub engine: EngineConfig,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: DbConfig::DEFAULT_URL.to_string(),
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the mise config directory: `$XDG_CONFIG_HOME/mise` or
/// `~/.config/mise`, on every platform.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("mise");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("mise")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

pub fn parse_config(contents: &str) -> Result<ConfigFile> {
    toml::from_str(contents).context("failed to parse config file")
}

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    parse_config(&contents)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// The file holds database credentials, so it is written 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct MiseConfig {
    pub db_config: DbConfig,
    pub engine: EngineConfig,
}

impl MiseConfig {
    /// Resolve configuration.
    ///
    /// - DB URL: `cli_db_url` > `MISE_DATABASE_URL` env > `config_file.database.url` > `DbConfig::DEFAULT_URL`
    /// - Engine: config file tables > defaults, then validated.
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let path = config_path();
        let file_config = if path.exists() {
            Some(load_config()?)
        } else {
            None
        };

        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("MISE_DATABASE_URL") {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };

        let engine = file_config.map(|c| c.engine).unwrap_or_default();
        engine
            .validate()
            .with_context(|| format!("invalid engine settings in {}", path.display()))?;

        Ok(Self {
            db_config: DbConfig::new(db_url),
            engine,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use mise_core::config::PublisherSink;

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        crate::test_util::lock_env()
    }

    /// Point the config lookup at an empty temp dir for the duration of `f`.
    fn with_config_home<T>(contents: Option<&str>, f: impl FnOnce() -> T) -> T {
        let tmp = tempfile::TempDir::new().unwrap();
        if let Some(contents) = contents {
            let dir = tmp.path().join("mise");
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("config.toml"), contents).unwrap();
        }
        let orig_xdg = std::env::var("XDG_CONFIG_HOME").ok();
        unsafe { std::env::set_var("XDG_CONFIG_HOME", tmp.path()) };

        let result = f();

        match orig_xdg {
            Some(x) => unsafe { std::env::set_var("XDG_CONFIG_HOME", x) },
            None => unsafe { std::env::remove_var("XDG_CONFIG_HOME") },
        }
        result
    }

    #[test]
    fn config_file_reads_database_and_engine_tables() {
        let cfg = parse_config(
            r#"
[database]
url = "postgresql://testhost:5432/testdb"

[finalization]
sweep_interval = 10

[worker]
concurrency = 2
"#,
        )
        .unwrap();
        assert_eq!(cfg.database.url, "postgresql://testhost:5432/testdb");
        assert_eq!(cfg.engine.finalization.sweep_interval, 10);
        assert_eq!(cfg.engine.materialization.sweep_interval, 30);
        assert_eq!(cfg.engine.worker.concurrency, 2);
        assert_eq!(cfg.engine.publisher.sink, PublisherSink::Log);
    }

    #[test]
    fn default_config_serializes_and_reads_back() {
        let original = ConfigFile::default();
        let contents = toml::to_string_pretty(&original).unwrap();
        let loaded = parse_config(&contents).unwrap();
        assert_eq!(loaded.database.url, DbConfig::DEFAULT_URL);
        assert_eq!(loaded.engine, original.engine);
    }

    #[cfg(unix)]
    #[test]
    fn save_config_sets_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let _lock = lock_env();
        with_config_home(None, || {
            save_config(&ConfigFile::default()).unwrap();
            let meta = std::fs::metadata(config_path()).unwrap();
            assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        });
    }

    #[test]
    fn resolve_with_cli_flag_overrides_all() {
        let _lock = lock_env();
        unsafe { std::env::set_var("MISE_DATABASE_URL", "postgresql://env:5432/envdb") };

        let config = with_config_home(None, || {
            MiseConfig::resolve(Some("postgresql://cli:5432/clidb")).unwrap()
        });
        assert_eq!(config.db_config.database_url, "postgresql://cli:5432/clidb");

        unsafe { std::env::remove_var("MISE_DATABASE_URL") };
    }

    #[test]
    fn resolve_with_env_var_overrides_config_file() {
        let _lock = lock_env();
        unsafe { std::env::set_var("MISE_DATABASE_URL", "postgresql://env:5432/envdb") };

        let config = with_config_home(Some("[database]\nurl = \"postgresql://file:5432/filedb\"\n"), || {
            MiseConfig::resolve(None).unwrap()
        });
        assert_eq!(config.db_config.database_url, "postgresql://env:5432/envdb");

        unsafe { std::env::remove_var("MISE_DATABASE_URL") };
    }

    #[test]
    fn resolve_uses_file_then_default() {
        let _lock = lock_env();
        unsafe { std::env::remove_var("MISE_DATABASE_URL") };

        let config = with_config_home(
            Some("[database]\nurl = \"postgresql://file:5432/filedb\"\n\n[worker]\nmax_attempts = 3\n"),
            || MiseConfig::resolve(None).unwrap(),
        );
        assert_eq!(config.db_config.database_url, "postgresql://file:5432/filedb");
        assert_eq!(config.engine.worker.max_attempts, 3);

        let config = with_config_home(None, || MiseConfig::resolve(None).unwrap());
        assert_eq!(config.db_config.database_url, DbConfig::DEFAULT_URL);
        assert_eq!(config.engine, EngineConfig::default());
    }

    #[test]
    fn resolve_rejects_invalid_engine_settings() {
        let _lock = lock_env();
        let result = with_config_home(Some("[worker]\nconcurrency = 0\n"), || {
            MiseConfig::resolve(Some("postgresql://localhost:5432/mise"))
        });
        let msg = format!("{:#}", result.unwrap_err());
        assert!(msg.contains("worker.concurrency"), "unexpected error: {msg}");
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("mise/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }
}
