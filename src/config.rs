//! Configuration Module
//!
//! This module reads configuration values from an optional JSON file and from
//! environment variables, provides sensible defaults, and validates the size
//! limits that guard decompression.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const DB_DIR: &str = ".dmarc-digest";
const DB_FILE: &str = "db.sqlite";

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Ceiling on raw attachment bytes, before decompression.
    pub max_file_size: usize,
    /// Ceiling on the XML produced by decompression.
    pub max_decompressed_size: usize,
    pub max_compression_ratio: f64,
    pub database_path: PathBuf,
}

/// Shape of the JSON config file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    max_file_size: Option<usize>,
    max_decompressed_size: Option<usize>,
    max_compression_ratio: Option<f64>,
    database_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_file_size: 10 * 1024 * 1024,
            max_decompressed_size: 100 * 1024 * 1024,
            max_compression_ratio: 1000.0,
            database_path: PathBuf::from(DB_DIR).join(DB_FILE),
        }
    }
}

impl Config {
    /// Creates a new configuration by reading environment variables.
    /// If a variable is missing or empty, a default value is used.
    pub fn new() -> Result<Self> {
        Self::load(None)
    }

    /// Reads `path` (when given and present) and then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) if p.exists() => {
                let raw = fs::read_to_string(p)
                    .with_context(|| format!("Failed to read config file {}", p.display()))?;
                serde_json::from_str::<FileConfig>(&raw)
                    .with_context(|| format!("Invalid config file {}", p.display()))?
            }
            _ => FileConfig::default(),
        };
        let defaults = Config::default();

        let max_file_size = env_parse("DMARC_MAX_FILE_SIZE")
            .or(file.max_file_size)
            .unwrap_or(defaults.max_file_size);
        if max_file_size > 500_000_000 {
            return Err(anyhow::anyhow!("Max file size too large (500MB limit)"));
        }

        let max_decompressed_size = env_parse("DMARC_MAX_DECOMPRESSED_SIZE")
            .or(file.max_decompressed_size)
            .unwrap_or(defaults.max_decompressed_size);

        let max_compression_ratio = env_parse("DMARC_MAX_COMPRESSION_RATIO")
            .or(file.max_compression_ratio)
            .unwrap_or(defaults.max_compression_ratio);
        if max_compression_ratio <= 1.0 {
            return Err(anyhow::anyhow!("Max compression ratio must be greater than 1"));
        }

        let database_path = match env::var("DMARC_DATABASE_PATH")
            .map(|s| s.trim().to_string())
            .ok()
            .filter(|s| !s.is_empty())
        {
            Some(p) => PathBuf::from(p),
            None => match file.database_path {
                Some(p) => p,
                None => default_database_path()?,
            },
        };

        Ok(Config {
            max_file_size,
            max_decompressed_size,
            max_compression_ratio,
            database_path,
        })
    }

    /// Creates the database's parent directory if it does not exist yet.
    pub fn ensure_database_dir(&self) -> Result<()> {
        if let Some(parent) = self.database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!(
                    "Failed to create database directory at {} - ensure the path is writable or set DMARC_DATABASE_PATH",
                    parent.display()
                )
            })?;
        }
        Ok(())
    }
}

/// Writes a sample JSON configuration to `path`.
pub fn write_sample(path: &Path) -> Result<()> {
    let sample = Config {
        database_path: default_database_path()?,
        ..Config::default()
    };
    let data = serde_json::to_string_pretty(&sample)?;
    fs::write(path, data).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn default_database_path() -> Result<PathBuf> {
    match env::var_os("HOME").filter(|h| !h.is_empty()) {
        Some(home) => Ok(PathBuf::from(home).join(DB_DIR).join(DB_FILE)),
        None => {
            let cwd = env::current_dir()
                .context("Cannot determine home directory or current working directory")?;
            Ok(cwd.join(DB_DIR).join(DB_FILE))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use tempfile::tempdir;

    // Env vars are process-global, so defaults and overrides share one test.
    #[test]
    fn test_config_defaults_and_env_overrides() {
        env::remove_var("DMARC_MAX_FILE_SIZE");
        env::remove_var("DMARC_MAX_DECOMPRESSED_SIZE");
        env::remove_var("DMARC_MAX_COMPRESSION_RATIO");
        env::remove_var("DMARC_DATABASE_PATH");

        let config = Config::new().unwrap();
        assert_eq!(config.max_file_size, 10 * 1024 * 1024);
        assert_eq!(config.max_decompressed_size, 100 * 1024 * 1024);
        assert_eq!(config.max_compression_ratio, 1000.0);
        assert!(config.database_path.ends_with(".dmarc-digest/db.sqlite"));

        env::set_var("DMARC_MAX_FILE_SIZE", "5242880"); // 5MB
        env::set_var("DMARC_MAX_DECOMPRESSED_SIZE", "10485760"); // 10MB
        env::set_var("DMARC_MAX_COMPRESSION_RATIO", "500.0");
        env::set_var("DMARC_DATABASE_PATH", "/tmp/reports.sqlite");

        let config = Config::new().unwrap();
        assert_eq!(config.max_file_size, 5242880);
        assert_eq!(config.max_decompressed_size, 10485760);
        assert_eq!(config.max_compression_ratio, 500.0);
        assert_eq!(config.database_path, PathBuf::from("/tmp/reports.sqlite"));

        env::set_var("DMARC_MAX_FILE_SIZE", "600000000");
        assert!(Config::new().is_err());

        env::remove_var("DMARC_MAX_FILE_SIZE");
        env::remove_var("DMARC_MAX_DECOMPRESSED_SIZE");
        env::remove_var("DMARC_MAX_COMPRESSION_RATIO");
        env::remove_var("DMARC_DATABASE_PATH");
    }

    #[test]
    fn test_sample_file_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        write_sample(&path).unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        let parsed: FileConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.max_file_size, Some(10 * 1024 * 1024));
        assert!(parsed.database_path.is_some());
    }

    #[test]
    fn test_partial_file_config() {
        let parsed: FileConfig = serde_json::from_str(r#"{"max_compression_ratio": 50.0}"#).unwrap();
        assert_eq!(parsed.max_compression_ratio, Some(50.0));
        assert!(parsed.max_file_size.is_none());
    }
}
