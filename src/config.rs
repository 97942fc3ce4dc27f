//! Layered configuration (ambient scaffolding): CLI args override environment variables,
//! which override the TOML config file, which falls back to fixed defaults.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;

const APP_NAME: &str = "fetchbox";

const DEFAULT_MAX_CONCURRENT: usize = 3;
const DEFAULT_PORT: u16 = 7878;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RECEIVE_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Args {
    /// Directory downloaded files are written to
    #[arg(long)]
    pub download_dir: Option<PathBuf>,
    /// Maximum number of downloads running at once
    #[arg(long)]
    pub max_concurrent: Option<usize>,
    /// Override listen port
    #[arg(short, long)]
    pub port: Option<u16>,
    /// Path to a TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FileSettings {
    pub download_dir: Option<PathBuf>,
    pub max_concurrent: Option<usize>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub download_dir: PathBuf,
    pub max_concurrent: usize,
    pub port: u16,
    pub database_path: PathBuf,
    pub connect_timeout_secs: u64,
    pub receive_timeout_secs: u64,
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var_os(key).map(PathBuf::from)
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_NAME)
}

fn default_download_dir() -> PathBuf {
    data_dir().join("downloads")
}

fn default_database_path() -> PathBuf {
    data_dir().join("fetchbox.sqlite")
}

/// Default location of the TOML config file, used when `--config` is not given.
pub fn default_config_path() -> PathBuf {
    dirs::config_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_NAME)
        .join("config.toml")
}

/// Read and parse the TOML config file at `path`. A missing file is not an error: it
/// resolves to defaults for every field.
pub async fn read_file_settings(path: &Path) -> anyhow::Result<FileSettings> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FileSettings::default()),
        Err(e) => Err(e.into()),
    }
}

impl Settings {
    /// Layer `cli > env > file > default` for each field independently.
    pub fn resolve(args: Args, file: FileSettings) -> Self {
        let download_dir = args
            .download_dir
            .or_else(|| env_path("FETCHBOX_DOWNLOAD_DIR"))
            .or(file.download_dir)
            .unwrap_or_else(default_download_dir);

        let max_concurrent = args
            .max_concurrent
            .or_else(|| env_parsed("FETCHBOX_MAX_CONCURRENT"))
            .or(file.max_concurrent)
            .unwrap_or(DEFAULT_MAX_CONCURRENT);

        let port = args
            .port
            .or_else(|| env_parsed("FETCHBOX_PORT"))
            .or(file.port)
            .unwrap_or(DEFAULT_PORT);

        let database_path = env_path("FETCHBOX_DATABASE_PATH").unwrap_or_else(default_database_path);

        let connect_timeout_secs = env_parsed("FETCHBOX_CONNECT_TIMEOUT_SECS").unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS);
        let receive_timeout_secs = env_parsed("FETCHBOX_RECEIVE_TIMEOUT_SECS").unwrap_or(DEFAULT_RECEIVE_TIMEOUT_SECS);

        Settings {
            download_dir,
            max_concurrent,
            port,
            database_path,
            connect_timeout_secs,
            receive_timeout_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_args() -> Args {
        Args {
            download_dir: None,
            max_concurrent: None,
            port: None,
            config: None,
        }
    }

    #[test]
    fn defaults_apply_when_nothing_set() {
        let settings = Settings::resolve(empty_args(), FileSettings::default());
        assert_eq!(settings.max_concurrent, DEFAULT_MAX_CONCURRENT);
        assert_eq!(settings.port, DEFAULT_PORT);
    }

    #[test]
    fn file_settings_override_defaults() {
        let file = FileSettings {
            download_dir: None,
            max_concurrent: Some(7),
            port: Some(9000),
        };
        let settings = Settings::resolve(empty_args(), file);
        assert_eq!(settings.max_concurrent, 7);
        assert_eq!(settings.port, 9000);
    }

    #[test]
    fn cli_args_override_file_settings() {
        let mut args = empty_args();
        args.max_concurrent = Some(1);
        let file = FileSettings {
            download_dir: None,
            max_concurrent: Some(7),
            port: None,
        };
        let settings = Settings::resolve(args, file);
        assert_eq!(settings.max_concurrent, 1);
        assert_eq!(settings.port, DEFAULT_PORT);
    }
}
