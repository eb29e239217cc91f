//! Configuration loading and write-back for the vsock-proxy daemon.
//!
//! Values come from `VSOCK_*` environment variables layered over an optional
//! `vsock_proxy_config.json`, searched for in the executable's directory and
//! then the working directory. Missing values stay at their defaults; whether
//! the address lists are usable is decided later when tuples are built.
//!
//! # Write-back
//!
//! - A discovered file is rewritten with the fully resolved configuration on
//!   every load, environment values included.
//! - With no file and `persist` set, a new file is created in the first search
//!   directory. Creation never replaces a file that appeared in the meantime.
//!
//! - A failed write is reported as [`WriteBack::Failed`] and logged; the
//!   resolved configuration is still used.
//! - Empty environment variables count as unset.
//!
//! Neither write is guarded against a concurrent invocation doing the same;
//! the daemon assumes a single operator at a time.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// File name searched for in each configuration directory.
pub const CONFIG_FILE_NAME: &str = "vsock_proxy_config.json";

/// Prefix of the environment variables bound to configuration keys.
pub const ENV_PREFIX: &str = "VSOCK";

/// Resolved vsock-proxy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Comma-separated listen addresses (`host:port` or `cid:port`).
    #[serde(default)]
    pub inaddrs: String,

    /// Comma-separated connect addresses, positionally aligned with `inaddrs`.
    #[serde(default)]
    pub outaddrs: String,

    /// Tracing log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// How long to wait for in-flight connections after a stop request.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_shutdown_grace_secs() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            inaddrs: String::new(),
            outaddrs: String::new(),
            log_level: default_log_level(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl Config {
    /// `true` when neither address list is set.
    pub fn is_empty(&self) -> bool {
        self.inaddrs.is_empty() && self.outaddrs.is_empty()
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// What [`ConfigStore::load`] did to the file system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteBack {
    /// No file was found and a new one was created here.
    Created(PathBuf),
    /// The discovered file was rewritten with the resolved configuration.
    Overwritten(PathBuf),
    /// Creation was attempted but a file already existed; it was left alone.
    AlreadyExisted(PathBuf),
    /// Nothing was written.
    Skipped,
    /// Writing to `path` failed; the file on disk, if any, is unchanged or
    /// partially written.
    Failed { path: PathBuf, error: String },
}

/// Result of a configuration load.
#[derive(Debug, Clone)]
pub struct Loaded {
    pub config: Config,
    /// File the configuration was (partially) read from, if any.
    pub source: Option<PathBuf>,
    pub write_back: WriteBack,
}

impl Loaded {
    /// Log where the configuration came from and what was persisted.
    ///
    /// Separate from loading because logging is only initialised once the
    /// log level has been read.
    pub fn log(&self) {
        match &self.source {
            Some(path) => info!(path = %path.display(), "configuration file loaded"),
            None => debug!("no configuration file found; using environment only"),
        }
        if self.config.is_empty() {
            debug!("VSOCK_INADDRS and VSOCK_OUTADDRS are not set");
        }
        match &self.write_back {
            WriteBack::Created(path) => info!(path = %path.display(), "configuration file created"),
            WriteBack::Overwritten(path) => {
                debug!(path = %path.display(), "configuration file rewritten")
            }
            WriteBack::AlreadyExisted(path) => {
                debug!(path = %path.display(), "configuration file already exists; not replaced")
            }
            WriteBack::Failed { path, error } => {
                warn!(path = %path.display(), error = %error, "failed to write configuration file")
            }
            WriteBack::Skipped => {}
        }
    }
}

/// Locates, reads, and writes back the configuration.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    search_paths: Vec<PathBuf>,
    env: Option<config::Map<String, String>>,
}

impl ConfigStore {
    /// Search the executable's directory, then the current working directory,
    /// reading variables from the process environment.
    pub fn discover() -> Self {
        let mut search_paths = Vec::with_capacity(2);
        if let Some(dir) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
        {
            search_paths.push(dir);
        }
        search_paths.push(std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        Self::with_search_paths(search_paths)
    }

    /// Search only `search_paths`, in order.
    pub fn with_search_paths(search_paths: Vec<PathBuf>) -> Self {
        Self {
            search_paths,
            env: None,
        }
    }

    /// Read variables from `env` instead of the process environment.
    #[cfg(test)]
    pub fn with_env<I, K, V>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = Some(
            env.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    /// First existing configuration file along the search path.
    pub fn find_file(&self) -> Option<PathBuf> {
        self.search_paths
            .iter()
            .map(|dir| dir.join(CONFIG_FILE_NAME))
            .find(|path| path.is_file())
    }

    /// Resolve the configuration and apply the write-back policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be parsed or a value has the wrong
    /// type. Write-back failures are not errors; see [`WriteBack::Failed`].
    pub fn load(&self, persist: bool) -> Result<Loaded> {
        let source = self.find_file();

        let mut builder = config::Config::builder();
        if let Some(path) = &source {
            builder = builder
                .add_source(config::File::from(path.as_path()).format(config::FileFormat::Json));
        }
        let cfg = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .ignore_empty(true)
                    .source(self.env.clone()),
            )
            .build()
            .context("failed to build vsock-proxy configuration")?;

        let config: Config = cfg
            .try_deserialize()
            .context("failed to deserialise vsock-proxy configuration")?;

        let write_back = match (&source, self.search_paths.first()) {
            (Some(path), _) => match overwrite(path, &config) {
                Ok(()) => WriteBack::Overwritten(path.clone()),
                Err(e) => failed(path, e),
            },
            (None, Some(dir)) if persist => {
                let path = dir.join(CONFIG_FILE_NAME);
                safe_write(&path, &config).unwrap_or_else(|e| failed(&path, e))
            }
            (None, _) => WriteBack::Skipped,
        };

        Ok(Loaded {
            config,
            source,
            write_back,
        })
    }
}

fn failed(path: &Path, error: anyhow::Error) -> WriteBack {
    WriteBack::Failed {
        path: path.to_path_buf(),
        error: format!("{error:#}"),
    }
}

fn render(config: &Config) -> Result<Vec<u8>> {
    let mut json =
        serde_json::to_vec_pretty(config).context("failed to serialise vsock-proxy configuration")?;
    json.push(b'\n');
    Ok(json)
}

fn overwrite(path: &Path, config: &Config) -> Result<()> {
    fs::write(path, render(config)?)
        .with_context(|| format!("failed to write configuration to {}", path.display()))
}

/// Create `path` only if nothing exists there yet.
fn safe_write(path: &Path, config: &Config) -> Result<WriteBack> {
    let json = render(config)?;
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            return Ok(WriteBack::AlreadyExisted(path.to_path_buf()));
        }
        Err(e) => {
            return Err(e)
                .with_context(|| format!("failed to create configuration {}", path.display()));
        }
    };
    file.write_all(&json)
        .with_context(|| format!("failed to write configuration to {}", path.display()))?;
    Ok(WriteBack::Created(path.to_path_buf()))
}
