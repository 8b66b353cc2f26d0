//! Configuration of the urd exporter.
//!
//! urd takes no command line flags. Configuration is YAML, read from the
//! `URD_CONFIG` environment variable if set, else from the file named by
//! `URD_CONFIG_PATH`, else from `/etc/urd/urd.yaml` if that file exists. With
//! none of these present every field takes its default. Every value is checked
//! at load time; a bad configuration is reported as an [`Error`] before any
//! collection starts.
use std::{
    env, fs,
    io::{self, ErrorKind},
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use rustc_hash::FxHashMap;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::debug;

/// Environment variable holding the YAML configuration itself.
pub const CONFIG_ENV: &str = "URD_CONFIG";
/// Environment variable holding the path of the YAML configuration.
pub const CONFIG_PATH_ENV: &str = "URD_CONFIG_PATH";
/// Environment variable overriding [`Config::kubeconfig_path`].
pub const KUBECONFIG_PATH_ENV: &str = "URD_KUBECONFIG_PATH";
/// Configuration file read when no other source is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/urd/urd.yaml";

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// A field holds a value urd cannot run with.
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

fn default_prometheus_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_period_seconds() -> u64 {
    60
}

fn default_window_seconds() -> u64 {
    60
}

fn default_fetch_timeout_seconds() -> u64 {
    10
}

fn default_max_concurrent_fetches() -> usize {
    100
}

fn default_kubeconfig_path() -> PathBuf {
    PathBuf::from("/srv/kubernetes/kubeconfig")
}

fn default_backend_namespace() -> String {
    "AWS/ELB".to_string()
}

fn default_dimension_name() -> String {
    "LoadBalancerName".to_string()
}

/// Main configuration struct for this program
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address the Prometheus scrape endpoint binds to.
    #[serde(default = "default_prometheus_addr")]
    pub prometheus_addr: SocketAddr,
    /// Labels applied to every exported series.
    #[serde(default)]
    pub global_labels: FxHashMap<String, String>,
    /// Seconds between the start of consecutive collection cycles.
    #[serde(default = "default_period_seconds")]
    pub period_seconds: u64,
    /// Seconds of CloudWatch history each statistic covers, whole minutes.
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    /// Seconds a single CloudWatch request may take before it is abandoned.
    #[serde(default = "default_fetch_timeout_seconds")]
    pub fetch_timeout_seconds: u64,
    /// Maximum CloudWatch requests in flight at once.
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
    /// Path of the kubeconfig used to reach the API server.
    #[serde(default = "default_kubeconfig_path")]
    pub kubeconfig_path: PathBuf,
    /// CloudWatch namespace of the load balancer metrics.
    #[serde(default = "default_backend_namespace")]
    pub backend_namespace: String,
    /// CloudWatch dimension identifying a load balancer.
    #[serde(default = "default_dimension_name")]
    pub dimension_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prometheus_addr: default_prometheus_addr(),
            global_labels: FxHashMap::default(),
            period_seconds: default_period_seconds(),
            window_seconds: default_window_seconds(),
            fetch_timeout_seconds: default_fetch_timeout_seconds(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
            kubeconfig_path: default_kubeconfig_path(),
            backend_namespace: default_backend_namespace(),
            dimension_name: default_dimension_name(),
        }
    }
}

impl Config {
    /// Load the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration source cannot be read, is not valid
    /// YAML or holds invalid values.
    pub fn load() -> Result<Self, Error> {
        Self::load_from(|key| env::var(key).ok(), Path::new(DEFAULT_CONFIG_PATH))
    }

    /// Load the configuration, looking environment variables up through
    /// `lookup` and falling back to the file at `default_path`.
    ///
    /// # Errors
    ///
    /// See [`Config::load`].
    pub fn load_from<F>(lookup: F, default_path: &Path) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let contents = if let Some(contents) = lookup(CONFIG_ENV) {
            debug!("Using config from env var '{CONFIG_ENV}'");
            Some(contents)
        } else if let Some(path) = lookup(CONFIG_PATH_ENV) {
            Some(read(Path::new(&path))?)
        } else {
            match read(default_path) {
                Ok(contents) => Some(contents),
                Err(Error::ReadFile { source, .. }) if source.kind() == ErrorKind::NotFound => {
                    debug!("No config at {}, using defaults", default_path.display());
                    None
                }
                Err(err) => return Err(err),
            }
        };

        let mut config = match contents {
            Some(contents) => serde_yaml::from_str(&contents)?,
            None => Config::default(),
        };
        if let Some(path) = lookup(KUBECONFIG_PATH_ENV).filter(|path| !path.is_empty()) {
            debug!("Using kubeconfig path from env var '{KUBECONFIG_PATH_ENV}'");
            config.kubeconfig_path = PathBuf::from(path);
        }
        config.validate()?;
        Ok(config)
    }

    /// Check that every field holds a usable value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), Error> {
        if self.period_seconds == 0 {
            return Err(Error::Invalid("period_seconds must be positive"));
        }
        if self.window_seconds == 0 || self.window_seconds % 60 != 0 {
            return Err(Error::Invalid(
                "window_seconds must be a positive multiple of 60",
            ));
        }
        if self.fetch_timeout_seconds == 0 {
            return Err(Error::Invalid("fetch_timeout_seconds must be positive"));
        }
        if self.max_concurrent_fetches == 0 {
            return Err(Error::Invalid("max_concurrent_fetches must be positive"));
        }
        if self.max_concurrent_fetches > Semaphore::MAX_PERMITS {
            return Err(Error::Invalid("max_concurrent_fetches is too large"));
        }
        Ok(())
    }

    /// Time between the start of consecutive collection cycles.
    #[must_use]
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_seconds)
    }

    /// CloudWatch history each statistic covers.
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    /// Time a single CloudWatch request may take.
    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds)
    }
}

fn read(path: &Path) -> Result<String, Error> {
    debug!("Attempting to open configuration file at: {}", path.display());
    fs::read_to_string(path).map_err(|source| Error::ReadFile {
        path: path.to_path_buf(),
        source: Box::new(source),
    })
}
