//! Runtime configuration.
//!
//! Everything the core would otherwise have to hard-code lives here: the
//! broker endpoint, the IAM instance-profile names used when preparing the
//! AWS cloud-controller-manager, the local directory of bootstrap assets
//! staged onto each machine, and the remote-executor bounds. Values load
//! from a TOML file; string fields expand `$VAR`/`${VAR}` references from
//! the process environment so path-style settings such as `$CBSTORE_ROOT`
//! work without the core reading the environment anywhere else.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Configuration load failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// IAM instance-profile names associated with EC2 instances so the AWS
/// cloud-controller-manager can manage them.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AwsCcmConfig {
    pub control_plane_role: String,
    pub worker_role: String,
}

impl Default for AwsCcmConfig {
    fn default() -> Self {
        Self {
            control_plane_role: "k8s-control-plane-role-for-ccm".to_string(),
            worker_role: "k8s-worker-role-for-ccm".to_string(),
        }
    }
}

/// Remote-executor bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// TCP connect timeout per dial attempt, in seconds.
    pub connect_timeout_secs: u64,
    /// Number of dial attempts before a machine is declared unreachable.
    pub dial_retries: u32,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            dial_retries: 3,
        }
    }
}

/// Top-level configuration of the provisioning core.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Base URL of the infrastructure broker.
    pub broker_url: String,
    /// Local directory holding the scripts and manifests staged onto each
    /// machine during bootstrap.
    pub scripts_dir: String,
    pub aws: AwsCcmConfig,
    pub ssh: SshConfig,
}

impl Config {
    /// Load configuration from a TOML file and expand environment
    /// references in its string fields.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self =
            toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.expand();
        Ok(config)
    }

    fn expand(&mut self) {
        self.broker_url = expand_env(&self.broker_url);
        self.scripts_dir = expand_env(&self.scripts_dir);
        self.aws.control_plane_role = expand_env(&self.aws.control_plane_role);
        self.aws.worker_role = expand_env(&self.aws.worker_role);
    }
}

/// Expand `$VAR` and `${VAR}` references from the process environment.
/// Unknown variables expand to the empty string.
#[must_use]
pub fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let braced = matches!(chars.peek(), Some((_, '{')));
        if braced {
            chars.next();
        }
        let mut name = String::new();
        while let Some(&(_, c)) = chars.peek() {
            if braced && c == '}' {
                chars.next();
                break;
            }
            if !braced && !(c.is_ascii_alphanumeric() || c == '_') {
                break;
            }
            name.push(c);
            chars.next();
        }
        if name.is_empty() {
            out.push('$');
            if braced {
                out.push_str("{}");
            }
        } else {
            out.push_str(&std::env::var(&name).unwrap_or_default());
        }
    }

    out
}
