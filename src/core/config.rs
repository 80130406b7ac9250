use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::core::exec::{CommandTarget, Credentials, LocalTarget, RemoteTarget};
use crate::core::job::PipelineTargets;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("error reading config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("error parsing config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{user_var} or {pass_var} not set in environment or env file")]
    MissingCredentials {
        user_var: &'static str,
        pass_var: &'static str,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_ssh_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SshConfig {
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            port: default_ssh_port(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl SshConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct HostConfig {
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub background_cmd: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct LocalConfig {
    #[serde(default)]
    pub commands: Vec<String>,
}

/// Contents of `config.yaml`.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub scheduler: HostConfig,
    #[serde(default)]
    pub sdvn: HostConfig,
    #[serde(default)]
    pub slab: LocalConfig,
}

impl FileConfig {
    pub fn parse(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        serde_yaml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.ip.trim().is_empty() {
            return Err(ConfigError::Invalid("scheduler.ip is required".into()));
        }
        if self.sdvn.ip.trim().is_empty() {
            return Err(ConfigError::Invalid("sdvn.ip is required".into()));
        }
        let background = self.sdvn.background_cmd.as_deref().unwrap_or_default();
        if background.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "sdvn.background_cmd is required for log tailing".into(),
            ));
        }
        Ok(())
    }
}

/// Parses `KEY=VALUE` lines of a dotenv file. Blank lines, `#` comments and
/// a leading `export ` are ignored; matching outer quotes are stripped.
pub fn parse_env_file(contents: &str) -> HashMap<String, String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=')?;
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(value);
            Some((key.trim().to_string(), value.to_string()))
        })
        .collect()
}

/// Process environment first, then the env file.
pub struct EnvSource {
    file_vars: HashMap<String, String>,
}

impl EnvSource {
    pub fn from_file(path: &Path) -> Self {
        let file_vars = std::fs::read_to_string(path)
            .map(|contents| parse_env_file(&contents))
            .unwrap_or_default();
        Self { file_vars }
    }

    pub fn from_vars(file_vars: HashMap<String, String>) -> Self {
        Self { file_vars }
    }

    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key)
            .ok()
            .or_else(|| self.file_vars.get(key).cloned())
            .filter(|v| !v.is_empty())
    }

    fn credentials(
        &self,
        user_var: &'static str,
        pass_var: &'static str,
    ) -> Result<Credentials, ConfigError> {
        match (self.get(user_var), self.get(pass_var)) {
            (Some(user), Some(password)) => Ok(Credentials { user, password }),
            _ => Err(ConfigError::MissingCredentials { user_var, pass_var }),
        }
    }
}

/// File config merged with the SSH credentials of both remote hosts.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub file: FileConfig,
    pub scheduler_ssh: Credentials,
    pub sdvn_ssh: Credentials,
}

impl AppConfig {
    pub fn load(config_path: &Path, env_file: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
                path: config_path.to_path_buf(),
                source,
            })?;
        let file = FileConfig::parse(&contents, config_path)?;
        Self::from_parts(file, &EnvSource::from_file(env_file))
    }

    pub fn from_parts(file: FileConfig, env: &EnvSource) -> Result<Self, ConfigError> {
        file.validate()?;
        let scheduler_ssh = env.credentials("SCHEDULER_SSH_USER", "SCHEDULER_SSH_PASS")?;
        let sdvn_ssh = env.credentials("SDVN_SSH_USER", "SDVN_SSH_PASS")?;
        Ok(Self {
            file,
            scheduler_ssh,
            sdvn_ssh,
        })
    }

    fn remote(&self, label: &str, host: &HostConfig, credentials: &Credentials) -> RemoteTarget {
        RemoteTarget {
            label: label.to_string(),
            host: host.ip.clone(),
            port: self.file.ssh.port,
            credentials: credentials.clone(),
            commands: host.commands.clone(),
            background_cmd: host.background_cmd.clone(),
        }
    }

    /// Builds fresh targets for one run.
    pub fn pipeline_targets(&self) -> PipelineTargets {
        let sdvn = self.remote("sdvn", &self.file.sdvn, &self.sdvn_ssh);
        PipelineTargets {
            log: sdvn.clone(),
            scheduler: CommandTarget::Remote(self.remote(
                "scheduler",
                &self.file.scheduler,
                &self.scheduler_ssh,
            )),
            analysis: CommandTarget::Remote(sdvn),
            local: CommandTarget::Local(LocalTarget {
                label: "slab".to_string(),
                commands: self.file.slab.commands.clone(),
            }),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_config(
    scheduler_commands: &[&str],
    sdvn_commands: &[&str],
    local_commands: &[&str],
) -> AppConfig {
    let strings = |cmds: &[&str]| cmds.iter().map(|c| c.to_string()).collect::<Vec<_>>();
    AppConfig {
        file: FileConfig {
            server: ServerConfig::default(),
            ssh: SshConfig::default(),
            scheduler: HostConfig {
                ip: "10.0.0.4".into(),
                commands: strings(scheduler_commands),
                background_cmd: None,
            },
            sdvn: HostConfig {
                ip: "10.0.0.5".into(),
                commands: strings(sdvn_commands),
                background_cmd: Some("tail -F /var/log/routes.log".into()),
            },
            slab: LocalConfig {
                commands: strings(local_commands),
            },
        },
        scheduler_ssh: Credentials {
            user: "sched".into(),
            password: "s3cret".into(),
        },
        sdvn_ssh: Credentials {
            user: "sdvn".into(),
            password: "s3cret".into(),
        },
    }
}
