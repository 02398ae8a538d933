//! Layered helper configuration.
//!
//! Precedence, lowest first: struct defaults, the optional TOML file,
//! `PTY_HELPER_*` environment variables, command-line flags.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use pty_bridge::{MuxConfig, SessionConfig, SupervisorConfig, WindowSize};

pub const ENV_PREFIX: &str = "PTY_HELPER_";

/// Variables under this prefix go to the shell with their names as written.
pub const SHELL_ENV_PREFIX: &str = "PTY_HELPER_ENV__";

/// Tunables, deserialized by figment.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelperConfig {
    /// Shell to run; falls back to `$SHELL`, then `/bin/sh`
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_rows")]
    pub rows: u32,
    #[serde(default = "default_cols")]
    pub cols: u32,
    #[serde(default = "default_term")]
    pub term: String,
    #[serde(default = "default_colorterm")]
    pub colorterm: String,
    /// Extra variables for the shell, on top of the inherited environment
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            shell: None,
            working_dir: None,
            rows: default_rows(),
            cols: default_cols(),
            term: default_term(),
            colorterm: default_colorterm(),
            env: BTreeMap::new(),
            grace_period_ms: default_grace_period_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            chunk_size: default_chunk_size(),
        }
    }
}

fn default_rows() -> u32 {
    24
}
fn default_cols() -> u32 {
    80
}
fn default_term() -> String {
    "xterm-256color".to_string()
}
fn default_colorterm() -> String {
    "truecolor".to_string()
}
fn default_grace_period_ms() -> u64 {
    2000
}
fn default_drain_timeout_ms() -> u64 {
    200
}
fn default_chunk_size() -> usize {
    4096
}

/// Values given on the command line. Unset fields leave lower layers alone.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CliOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cols: Option<u32>,
}

/// Build a figment that layers: defaults → config file → PTY_HELPER_* env vars → CLI.
pub fn load_config(config_file: Option<&Path>, cli: &CliOverrides) -> Figment {
    let mut figment = Figment::from(Serialized::defaults(HelperConfig::default()));
    if let Some(path) = config_file {
        figment = figment.merge(Toml::file(path));
    }
    // figment lowercases env keys, which would mangle shell variable names,
    // so the `env` table is collected separately.
    let shell_env = shell_env_overrides(std::env::vars());
    figment
        .merge(
            Env::prefixed(ENV_PREFIX)
                .filter(|key| !is_shell_env_key(key.as_str()))
                .split("__"),
        )
        .merge(Serialized::default("env", shell_env))
        .merge(Serialized::defaults(cli))
}

fn is_shell_env_key(key: &str) -> bool {
    key.to_ascii_lowercase().starts_with("env__")
}

/// `PTY_HELPER_ENV__<NAME>=<value>` pairs, keeping `<NAME>` exactly as written.
pub fn shell_env_overrides(
    vars: impl IntoIterator<Item = (String, String)>,
) -> BTreeMap<String, String> {
    vars.into_iter()
        .filter_map(|(key, value)| {
            let name = key.strip_prefix(SHELL_ENV_PREFIX)?;
            (!name.is_empty()).then(|| (name.to_string(), value))
        })
        .collect()
}

impl HelperConfig {
    /// Load and validate.
    pub fn load(config_file: Option<&Path>, cli: &CliOverrides) -> Result<Self> {
        if let Some(path) = config_file.filter(|path| !path.is_file()) {
            bail!("config file {} does not exist", path.display());
        }
        let config: HelperConfig = load_config(config_file, cli)
            .extract()
            .context("failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.size()?;
        if self.chunk_size == 0 {
            bail!("chunk_size must be at least 1 byte");
        }
        if self.shell.as_deref().is_some_and(|shell| shell.trim().is_empty()) {
            bail!("shell must not be empty");
        }
        Ok(())
    }

    pub fn size(&self) -> Result<WindowSize> {
        WindowSize::new(self.rows, self.cols).context("invalid initial size")
    }

    pub fn to_supervisor_config(&self) -> Result<SupervisorConfig> {
        Ok(SupervisorConfig {
            session: SessionConfig {
                shell: self.shell.clone(),
                args: Vec::new(),
                working_dir: self.working_dir.clone(),
                env: self
                    .env
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                size: self.size()?,
                term: self.term.clone(),
                colorterm: self.colorterm.clone(),
            },
            mux: MuxConfig {
                chunk_size: self.chunk_size,
                drain_timeout: Duration::from_millis(self.drain_timeout_ms),
            },
            grace_period: Duration::from_millis(self.grace_period_ms),
            status_prefix: "pty-helper".to_string(),
        })
    }
}
