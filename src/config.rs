//! Daemon configuration: system settings, compiler traits, switches, jails.
//!
//! Loaded once at startup from a TOML file and treated as immutable for
//! the life of the process. Referential integrity (compiler to jail) is
//! checked at load time so sessions can index without failure paths.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct Config {
    pub(crate) system: SystemConfig,
    #[serde(default)]
    pub(crate) compilers: Vec<Compiler>,
    #[serde(default)]
    pub(crate) switches: HashMap<String, Switch>,
    #[serde(default)]
    pub(crate) jails: HashMap<String, JailConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct SystemConfig {
    pub(crate) listen_port: u16,
    /// Parent of the per-session jail working directories.
    pub(crate) basedir: PathBuf,
    /// Parent of the archival source copies.
    pub(crate) storedir: PathBuf,
    #[serde(default = "default_max_connections")]
    pub(crate) max_connections: usize,
}

/// One configured toolchain.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct Compiler {
    pub(crate) name: String,
    pub(crate) language: String,
    pub(crate) display_name: String,
    #[serde(default)]
    pub(crate) compile_command: Vec<String>,
    #[serde(default)]
    pub(crate) run_command: Vec<String>,
    #[serde(default)]
    pub(crate) version_command: Vec<String>,
    /// Filename substituted when the client submits a source without one.
    #[serde(default = "default_output_file")]
    pub(crate) output_file: String,
    #[serde(default = "default_true")]
    pub(crate) displayable: bool,
    pub(crate) jail_name: String,
    /// Ordered allow-list of switch ids this compiler honors.
    #[serde(default)]
    pub(crate) switches: Vec<String>,
}

/// Flags a client may splice into a compiler's argv by id.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct Switch {
    pub(crate) flags: Vec<String>,
    /// 0 appends; any other value inserts at that argv index.
    #[serde(default)]
    pub(crate) insert_position: usize,
    /// Whether the flags apply to the run argv instead of the compile argv.
    #[serde(default)]
    pub(crate) runtime: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct JailConfig {
    /// Prefix argv: the jail wrapper command every child runs under.
    pub(crate) jail_command: Vec<String>,
    /// Soft time limit for the compile step, seconds.
    #[serde(default = "default_compile_time_limit")]
    pub(crate) compile_time_limit: u64,
    /// Soft time limit for the run step, seconds.
    #[serde(default = "default_program_duration")]
    pub(crate) program_duration: u64,
    /// Grace window between SIGXCPU and SIGKILL, seconds.
    #[serde(default = "default_kill_wait")]
    pub(crate) kill_wait: u64,
    /// Emitted-byte count that earns the child a SIGXFSZ warning.
    #[serde(default = "default_output_limit_warn")]
    pub(crate) output_limit_warn: u64,
    /// Emitted-byte count that earns the child a SIGKILL.
    #[serde(default = "default_output_limit_kill")]
    pub(crate) output_limit_kill: u64,
}

impl Config {
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("in config file {}", path.display()))
    }

    pub(crate) fn parse(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.system.max_connections == 0 {
            bail!("system.max-connections must be at least 1");
        }
        for compiler in &self.compilers {
            if !self.jails.contains_key(&compiler.jail_name) {
                bail!(
                    "compiler '{}' references unknown jail '{}'",
                    compiler.name,
                    compiler.jail_name
                );
            }
        }
        Ok(())
    }

    pub(crate) fn compiler(&self, name: &str) -> Option<&Compiler> {
        self.compilers.iter().find(|c| c.name == name)
    }

    /// The jail a compiler runs under. Resolution cannot fail after
    /// [`Config::validate`] has passed.
    pub(crate) fn jail(&self, compiler: &Compiler) -> &JailConfig {
        &self.jails[&compiler.jail_name]
    }
}

/// JSON element of a `VersionResult` array, rendered for the front-end.
pub(crate) fn display_entry(compiler: &Compiler, version: &str) -> serde_json::Value {
    serde_json::json!({
        "name": compiler.name,
        "language": compiler.language,
        "display-name": compiler.display_name,
        "version": version,
        "switches": compiler.switches,
    })
}

const fn default_max_connections() -> usize {
    64
}

fn default_output_file() -> String {
    "prog.exe".to_string()
}

const fn default_true() -> bool {
    true
}

const fn default_compile_time_limit() -> u64 {
    60
}

const fn default_program_duration() -> u64 {
    10
}

const fn default_kill_wait() -> u64 {
    5
}

const fn default_output_limit_warn() -> u64 {
    30_000
}

const fn default_output_limit_kill() -> u64 {
    400_000
}
