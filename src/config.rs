use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Deserialize;

use crate::archive::ArchiveLimits;
use crate::job::LimitPolicy;
use crate::runtime::{Language, RuntimeTable};

#[derive(Parser, Debug)]
#[command(name = "pocrun", version = "0.1", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c', global = true)]
    pub config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Serve the execute endpoint over HTTP
    Serve,

    /// Execute one PoC and print its result as JSON
    Run {
        /// Language tag of the PoC (python, go, bash)
        #[arg(long, short = 'l')]
        language: String,

        /// File holding the PoC source code
        #[arg(long, short = 's')]
        source: PathBuf,

        /// Zip archive with auxiliary files
        #[arg(long, short = 'a')]
        archive: Option<PathBuf>,

        /// Wall-clock timeout in seconds
        #[arg(long, short = 't')]
        timeout: Option<u64>,
    },
}

impl CliArgs {
    /// Load the configuration from the specified file, or the defaults when none is given
    pub fn to_config(&self) -> Result<Config> {
        let Some(path) = &self.config_path else {
            return Ok(Config::default());
        };
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open config file {}", path.display()))?;
        let reader = std::io::BufReader::new(file);
        let config: Config = serde_json::from_reader(reader)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub limits: LimitPolicy,
    pub runtimes: Vec<RuntimeConfig>,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let limits = &self.limits;
        if limits.defaults.memory > limits.ceiling.memory
            || limits.defaults.cpus > limits.ceiling.cpus
            || limits.defaults.pids > limits.ceiling.pids
            || limits.defaults.timeout > limits.ceiling.timeout
        {
            bail!("Default limits must not exceed the ceiling");
        }
        let fraction = self.engine.build_time_fraction;
        if !(fraction > 0.0 && fraction < 1.0) {
            bail!("build_time_fraction must be in (0, 1), got {fraction}");
        }
        if self.engine.max_concurrent_jobs == 0 {
            bail!("max_concurrent_jobs must not be 0");
        }
        Ok(())
    }

    /// The runtime table with any configured image overrides applied
    pub fn runtime_table(&self) -> RuntimeTable {
        let mut table = RuntimeTable::builtin();
        for runtime in &self.runtimes {
            table.override_image(runtime.language, &runtime.image);
        }
        table
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
}

#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    Docker,
    Process,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct EngineConfig {
    pub backend: Backend,
    pub docker_binary: String,
    /// Defaults to the user cache directory
    pub staging_root: Option<PathBuf>,
    pub output_limit_bytes: usize,
    pub max_concurrent_jobs: usize,
    /// Share of the job timeout the build phase may use
    pub build_time_fraction: f64,
    pub reap_interval_secs: u64,
    pub archive_max_entries: usize,
    pub archive_max_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let archive = ArchiveLimits::default();
        Self {
            backend: Backend::default(),
            docker_binary: "docker".to_string(),
            staging_root: None,
            output_limit_bytes: 64 * 1024,
            max_concurrent_jobs: 4,
            build_time_fraction: 0.6,
            reap_interval_secs: 60,
            archive_max_entries: archive.max_entries,
            archive_max_bytes: archive.max_total_bytes,
        }
    }
}

impl EngineConfig {
    pub fn archive_limits(&self) -> ArchiveLimits {
        ArchiveLimits {
            max_entries: self.archive_max_entries,
            max_total_bytes: self.archive_max_bytes,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct RuntimeConfig {
    pub language: Language,
    pub image: String,
}
