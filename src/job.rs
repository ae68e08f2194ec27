use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 hex digits, enough to tell jobs apart in logs and container names
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MegaByte(pub u64);

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Second(pub u64);

impl From<Second> for Duration {
    fn from(value: Second) -> Self {
        Duration::from_secs(value.0)
    }
}

/// Network access granted to the sandbox
///
/// Only `Disabled` exists; the ceiling never lets a job opt into networking.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NetworkPolicy {
    #[default]
    Disabled,
}

/// Fully resolved limits a sandbox is launched with
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct ResourceLimits {
    pub memory: MegaByte,
    /// Fraction of one core
    pub cpus: f64,
    pub pids: u32,
    pub timeout: Second,
    #[serde(default)]
    pub network: NetworkPolicy,
}

impl ResourceLimits {
    pub const fn default_profile() -> Self {
        Self {
            memory: MegaByte(100),
            cpus: 0.5,
            pids: 100,
            timeout: Second(30),
            network: NetworkPolicy::Disabled,
        }
    }

    pub const fn default_ceiling() -> Self {
        Self {
            memory: MegaByte(512),
            cpus: 1.0,
            pids: 256,
            timeout: Second(120),
            network: NetworkPolicy::Disabled,
        }
    }

    /// Smallest values the engine will launch with, whatever the caller asks for
    pub const fn floor() -> Self {
        Self {
            memory: MegaByte(8),
            cpus: 0.05,
            pids: 8,
            timeout: Second(1),
            network: NetworkPolicy::Disabled,
        }
    }
}

/// Per-job overrides supplied by the caller; unset fields fall back to the engine defaults
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct LimitOverrides {
    pub memory_mb: Option<u64>,
    pub cpus: Option<f64>,
    pub pids: Option<u32>,
    pub timeout_secs: Option<u64>,
}

/// Engine-wide defaults and the ceiling every job is clamped to
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct LimitPolicy {
    pub defaults: ResourceLimits,
    pub ceiling: ResourceLimits,
}

impl Default for LimitPolicy {
    fn default() -> Self {
        Self {
            defaults: ResourceLimits::default_profile(),
            ceiling: ResourceLimits::default_ceiling(),
        }
    }
}

impl LimitPolicy {
    /// Applies the overrides on top of the defaults and clamps into `[floor, ceiling]`
    pub fn resolve(&self, overrides: &LimitOverrides) -> ResourceLimits {
        let floor = ResourceLimits::floor();
        let ceiling = &self.ceiling;

        let memory = overrides.memory_mb.unwrap_or(self.defaults.memory.0);
        let cpus = overrides
            .cpus
            .filter(|c| c.is_finite())
            .unwrap_or(self.defaults.cpus);
        let pids = overrides.pids.unwrap_or(self.defaults.pids);
        let timeout = overrides.timeout_secs.unwrap_or(self.defaults.timeout.0);

        ResourceLimits {
            memory: MegaByte(memory.min(ceiling.memory.0).max(floor.memory.0)),
            cpus: cpus.min(ceiling.cpus).max(floor.cpus),
            pids: pids.min(ceiling.pids).max(floor.pids),
            timeout: Second(timeout.min(ceiling.timeout.0).max(floor.timeout.0)),
            network: NetworkPolicy::Disabled,
        }
    }
}

/// A single PoC execution request; immutable once built
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PoCJob {
    #[serde(default)]
    id: JobId,
    language: String,
    source: String,
    #[serde(default)]
    archive: Option<PathBuf>,
    #[serde(default)]
    limits: LimitOverrides,
}

impl PoCJob {
    pub fn new(language: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            language: language.into(),
            source: source.into(),
            archive: None,
            limits: LimitOverrides::default(),
        }
    }

    pub fn with_archive(mut self, archive: impl Into<PathBuf>) -> Self {
        self.archive = Some(archive.into());
        self
    }

    pub fn with_limits(mut self, limits: LimitOverrides) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.limits.timeout_secs = Some(secs);
        self
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn archive(&self) -> Option<&Path> {
        self.archive.as_deref()
    }

    pub fn limits(&self) -> &LimitOverrides {
        &self.limits
    }
}
