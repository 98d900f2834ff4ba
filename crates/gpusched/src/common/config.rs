use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::env::CUDA_VISIBLE_DEVICES;

pub const DEFAULT_ROOT: &str = "/var/gpusched";

/// Which facility is used to find out which processes run on which GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    /// Query `nvidia-smi`.
    Nvidia,
    /// Do not inspect GPU processes (disables the intruder sweep).
    None,
}

/// Configuration shared by the daemon and the clients.
///
/// It can be loaded from a TOML file; missing keys take their default values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedConfig {
    /// Root directory of the job store.
    pub root: PathBuf,
    /// Delay between two scheduling cycles of the daemon.
    pub cycle_secs: u64,
    /// Delay between two checks of a waiting client.
    pub poll_secs: u64,
    /// How long a client waits for an assignment before it gives up.
    pub max_wait_secs: u64,
    /// How long an evicted job may take to exit after SIGTERM.
    pub grace_secs: u64,
    /// How long to wait for the store lock before the store is considered unavailable.
    pub lock_timeout_secs: u64,
    /// Environment variable that restricts the GPUs visible to a job.
    pub visibility_var: String,
    pub gpu_probe: ProbeKind,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            cycle_secs: 10,
            poll_secs: 2,
            max_wait_secs: 10,
            grace_secs: 5,
            lock_timeout_secs: 30,
            visibility_var: CUDA_VISIBLE_DEVICES.to_string(),
            gpu_probe: ProbeKind::Nvidia,
        }
    }
}

impl SchedConfig {
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> crate::Result<Self> {
        let config: SchedConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.cycle_secs == 0 {
            return Err("`cycle_secs` has to be at least 1".into());
        }
        if self.poll_secs == 0 {
            return Err("`poll_secs` has to be at least 1".into());
        }
        if self.visibility_var.is_empty() {
            return Err("`visibility_var` cannot be empty".into());
        }
        Ok(())
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_secs)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}
