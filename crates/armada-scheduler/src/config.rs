//! Configuration types for armada services.

use std::path::{Path, PathBuf};
use std::time::Duration;

use armada_state::StateConfig;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::{Result, SchedulerError};

const DEFAULT_CONFIG_FILE: &str = "armada.toml";
const ENV_PREFIX: &str = "ARMADA_";

/// Top-level configuration shared by every `armada` subcommand.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ArmadaConfig {
    /// Cache, ledger and queue backends.
    pub state: StateConfig,
    /// Worker identity, capacity and lease.
    pub worker: WorkerConfig,
    /// Scheduling loop.
    pub scheduler: SchedulingConfig,
    /// Cached counter maintenance.
    pub accounting: AccountingConfig,
    /// Job execution.
    pub executor: ExecutorConfig,
    /// Stale row sweeps.
    pub reaper: ReaperConfig,
    /// Cancellation signalling.
    pub cancel: CancelConfig,
}

impl ArmadaConfig {
    /// Load configuration.
    ///
    /// Sources, later overriding earlier:
    /// 1. Default values
    /// 2. `path`, or `armada.toml` in the current directory (if present)
    /// 3. Environment variables prefixed `ARMADA_`, nested with `__`
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        Self::from_figment(Figment::new().merge(Toml::file(file)))
    }

    fn from_figment(figment: Figment) -> Result<Self> {
        figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| SchedulerError::Config(e.to_string()))
    }
}

/// Worker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker ID. Generated at start-up when unset.
    pub id: Option<String>,
    /// CPUs advertised to the scheduler. Defaults to the host's parallelism.
    pub cpus: u32,
    /// Hostname recorded in the liveness record. Read from the OS when unset.
    pub hostname: Option<String>,
    /// Parallel execution slots.
    pub slots: usize,
    /// Liveness record lifetime.
    #[serde(with = "serde_duration_secs")]
    pub lease: Duration,
    /// How often the liveness record is rewritten.
    #[serde(with = "serde_duration_secs")]
    pub heartbeat_interval: Duration,
    /// Pause between queue polls when no dispatch is waiting.
    #[serde(with = "serde_duration_millis")]
    pub idle_poll: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .ok()
            .and_then(|n| u32::try_from(n.get()).ok())
            .unwrap_or(1);
        Self {
            id: None,
            cpus,
            hostname: None,
            slots: 4,
            lease: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            idle_poll: Duration::from_millis(500),
        }
    }
}

/// Scheduling loop configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    /// Time between ticks.
    #[serde(with = "serde_duration_secs")]
    pub tick_interval: Duration,
    /// Pending jobs considered per tick.
    pub batch_size: usize,
    /// Work queue the scheduler publishes dispatches to.
    pub queue: String,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            batch_size: 256,
            queue: "armada.dispatch".to_owned(),
        }
    }
}

/// Cached counter maintenance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AccountingConfig {
    /// How often the cached allocated-CPU counter is rebuilt from the ledger.
    #[serde(with = "serde_duration_secs")]
    pub resync_interval: Duration,
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(120),
        }
    }
}

/// Job execution configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Interval for exit, cancellation and time-limit checks.
    #[serde(with = "serde_duration_millis")]
    pub poll_interval: Duration,
    /// Time between SIGTERM and SIGKILL.
    #[serde(with = "serde_duration_secs")]
    pub grace_period: Duration,
    /// Interpreter the job script is handed to with `-c`.
    pub shell: PathBuf,
    /// Working directory for job processes. Inherited when unset.
    pub working_dir: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            grace_period: Duration::from_secs(10),
            shell: PathBuf::from("/bin/sh"),
            working_dir: None,
        }
    }
}

/// Reaper configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    /// Time between sweeps.
    #[serde(with = "serde_duration_secs")]
    pub sweep_interval: Duration,
    /// Age after which a reservation is presumed to have lost its dispatch.
    #[serde(with = "serde_duration_secs")]
    pub stale_reservation: Duration,
    /// Age after which a running job is presumed to have lost its executor.
    #[serde(with = "serde_duration_secs")]
    pub orphan_after: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            stale_reservation: Duration::from_secs(600),
            orphan_after: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Cancellation configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CancelConfig {
    /// Lifetime of a cancellation flag nobody clears.
    #[serde(with = "serde_duration_secs")]
    pub signal_ttl: Duration,
    /// How long a cancel request waits for the executor before killing.
    #[serde(with = "serde_duration_secs")]
    pub window: Duration,
    /// Ledger poll interval while waiting.
    #[serde(with = "serde_duration_millis")]
    pub poll_interval: Duration,
}

impl Default for CancelConfig {
    fn default() -> Self {
        Self {
            signal_ttl: Duration::from_secs(3600),
            window: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Serde helper for Duration as seconds.
mod serde_duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serde helper for Duration as milliseconds.
mod serde_duration_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
