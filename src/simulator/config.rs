//! Simulation Configuration
//!
//! Budgets, error policy, scheduler selection and the crash set of a
//! simulation. Loadable from TOML or from `SIMCHECK_*` environment
//! variables.

use super::failure::FailureSpec;
use crate::node::NodeId;
use crate::scheduler::{GlobalScheduler, PrefixScheduler, RandomScheduler, ReplayScheduler};
use crate::state::RunFileError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Exploration strategy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchedulerKind {
    #[default]
    Prefix,
    Random { seed: u64 },
    Replay { path: PathBuf },
}

#[derive(Debug)]
pub enum ConfigError {
    Invalid(String),
    Toml(toml::de::Error),
    Replay(RunFileError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid(msg) => write!(f, "invalid simulation config: {}", msg),
            ConfigError::Toml(e) => write!(f, "cannot parse simulation config: {}", e),
            ConfigError::Replay(e) => write!(f, "cannot load replay run: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Toml(e)
    }
}

impl From<RunFileError> for ConfigError {
    fn from(e: RunFileError) -> Self {
        ConfigError::Replay(e)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Run budget; `None` explores until the scheduler is exhausted
    pub max_runs: Option<u64>,
    /// Steps per run
    pub max_depth: usize,
    pub num_concurrent: usize,
    /// Collect run errors instead of aborting on the first one
    pub ignore_errors: bool,
    /// Let panics in node code propagate to the caller
    pub ignore_panics: bool,
    /// Fail a step that has not completed after this long. Off by default:
    /// a step that never completes hangs its run.
    pub event_timeout_ms: Option<u64>,
    pub scheduler: SchedulerKind,
    pub failures: FailureSpec,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            max_runs: None,
            max_depth: 1_000,
            num_concurrent: 4,
            ignore_errors: false,
            ignore_panics: false,
            event_timeout_ms: None,
            scheduler: SchedulerKind::Prefix,
            failures: FailureSpec::none(),
        }
    }
}

impl SimulationConfig {
    /// Depth-first exploration of every interleaving
    pub fn exhaustive() -> Self {
        Self::default()
    }

    /// Random walk over `max_runs` runs
    pub fn random_walk(seed: u64, max_runs: u64) -> Self {
        SimulationConfig {
            max_runs: Some(max_runs),
            scheduler: SchedulerKind::Random { seed },
            ..Self::default()
        }
    }

    /// Small exhaustive setup for unit tests: two workers, a step timeout
    pub fn test() -> Self {
        SimulationConfig {
            max_depth: 200,
            num_concurrent: 2,
            event_timeout_ms: Some(10_000),
            ..Self::default()
        }
    }

    pub fn with_crashes(mut self, nodes: impl IntoIterator<Item = usize>) -> Self {
        self.failures = FailureSpec::crash(nodes);
        self
    }

    /// Load configuration from `SIMCHECK_*` environment variables; unset or
    /// unparsable values keep their defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let seed = env_parse("SIMCHECK_SEED").unwrap_or(0);
        let scheduler = match std::env::var("SIMCHECK_SCHEDULER").as_deref() {
            Ok("random") => SchedulerKind::Random { seed },
            Ok("replay") => match std::env::var("SIMCHECK_REPLAY") {
                Ok(path) => SchedulerKind::Replay { path: path.into() },
                Err(_) => SchedulerKind::Prefix,
            },
            _ => SchedulerKind::Prefix,
        };

        SimulationConfig {
            max_runs: env_parse("SIMCHECK_MAX_RUNS").or(defaults.max_runs),
            max_depth: env_parse("SIMCHECK_MAX_DEPTH").unwrap_or(defaults.max_depth),
            num_concurrent: env_parse("SIMCHECK_CONCURRENCY").unwrap_or(defaults.num_concurrent),
            ignore_errors: env_flag("SIMCHECK_IGNORE_ERRORS"),
            ignore_panics: env_flag("SIMCHECK_IGNORE_PANICS"),
            event_timeout_ms: env_parse("SIMCHECK_EVENT_TIMEOUT_MS"),
            scheduler,
            failures: FailureSpec {
                crash: Self::parse_crash_list(&std::env::var("SIMCHECK_CRASH").unwrap_or_default()),
            },
        }
    }

    /// Parse a crash list (format: "1,2,4")
    fn parse_crash_list(list: &str) -> Vec<NodeId> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter_map(|s| s.parse().ok())
            .map(NodeId)
            .collect()
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: SimulationConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_concurrent == 0 {
            return Err(ConfigError::Invalid("num_concurrent must be at least 1".into()));
        }
        if self.max_depth == 0 {
            return Err(ConfigError::Invalid("max_depth must be at least 1".into()));
        }
        if self.max_runs.is_none() && matches!(self.scheduler, SchedulerKind::Random { .. }) {
            return Err(ConfigError::Invalid(
                "a random walk never exhausts; set max_runs".into(),
            ));
        }
        Ok(())
    }

    pub fn event_timeout(&self) -> Option<Duration> {
        self.event_timeout_ms.map(Duration::from_millis)
    }

    pub fn build_scheduler(&self) -> Result<Arc<dyn GlobalScheduler>, ConfigError> {
        Ok(match &self.scheduler {
            SchedulerKind::Prefix => Arc::new(PrefixScheduler::new()),
            SchedulerKind::Random { seed } => Arc::new(RandomScheduler::new(*seed)),
            SchedulerKind::Replay { path } => Arc::new(ReplayScheduler::from_file(path)?),
        })
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    std::env::var(var).ok().and_then(|s| s.trim().parse().ok())
}

fn env_flag(var: &str) -> bool {
    std::env::var(var)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}
