use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use batchd_core::{ConfigFile, RetryPolicy, SchedulerConfig, SchedulerOptions};

use crate::error::{Result, SchedulerError};
use crate::metrics::Counters;
use crate::resources::ResourcePool;
use crate::state::TaskState;

/// Everything guarded by the scheduler lock.
#[derive(Debug, Default)]
pub(super) struct Inner {
    pub state: TaskState,
    pub pool: ResourcePool,
    pub counters: Counters,
}

/// Central scheduler. Workers declare tasks with [`Scheduler::add_task`] and
/// pull runnable ones with [`Scheduler::get_work`].
///
/// All state sits behind one mutex, so a scan-then-assign step is atomic and
/// two workers can never receive the same task. Share it across threads with
/// an `Arc`.
#[derive(Debug)]
pub struct Scheduler {
    pub(super) config: SchedulerConfig,
    pub(super) inner: Mutex<Inner>,
}

impl Scheduler {
    /// Scheduler with built-in defaults.
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    /// Constructor options over built-in defaults.
    pub fn with_options(options: SchedulerOptions) -> Self {
        Self::with_config(SchedulerConfig::default().overridden_by(&options))
    }

    /// Constructor options over the configuration file over built-in defaults.
    pub fn from_config(options: SchedulerOptions, file: &ConfigFile) -> Result<Self> {
        Ok(Self::with_config(SchedulerConfig::resolve(&options, file)?))
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        config.log_summary();
        let pool = ResourcePool::new(config.resources.clone());
        Self {
            config,
            inner: Mutex::new(Inner {
                pool,
                ..Inner::default()
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Policy given to tasks declared without an explicit one.
    pub fn default_retry_policy(&self) -> RetryPolicy {
        self.config.default_retry_policy()
    }

    /// Configured resource capacities.
    pub fn resources(&self) -> &BTreeMap<String, u32> {
        &self.config.resources
    }

    pub(super) fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|e| SchedulerError::LockPoisoned(format!("scheduler state: {e}")))
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
