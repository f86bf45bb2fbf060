//! Jobs
//!
//! A job is one queued unit of scheduled work: a reference to the observer
//! whose pending value should be committed, plus the configuration that
//! controls how the commit behaves. Jobs are created by `ingest`, consumed
//! exactly once by the runtime in FIFO order, then discarded.

use std::sync::Arc;

use smallvec::SmallVec;

use super::observer::Observer;

/// Controls which registered side effects run during a commit.
#[derive(Debug, Clone)]
pub struct SideEffectConfig {
    /// When `false`, no side effect runs for this job.
    pub enabled: bool,

    /// Side-effect names skipped for this job even when enabled.
    pub exclude: SmallVec<[String; 2]>,
}

impl Default for SideEffectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            exclude: SmallVec::new(),
        }
    }
}

impl SideEffectConfig {
    /// Whether the side effect registered under `name` should run.
    pub fn allows(&self, name: &str) -> bool {
        self.enabled && !self.exclude.iter().any(|excluded| excluded == name)
    }
}

/// Execution configuration carried by a job.
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Suppress the notification step: subscribers are not marked for
    /// update. The value commit itself still happens.
    pub background: bool,

    /// Bypass the equality short-circuit and commit even when the new value
    /// equals the current one.
    pub force: bool,

    /// Side-effect filtering for this job.
    pub side_effects: SideEffectConfig,

    /// Mirror the committed value to configured storage backends. Turned off
    /// for values that were just loaded from storage.
    pub storage: bool,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            background: false,
            force: false,
            side_effects: SideEffectConfig::default(),
            storage: true,
        }
    }
}

impl JobConfig {
    /// A config that commits without marking subscribers.
    pub fn background() -> Self {
        Self {
            background: true,
            ..Self::default()
        }
    }

    /// A config that bypasses the equality short-circuit.
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }

    /// A config for values arriving from storage: committed and notified,
    /// but not mirrored back into the backend they came from.
    pub fn from_storage() -> Self {
        Self {
            storage: false,
            ..Self::default()
        }
    }
}

/// A queued, pending mutation plus its execution configuration.
pub struct Job {
    observer: Arc<dyn Observer>,
    config: JobConfig,

    /// Whether this job should mark subscribers, decided at enqueue time:
    /// a background job never does, and a node without subscribers has
    /// nothing to mark.
    rerender: bool,
}

impl Job {
    /// Create a job for `observer` with the given config.
    pub fn new(observer: Arc<dyn Observer>, config: JobConfig) -> Self {
        let rerender = !config.background && observer.node().has_subscribers();
        Self {
            observer,
            config,
            rerender,
        }
    }

    /// The observer this job commits.
    pub fn observer(&self) -> &Arc<dyn Observer> {
        &self.observer
    }

    /// The job's execution configuration.
    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Whether subscribers should be marked after the commit.
    pub fn rerender(&self) -> bool {
        self.rerender
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("observer", &self.observer.node().id())
            .field("config", &self.config)
            .field("rerender", &self.rerender)
            .finish()
    }
}
