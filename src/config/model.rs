// src/config/model.rs

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::dispatch::{BackupPolicy, DispatchOptions};
use crate::remote::local::DEFAULT_MAX_WORKERS;

/// Configuration as read from a TOML file, before validation.
///
/// ```toml
/// [executor]
/// max_workers = 8
/// use_backups = true
///
/// [params]
/// prefix = "out"
///
/// [node.a]
/// [[node.a.stage]]
/// name = "write"
/// cmd = "write-chunk {params.prefix} {item}"
/// grid = [2, 2]
///
/// [node.b]
/// after = ["a"]
/// [[node.b.stage]]
/// name = "finalize"
/// cmd = "finalize {params.prefix}"
/// ```
///
/// All sections except `[node.*]` are optional.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub executor: ExecutorSection,

    /// Straggler detection tuning, used only when backups are enabled.
    #[serde(default)]
    pub backups: BackupPolicy,

    #[serde(default)]
    pub resume: ResumeSection,

    /// Shared pipeline config handed to every stage.
    #[serde(default)]
    pub params: Map<String, Value>,

    /// All nodes from `[node.<name>]`.
    #[serde(default)]
    pub node: BTreeMap<String, NodeConfig>,
}

/// Validated configuration. Only obtainable through `TryFrom<RawConfigFile>`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    executor: ExecutorSection,
    backups: BackupPolicy,
    resume: ResumeSection,
    params: Map<String, Value>,
    node: BTreeMap<String, NodeConfig>,
    poll_interval: Duration,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(raw: RawConfigFile, poll_interval: Duration) -> Self {
        Self {
            executor: raw.executor,
            backups: raw.backups,
            resume: raw.resume,
            params: raw.params,
            node: raw.node,
            poll_interval,
        }
    }

    pub fn executor(&self) -> &ExecutorSection {
        &self.executor
    }

    pub fn backups(&self) -> &BackupPolicy {
        &self.backups
    }

    pub fn resume(&self) -> &ResumeSection {
        &self.resume
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    pub fn nodes(&self) -> &BTreeMap<String, NodeConfig> {
        &self.node
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Dispatcher options for every mappable stage of this config.
    pub fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            max_failures: self.executor.max_failures,
            use_backups: self.executor.use_backups,
            return_stats: false,
            poll_interval: self.poll_interval,
            backup: self.backups,
        }
    }
}

/// `[executor]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorSection {
    /// Calls allowed to run at the same time on the local backend.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Failures tolerated per mappable stage before it aborts.
    #[serde(default = "default_max_failures")]
    pub max_failures: usize,

    #[serde(default)]
    pub use_backups: bool,

    /// Delay between status polls while backups are enabled, e.g. `"500ms"`.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,
}

fn default_max_workers() -> usize {
    DEFAULT_MAX_WORKERS
}

fn default_max_failures() -> usize {
    DispatchOptions::default().max_failures
}

fn default_poll_interval() -> String {
    "1s".to_string()
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_failures: default_max_failures(),
            use_backups: false,
            poll_interval: default_poll_interval(),
        }
    }
}

/// `[resume]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ResumeSection {
    /// Skip nodes recorded as computed by a previous run.
    #[serde(default = "default_resume_enabled")]
    pub enabled: bool,
}

fn default_resume_enabled() -> bool {
    true
}

impl Default for ResumeSection {
    fn default() -> Self {
        Self {
            enabled: default_resume_enabled(),
        }
    }
}

/// `[node.<name>]` section: one pipeline.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NodeConfig {
    /// Nodes whose output this node reads.
    #[serde(default)]
    pub after: Vec<String>,

    /// Mark the output as present without running anything.
    #[serde(default)]
    pub computed: bool,

    /// Stages, run in the order written.
    #[serde(default, rename = "stage")]
    pub stages: Vec<StageConfig>,
}

/// `[[node.<name>.stage]]` entry.
///
/// A stage with `items` or `grid` is mappable; with neither it runs once.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct StageConfig {
    pub name: String,

    /// Shell command template.
    pub cmd: String,

    /// Explicit work items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<Value>>,

    /// Block counts per dimension; expands to every block index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid: Option<Vec<u64>>,
}

impl StageConfig {
    pub fn is_mappable(&self) -> bool {
        self.items.is_some() || self.grid.is_some()
    }
}
