#![allow(dead_code)]

use std::collections::BTreeMap;

use chunkdag::config::{
    ConfigFile, ExecutorSection, NodeConfig, RawConfigFile, ResumeSection, StageConfig,
};
use chunkdag::dispatch::BackupPolicy;
use serde_json::{Map, Value};

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile {
                executor: ExecutorSection::default(),
                backups: BackupPolicy::default(),
                resume: ResumeSection::default(),
                params: Map::new(),
                node: BTreeMap::new(),
            },
        }
    }

    pub fn with_node(mut self, name: &str, node: NodeConfig) -> Self {
        self.config.node.insert(name.to_string(), node);
        self
    }

    pub fn with_param(mut self, key: &str, value: Value) -> Self {
        self.config.params.insert(key.to_string(), value);
        self
    }

    pub fn with_backups(mut self, enabled: bool) -> Self {
        self.config.executor.use_backups = enabled;
        self
    }

    pub fn with_max_failures(mut self, max_failures: usize) -> Self {
        self.config.executor.max_failures = max_failures;
        self
    }

    pub fn with_resume(mut self, enabled: bool) -> Self {
        self.config.resume.enabled = enabled;
        self
    }

    pub fn raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `NodeConfig`.
#[derive(Default)]
pub struct NodeConfigBuilder {
    node: NodeConfig,
}

impl NodeConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.node.after.push(dep.to_string());
        self
    }

    pub fn computed(mut self, computed: bool) -> Self {
        self.node.computed = computed;
        self
    }

    pub fn stage(mut self, stage: StageConfig) -> Self {
        self.node.stages.push(stage);
        self
    }

    pub fn build(self) -> NodeConfig {
        self.node
    }
}

/// Builder for `StageConfig`.
pub struct StageConfigBuilder {
    stage: StageConfig,
}

impl StageConfigBuilder {
    pub fn new(name: &str, cmd: &str) -> Self {
        Self {
            stage: StageConfig {
                name: name.to_string(),
                cmd: cmd.to_string(),
                items: None,
                grid: None,
            },
        }
    }

    pub fn items(mut self, items: Vec<Value>) -> Self {
        self.stage.items = Some(items);
        self
    }

    pub fn grid(mut self, grid: Vec<u64>) -> Self {
        self.stage.grid = Some(grid);
        self
    }

    pub fn build(self) -> StageConfig {
        self.stage
    }
}
