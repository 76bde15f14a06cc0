// src/config/validate.rs

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::config::model::{ConfigFile, RawConfigFile, StageConfig};
use crate::errors::{ChunkdagError, Result};
use crate::exec::template;
use crate::types::parse_duration;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = ChunkdagError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        ensure_has_nodes(&raw)?;
        validate_executor(&raw)?;
        validate_node_dependencies(&raw)?;
        validate_dag(&raw)?;
        validate_stages(&raw)?;

        let poll_interval = parse_duration(&raw.executor.poll_interval).map_err(|e| {
            ChunkdagError::ConfigError(format!("[executor].poll_interval: {e}"))
        })?;
        let config = ConfigFile::new_unchecked(raw, poll_interval);
        config.dispatch_options().validate()?;
        Ok(config)
    }
}

fn ensure_has_nodes(cfg: &RawConfigFile) -> Result<()> {
    if cfg.node.is_empty() {
        return Err(ChunkdagError::ConfigError(
            "config must contain at least one [node.<name>] section".to_string(),
        ));
    }
    Ok(())
}

fn validate_executor(cfg: &RawConfigFile) -> Result<()> {
    if cfg.executor.max_workers == 0 {
        return Err(ChunkdagError::ConfigError(
            "[executor].max_workers must be >= 1 (got 0)".to_string(),
        ));
    }
    if cfg.executor.use_backups {
        cfg.backups.validate()?;
    }
    Ok(())
}

fn validate_node_dependencies(cfg: &RawConfigFile) -> Result<()> {
    for (name, node) in cfg.node.iter() {
        for dep in node.after.iter() {
            if dep == name {
                return Err(ChunkdagError::ConfigError(format!(
                    "node '{}' cannot depend on itself in `after`",
                    name
                )));
            }
            if !cfg.node.contains_key(dep) {
                return Err(ChunkdagError::ConfigError(format!(
                    "node '{}' has unknown dependency '{}' in `after`",
                    name, dep
                )));
            }
        }
    }
    Ok(())
}

fn validate_dag(cfg: &RawConfigFile) -> Result<()> {
    // Edge direction: dependency -> dependent.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for name in cfg.node.keys() {
        graph.add_node(name.as_str());
    }
    for (name, node) in cfg.node.iter() {
        for dep in node.after.iter() {
            graph.add_edge(dep.as_str(), name.as_str(), ());
        }
    }

    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(ChunkdagError::DagCycle(format!(
            "cycle detected in node DAG involving node '{}'",
            cycle.node_id()
        ))),
    }
}

fn validate_stages(cfg: &RawConfigFile) -> Result<()> {
    for (name, node) in cfg.node.iter() {
        let mut seen = std::collections::HashSet::new();
        for stage in node.stages.iter() {
            if !seen.insert(stage.name.as_str()) {
                return Err(ChunkdagError::ConfigError(format!(
                    "node '{}' has two stages named '{}'",
                    name, stage.name
                )));
            }
            validate_stage(cfg, name, stage)?;
        }
    }
    Ok(())
}

fn validate_stage(cfg: &RawConfigFile, node: &str, stage: &StageConfig) -> Result<()> {
    let err = |msg: String| {
        ChunkdagError::ConfigError(format!("node '{}' stage '{}': {}", node, stage.name, msg))
    };

    if stage.cmd.trim().is_empty() {
        return Err(err("`cmd` must not be empty".to_string()));
    }
    if stage.items.is_some() && stage.grid.is_some() {
        return Err(err("set either `items` or `grid`, not both".to_string()));
    }
    if let Some(grid) = &stage.grid {
        if grid.is_empty() || grid.contains(&0) {
            return Err(err(format!(
                "`grid` needs at least one dimension and no zero entries (got {:?})",
                grid
            )));
        }
    }
    template::check(&stage.cmd, &cfg.params, stage.is_mappable()).map_err(err)
}

#[cfg(test)]
mod tests {
    use crate::config::loader::parse_str;
    use crate::errors::ChunkdagError;
    use std::time::Duration;

    fn config_error(toml: &str) -> String {
        match parse_str(toml) {
            Err(ChunkdagError::ConfigError(msg)) => msg,
            other => panic!("expected ConfigError, got {other:?}"),
        }
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = parse_str(
            r#"
            [node.a]
            [[node.a.stage]]
            name = "s"
            cmd = "true"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.executor().max_workers, 4);
        assert_eq!(cfg.executor().max_failures, 3);
        assert!(!cfg.executor().use_backups);
        assert!(cfg.resume().enabled);
        assert_eq!(cfg.poll_interval(), Duration::from_secs(1));
    }

    #[test]
    fn rejects_empty_config() {
        assert!(config_error("").contains("at least one [node"));
    }

    #[test]
    fn rejects_unknown_and_self_dependencies() {
        assert!(config_error("[node.a]\nafter = [\"b\"]").contains("unknown dependency 'b'"));
        assert!(config_error("[node.a]\nafter = [\"a\"]").contains("cannot depend on itself"));
    }

    #[test]
    fn rejects_cycles() {
        let result = parse_str(
            r#"
            [node.a]
            after = ["b"]
            [node.b]
            after = ["a"]
            "#,
        );
        assert!(matches!(result, Err(ChunkdagError::DagCycle(_))));
    }

    #[test]
    fn rejects_bad_stage_definitions() {
        let both = config_error(
            r#"
            [node.a]
            [[node.a.stage]]
            name = "s"
            cmd = "true"
            items = [1]
            grid = [1]
            "#,
        );
        assert!(both.contains("not both"), "{both}");

        let zero = config_error(
            r#"
            [node.a]
            [[node.a.stage]]
            name = "s"
            cmd = "true"
            grid = [2, 0]
            "#,
        );
        assert!(zero.contains("zero"), "{zero}");

        let item_in_single = config_error(
            r#"
            [node.a]
            [[node.a.stage]]
            name = "s"
            cmd = "echo {item}"
            "#,
        );
        assert!(item_in_single.contains("items or grid"), "{item_in_single}");
    }

    #[test]
    fn rejects_bad_executor_settings() {
        assert!(config_error("[executor]\nmax_workers = 0\n[node.a]").contains("max_workers"));
        assert!(
            config_error("[executor]\npoll_interval = \"soon\"\n[node.a]")
                .contains("poll_interval")
        );
        assert!(
            config_error(
                "[executor]\nuse_backups = true\n[backups]\nslow_factor = 0.5\n[node.a]"
            )
            .contains("slow_factor")
        );
    }
}
