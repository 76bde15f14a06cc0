// src/resume.rs

//! Resume support: remembers which nodes finished, and with what inputs.
//!
//! Each node gets a blake3 fingerprint over its own definition, the shared
//! `[params]` and the fingerprints of its dependencies, so changing a node
//! also invalidates everything downstream of it. Finished nodes are written
//! to `<root>/.chunkdag/computed` as `name fingerprint` lines.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use blake3::Hasher;
use tracing::{debug, info};

use crate::config::ConfigFile;
use crate::dag::{ComputedCheck, DagNode};
use crate::errors::{ChunkdagError, Result};
use crate::types::NodeName;

/// Path of the ledger relative to the directory holding the config file.
pub const LEDGER_PATH: &str = ".chunkdag/computed";

/// Fingerprint every node of a validated config.
pub fn fingerprints(config: &ConfigFile) -> Result<BTreeMap<NodeName, String>> {
    let params = serde_json::to_vec(config.params()).context("serializing [params]")?;
    let mut out = BTreeMap::new();
    for name in config.nodes().keys() {
        fingerprint_node(config, name, &params, &mut out)?;
    }
    Ok(out)
}

fn fingerprint_node(
    config: &ConfigFile,
    name: &str,
    params: &[u8],
    done: &mut BTreeMap<NodeName, String>,
) -> Result<String> {
    if let Some(hash) = done.get(name) {
        return Ok(hash.clone());
    }
    let node = config
        .nodes()
        .get(name)
        .ok_or_else(|| ChunkdagError::NodeNotFound(name.to_string()))?;

    let mut deps = node.after.clone();
    deps.sort();
    let mut dep_hashes = Vec::with_capacity(deps.len());
    for dep in &deps {
        dep_hashes.push(fingerprint_node(config, dep, params, done)?);
    }

    let mut hasher = Hasher::new();
    hasher.update(name.as_bytes());
    hasher.update(&serde_json::to_vec(&node.stages).context("serializing node stages")?);
    hasher.update(params);
    for hash in &dep_hashes {
        hasher.update(hash.as_bytes());
    }
    let hash = hasher.finalize().to_hex().to_string();
    done.insert(name.to_string(), hash.clone());
    Ok(hash)
}

/// [`ComputedCheck`] backed by the on-disk ledger.
///
/// A node counts as computed when its flag is set, when it has no pipeline,
/// or when the ledger holds a matching fingerprint. With `force`, the
/// ledger is not consulted but finished nodes are still recorded.
#[derive(Debug)]
pub struct FingerprintLedger {
    path: PathBuf,
    current: BTreeMap<NodeName, String>,
    stored: Mutex<HashMap<NodeName, String>>,
    force: bool,
}

impl FingerprintLedger {
    /// Open the ledger under `root`, dropping entries for nodes that no
    /// longer exist.
    pub fn open(root: &Path, current: BTreeMap<NodeName, String>, force: bool) -> Result<Self> {
        let path = root.join(LEDGER_PATH);
        let mut stored = load_ledger(&path)?;

        let before = stored.len();
        stored.retain(|name, _| current.contains_key(name));
        if stored.len() < before {
            info!(removed = before - stored.len(), "pruned stale ledger entries");
        }

        Ok(Self {
            path,
            current,
            stored: Mutex::new(stored),
            force,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn matches(&self, name: &str) -> bool {
        let Some(expected) = self.current.get(name) else {
            return false;
        };
        self.stored
            .lock()
            .map(|stored| stored.get(name) == Some(expected))
            .unwrap_or(false)
    }
}

impl ComputedCheck for FingerprintLedger {
    fn already_computed(&self, node: &DagNode) -> bool {
        if node.computed || node.pipeline.is_none() {
            return true;
        }
        !self.force && self.matches(&node.name)
    }

    fn record_computed(&self, node: &DagNode) -> Result<()> {
        let Some(hash) = self.current.get(&node.name) else {
            return Ok(());
        };
        let mut stored = self
            .stored
            .lock()
            .map_err(|_| ChunkdagError::Executor("ledger lock poisoned".to_string()))?;
        stored.insert(node.name.clone(), hash.clone());
        save_ledger(&self.path, &stored)?;
        debug!(node = %node.name, hash = %hash, "recorded computed node");
        Ok(())
    }
}

fn load_ledger(path: &Path) -> Result<HashMap<NodeName, String>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }

    let file = File::open(path).with_context(|| format!("opening ledger at {:?}", path))?;
    let mut map = HashMap::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if let Some((name, hash)) = line.trim().split_once(char::is_whitespace) {
            map.insert(name.to_string(), hash.trim().to_string());
        }
    }
    Ok(map)
}

fn save_ledger(path: &Path, map: &HashMap<NodeName, String>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating ledger directory at {:?}", parent))?;
    }

    let file = File::create(path).with_context(|| format!("creating ledger at {:?}", path))?;
    let mut writer = BufWriter::new(file);

    let sorted: BTreeMap<_, _> = map.iter().collect();
    for (name, hash) in sorted {
        writeln!(writer, "{} {}", name, hash)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_str;
    use crate::pipeline::Pipeline;
    use serde_json::json;

    const CONFIG: &str = r#"
        [node.a]
        [[node.a.stage]]
        name = "s"
        cmd = "true"

        [node.b]
        after = ["a"]
        [[node.b.stage]]
        name = "s"
        cmd = "true"
    "#;

    fn node(name: &str) -> DagNode {
        DagNode::new(name, Pipeline::new(vec![], json!({})))
    }

    #[test]
    fn upstream_changes_invalidate_downstream_fingerprints() {
        let base = fingerprints(&parse_str(CONFIG).unwrap()).unwrap();
        let changed = fingerprints(&parse_str(&CONFIG.replacen("true", "false", 1)).unwrap())
            .unwrap();

        assert_ne!(base["a"], changed["a"]);
        assert_ne!(base["b"], changed["b"]);
    }

    #[test]
    fn recorded_nodes_are_computed_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let prints = fingerprints(&parse_str(CONFIG).unwrap()).unwrap();

        let ledger = FingerprintLedger::open(dir.path(), prints.clone(), false).unwrap();
        assert!(!ledger.already_computed(&node("a")));
        ledger.record_computed(&node("a")).unwrap();

        let reopened = FingerprintLedger::open(dir.path(), prints.clone(), false).unwrap();
        assert!(reopened.already_computed(&node("a")));
        assert!(!reopened.already_computed(&node("b")));

        let forced = FingerprintLedger::open(dir.path(), prints, true).unwrap();
        assert!(!forced.already_computed(&node("a")));
    }

    #[test]
    fn stale_fingerprints_do_not_count() {
        let dir = tempfile::tempdir().unwrap();
        let mut prints = fingerprints(&parse_str(CONFIG).unwrap()).unwrap();

        let ledger = FingerprintLedger::open(dir.path(), prints.clone(), false).unwrap();
        ledger.record_computed(&node("a")).unwrap();

        prints.insert("a".to_string(), "different".to_string());
        let reopened = FingerprintLedger::open(dir.path(), prints, false).unwrap();
        assert!(!reopened.already_computed(&node("a")));
    }
}
