use crate::error::PfcError;
use crate::io::{absolute_path, load_json_file, value_type_name};
use crate::paths::CALC_FILE;
use anyhow::{anyhow, Result};
use serde_json::{Map, Value};
use std::path::{Component, Path};
use tracing::debug;
use walkdir::WalkDir;

pub fn segment_key(segment: &str) -> &str {
    segment.rsplit('_').next().unwrap_or(segment)
}

// `root` must lie inside `data_dir` (compared lexically). Objects found at
// the same key path are merged key by key; when two files set the same key
// the one visited later wins.
pub fn collect(data_dir: &Path, root: &Path) -> Result<Value> {
    let data_abs = absolute_path(data_dir)?;
    let root_abs = absolute_path(root)?;
    if !root_abs.starts_with(&data_abs) {
        return Err(PfcError::InvalidRoot {
            root: root.to_path_buf(),
            data_dir: data_dir.to_path_buf(),
        }
        .into());
    }

    let mut merged = Map::new();
    for entry in WalkDir::new(&root_abs).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() || entry.file_name() != CALC_FILE {
            continue;
        }
        let path = entry.path();
        let rel = path
            .parent()
            .and_then(|p| p.strip_prefix(&root_abs).ok())
            .ok_or_else(|| anyhow!("{} is outside {}", path.display(), root_abs.display()))?;
        let keys: Vec<String> = rel
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(segment_key(&s.to_string_lossy()).to_string()),
                _ => None,
            })
            .collect();
        let payload = load_json_file(path)?;
        debug!(file = %path.display(), keys = ?keys, "collecting");
        merge_at(&mut merged, &keys, payload)?;
    }
    Ok(Value::Object(merged))
}

fn merge_at(root: &mut Map<String, Value>, keys: &[String], payload: Value) -> Result<()> {
    let (parents, last) = match keys.split_last() {
        Some((last, parents)) => (parents, Some(last)),
        None => (keys, None),
    };
    let mut node = root;
    for key in parents {
        node = object_at(node, key)?;
    }
    match (last, payload) {
        (Some(key), Value::Object(fields)) => object_at(node, key)?.extend(fields),
        (None, Value::Object(fields)) => node.extend(fields),
        // A bare value is stored as the leaf at its directory's key.
        (Some(key), leaf) => {
            node.insert(key.clone(), leaf);
        }
        (None, other) => {
            return Err(anyhow!(
                "{} at the collect root must hold a JSON object, found {}",
                CALC_FILE,
                value_type_name(&other)
            ))
        }
    }
    Ok(())
}

fn object_at<'m>(node: &'m mut Map<String, Value>, key: &str) -> Result<&'m mut Map<String, Value>> {
    let entry = node
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    entry
        .as_object_mut()
        .ok_or_else(|| anyhow!("collect: {} is not an object", key))
}
