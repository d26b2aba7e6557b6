use anyhow::{anyhow, Result};
use chrono::Utc;
use serde_json::{Map, Value};
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .map_err(|e| anyhow!("failed to create directory {}: {}", path.display(), e))
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

pub fn load_json_file(path: &Path) -> Result<Value> {
    let bytes =
        fs::read(path).map_err(|e| anyhow!("failed to read {}: {}", path.display(), e))?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub fn put_val(root: &mut Map<String, Value>, keys: &[String], val: Value) -> Result<()> {
    let (last, parents) = keys
        .split_last()
        .ok_or_else(|| anyhow!("put_val needs at least one key"))?;
    let mut node = root;
    for key in parents {
        let entry = node
            .entry(key.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        node = entry
            .as_object_mut()
            .ok_or_else(|| anyhow!("put_val: {} is not an object", key))?;
    }
    node.insert(last.clone(), val);
    Ok(())
}

pub fn put_val_into_json(path: &Path, keys: &[String], val: Value) -> Result<()> {
    let mut data = if path.exists() {
        match load_json_file(path)? {
            Value::Object(map) => map,
            other => {
                return Err(anyhow!(
                    "{} holds {} instead of a JSON object",
                    path.display(),
                    value_type_name(&other)
                ))
            }
        }
    } else {
        Map::new()
    };
    put_val(&mut data, keys, val)?;
    atomic_write_json_pretty(path, &Value::Object(data))
}

pub fn json_has_key(path: &Path, key: &str) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    Ok(load_json_file(path)?.get(key).is_some())
}

pub fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                let _ = out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

pub fn absolute_path(path: &Path) -> Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Ok(normalize_path(&joined))
}
