use crate::paths::RUNNING_FILE;
use anyhow::Result;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub fn running_markers(data_dir: &Path) -> Result<Vec<PathBuf>> {
    if !data_dir.exists() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    for entry in WalkDir::new(data_dir).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_file() && entry.file_name() == RUNNING_FILE {
            if let Some(parent) = entry.path().parent() {
                dirs.push(parent.to_path_buf());
            }
        }
    }
    Ok(dirs)
}
