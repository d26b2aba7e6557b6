use crate::error::PfcError;
use crate::io::ensure_dir;
use crate::paths::RUNNING_FILE;
use anyhow::{anyhow, Result};
use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunMode {
    pub dry: bool,
    pub overwrite: bool,
    pub plot: bool,
}

// The marker is advisory: it only excludes other processes that also go
// through `RunGuard`. A process that dies without unwinding leaves it
// behind, and it must then be removed by hand.
#[derive(Debug)]
pub struct RunGuard {
    marker: Option<PathBuf>,
}

impl RunGuard {
    pub fn acquire(dir: &Path, mode: RunMode) -> Result<Self> {
        let marker = dir.join(RUNNING_FILE);
        if marker.exists() {
            return Err(already_running(dir));
        }
        if mode.dry {
            return Ok(Self { marker: None });
        }
        ensure_dir(dir)?;
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&marker)
        {
            Ok(mut file) => {
                let payload = format!(
                    "{{\"pid\":{},\"acquired_at\":\"{}\"}}\n",
                    std::process::id(),
                    Utc::now().to_rfc3339()
                );
                let _ = file.write_all(payload.as_bytes());
                let _ = file.sync_all();
                debug!(dir = %dir.display(), "acquired run marker");
                Ok(Self {
                    marker: Some(marker),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(already_running(dir)),
            Err(e) => Err(anyhow!(
                "failed to create run marker {}: {}",
                marker.display(),
                e
            )),
        }
    }

    pub fn acquire_fresh(dir: &Path, mode: RunMode) -> Result<Self> {
        if dir.join(RUNNING_FILE).exists() {
            return Err(already_running(dir));
        }
        if !mode.dry && !mode.overwrite {
            check_dir_empty(dir)?;
        }
        Self::acquire(dir, mode)
    }

    pub fn marker(&self) -> Option<&Path> {
        self.marker.as_deref()
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Some(marker) = &self.marker {
            let _ = fs::remove_file(marker);
        }
    }
}

fn already_running(dir: &Path) -> anyhow::Error {
    PfcError::AlreadyRunning {
        dir: dir.to_path_buf(),
    }
    .into()
}

pub fn check_dir_empty(dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let mut entries = fs::read_dir(dir)
        .map_err(|e| anyhow!("failed to read directory {}: {}", dir.display(), e))?;
    if entries.next().is_some() {
        return Err(PfcError::DataExists(format!(
            "{} is not empty (use --overwrite to run anyway)",
            dir.display()
        ))
        .into());
    }
    Ok(())
}
