use crate::config::{
    load_document, parse_data_dir, parse_engine, parse_phase, parse_rotation, parse_shape,
    parse_simulation, parse_wisdoms, EngineConfig, PhaseParams, Precision, Rotation, Scope, Shape,
    SimulationParams, Wisdoms,
};
use crate::engine::{import_wisdoms, Dynamics, DynamicsKind, Engine};
use crate::error::PfcError;
use crate::field::RealField2D;
use crate::guard::{RunGuard, RunMode};
use crate::io::ensure_dir;
use crate::paths::{
    angle_path, checkpoint_name, parse_checkpoint_name, INTERFACES_DIR, INTERFACE_FILE,
    LIQUID_FILE, SOLID_FILE,
};
use crate::relax::{relax, RelaxSettings};
use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceRunConfig {
    pub shape: Shape,
    pub rotation: Rotation,
    pub phase: PhaseParams,
    pub precision: Precision,
    pub sim: SimulationParams,
    pub wisdoms: Wisdoms,
    pub engine: EngineConfig,
    pub data_dir: PathBuf,
    pub mx_delta: usize,
    pub my: usize,
    pub inertia: Option<f64>,
    pub k_regularizer: Option<f64>,
}

impl InterfaceRunConfig {
    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self::from_value(&load_document(path)?)?)
    }

    pub fn from_value(value: &Value) -> Result<Self, PfcError> {
        let top = Scope::from_value(value)?;
        let precision = top.precision()?;
        let mx_delta = top.usize("mx_delta")?;
        let my = top.usize("my")?;
        if mx_delta == 0 || my == 0 {
            return Err(PfcError::invalid("mx_delta/my", "must be positive"));
        }
        Ok(Self {
            shape: parse_shape(&top)?,
            rotation: parse_rotation(&top)?,
            phase: parse_phase(&top)?,
            precision,
            sim: parse_simulation(&top, precision)?,
            wisdoms: parse_wisdoms(&top)?,
            engine: parse_engine(&top)?,
            data_dir: parse_data_dir(&top)?,
            mx_delta,
            my,
            inertia: top.opt_float("inertia", precision)?,
            k_regularizer: top.opt_float("k_regularizer", precision)?,
        })
    }

    pub fn run_dir(&self) -> PathBuf {
        angle_path(&self.data_dir, self.shape, &self.phase, self.rotation)
    }

    pub fn growth_settings(&self) -> GrowthSettings {
        GrowthSettings {
            dynamics: Dynamics::new(
                DynamicsKind::Conserved {
                    inertia: self.inertia,
                    k_regularizer: self.k_regularizer,
                },
                &self.sim,
            ),
            relax: RelaxSettings::from_params(&self.sim),
            mx_delta: self.mx_delta,
            my: self.my,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointDir {
    dir: PathBuf,
}

impl CheckpointDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn file(&self, index: usize) -> PathBuf {
        self.dir.join(checkpoint_name(index))
    }

    // Present checkpoint indices in order. They must be exactly `0..k`;
    // anything else is reported as corrupt. A missing directory is empty.
    pub fn scan(&self) -> Result<Vec<usize>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut indices = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .map_err(|e| anyhow!("failed to read {}: {}", self.dir.display(), e))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(index) = parse_checkpoint_name(&entry.file_name().to_string_lossy()) {
                indices.push(index);
            }
        }
        indices.sort_unstable();
        for (expected, found) in indices.iter().enumerate() {
            if *found != expected {
                return Err(PfcError::CorruptCheckpoints {
                    dir: self.dir.clone(),
                    message: format!("expected index {}, found {}", expected, found),
                }
                .into());
            }
        }
        Ok(indices)
    }

    pub fn load(&self, index: usize) -> Result<RealField2D> {
        RealField2D::load(&self.file(index))
    }

    pub fn save(&self, index: usize, field: &RealField2D) -> Result<()> {
        field.save(&self.file(index))
    }

    pub fn wipe(&self) -> Result<()> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)
                .map_err(|e| anyhow!("failed to remove {}: {}", self.dir.display(), e))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GrowthSettings {
    pub dynamics: Dynamics,
    pub relax: RelaxSettings,
    pub mx_delta: usize,
    pub my: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GrowthStep {
    pub index: usize,
    pub lx: f64,
    pub relax_steps: usize,
    pub last_value: Option<f64>,
}

pub struct GrowthPipeline<'e, E: Engine + ?Sized> {
    engine: &'e mut E,
    settings: GrowthSettings,
    checkpoints: CheckpointDir,
    delta_solid: RealField2D,
    delta_liquid: RealField2D,
    field: RealField2D,
    next_index: usize,
    dry: bool,
}

impl<'e, E: Engine + ?Sized> GrowthPipeline<'e, E> {
    pub fn resume(
        engine: &'e mut E,
        run_dir: &Path,
        settings: GrowthSettings,
        dry: bool,
    ) -> Result<Self> {
        let checkpoints = CheckpointDir::new(run_dir.join(INTERFACES_DIR));
        let delta_solid =
            RealField2D::load(&run_dir.join(SOLID_FILE))?.extend(settings.mx_delta, settings.my)?;
        let delta_liquid =
            RealField2D::load(&run_dir.join(LIQUID_FILE))?.extend(settings.mx_delta, settings.my)?;

        let indices = checkpoints.scan()?;
        let (field, next_index) = match indices.last() {
            Some(&last) => {
                let relaxed = checkpoints.load(last)?;
                info!(index = last, "resuming from checkpoint");
                (relaxed.elongate(&delta_solid, &delta_liquid)?, last + 1)
            }
            None => {
                if !dry {
                    ensure_dir(checkpoints.path())?;
                }
                info!("starting from the initial interface");
                (RealField2D::load(&run_dir.join(INTERFACE_FILE))?, 0)
            }
        };
        if field.ny != delta_solid.ny || field.ny != delta_liquid.ny {
            return Err(anyhow!(
                "slab height does not match the interface: ny {} vs solid {} / liquid {}",
                field.ny,
                delta_solid.ny,
                delta_liquid.ny
            ));
        }

        Ok(Self {
            engine,
            settings,
            checkpoints,
            delta_solid,
            delta_liquid,
            field,
            next_index,
            dry,
        })
    }

    pub fn step(&mut self) -> Result<GrowthStep> {
        let index = self.next_index;
        let report = relax(
            &mut *self.engine,
            &mut self.field,
            &self.settings.dynamics,
            &self.settings.relax,
        )?;
        if !self.dry {
            self.checkpoints.save(index, &self.field)?;
        }
        let step = GrowthStep {
            index,
            lx: self.field.lx,
            relax_steps: report.steps,
            last_value: report.last_value(),
        };
        info!(
            index,
            lx = step.lx,
            nx = self.field.nx,
            steps = report.steps,
            "checkpointed interface"
        );
        self.field = self.field.elongate(&self.delta_solid, &self.delta_liquid)?;
        self.next_index += 1;
        Ok(step)
    }

    // Iterate until `keep_going` is cleared. The flag is read at the top of
    // each iteration, so a running iteration always finishes its checkpoint.
    pub fn run(&mut self, keep_going: &AtomicBool) -> Result<Vec<GrowthStep>> {
        let mut steps = Vec::new();
        while keep_going.load(Ordering::SeqCst) {
            steps.push(self.step()?);
        }
        warn!(next_index = self.next_index, "growth interrupted");
        Ok(steps)
    }

    pub fn field(&self) -> &RealField2D {
        &self.field
    }

    pub fn next_index(&self) -> usize {
        self.next_index
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GrowthReport {
    pub dir: PathBuf,
    pub first_index: usize,
    pub next_index: usize,
    pub steps: Vec<GrowthStep>,
}

pub fn run_interface<E: Engine + ?Sized>(
    config: &InterfaceRunConfig,
    engine: &mut E,
    mode: RunMode,
    keep_going: &AtomicBool,
) -> Result<GrowthReport> {
    let dir = config.run_dir();
    let _guard = RunGuard::acquire(&dir, mode)?;
    import_wisdoms(engine, &config.wisdoms)?;
    engine.configure(&config.phase.model(config.precision)?)?;

    if mode.overwrite && !mode.dry {
        let checkpoints = CheckpointDir::new(dir.join(INTERFACES_DIR));
        warn!(dir = %checkpoints.path().display(), "overwrite: removing existing checkpoints");
        checkpoints.wipe()?;
    }

    let mut pipeline = GrowthPipeline::resume(engine, &dir, config.growth_settings(), mode.dry)?;
    let first_index = pipeline.next_index();
    let steps = pipeline.run(keep_going)?;
    if mode.plot {
        let series: Vec<(f64, Option<f64>)> = steps.iter().map(|s| (s.lx, s.last_value)).collect();
        info!(?series, target = %config.sim.target, "relaxed value per length");
    }
    Ok(GrowthReport {
        dir,
        first_index,
        next_index: pipeline.next_index(),
        steps,
    })
}
