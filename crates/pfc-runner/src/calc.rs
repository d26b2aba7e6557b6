use crate::config::{
    load_document, parse_data_dir, parse_engine, parse_phase, parse_rotation, parse_shape,
    EngineConfig, PhaseParams, Precision, Rotation, Scope, Shape,
};
use crate::engine::Engine;
use crate::error::PfcError;
use crate::field::RealField2D;
use crate::growth::CheckpointDir;
use crate::guard::RunMode;
use crate::io::{json_has_key, put_val_into_json};
use crate::paths::{
    angle_path, phase_path, CALC_FILE, INTERFACES_DIR, LOG_FILE, SOLID_FILE, UNIT_LIQ_FILE,
    UNIT_SOL_FILE,
};
use crate::search::coexistence_mu;
use anyhow::Result;
use serde::Serialize;
use serde_json::{json, Value};
use std::f64::consts::PI;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const GAMMA_KEY: &str = "gamma";
pub const WIDTHS_KEY: &str = "widths";

#[derive(Debug, Clone, PartialEq)]
pub struct CalcConfig {
    pub shape: Shape,
    pub rotation: Rotation,
    pub phase: PhaseParams,
    pub precision: Precision,
    pub engine: EngineConfig,
    pub data_dir: PathBuf,
    pub lx_min: f64,
    pub lx_max: f64,
}

impl CalcConfig {
    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self::from_value(&load_document(path)?)?)
    }

    pub fn from_value(value: &Value) -> Result<Self, PfcError> {
        let top = Scope::from_value(value)?;
        let precision = top.precision()?;
        Ok(Self {
            shape: parse_shape(&top)?,
            rotation: parse_rotation(&top)?,
            phase: parse_phase(&top)?,
            precision,
            engine: parse_engine(&top)?,
            data_dir: parse_data_dir(&top)?,
            lx_min: top.float("lx_min", precision)?,
            lx_max: top.float("lx_max", precision)?,
        })
    }

    pub fn phase_dir(&self) -> PathBuf {
        phase_path(&self.data_dir, self.shape, &self.phase)
    }

    pub fn angle_dir(&self) -> PathBuf {
        angle_path(&self.data_dir, self.shape, &self.phase, self.rotation)
    }

    pub fn calc_file(&self) -> PathBuf {
        self.angle_dir().join(CALC_FILE)
    }
}

fn check_calc_key(path: &Path, key: &str, mode: RunMode) -> Result<()> {
    if !mode.dry && !mode.overwrite && json_has_key(path, key)? {
        return Err(PfcError::DataExists(format!(
            "{} already has key '{}'",
            path.display(),
            key
        ))
        .into());
    }
    Ok(())
}

fn interface_files(config: &CalcConfig) -> Result<Vec<PathBuf>> {
    let checkpoints = CheckpointDir::new(config.angle_dir().join(INTERFACES_DIR));
    let files: Vec<PathBuf> = checkpoints
        .scan()?
        .into_iter()
        .map(|i| checkpoints.file(i))
        .collect();
    info!(count = files.len(), dir = %checkpoints.path().display(), "found interfaces");
    Ok(files)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct InterfaceSample {
    pub lx: f64,
    pub ly: f64,
    pub volume: f64,
    pub free_energy_density: f64,
    pub grand_potential_density: f64,
}

// Excess grand potential per unit interface length. Each periodic sample
// holds two interfaces of length `ly`.
pub fn interfacial_energies(samples: &[InterfaceSample], omega_liquid: f64) -> Vec<f64> {
    samples
        .iter()
        .map(|s| (s.grand_potential_density * s.volume - omega_liquid * s.volume) / s.ly / 2.0)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GammaReport {
    pub mu: f64,
    pub omega_l: f64,
    pub omega_s: f64,
    pub samples: Vec<InterfaceSample>,
    pub gamma: Vec<f64>,
    pub saved: bool,
}

pub fn calc_gamma<E: Engine + ?Sized>(
    config: &CalcConfig,
    engine: &mut E,
    mode: RunMode,
) -> Result<GammaReport> {
    let calc_file = config.calc_file();
    check_calc_key(&calc_file, GAMMA_KEY, mode)?;
    let phase_dir = config.phase_dir();
    let mu = coexistence_mu(&phase_dir.join(LOG_FILE))?;
    engine.configure(&config.phase.model(config.precision)?)?;
    info!(theta = config.rotation.theta, mu, "computing interfacial energies");

    let mut samples = Vec::new();
    for path in interface_files(config)? {
        let field = match RealField2D::load(&path) {
            Ok(field) => field,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping unreadable interface");
                continue;
            }
        };
        if field.lx < config.lx_min || field.lx > config.lx_max {
            continue;
        }
        samples.push(InterfaceSample {
            lx: field.lx,
            ly: field.ly,
            volume: field.volume(),
            free_energy_density: engine.free_energy_density(&field)?,
            grand_potential_density: engine.grand_potential_density(&field, mu)?,
        });
    }
    if let (Some(first), Some(last)) = (samples.first(), samples.last()) {
        info!(lx_from = first.lx, lx_to = last.lx, count = samples.len(), "using interfaces");
    } else {
        warn!(
            lx_min = config.lx_min,
            lx_max = config.lx_max,
            "no interface within the length window"
        );
    }

    let liquid = RealField2D::load(&phase_dir.join(UNIT_LIQ_FILE))?;
    let omega_l = engine.grand_potential_density(&liquid, mu)?;
    let solid = RealField2D::load(&phase_dir.join(UNIT_SOL_FILE))?;
    let omega_s = engine.grand_potential_density(&solid, mu)?;
    info!(omega_l, omega_s, "reference grand potentials");

    let gamma = interfacial_energies(&samples, omega_l);
    info!(?gamma, "interfacial energies");
    if mode.plot {
        let free_energy: Vec<(f64, f64)> =
            samples.iter().map(|s| (s.lx, s.free_energy_density)).collect();
        let bulk_gap: Vec<(f64, f64)> = samples
            .iter()
            .map(|s| (s.lx, (omega_l - omega_s) * s.volume / s.ly / 2.0))
            .collect();
        info!(?free_energy, ?bulk_gap, "gamma diagnostics by length");
    }

    if !mode.dry {
        put_val_into_json(&calc_file, &[GAMMA_KEY.to_string()], json!(gamma))?;
        info!(file = %calc_file.display(), "saved interfacial energies");
    }
    Ok(GammaReport {
        mu,
        omega_l,
        omega_s,
        samples,
        gamma,
        saved: !mode.dry,
    })
}

pub fn unit_cell_factor(solid: &RealField2D) -> f64 {
    let fx = solid.lx / (4.0 * PI);
    let fy = solid.ly / (4.0 * PI / 3f64.sqrt());
    (fx + fy) / 2.0
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WidthReport {
    pub uc_factor: f64,
    pub widths: Vec<[f64; 3]>,
    pub saved: bool,
}

pub fn calc_width<E: Engine + ?Sized>(
    config: &CalcConfig,
    engine: &mut E,
    mode: RunMode,
) -> Result<WidthReport> {
    let calc_file = config.calc_file();
    check_calc_key(&calc_file, WIDTHS_KEY, mode)?;
    engine.configure(&config.phase.model(config.precision)?)?;

    let solid = RealField2D::load(&config.angle_dir().join(SOLID_FILE))?;
    let uc_factor = unit_cell_factor(&solid);
    info!(uc_factor, theta = config.rotation.theta, "computing interface widths");

    let mut widths = Vec::new();
    for path in interface_files(config)? {
        let field = RealField2D::load(&path)?;
        let w = engine.interface_widths(&field, config.rotation.theta, uc_factor)?;
        info!(lx = field.lx, widths = ?w, "fitted widths");
        widths.push(w);
    }

    if !mode.dry {
        put_val_into_json(&calc_file, &[WIDTHS_KEY.to_string()], json!(widths))?;
        info!(file = %calc_file.display(), "saved interface widths");
    }
    Ok(WidthReport {
        uc_factor,
        widths,
        saved: !mode.dry,
    })
}
