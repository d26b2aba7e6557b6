use crate::config::{
    load_document, parse_data_dir, parse_engine, parse_phase, parse_shape, parse_simulation,
    parse_wisdoms, EngineConfig, PhaseParams, Precision, Scope, Shape, SimulationParams, Wisdoms,
};
use crate::engine::{import_wisdoms, Dynamics, DynamicsKind, Engine};
use crate::error::PfcError;
use crate::field::RealField2D;
use crate::guard::{RunGuard, RunMode};
use crate::paths::{phase_path, LOG_FILE, UNIT_LIQ_FILE, UNIT_SOL_FILE};
use crate::relax::{relax, RelaxSettings};
use crate::search::{find_coexistence, save_log, SearchMethod, SearchSettings, SearchStep};
use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::info;

pub const DEFAULT_MAX_TRIALS: usize = 3;

const RUN_FALLBACK_KEYS: &[&str] = &["eps", "alpha", "beta"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSource {
    Builtin(String),
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnitCellRunConfig {
    pub phase: PhaseParams,
    pub precision: Precision,
    pub sim: SimulationParams,
    pub mu_precision: f64,
    pub expand_range: f64,
    pub search_method: SearchMethod,
    pub liquid_tol: f64,
    pub max_trials: usize,
}

impl UnitCellRunConfig {
    fn parse(scope: &Scope) -> Result<Self, PfcError> {
        let precision = scope.precision()?;
        let max_trials = if scope.has("max_trials") {
            scope.usize("max_trials")?
        } else {
            DEFAULT_MAX_TRIALS
        };
        if max_trials == 0 {
            return Err(PfcError::invalid(
                scope.qualify("max_trials"),
                "must be at least 1",
            ));
        }
        Ok(Self {
            phase: parse_phase(scope)?,
            precision,
            sim: parse_simulation(scope, precision)?,
            mu_precision: scope.float("mu_precision", precision)?,
            expand_range: scope.float("expand_range", precision)?,
            search_method: SearchMethod::parse(&scope.string("search_method")?),
            liquid_tol: scope.float("liquid_tol", precision)?,
            max_trials,
        })
    }

    pub fn search_step(&self) -> Result<SearchStep, PfcError> {
        Ok(SearchStep {
            settings: SearchSettings {
                method: self.search_method,
                precision: self.mu_precision,
                liquid_tol: self.liquid_tol,
                sim: self.sim.clone(),
            },
            model: self.phase.model(self.precision)?,
            precision: self.precision,
            expand_range: self.expand_range,
            max_trials: self.max_trials,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnitCellConfig {
    pub shape: Shape,
    pub phase: PhaseParams,
    pub wisdoms: Wisdoms,
    pub engine: EngineConfig,
    pub data_dir: PathBuf,
    pub source: FieldSource,
    pub mu_min: String,
    pub mu_max: String,
    pub runs: Vec<UnitCellRunConfig>,
}

impl UnitCellConfig {
    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self::from_value(&load_document(path)?)?)
    }

    pub fn from_value(value: &Value) -> Result<Self, PfcError> {
        let top = Scope::from_value(value)?;

        let source_scope = top.section("source", &[])?;
        let name = source_scope.string("name")?;
        let source = match source_scope.string("type")?.as_str() {
            "static" => FieldSource::Builtin(name),
            "file" => FieldSource::File(PathBuf::from(name)),
            other => {
                return Err(PfcError::invalid(
                    source_scope.qualify("type"),
                    format!("expected 'static' or 'file', got '{}'", other),
                ))
            }
        };

        let mut runs = Vec::new();
        for (i, raw) in top.list("runs")?.iter().enumerate() {
            let child = raw
                .as_object()
                .ok_or_else(|| PfcError::invalid(format!("runs[{}]", i), "expected a mapping"))?;
            let scope = top.fallback(child, RUN_FALLBACK_KEYS, format!("runs[{}]", i));
            runs.push(UnitCellRunConfig::parse(&scope)?);
        }
        if runs.is_empty() {
            return Err(PfcError::invalid("runs", "at least one run is required"));
        }

        Ok(Self {
            shape: parse_shape(&top)?,
            phase: parse_phase(&top)?,
            wisdoms: parse_wisdoms(&top)?,
            engine: parse_engine(&top)?,
            data_dir: parse_data_dir(&top)?,
            source,
            mu_min: top.string("mu_min")?,
            mu_max: top.string("mu_max")?,
            runs,
        })
    }

    pub fn save_dir(&self) -> PathBuf {
        phase_path(&self.data_dir, self.shape, &self.phase)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitCellReport {
    pub dir: PathBuf,
    pub mu: f64,
    pub attempts: usize,
    pub saved: bool,
}

pub fn run_unit_cell<E: Engine + ?Sized>(
    config: &UnitCellConfig,
    engine: &mut E,
    mode: RunMode,
) -> Result<UnitCellReport> {
    let dir = config.save_dir();
    let _guard = RunGuard::acquire_fresh(&dir, mode)?;
    info!(dir = %dir.display(), runs = config.runs.len(), "unit cell search");

    let steps = config
        .runs
        .iter()
        .map(UnitCellRunConfig::search_step)
        .collect::<Result<Vec<_>, _>>()?;
    let first = &config.runs[0];
    let mu_min = first.precision.to_float(&config.mu_min)?;
    let mu_max = first.precision.to_float(&config.mu_max)?;

    import_wisdoms(engine, &config.wisdoms)?;
    engine.configure(&steps[0].model)?;
    let source = match &config.source {
        FieldSource::Builtin(name) => engine.builtin_unit_cell(name)?,
        FieldSource::File(path) => RealField2D::load(path)?,
    };
    let (nx, ny) = (config.shape.nx, config.shape.ny);
    let field = if source.shape() != (nx, ny) {
        info!(from = ?source.shape(), to = ?(nx, ny), "resampling source field");
        engine.resample(&source, nx, ny)?
    } else {
        source
    };

    let outcome = find_coexistence(engine, field, mu_min, mu_max, &steps)?;

    let last = &config.runs[config.runs.len() - 1];
    let mut liquid = outcome.field.uniform_like();
    let dynamics = Dynamics::new(DynamicsKind::ConstantMu { mu: outcome.mu }, &last.sim);
    let report = relax(engine, &mut liquid, &dynamics, &RelaxSettings::from_params(&last.sim))?;
    info!(mu = outcome.mu, steps = report.steps, "relaxed liquid at coexistence");
    if mode.plot {
        for record in &outcome.records {
            let series: Vec<(f64, Option<f64>)> =
                record.trials.iter().map(|t| (t.mu, t.gap)).collect();
            info!(?series, "search trials (mu, gap)");
        }
    }

    if !mode.dry {
        outcome.field.save(&dir.join(UNIT_SOL_FILE))?;
        liquid.save(&dir.join(UNIT_LIQ_FILE))?;
        save_log(&dir.join(LOG_FILE), &outcome.records)?;
        info!(dir = %dir.display(), "saved unit cell fields and search log");
    }

    Ok(UnitCellReport {
        dir,
        mu: outcome.mu,
        attempts: outcome.records.len(),
        saved: !mode.dry,
    })
}
