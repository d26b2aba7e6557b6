pub mod calc;
pub mod collect;
pub mod config;
pub mod engine;
pub mod error;
pub mod field;
pub mod growth;
pub mod guard;
pub mod interface;
pub mod io;
pub mod paths;
pub mod relax;
pub mod search;
pub mod status;
pub mod unit_cell;

pub use calc::{calc_gamma, calc_width, CalcConfig, GammaReport, WidthReport};
pub use collect::collect;
pub use engine::{Dynamics, DynamicsKind, Engine, ModelParams, Observables, ProcessEngine};
pub use error::{is_already_running, PfcError};
pub use field::RealField2D;
pub use growth::{run_interface, CheckpointDir, GrowthPipeline, GrowthReport, InterfaceRunConfig};
pub use guard::{RunGuard, RunMode};
pub use interface::{run_gen_interface, InterfaceGenConfig, InterfaceGenReport};
pub use search::{find_coexistence, SearchFailure, SearchOutcome, SearchRecord};
pub use status::running_markers;
pub use unit_cell::{run_unit_cell, UnitCellConfig, UnitCellReport};

use anyhow::Result;
use std::path::Path;
use std::sync::atomic::AtomicBool;

// Command entry points: resolve the whole config first, then start the
// engine it names. Nothing touches the data tree before resolution succeeds.

pub fn unit_cell_from_config(config_path: &Path, mode: RunMode) -> Result<UnitCellReport> {
    let config = UnitCellConfig::load(config_path)?;
    let mut engine = ProcessEngine::new(&config.engine)?;
    run_unit_cell(&config, &mut engine, mode)
}

pub fn gen_interface_from_config(config_path: &Path, mode: RunMode) -> Result<InterfaceGenReport> {
    let config = InterfaceGenConfig::load(config_path)?;
    let mut engine = ProcessEngine::new(&config.engine)?;
    run_gen_interface(&config, &mut engine, mode)
}

pub fn run_interface_from_config(
    config_path: &Path,
    mode: RunMode,
    keep_going: &AtomicBool,
) -> Result<GrowthReport> {
    let config = InterfaceRunConfig::load(config_path)?;
    let mut engine = ProcessEngine::new(&config.engine)?;
    run_interface(&config, &mut engine, mode, keep_going)
}

pub fn calc_gamma_from_config(config_path: &Path, mode: RunMode) -> Result<GammaReport> {
    let config = CalcConfig::load(config_path)?;
    let mut engine = ProcessEngine::new(&config.engine)?;
    calc_gamma(&config, &mut engine, mode)
}

pub fn calc_width_from_config(config_path: &Path, mode: RunMode) -> Result<WidthReport> {
    let config = CalcConfig::load(config_path)?;
    let mut engine = ProcessEngine::new(&config.engine)?;
    calc_width(&config, &mut engine, mode)
}
