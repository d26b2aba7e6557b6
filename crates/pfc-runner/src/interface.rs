use crate::config::{
    load_document, parse_data_dir, parse_engine, parse_phase, parse_rotation, parse_shape,
    parse_simulation, parse_wisdoms, EngineConfig, PhaseParams, Precision, Rotation, Scope, Shape,
    SimulationParams, Wisdoms,
};
use crate::engine::{import_wisdoms, Dynamics, DynamicsKind, Engine};
use crate::error::PfcError;
use crate::field::RealField2D;
use crate::guard::{RunGuard, RunMode};
use crate::paths::{
    angle_path, phase_path, INTERFACE_FILE, LIQUID_FILE, LOG_FILE, LONG_LIQUID_FILE,
    LONG_SOLID_FILE, SOLID_FILE, UNIT_LIQ_FILE, UNIT_SOL_FILE,
};
use crate::relax::{relax, RelaxSettings};
use crate::search::coexistence_mu;
use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::info;

const STAGE_FALLBACK_KEYS: &[&str] = &["precision", "dt"];

#[derive(Debug, Clone, PartialEq)]
pub enum Widths {
    Single(f64),
    Candidates(Vec<f64>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BaseFieldConfig {
    pub precision: Precision,
    pub sim: SimulationParams,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LongFieldConfig {
    pub precision: Precision,
    pub sim: SimulationParams,
    pub mx: usize,
    pub my: usize,
    pub width: Widths,
    pub inertia: Option<f64>,
    pub k_regularizer: Option<f64>,
}

impl LongFieldConfig {
    pub fn conserved(&self) -> Dynamics {
        Dynamics::new(
            DynamicsKind::Conserved {
                inertia: self.inertia,
                k_regularizer: self.k_regularizer,
            },
            &self.sim,
        )
    }
}

fn parse_base(scope: &Scope) -> Result<BaseFieldConfig, PfcError> {
    let precision = scope.precision()?;
    Ok(BaseFieldConfig {
        precision,
        sim: parse_simulation(scope, precision)?,
    })
}

fn parse_long(scope: &Scope) -> Result<LongFieldConfig, PfcError> {
    let precision = scope.precision()?;
    let width = match scope.value("width")? {
        Value::Array(_) => {
            let list = scope.list("width")?;
            if list.is_empty() {
                return Err(PfcError::invalid(
                    scope.qualify("width"),
                    "supply at least one width",
                ));
            }
            let widths = list
                .iter()
                .map(|v| match v {
                    Value::Number(n) => n.as_f64().map(|w| precision.round(w)),
                    Value::String(s) => precision.to_float(s).ok(),
                    _ => None,
                })
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| PfcError::invalid(scope.qualify("width"), "expected numbers"))?;
            Widths::Candidates(widths)
        }
        _ => Widths::Single(scope.float("width", precision)?),
    };
    Ok(LongFieldConfig {
        precision,
        sim: parse_simulation(scope, precision)?,
        mx: scope.usize("mx")?,
        my: scope.usize("my")?,
        width,
        inertia: scope.opt_float("inertia", precision)?,
        k_regularizer: scope.opt_float("k_regularizer", precision)?,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceGenConfig {
    pub shape: Shape,
    pub rotation: Rotation,
    pub phase: PhaseParams,
    pub precision: Precision,
    pub dt: f64,
    pub wisdoms: Wisdoms,
    pub engine: EngineConfig,
    pub data_dir: PathBuf,
    pub base: BaseFieldConfig,
    pub long: LongFieldConfig,
}

impl InterfaceGenConfig {
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
            dt: top.float("dt", precision)?,
            wisdoms: parse_wisdoms(&top)?,
            engine: parse_engine(&top)?,
            data_dir: parse_data_dir(&top)?,
            base: parse_base(&top.section("base", STAGE_FALLBACK_KEYS)?)?,
            long: parse_long(&top.section("long", STAGE_FALLBACK_KEYS)?)?,
        })
    }

    pub fn phase_dir(&self) -> PathBuf {
        phase_path(&self.data_dir, self.shape, &self.phase)
    }

    pub fn save_dir(&self) -> PathBuf {
        angle_path(&self.data_dir, self.shape, &self.phase, self.rotation)
    }
}

pub fn pick_width<E: Engine + ?Sized>(
    engine: &mut E,
    solid: &RealField2D,
    liquid: &RealField2D,
    candidates: &[f64],
) -> Result<f64> {
    let mut best: Option<(f64, f64)> = None;
    for &width in candidates {
        let blended = engine.blend(solid, liquid, width)?;
        let energy = engine.free_energy_density(&blended)? * blended.volume();
        info!(width, energy, "candidate interface width");
        if best.map_or(true, |(_, e)| energy < e) {
            best = Some((width, energy));
        }
    }
    best.map(|(w, _)| w)
        .ok_or_else(|| PfcError::invalid("long.width", "supply at least one width").into())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InterfaceGenReport {
    pub dir: PathBuf,
    pub mu: f64,
    pub width: f64,
    pub shape: (usize, usize),
    pub saved: bool,
}

pub fn run_gen_interface<E: Engine + ?Sized>(
    config: &InterfaceGenConfig,
    engine: &mut E,
    mode: RunMode,
) -> Result<InterfaceGenReport> {
    let phase_dir = config.phase_dir();
    let dir = config.save_dir();
    let mu = coexistence_mu(&phase_dir.join(LOG_FILE))?;
    let _guard = RunGuard::acquire_fresh(&dir, mode)?;
    info!(
        from = %phase_dir.display(),
        to = %dir.display(),
        mu,
        theta = config.rotation.theta,
        "generating interface"
    );

    import_wisdoms(engine, &config.wisdoms)?;
    engine.configure(&config.phase.model(config.precision)?)?;

    let sol0 = RealField2D::load(&phase_dir.join(UNIT_SOL_FILE))?.with_precision(config.precision);
    let liq0 = RealField2D::load(&phase_dir.join(UNIT_LIQ_FILE))?.with_precision(config.precision);
    let (na, nb) = (config.rotation.na, config.rotation.nb);
    let mut solid = engine.rotate(&sol0, na, nb)?;
    let mut liquid = engine.rotate(&liq0, na, nb)?;
    info!(solid = ?solid.shape(), liquid = ?liquid.shape(), "rotated unit cells");

    let base = &config.base;
    let base_relax = RelaxSettings::from_params(&base.sim);
    let constant_mu = Dynamics::new(DynamicsKind::ConstantMu { mu }, &base.sim);
    relax(engine, &mut solid, &constant_mu, &base_relax)?;
    relax(engine, &mut liquid, &constant_mu, &base_relax)?;
    let omega_s = engine.grand_potential_density(&solid, mu)?;
    let omega_l = engine.grand_potential_density(&liquid, mu)?;
    info!(omega_s, omega_l, "relaxed rotated unit cells");

    let long = &config.long;
    let mut long_solid = solid.extend(long.mx, long.my)?;
    let mut long_liquid = liquid.extend(long.mx, long.my)?;
    let long_relax = RelaxSettings::from_params(&long.sim);
    let conserved = long.conserved();
    relax(engine, &mut long_solid, &conserved, &long_relax)?;
    relax(engine, &mut long_liquid, &conserved, &long_relax)?;
    info!(shape = ?long_solid.shape(), "relaxed elongated bulk fields");

    let width = match &long.width {
        Widths::Single(w) => *w,
        Widths::Candidates(candidates) => {
            pick_width(engine, &long_solid, &long_liquid, candidates)?
        }
    };
    let mut interface = engine.blend(&long_solid, &long_liquid, width)?;
    let report = relax(engine, &mut interface, &conserved, &long_relax)?;
    let omega = engine.grand_potential_density(&interface, mu)?;
    info!(width, mean = interface.mean(), omega, "relaxed interface");
    if mode.plot {
        info!(series = ?report.series, target = %long.sim.target, "interface relaxation");
    }

    if !mode.dry {
        solid.save(&dir.join(SOLID_FILE))?;
        liquid.save(&dir.join(LIQUID_FILE))?;
        long_solid.save(&dir.join(LONG_SOLID_FILE))?;
        long_liquid.save(&dir.join(LONG_LIQUID_FILE))?;
        interface.save(&dir.join(INTERFACE_FILE))?;
        info!(dir = %dir.display(), "saved interface fields");
    }

    Ok(InterfaceGenReport {
        dir,
        mu,
        width,
        shape: interface.shape(),
        saved: !mode.dry,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Observables;
    use serde_json::json;

    fn stage(extra: Value) -> Value {
        let mut base = json!({
            "target": "F", "tol": 1e-8, "patience": 5, "n_steps": 100,
            "refresh_interval": 10, "fps": 12, "fft_threads": 2, "wisdom_only": false
        });
        if let (Some(b), Some(e)) = (base.as_object_mut(), extra.as_object()) {
            b.extend(e.clone());
        }
        base
    }

    fn document() -> Value {
        json!({
            "nx": 16, "ny": 16, "na": 1, "nb": 1,
            "eps": 0.1, "alpha": 0, "beta": 1,
            "precision": "double", "dt": 0.1,
            "engine": {"command": ["engine"]},
            "base": stage(json!({})),
            "long": stage(json!({"precision": "single", "mx": 8, "my": 1, "width": [5, "10"], "inertia": 100}))
        })
    }

    #[test]
    fn stages_inherit_precision_and_dt() {
        let config = InterfaceGenConfig::from_value(&document()).expect("config");
        assert_eq!(config.base.precision, Precision::Double);
        assert_eq!(config.base.sim.dt, 0.1);
        assert_eq!(config.long.precision, Precision::Single);
        assert_eq!(config.long.sim.dt, 0.1f32 as f64);
        assert_eq!(config.long.width, Widths::Candidates(vec![5.0, 10.0]));
        assert_eq!(config.long.inertia, Some(100.0));
        assert_eq!(config.long.k_regularizer, None);
        assert_eq!(
            config.save_dir(),
            PathBuf::from("data/16x16/eps_0.1/alpha_0/beta_1/theta_0.5236")
        );
    }

    #[test]
    fn stages_do_not_inherit_other_keys() {
        let mut doc = document();
        doc["fps"] = json!(30);
        doc["base"].as_object_mut().expect("base").remove("fps");
        match InterfaceGenConfig::from_value(&doc) {
            Err(PfcError::MissingKey { key }) => assert_eq!(key, "base.fps"),
            other => panic!("expected MissingKey, got {:?}", other),
        }
    }

    #[test]
    fn empty_width_list_is_rejected() {
        let mut doc = document();
        doc["long"]["width"] = json!([]);
        assert!(matches!(
            InterfaceGenConfig::from_value(&doc),
            Err(PfcError::InvalidConfig { .. })
        ));
        doc["long"]["width"] = json!(7.5);
        let config = InterfaceGenConfig::from_value(&doc).expect("single width");
        assert_eq!(config.long.width, Widths::Single(7.5));
    }

    struct WidthProbe;

    impl Engine for WidthProbe {
        fn advance(
            &mut self,
            _field: &mut RealField2D,
            _dynamics: &Dynamics,
            _steps: usize,
        ) -> Result<Observables> {
            Ok(Observables::new())
        }

        fn grand_potential_density(&mut self, _field: &RealField2D, _mu: f64) -> Result<f64> {
            Ok(0.0)
        }

        fn free_energy_density(&mut self, field: &RealField2D) -> Result<f64> {
            let w = field.mean();
            Ok((w - 12.0) * (w - 12.0))
        }

        fn blend(
            &mut self,
            solid: &RealField2D,
            _liquid: &RealField2D,
            width: f64,
        ) -> Result<RealField2D> {
            Ok(RealField2D::uniform(solid.lx, solid.ly, solid.nx, solid.ny, width))
        }
    }

    #[test]
    fn pick_width_prefers_lowest_free_energy() {
        let solid = RealField2D::uniform(8.0, 2.0, 4, 2, 0.3);
        let liquid = solid.uniform_like();
        let mut engine = WidthProbe;
        let w = pick_width(&mut engine, &solid, &liquid, &[5.0, 10.0, 14.0, 20.0]).expect("pick");
        assert_eq!(w, 10.0);
        let w = pick_width(&mut engine, &solid, &liquid, &[11.0, 13.0]).expect("tie");
        assert_eq!(w, 11.0);
        assert!(pick_width(&mut engine, &solid, &liquid, &[]).is_err());
    }
}
