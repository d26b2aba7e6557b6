use crate::config::{Precision, SimulationParams};
use crate::engine::{Dynamics, DynamicsKind, Engine, ModelParams};
use crate::error::PfcError;
use crate::field::RealField2D;
use crate::io::{atomic_write_json_pretty, load_json_file};
use crate::relax::{relax, RelaxSettings};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMethod {
    Binary,
    Interpolate,
}

impl SearchMethod {
    pub fn parse(raw: &str) -> Self {
        if raw.trim() == "binary" {
            SearchMethod::Binary
        } else {
            SearchMethod::Interpolate
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub mu: f64,
    pub gap: Option<f64>,
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRecord {
    pub method: SearchMethod,
    pub precision: f64,
    pub trials: Vec<Trial>,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub final_mu: Option<f64>,
    pub liquefied_at: Option<f64>,
}

impl SearchRecord {
    fn new(method: SearchMethod, precision: f64, lower: f64, upper: f64) -> Self {
        Self {
            method,
            precision,
            trials: Vec::new(),
            lower_bound: lower,
            upper_bound: upper,
            final_mu: None,
            liquefied_at: None,
        }
    }

    pub fn width(&self) -> f64 {
        self.upper_bound - self.lower_bound
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchSettings {
    pub method: SearchMethod,
    pub precision: f64,
    pub liquid_tol: f64,
    pub sim: SimulationParams,
}

#[derive(Debug)]
pub enum SearchFailure {
    Liquefied { record: SearchRecord, mu: f64 },
    Failed(anyhow::Error),
}

impl From<anyhow::Error> for SearchFailure {
    fn from(err: anyhow::Error) -> Self {
        SearchFailure::Failed(err)
    }
}

pub fn next_trial(
    method: SearchMethod,
    lower: f64,
    upper: f64,
    lower_gap: Option<f64>,
    upper_gap: Option<f64>,
) -> f64 {
    let mid = 0.5 * (lower + upper);
    let (SearchMethod::Interpolate, Some(g_lo), Some(g_hi)) = (method, lower_gap, upper_gap) else {
        return mid;
    };
    let slope = g_lo - g_hi;
    if slope == 0.0 || !slope.is_finite() {
        return mid;
    }
    let estimate = lower + g_lo * (upper - lower) / slope;
    if !estimate.is_finite() {
        return mid;
    }
    let quarter = 0.25 * (upper - lower);
    estimate.clamp(lower + quarter, upper - quarter)
}

// One search over `[lower, upper]`. On success `field` holds the solid
// relaxed at the last accepted trial; on liquefaction it may hold any
// earlier accepted trial and the caller is expected to restore it.
pub fn search_step<E: Engine + ?Sized>(
    engine: &mut E,
    field: &mut RealField2D,
    lower: f64,
    upper: f64,
    settings: &SearchSettings,
) -> Result<SearchRecord, SearchFailure> {
    if lower.is_nan() || upper.is_nan() || lower > upper {
        return Err(anyhow!("invalid μ bracket [{}, {}]", lower, upper).into());
    }
    if settings.precision.is_nan() || settings.precision <= 0.0 {
        return Err(SearchFailure::Failed(
            PfcError::invalid("mu_precision", "must be positive").into(),
        ));
    }
    let relax_settings = RelaxSettings::from_params(&settings.sim);
    let mut record = SearchRecord::new(settings.method, settings.precision, lower, upper);
    let mut lower_gap = None;
    let mut upper_gap = None;

    while record.width() > settings.precision {
        let mu = next_trial(
            settings.method,
            record.lower_bound,
            record.upper_bound,
            lower_gap,
            upper_gap,
        );
        // Bracket is down to adjacent floats; no trial can narrow it further.
        if mu <= record.lower_bound || mu >= record.upper_bound {
            warn!(
                lower = record.lower_bound,
                upper = record.upper_bound,
                precision = settings.precision,
                "bracket reached float resolution before the requested precision"
            );
            break;
        }

        let mut solid = field.clone();
        let dynamics = Dynamics::new(DynamicsKind::StressRelax { mu }, &settings.sim);
        relax(engine, &mut solid, &dynamics, &relax_settings)?;
        let variance = solid.variance();
        if variance < settings.liquid_tol {
            warn!(mu, variance, "solid liquefied during trial");
            record.trials.push(Trial {
                mu,
                gap: None,
                lower: record.lower_bound,
                upper: record.upper_bound,
            });
            record.liquefied_at = Some(mu);
            return Err(SearchFailure::Liquefied { record, mu });
        }

        let mut liquid = field.uniform_like();
        let dynamics = Dynamics::new(DynamicsKind::ConstantMu { mu }, &settings.sim);
        relax(engine, &mut liquid, &dynamics, &relax_settings)?;

        let omega_s = engine.grand_potential_density(&solid, mu)?;
        let omega_l = engine.grand_potential_density(&liquid, mu)?;
        let gap = omega_s - omega_l;
        if gap > 0.0 {
            record.lower_bound = mu;
            lower_gap = Some(gap);
        } else {
            record.upper_bound = mu;
            upper_gap = Some(gap);
        }
        info!(
            mu,
            gap,
            lower = record.lower_bound,
            upper = record.upper_bound,
            "search trial"
        );
        record.trials.push(Trial {
            mu,
            gap: Some(gap),
            lower: record.lower_bound,
            upper: record.upper_bound,
        });
        record.final_mu = Some(mu);
        *field = solid;
    }

    if record.final_mu.is_none() {
        record.final_mu = Some(0.5 * (record.lower_bound + record.upper_bound));
    }
    Ok(record)
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchStep {
    pub settings: SearchSettings,
    pub model: ModelParams,
    pub precision: Precision,
    pub expand_range: f64,
    pub max_trials: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutcome {
    pub field: RealField2D,
    pub records: Vec<SearchRecord>,
    pub mu: f64,
}

pub fn find_coexistence<E: Engine + ?Sized>(
    engine: &mut E,
    field: RealField2D,
    mu_min: f64,
    mu_max: f64,
    steps: &[SearchStep],
) -> Result<SearchOutcome> {
    if steps.is_empty() {
        return Err(PfcError::invalid("runs", "at least one run is required").into());
    }
    let mut field = field;
    let mut records = Vec::new();
    let mut lower = mu_min;
    let mut upper = mu_max;
    let mut mu = 0.5 * (lower + upper);

    for (index, step) in steps.iter().enumerate() {
        if index > 0 {
            lower -= step.expand_range;
            upper += step.expand_range;
        }
        engine.configure(&step.model)?;
        field = field.with_precision(step.precision);
        lower = step.precision.round(lower);
        upper = step.precision.round(upper);
        info!(
            step = index + 1,
            of = steps.len(),
            method = ?step.settings.method,
            lower,
            upper,
            "starting search step"
        );

        let mut attempts = 0usize;
        loop {
            attempts += 1;
            let snapshot = field.clone();
            match search_step(engine, &mut field, lower, upper, &step.settings) {
                Ok(record) => {
                    lower = record.lower_bound;
                    upper = record.upper_bound;
                    mu = record.final_mu.unwrap_or(0.5 * (lower + upper));
                    records.push(record);
                    break;
                }
                Err(SearchFailure::Liquefied { record, mu: melted }) => {
                    field = snapshot;
                    let solid_lower = record.lower_bound;
                    records.push(record);
                    if attempts >= step.max_trials {
                        return Err(PfcError::PersistentLiquefaction {
                            step: index,
                            attempts,
                        }
                        .into());
                    }
                    warn!(
                        attempt = attempts,
                        max_trials = step.max_trials,
                        lower = solid_lower,
                        upper = melted,
                        "retrying search below liquefaction point"
                    );
                    lower = solid_lower;
                    upper = melted;
                }
                Err(SearchFailure::Failed(err)) => return Err(err),
            }
        }
    }

    Ok(SearchOutcome {
        field,
        records,
        mu,
    })
}

pub fn save_log(path: &Path, records: &[SearchRecord]) -> Result<()> {
    atomic_write_json_pretty(path, &serde_json::to_value(records)?)
}

pub fn load_log(path: &Path) -> Result<Vec<SearchRecord>> {
    let value = load_json_file(path)?;
    serde_json::from_value(value)
        .map_err(|e| anyhow!("failed to parse search log {}: {}", path.display(), e))
}

pub fn coexistence_mu(path: &Path) -> Result<f64> {
    load_log(path)?
        .iter()
        .rev()
        .filter(|r| r.liquefied_at.is_none())
        .find_map(|r| r.final_mu)
        .ok_or_else(|| anyhow!("search log {} holds no settled μ", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Observables;

    struct ToyEngine {
        mu_star: f64,
        melt_above: Option<f64>,
        solid_inputs: Vec<Vec<f64>>,
    }

    impl ToyEngine {
        fn new(mu_star: f64) -> Self {
            Self {
                mu_star,
                melt_above: None,
                solid_inputs: Vec::new(),
            }
        }
    }

    impl Engine for ToyEngine {
        fn advance(
            &mut self,
            field: &mut RealField2D,
            dynamics: &Dynamics,
            _steps: usize,
        ) -> Result<Observables> {
            match dynamics.kind {
                DynamicsKind::StressRelax { mu } => {
                    self.solid_inputs.push(field.psi.clone());
                    if self.melt_above.map_or(false, |m| mu > m) {
                        *field = field.uniform_like();
                    } else {
                        field.psi.iter_mut().for_each(|p| *p += 1e-3 * mu);
                    }
                }
                DynamicsKind::ConstantMu { .. } => *field = field.uniform_like(),
                DynamicsKind::Conserved { .. } => {}
            }
            Ok(Observables::new().with("F", 1.0))
        }

        fn grand_potential_density(&mut self, field: &RealField2D, mu: f64) -> Result<f64> {
            if field.variance() > 1e-9 {
                Ok(self.mu_star - mu)
            } else {
                Ok(0.0)
            }
        }

        fn free_energy_density(&mut self, _field: &RealField2D) -> Result<f64> {
            Ok(0.0)
        }
    }

    fn sim() -> SimulationParams {
        SimulationParams {
            dt: 0.1,
            target: "F".to_string(),
            tol: 1e-9,
            patience: 1,
            n_steps: 10,
            refresh_interval: 10,
            fps: 12,
            fft_threads: 1,
            wisdom_only: false,
        }
    }

    fn settings(method: SearchMethod, precision: f64) -> SearchSettings {
        SearchSettings {
            method,
            precision,
            liquid_tol: 1e-4,
            sim: sim(),
        }
    }

    fn step(method: SearchMethod, precision: f64, max_trials: usize) -> SearchStep {
        SearchStep {
            settings: settings(method, precision),
            model: ModelParams {
                eps: 0.1,
                alpha: 0.0,
                beta: 0.0,
            },
            precision: Precision::Double,
            expand_range: 0.0,
            max_trials,
        }
    }

    fn crystal() -> RealField2D {
        let psi = (0..16).map(|k| (k as f64 * 0.7).sin() * 0.3).collect();
        RealField2D::new(4.0, 4.0, 4, 4, psi).expect("field")
    }

    #[test]
    fn binary_search_takes_ceil_log2_trials() {
        for (lo, hi, precision) in [(0.0, 1.0, 1e-3), (0.1, 0.3, 1e-4), (-1.0, 2.0, 0.25)] {
            let mut engine = ToyEngine::new(lo + 0.37 * (hi - lo));
            let mut field = crystal();
            let record = search_step(
                &mut engine,
                &mut field,
                lo,
                hi,
                &settings(SearchMethod::Binary, precision),
            )
            .expect("search");
            let expected = ((hi - lo) / precision).log2().ceil() as usize;
            assert_eq!(record.trials.len(), expected, "bracket [{}, {}]", lo, hi);
            assert!(record.width() <= precision);
            let mu = record.final_mu.expect("final");
            assert!(record.lower_bound <= mu && mu <= record.upper_bound);
            assert!(record.lower_bound <= engine.mu_star && engine.mu_star <= record.upper_bound);
        }
    }

    #[test]
    fn narrow_bracket_runs_no_trials() {
        let mut engine = ToyEngine::new(0.5);
        let mut field = crystal();
        let record = search_step(
            &mut engine,
            &mut field,
            0.5,
            0.5005,
            &settings(SearchMethod::Binary, 1e-3),
        )
        .expect("search");
        assert!(record.trials.is_empty());
        assert!((record.final_mu.expect("final") - 0.50025).abs() < 1e-12);
        assert_eq!(field, crystal());
    }

    #[test]
    fn precision_below_float_spacing_stops_at_adjacent_bounds() {
        let mut engine = ToyEngine::new(0.2345);
        let mut field = crystal();
        for method in [SearchMethod::Binary, SearchMethod::Interpolate] {
            let record = search_step(&mut engine, &mut field, 0.2, 0.3, &settings(method, 1e-18))
                .expect("search");
            assert!(record.trials.len() < 200, "{} trials", record.trials.len());
            assert!(record.width() > 0.0);
            assert!(record.width() <= 2.0 * f64::EPSILON * 0.3);
            assert!(record.lower_bound <= 0.2345 && 0.2345 <= record.upper_bound);
        }
    }

    #[test]
    fn non_positive_precision_is_a_config_error() {
        let mut engine = ToyEngine::new(0.5);
        let mut field = crystal();
        for precision in [0.0, -1e-3, f64::NAN] {
            match search_step(
                &mut engine,
                &mut field,
                0.0,
                1.0,
                &settings(SearchMethod::Binary, precision),
            ) {
                Err(SearchFailure::Failed(err)) => assert!(matches!(
                    err.downcast_ref::<PfcError>(),
                    Some(PfcError::InvalidConfig { .. })
                )),
                other => panic!("expected config error, got {:?}", other.map(|r| r.trials)),
            }
        }
        assert!(engine.solid_inputs.is_empty());
    }

    #[test]
    fn interpolate_converges_in_fewer_trials_than_bisection() {
        let mut engine = ToyEngine::new(0.123);
        let mut field = crystal();
        let record = search_step(
            &mut engine,
            &mut field,
            0.0,
            1.0,
            &settings(SearchMethod::Interpolate, 1e-6),
        )
        .expect("search");
        let bisection = (1e6f64).log2().ceil() as usize;
        assert!(record.trials.len() < bisection, "{} trials", record.trials.len());
        assert!(record.lower_bound <= 0.123 && 0.123 <= record.upper_bound);
        assert!(record.width() <= 1e-6);
    }

    #[test]
    fn next_trial_clamps_interpolation_to_inner_half() {
        assert_eq!(next_trial(SearchMethod::Interpolate, 0.0, 1.0, None, Some(-1.0)), 0.5);
        assert_eq!(next_trial(SearchMethod::Binary, 0.0, 1.0, Some(1.0), Some(-1.0)), 0.5);
        assert_eq!(next_trial(SearchMethod::Interpolate, 0.0, 1.0, Some(1.0), Some(-3.0)), 0.25);
        assert_eq!(next_trial(SearchMethod::Interpolate, 0.0, 1.0, Some(3.0), Some(-1.0)), 0.75);
        assert_eq!(next_trial(SearchMethod::Interpolate, 0.0, 1.0, Some(1.0), Some(-1.0)), 0.5);
        assert_eq!(next_trial(SearchMethod::Interpolate, 0.0, 1.0, Some(1.0), Some(1.0)), 0.5);
    }

    #[test]
    fn liquefaction_is_reported_with_the_offending_mu() {
        let mut engine = ToyEngine::new(0.65);
        engine.melt_above = Some(0.7);
        let mut field = crystal();
        match search_step(
            &mut engine,
            &mut field,
            0.0,
            1.0,
            &settings(SearchMethod::Binary, 1e-3),
        ) {
            Err(SearchFailure::Liquefied { record, mu }) => {
                assert_eq!(mu, 0.75);
                assert_eq!(record.liquefied_at, Some(0.75));
                assert_eq!(record.trials.len(), 2);
                assert_eq!(record.trials[1].gap, None);
            }
            other => panic!("expected liquefaction, got {:?}", other.map(|r| r.trials)),
        }
    }

    #[test]
    fn retry_restores_field_and_succeeds_within_max_trials() {
        let mut engine = ToyEngine::new(0.65);
        engine.melt_above = Some(0.7);
        let original = crystal();
        let outcome = find_coexistence(
            &mut engine,
            original.clone(),
            0.0,
            1.0,
            &[step(SearchMethod::Binary, 1e-3, 3)],
        )
        .expect("search");

        // attempt 1: 0.5 accepted (mutates the field), 0.75 melts
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.records[0].liquefied_at, Some(0.75));
        // attempt 2 starts over [0.5, 0.75] from the pre-attempt field
        let second = &outcome.records[1];
        assert_eq!(second.trials[0].mu, 0.625);
        assert_eq!(engine.solid_inputs[2], original.psi);
        assert_ne!(engine.solid_inputs[1], original.psi);
        assert!(second.lower_bound <= 0.65 && 0.65 <= second.upper_bound);
        assert!((outcome.mu - 0.65).abs() <= 1e-3);
    }

    #[test]
    fn persistent_liquefaction_aborts_after_max_trials() {
        let mut engine = ToyEngine::new(0.3);
        engine.melt_above = Some(-10.0);
        let err = find_coexistence(
            &mut engine,
            crystal(),
            0.0,
            1.0,
            &[step(SearchMethod::Binary, 1e-3, 3)],
        )
        .expect_err("always liquid");
        match err.downcast_ref::<PfcError>() {
            Some(PfcError::PersistentLiquefaction { step, attempts }) => {
                assert_eq!(*step, 0);
                assert_eq!(*attempts, 3);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(engine.solid_inputs.len(), 3);
    }

    #[test]
    fn later_steps_start_from_widened_previous_bracket() {
        let mut engine = ToyEngine::new(0.4);
        let mut coarse = step(SearchMethod::Binary, 0.1, 3);
        coarse.expand_range = 0.0;
        let mut fine = step(SearchMethod::Binary, 0.01, 3);
        fine.expand_range = 0.05;
        let outcome =
            find_coexistence(&mut engine, crystal(), 0.0, 1.0, &[coarse, fine]).expect("search");
        assert_eq!(outcome.records.len(), 2);
        let (first, second) = (&outcome.records[0], &outcome.records[1]);
        let widened_lower = first.lower_bound - 0.05;
        let widened_upper = first.upper_bound + 0.05;
        assert!((second.trials[0].mu - 0.5 * (widened_lower + widened_upper)).abs() < 1e-12);
        assert!(second.width() <= 0.01);
        assert!(second.lower_bound <= 0.4 && 0.4 <= second.upper_bound);
    }

    #[test]
    fn log_round_trips_and_yields_last_settled_mu() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("log.json");
        let mut engine = ToyEngine::new(0.65);
        engine.melt_above = Some(0.7);
        let outcome = find_coexistence(
            &mut engine,
            crystal(),
            0.0,
            1.0,
            &[step(SearchMethod::Binary, 1e-3, 3)],
        )
        .expect("search");
        save_log(&path, &outcome.records).expect("save");
        assert_eq!(load_log(&path).expect("load"), outcome.records);
        assert_eq!(coexistence_mu(&path).expect("mu"), outcome.mu);
    }
}
