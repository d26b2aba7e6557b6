use crate::config::SimulationParams;
use crate::engine::{Dynamics, Engine};
use crate::field::RealField2D;
use anyhow::Result;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct RelaxSettings {
    pub n_steps: usize,
    pub check_interval: usize,
    pub target: String,
    pub tol: f64,
    pub patience: usize,
}

impl RelaxSettings {
    pub fn from_params(params: &SimulationParams) -> Self {
        Self {
            n_steps: params.n_steps,
            check_interval: params.refresh_interval,
            target: params.target.clone(),
            tol: params.tol,
            patience: params.patience,
        }
    }
}

// Counts consecutive checks whose value moved by less than `tol`.
// `patience == 0` disables the early stop.
#[derive(Debug, Clone)]
pub struct SlowProgress {
    tol: f64,
    patience: usize,
    last: Option<f64>,
    streak: usize,
}

impl SlowProgress {
    pub fn new(tol: f64, patience: usize) -> Self {
        Self {
            tol,
            patience,
            last: None,
            streak: 0,
        }
    }

    pub fn observe(&mut self, value: f64) -> bool {
        if let Some(last) = self.last {
            if (value - last).abs() < self.tol {
                self.streak += 1;
            } else {
                self.streak = 0;
            }
        }
        self.last = Some(value);
        self.patience > 0 && self.streak >= self.patience
    }

    pub fn streak(&self) -> usize {
        self.streak
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelaxStop {
    SlowProgress,
    StepBudget,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelaxReport {
    pub steps: usize,
    pub series: Vec<f64>,
    pub stop: RelaxStop,
}

impl RelaxReport {
    pub fn last_value(&self) -> Option<f64> {
        self.series.last().copied()
    }
}

pub fn relax<E: Engine + ?Sized>(
    engine: &mut E,
    field: &mut RealField2D,
    dynamics: &Dynamics,
    settings: &RelaxSettings,
) -> Result<RelaxReport> {
    let interval = if settings.check_interval == 0 {
        settings.n_steps
    } else {
        settings.check_interval
    };
    let mut monitor = SlowProgress::new(settings.tol, settings.patience);
    let mut steps = 0usize;
    let mut series = Vec::new();
    while steps < settings.n_steps {
        let chunk = interval.min(settings.n_steps - steps);
        let observables = engine.advance(field, dynamics, chunk)?;
        steps += chunk;
        let value = observables.require(&settings.target)?;
        series.push(value);
        if monitor.observe(value) {
            debug!(steps, value, target = %settings.target, "relaxation settled");
            return Ok(RelaxReport {
                steps,
                series,
                stop: RelaxStop::SlowProgress,
            });
        }
    }
    debug!(steps, target = %settings.target, "relaxation used its step budget");
    Ok(RelaxReport {
        steps,
        series,
        stop: RelaxStop::StepBudget,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{DynamicsKind, Observables};

    struct Decaying {
        calls: usize,
        steps: Vec<usize>,
    }

    impl Engine for Decaying {
        fn advance(
            &mut self,
            _field: &mut RealField2D,
            _dynamics: &Dynamics,
            steps: usize,
        ) -> Result<Observables> {
            self.calls += 1;
            self.steps.push(steps);
            Ok(Observables::new().with("F", 1.0 / (1.0 + self.calls as f64)))
        }

        fn grand_potential_density(&mut self, _field: &RealField2D, _mu: f64) -> Result<f64> {
            Ok(0.0)
        }

        fn free_energy_density(&mut self, _field: &RealField2D) -> Result<f64> {
            Ok(0.0)
        }
    }

    fn dynamics() -> Dynamics {
        Dynamics {
            kind: DynamicsKind::ConstantMu { mu: 0.0 },
            dt: 0.1,
            fft_threads: 1,
            wisdom_only: false,
        }
    }

    fn settings(n_steps: usize, check_interval: usize, tol: f64, patience: usize) -> RelaxSettings {
        RelaxSettings {
            n_steps,
            check_interval,
            target: "F".to_string(),
            tol,
            patience,
        }
    }

    #[test]
    fn slow_progress_needs_consecutive_small_changes() {
        let mut m = SlowProgress::new(0.1, 2);
        assert!(!m.observe(1.0));
        assert!(!m.observe(1.05));
        assert!(!m.observe(2.0));
        assert_eq!(m.streak(), 0);
        assert!(!m.observe(2.01));
        assert!(m.observe(2.02));
    }

    #[test]
    fn zero_patience_never_stops_early() {
        let mut m = SlowProgress::new(1.0, 0);
        assert!(!m.observe(1.0));
        assert!(!m.observe(1.0));
    }

    #[test]
    fn relax_stops_on_slow_progress() {
        let mut engine = Decaying {
            calls: 0,
            steps: Vec::new(),
        };
        let mut field = RealField2D::uniform(1.0, 1.0, 2, 2, 0.0);
        // successive differences: 1/6, 1/12, 1/20, 1/30, ...
        let report = relax(&mut engine, &mut field, &dynamics(), &settings(10_000, 10, 0.06, 2))
            .expect("relax");
        assert_eq!(report.stop, RelaxStop::SlowProgress);
        assert_eq!(report.series.len(), 5);
        assert_eq!(report.steps, 50);
    }

    #[test]
    fn relax_honours_step_budget_with_partial_last_chunk() {
        let mut engine = Decaying {
            calls: 0,
            steps: Vec::new(),
        };
        let mut field = RealField2D::uniform(1.0, 1.0, 2, 2, 0.0);
        let report =
            relax(&mut engine, &mut field, &dynamics(), &settings(25, 10, 0.0, 3)).expect("relax");
        assert_eq!(report.stop, RelaxStop::StepBudget);
        assert_eq!(engine.steps, vec![10, 10, 5]);
        assert_eq!(report.steps, 25);
        assert_eq!(report.last_value(), Some(0.25));
    }

    #[test]
    fn missing_target_observable_is_an_error() {
        let mut engine = Decaying {
            calls: 0,
            steps: Vec::new(),
        };
        let mut field = RealField2D::uniform(1.0, 1.0, 2, 2, 0.0);
        let mut s = settings(10, 5, 0.0, 1);
        s.target = "Omega".to_string();
        assert!(relax(&mut engine, &mut field, &dynamics(), &s).is_err());
    }
}
