use crate::config::{EngineConfig, SimulationParams, Wisdoms};
use crate::error::PfcError;
use crate::field::RealField2D;
use crate::io::{atomic_write_bytes, atomic_write_json_pretty, ensure_dir};
use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

pub const ENGINE_REQUEST_ENV: &str = "PFC_ENGINE_REQUEST";
pub const ENGINE_RESPONSE_ENV: &str = "PFC_ENGINE_RESPONSE";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub eps: f64,
    pub alpha: f64,
    pub beta: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DynamicsKind {
    ConstantMu { mu: f64 },
    StressRelax { mu: f64 },
    Conserved {
        inertia: Option<f64>,
        k_regularizer: Option<f64>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dynamics {
    pub kind: DynamicsKind,
    pub dt: f64,
    pub fft_threads: usize,
    pub wisdom_only: bool,
}

impl Dynamics {
    pub fn new(kind: DynamicsKind, params: &SimulationParams) -> Self {
        Self {
            kind,
            dt: params.dt,
            fft_threads: params.fft_threads,
            wisdom_only: params.wisdom_only,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Observables(BTreeMap<String, f64>);

impl Observables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: f64) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: f64) {
        self.0.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn require(&self, name: &str) -> Result<f64> {
        self.get(name).ok_or_else(|| {
            anyhow!(
                "engine did not report observable '{}' (available: {})",
                name,
                self.0.keys().cloned().collect::<Vec<_>>().join(", ")
            )
        })
    }
}

fn unsupported(op: &str) -> anyhow::Error {
    PfcError::engine(op, "not supported by this engine").into()
}

pub trait Engine {
    fn advance(
        &mut self,
        field: &mut RealField2D,
        dynamics: &Dynamics,
        steps: usize,
    ) -> Result<Observables>;

    fn grand_potential_density(&mut self, field: &RealField2D, mu: f64) -> Result<f64>;

    fn free_energy_density(&mut self, field: &RealField2D) -> Result<f64>;

    fn configure(&mut self, _model: &ModelParams) -> Result<()> {
        Ok(())
    }

    fn import_wisdom(&mut self, _blob: &[u8]) -> Result<()> {
        Ok(())
    }

    fn builtin_unit_cell(&mut self, _name: &str) -> Result<RealField2D> {
        Err(unsupported("builtin_unit_cell"))
    }

    fn resample(&mut self, _field: &RealField2D, _nx: usize, _ny: usize) -> Result<RealField2D> {
        Err(unsupported("resample"))
    }

    fn rotate(&mut self, _field: &RealField2D, _na: i64, _nb: i64) -> Result<RealField2D> {
        Err(unsupported("rotate"))
    }

    fn blend(
        &mut self,
        _solid: &RealField2D,
        _liquid: &RealField2D,
        _width: f64,
    ) -> Result<RealField2D> {
        Err(unsupported("blend"))
    }

    fn interface_widths(
        &mut self,
        _field: &RealField2D,
        _theta: f64,
        _uc_factor: f64,
    ) -> Result<[f64; 3]> {
        Err(unsupported("interface_widths"))
    }
}

pub fn import_wisdoms<E: Engine + ?Sized>(engine: &mut E, wisdoms: &Wisdoms) -> Result<()> {
    for blob in wisdoms.load()? {
        engine.import_wisdom(&blob)?;
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
struct EngineResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    observables: Observables,
    #[serde(default)]
    values: Vec<f64>,
}

impl EngineResponse {
    fn value(&self, op: &str, idx: usize) -> Result<f64> {
        self.values.get(idx).copied().ok_or_else(|| {
            PfcError::engine(op, format!("response carries no value at index {}", idx)).into()
        })
    }
}

pub struct ProcessEngine {
    command: Vec<String>,
    workdir: Option<PathBuf>,
    scratch: PathBuf,
    model: Option<ModelParams>,
    calls: u64,
}

impl ProcessEngine {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        if config.command.is_empty() {
            return Err(anyhow!("engine command cannot be empty"));
        }
        let scratch = std::env::temp_dir().join(format!(
            "pfc_engine_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&scratch)?;
        Ok(Self {
            command: config.command.clone(),
            workdir: config.workdir.clone(),
            scratch,
            model: None,
            calls: 0,
        })
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch
    }

    fn call(
        &mut self,
        op: &str,
        params: Value,
        inputs: &[(&str, &RealField2D)],
        wants_field: bool,
    ) -> Result<(EngineResponse, Option<RealField2D>)> {
        self.calls += 1;
        let call_dir = self.scratch.join(format!("call_{:06}", self.calls));
        ensure_dir(&call_dir)?;

        let mut input_paths = BTreeMap::new();
        for (name, field) in inputs {
            let path = call_dir.join(format!("{}.field", name));
            field.save(&path)?;
            input_paths.insert(name.to_string(), path.to_string_lossy().to_string());
        }
        let output_path = call_dir.join("output.field");
        let request_path = call_dir.join("request.json");
        let response_path = call_dir.join("response.json");
        let request = json!({
            "schema_version": "engine_request_v1",
            "op": op,
            "model": self.model,
            "params": params,
            "inputs": input_paths,
            "output": if wants_field { Some(output_path.to_string_lossy().to_string()) } else { None },
        });
        atomic_write_json_pretty(&request_path, &request)?;

        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        cmd.env(ENGINE_REQUEST_ENV, &request_path);
        cmd.env(ENGINE_RESPONSE_ENV, &response_path);
        debug!(op, call = self.calls, "invoking engine");
        let status = run_engine_process(cmd, &request_path, &response_path)?;
        if status != "0" {
            return Err(PfcError::engine(
                op,
                format!(
                    "engine exited with status {} (request: {})",
                    status,
                    request_path.display()
                ),
            )
            .into());
        }

        let response: EngineResponse = serde_json::from_slice(&fs::read(&response_path)?)
            .map_err(|e| PfcError::engine(op, format!("malformed response: {}", e)))?;
        if !response.ok {
            return Err(PfcError::engine(
                op,
                response
                    .error
                    .clone()
                    .unwrap_or_else(|| "engine reported failure".to_string()),
            )
            .into());
        }
        let field = if wants_field {
            Some(RealField2D::load(&output_path)?)
        } else {
            None
        };
        let _ = fs::remove_dir_all(&call_dir);
        Ok((response, field))
    }

    fn call_field(
        &mut self,
        op: &str,
        params: Value,
        inputs: &[(&str, &RealField2D)],
    ) -> Result<RealField2D> {
        let (_, field) = self.call(op, params, inputs, true)?;
        field.ok_or_else(|| PfcError::engine(op, "no output field").into())
    }
}

impl Drop for ProcessEngine {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.scratch);
    }
}

fn run_engine_process(mut cmd: Command, request_path: &Path, response_path: &Path) -> Result<String> {
    let request_bytes = fs::read(request_path).unwrap_or_default();
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::inherit());
    // Own process group: a terminal Ctrl-C reaches only the runner, which
    // stops at the next iteration boundary instead of killing the engine.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let mut child = cmd.spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(&request_bytes);
    }
    let output = child.wait_with_output()?;

    // Engines may answer on stdout instead of writing the response file.
    if !response_path.exists() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let maybe_json = stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(|s| s.trim().to_string());
        if let Some(line) = maybe_json {
            if serde_json::from_str::<Value>(&line).is_ok() {
                atomic_write_bytes(response_path, line.as_bytes())?;
            }
        }
    }
    if !response_path.exists() {
        let fallback = json!({
            "ok": false,
            "error": "engine exited without writing a response",
        });
        atomic_write_json_pretty(response_path, &fallback)?;
    }

    Ok(output
        .status
        .code()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string()))
}

impl Engine for ProcessEngine {
    fn advance(
        &mut self,
        field: &mut RealField2D,
        dynamics: &Dynamics,
        steps: usize,
    ) -> Result<Observables> {
        let params = json!({ "dynamics": dynamics, "steps": steps });
        let (response, evolved) = self.call("advance", params, &[("field", &*field)], true)?;
        *field = evolved.ok_or_else(|| PfcError::engine("advance", "no output field"))?;
        Ok(response.observables)
    }

    fn grand_potential_density(&mut self, field: &RealField2D, mu: f64) -> Result<f64> {
        let op = "grand_potential_density";
        let (response, _) = self.call(op, json!({ "mu": mu }), &[("field", field)], false)?;
        response.value(op, 0)
    }

    fn free_energy_density(&mut self, field: &RealField2D) -> Result<f64> {
        let op = "free_energy_density";
        let (response, _) = self.call(op, json!({}), &[("field", field)], false)?;
        response.value(op, 0)
    }

    fn configure(&mut self, model: &ModelParams) -> Result<()> {
        self.model = Some(*model);
        Ok(())
    }

    fn import_wisdom(&mut self, blob: &[u8]) -> Result<()> {
        let path = self.scratch.join(format!("wisdom_{:06}.bin", self.calls + 1));
        atomic_write_bytes(&path, blob)?;
        let params = json!({ "path": path.to_string_lossy() });
        self.call("import_wisdom", params, &[], false)?;
        Ok(())
    }

    fn builtin_unit_cell(&mut self, name: &str) -> Result<RealField2D> {
        self.call_field("builtin_unit_cell", json!({ "name": name }), &[])
    }

    fn resample(&mut self, field: &RealField2D, nx: usize, ny: usize) -> Result<RealField2D> {
        self.call_field("resample", json!({ "nx": nx, "ny": ny }), &[("field", field)])
    }

    fn rotate(&mut self, field: &RealField2D, na: i64, nb: i64) -> Result<RealField2D> {
        self.call_field("rotate", json!({ "na": na, "nb": nb }), &[("field", field)])
    }

    fn blend(&mut self, solid: &RealField2D, liquid: &RealField2D, width: f64) -> Result<RealField2D> {
        self.call_field(
            "blend",
            json!({ "width": width, "axis": 0 }),
            &[("solid", solid), ("liquid", liquid)],
        )
    }

    fn interface_widths(
        &mut self,
        field: &RealField2D,
        theta: f64,
        uc_factor: f64,
    ) -> Result<[f64; 3]> {
        let op = "interface_widths";
        let params = json!({ "theta": theta, "uc_factor": uc_factor });
        let (response, _) = self.call(op, params, &[("field", field)], false)?;
        Ok([
            response.value(op, 0)?,
            response.value(op, 1)?,
            response.value(op, 2)?,
        ])
    }
}
