use crate::engine::ModelParams;
use crate::error::PfcError;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

pub type Document = Map<String, Value>;

pub const DEFAULT_DATA_DIR: &str = "data";

pub fn load_document(path: &Path) -> Result<Value> {
    let raw_yaml = fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config {}: {}", path.display(), e))?;
    let yaml_value: serde_yaml::Value = serde_yaml::from_str(&raw_yaml)?;
    let json_value: Value = serde_json::to_value(yaml_value)?;
    Ok(json_value)
}

// Look `key` up in `child`; when absent, fall back to `parent` only if the
// key is allow-listed. Fallback never chains past `parent`.
pub fn resolve<'a>(
    child: &'a Document,
    parent: Option<&'a Document>,
    allow: &[&str],
    key: &str,
) -> Result<&'a Value, PfcError> {
    if let Some(v) = child.get(key) {
        return Ok(v);
    }
    if allow.contains(&key) {
        if let Some(v) = parent.and_then(|p| p.get(key)) {
            return Ok(v);
        }
    }
    Err(PfcError::MissingKey {
        key: key.to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Single,
    Double,
    LongDouble,
}

impl Precision {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "single" | "float32" | "f32" => Some(Precision::Single),
            "double" | "float64" | "f64" => Some(Precision::Double),
            // carried as f64: there is no stable wider float to hold it
            "longdouble" | "long_double" | "float128" => Some(Precision::LongDouble),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Precision::Single => "single",
            Precision::Double => "double",
            Precision::LongDouble => "longdouble",
        }
    }

    pub fn round(self, x: f64) -> f64 {
        match self {
            Precision::Single => x as f32 as f64,
            Precision::Double | Precision::LongDouble => x,
        }
    }

    pub fn to_float(self, raw: &str) -> Result<f64, PfcError> {
        parse_float_literal(raw)
            .map(|x| self.round(x))
            .ok_or_else(|| PfcError::invalid(raw, "not a floating-point literal"))
    }
}

fn parse_float_literal(raw: &str) -> Option<f64> {
    let s = raw.trim();
    match s.to_ascii_lowercase().as_str() {
        "inf" | "+inf" | "infinity" => Some(f64::INFINITY),
        "-inf" | "-infinity" => Some(f64::NEG_INFINITY),
        _ => s.parse::<f64>().ok(),
    }
}

#[derive(Debug, Clone)]
pub struct Scope<'a> {
    child: &'a Document,
    parent: Option<&'a Document>,
    allow: &'a [&'a str],
    section: Option<String>,
}

impl<'a> Scope<'a> {
    pub fn root(doc: &'a Document) -> Self {
        Self {
            child: doc,
            parent: None,
            allow: &[],
            section: None,
        }
    }

    pub fn from_value(value: &'a Value) -> Result<Self, PfcError> {
        value
            .as_object()
            .map(Scope::root)
            .ok_or_else(|| PfcError::invalid("<root>", "config document must be a mapping"))
    }

    pub fn fallback(
        &self,
        child: &'a Document,
        allow: &'a [&'a str],
        section: impl Into<String>,
    ) -> Scope<'a> {
        Scope {
            child,
            parent: Some(self.child),
            allow,
            section: Some(self.qualify(&section.into())),
        }
    }

    pub fn section(&self, key: &str, allow: &'a [&'a str]) -> Result<Scope<'a>, PfcError> {
        let child = self
            .child
            .get(key)
            .ok_or_else(|| PfcError::MissingKey {
                key: self.qualify(key),
            })?
            .as_object()
            .ok_or_else(|| PfcError::invalid(self.qualify(key), "expected a mapping"))?;
        Ok(self.fallback(child, allow, key))
    }

    pub fn qualify(&self, key: &str) -> String {
        match &self.section {
            Some(section) => format!("{}.{}", section, key),
            None => key.to_string(),
        }
    }

    pub fn value(&self, key: &str) -> Result<&'a Value, PfcError> {
        resolve(self.child, self.parent, self.allow, key).map_err(|_| PfcError::MissingKey {
            key: self.qualify(key),
        })
    }

    pub fn has(&self, key: &str) -> bool {
        resolve(self.child, self.parent, self.allow, key).is_ok()
    }

    pub fn int(&self, key: &str) -> Result<i64, PfcError> {
        let v = self.value(key)?;
        let parsed = match v {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        };
        parsed.ok_or_else(|| PfcError::invalid(self.qualify(key), "expected an integer"))
    }

    pub fn usize(&self, key: &str) -> Result<usize, PfcError> {
        let v = self.int(key)?;
        usize::try_from(v)
            .map_err(|_| PfcError::invalid(self.qualify(key), "expected a non-negative integer"))
    }

    pub fn float(&self, key: &str, precision: Precision) -> Result<f64, PfcError> {
        let parsed = match self.value(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => parse_float_literal(s),
            _ => None,
        };
        parsed
            .map(|x| precision.round(x))
            .ok_or_else(|| PfcError::invalid(self.qualify(key), "expected a number"))
    }

    pub fn opt_float(&self, key: &str, precision: Precision) -> Result<Option<f64>, PfcError> {
        if self.has(key) {
            self.float(key, precision).map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn string(&self, key: &str) -> Result<String, PfcError> {
        match self.value(key)? {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            _ => Err(PfcError::invalid(self.qualify(key), "expected a scalar")),
        }
    }

    pub fn boolean(&self, key: &str) -> Result<bool, PfcError> {
        match self.value(key)? {
            Value::Bool(b) => Ok(*b),
            Value::Number(n) => Ok(n.as_f64().map(|f| f != 0.0).unwrap_or(false)),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(true),
                "false" | "no" | "0" => Ok(false),
                _ => Err(PfcError::invalid(self.qualify(key), "expected a boolean")),
            },
            _ => Err(PfcError::invalid(self.qualify(key), "expected a boolean")),
        }
    }

    pub fn list(&self, key: &str) -> Result<&'a Vec<Value>, PfcError> {
        self.value(key)?
            .as_array()
            .ok_or_else(|| PfcError::invalid(self.qualify(key), "expected a list"))
    }

    pub fn precision(&self) -> Result<Precision, PfcError> {
        let raw = self.string("precision")?;
        Precision::parse(&raw).ok_or_else(|| {
            PfcError::invalid(
                self.qualify("precision"),
                format!("unknown precision '{}'", raw),
            )
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape {
    pub nx: usize,
    pub ny: usize,
}

pub fn parse_shape(scope: &Scope) -> Result<Shape, PfcError> {
    Ok(Shape {
        nx: scope.usize("nx")?,
        ny: scope.usize("ny")?,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseParams {
    pub eps: String,
    pub alpha: String,
    pub beta: String,
}

impl PhaseParams {
    pub fn model(&self, precision: Precision) -> Result<ModelParams, PfcError> {
        Ok(ModelParams {
            eps: precision.to_float(&self.eps)?,
            alpha: precision.to_float(&self.alpha)?,
            beta: precision.to_float(&self.beta)?,
        })
    }
}

pub fn parse_phase(scope: &Scope) -> Result<PhaseParams, PfcError> {
    Ok(PhaseParams {
        eps: scope.string("eps")?,
        alpha: scope.string("alpha")?,
        beta: scope.string("beta")?,
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rotation {
    pub na: i64,
    pub nb: i64,
    pub theta: f64,
}

impl Rotation {
    pub fn new(na: i64, nb: i64) -> Self {
        let theta = (3f64.sqrt() * nb as f64).atan2((2 * na + nb) as f64);
        Self { na, nb, theta }
    }
}

pub fn parse_rotation(scope: &Scope) -> Result<Rotation, PfcError> {
    Ok(Rotation::new(scope.int("na")?, scope.int("nb")?))
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationParams {
    pub dt: f64,
    pub target: String,
    pub tol: f64,
    pub patience: usize,
    pub n_steps: usize,
    pub refresh_interval: usize,
    pub fps: usize,
    pub fft_threads: usize,
    pub wisdom_only: bool,
}

pub fn parse_simulation(scope: &Scope, precision: Precision) -> Result<SimulationParams, PfcError> {
    Ok(SimulationParams {
        dt: scope.float("dt", precision)?,
        target: scope.string("target")?,
        tol: scope.float("tol", precision)?,
        patience: scope.usize("patience")?,
        n_steps: scope.usize("n_steps")?,
        refresh_interval: scope.usize("refresh_interval")?,
        fps: scope.usize("fps")?,
        fft_threads: scope.usize("fft_threads")?,
        wisdom_only: scope.boolean("wisdom_only")?,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Wisdoms {
    pub files: Vec<PathBuf>,
}

impl Wisdoms {
    pub fn load(&self) -> Result<Vec<Vec<u8>>> {
        self.files
            .iter()
            .map(|p| {
                fs::read(p).map_err(|e| anyhow!("failed to read wisdom {}: {}", p.display(), e))
            })
            .collect()
    }
}

pub fn parse_wisdoms(scope: &Scope) -> Result<Wisdoms, PfcError> {
    if !scope.has("fftw_wisdoms") {
        return Ok(Wisdoms::default());
    }
    let files = scope
        .list("fftw_wisdoms")?
        .iter()
        .map(|v| {
            v.as_str()
                .map(PathBuf::from)
                .ok_or_else(|| PfcError::invalid(scope.qualify("fftw_wisdoms"), "expected paths"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Wisdoms { files })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub command: Vec<String>,
    pub workdir: Option<PathBuf>,
}

pub fn parse_engine(scope: &Scope) -> Result<EngineConfig, PfcError> {
    let engine = scope.section("engine", &[])?;
    let command = engine
        .list("command")?
        .iter()
        .map(|v| match v {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            _ => Err(PfcError::invalid(engine.qualify("command"), "expected strings")),
        })
        .collect::<Result<Vec<_>, _>>()?;
    if command.is_empty() {
        return Err(PfcError::invalid(
            engine.qualify("command"),
            "command cannot be empty",
        ));
    }
    let workdir = if engine.has("workdir") {
        Some(PathBuf::from(engine.string("workdir")?))
    } else {
        None
    };
    Ok(EngineConfig { command, workdir })
}

pub fn parse_data_dir(scope: &Scope) -> Result<PathBuf, PfcError> {
    if scope.has("data_dir") {
        Ok(PathBuf::from(scope.string("data_dir")?))
    } else {
        Ok(PathBuf::from(DEFAULT_DATA_DIR))
    }
}
