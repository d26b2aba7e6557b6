use crate::config::Precision;
use crate::io::atomic_write_bytes;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

// Row-major by x: sample (i, j) is psi[i * ny + j].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealField2D {
    pub lx: f64,
    pub ly: f64,
    pub nx: usize,
    pub ny: usize,
    pub psi: Vec<f64>,
}

impl RealField2D {
    pub fn new(lx: f64, ly: f64, nx: usize, ny: usize, psi: Vec<f64>) -> Result<Self> {
        let field = Self { lx, ly, nx, ny, psi };
        field.validate()?;
        Ok(field)
    }

    pub fn uniform(lx: f64, ly: f64, nx: usize, ny: usize, value: f64) -> Self {
        Self {
            lx,
            ly,
            nx,
            ny,
            psi: vec![value; nx * ny],
        }
    }

    fn validate(&self) -> Result<()> {
        if self.nx == 0 || self.ny == 0 {
            return Err(anyhow!("field shape must be non-empty, got {:?}", self.shape()));
        }
        if self.psi.len() != self.nx * self.ny {
            return Err(anyhow!(
                "field data has {} samples, shape {:?} needs {}",
                self.psi.len(),
                self.shape(),
                self.nx * self.ny
            ));
        }
        Ok(())
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.nx, self.ny)
    }

    pub fn volume(&self) -> f64 {
        self.lx * self.ly
    }

    pub fn mean(&self) -> f64 {
        self.psi.iter().sum::<f64>() / self.psi.len() as f64
    }

    pub fn variance(&self) -> f64 {
        let mean = self.mean();
        self.psi.iter().map(|p| (p - mean) * (p - mean)).sum::<f64>() / self.psi.len() as f64
    }

    pub fn uniform_like(&self) -> Self {
        Self::uniform(self.lx, self.ly, self.nx, self.ny, self.mean())
    }

    pub fn with_precision(&self, precision: Precision) -> Self {
        Self {
            lx: precision.round(self.lx),
            ly: precision.round(self.ly),
            nx: self.nx,
            ny: self.ny,
            psi: self.psi.iter().map(|p| precision.round(*p)).collect(),
        }
    }

    pub fn extend(&self, mx: usize, my: usize) -> Result<Self> {
        if mx == 0 || my == 0 {
            return Err(anyhow!("extension factors must be positive, got ({}, {})", mx, my));
        }
        let nx = self.nx * mx;
        let ny = self.ny * my;
        let mut psi = Vec::with_capacity(nx * ny);
        for i in 0..nx {
            let row = &self.psi[(i % self.nx) * self.ny..(i % self.nx + 1) * self.ny];
            for _ in 0..my {
                psi.extend_from_slice(row);
            }
        }
        Ok(Self {
            lx: self.lx * mx as f64,
            ly: self.ly * my as f64,
            nx,
            ny,
            psi,
        })
    }

    pub fn columns(&self, start: usize, end: usize) -> Result<Self> {
        if start >= end || end > self.nx {
            return Err(anyhow!(
                "invalid column range {}..{} for nx = {}",
                start,
                end,
                self.nx
            ));
        }
        Ok(Self {
            lx: self.lx * (end - start) as f64 / self.nx as f64,
            ly: self.ly,
            nx: end - start,
            ny: self.ny,
            psi: self.psi[start * self.ny..end * self.ny].to_vec(),
        })
    }

    pub fn concat_x(parts: &[&RealField2D]) -> Result<Self> {
        let first = parts
            .first()
            .ok_or_else(|| anyhow!("concat_x needs at least one field"))?;
        let mut out = Self {
            lx: 0.0,
            ly: first.ly,
            nx: 0,
            ny: first.ny,
            psi: Vec::new(),
        };
        for part in parts {
            if part.ny != first.ny {
                return Err(anyhow!(
                    "cannot join fields along x: ny {} != {}",
                    part.ny,
                    first.ny
                ));
            }
            out.lx += part.lx;
            out.nx += part.nx;
            out.psi.extend_from_slice(&part.psi);
        }
        Ok(out)
    }

    // Insert a bulk solid slab at a quarter of the way along x (inside the
    // solid half) and a bulk liquid slab at three quarters (inside the
    // liquid half). Both interfaces are left untouched.
    pub fn elongate(&self, delta_solid: &RealField2D, delta_liquid: &RealField2D) -> Result<Self> {
        if self.nx < 4 {
            return Err(anyhow!("cannot elongate a field with nx = {}", self.nx));
        }
        let q1 = self.nx / 4;
        let q3 = 3 * self.nx / 4;
        let left = self.columns(0, q1)?;
        let middle = self.columns(q1, q3)?;
        let right = self.columns(q3, self.nx)?;
        Self::concat_x(&[&left, delta_solid, &middle, delta_liquid, &right])
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .map_err(|e| anyhow!("failed to read field {}: {}", path.display(), e))?;
        let field: Self = serde_json::from_slice(&bytes)
            .map_err(|e| anyhow!("failed to parse field {}: {}", path.display(), e))?;
        field.validate()?;
        Ok(field)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec(self)?;
        atomic_write_bytes(path, &bytes)
    }
}
