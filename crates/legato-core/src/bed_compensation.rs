//! Bed surface compensation.
//!
//! The bed is described by a height offset `Σ M[i][j]·xⁱ·yʲ` for
//! `i, j ∈ 0..3`. Probing fits a plane, which fills `M[0][0]`, `M[1][0]`
//! and `M[0][1]`; the higher terms are available to callers that load a
//! measured surface directly.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BedCompensationError {
    #[error("need at least 3 height samples to fit a plane, got {got}")]
    TooFewSamples { got: usize },
    #[error("height samples are collinear")]
    Collinear,
    #[error("height sample {index} is not finite")]
    NonFinite { index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeightSample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl HeightSample {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BedCompensationMatrix(pub [[f64; 3]; 3]);

impl BedCompensationMatrix {
    /// A flat bed: no offset anywhere.
    pub const FLAT: Self = Self([[0.0; 3]; 3]);

    /// `z = c0 + c1·x + c2·y`
    pub fn plane(c0: f64, c1: f64, c2: f64) -> Self {
        let mut m = [[0.0; 3]; 3];
        m[0][0] = c0;
        m[1][0] = c1;
        m[0][1] = c2;
        Self(m)
    }

    /// Least-squares plane through the measured heights.
    pub fn fit_plane(samples: &[HeightSample]) -> Result<Self, BedCompensationError> {
        if samples.len() < 3 {
            return Err(BedCompensationError::TooFewSamples { got: samples.len() });
        }
        if let Some(index) = samples
            .iter()
            .position(|s| !(s.x.is_finite() && s.y.is_finite() && s.z.is_finite()))
        {
            return Err(BedCompensationError::NonFinite { index });
        }

        // Center the samples so the normal equations stay well conditioned.
        let n = samples.len() as f64;
        let mx = samples.iter().map(|s| s.x).sum::<f64>() / n;
        let my = samples.iter().map(|s| s.y).sum::<f64>() / n;
        let mz = samples.iter().map(|s| s.z).sum::<f64>() / n;

        let (mut sxx, mut sxy, mut syy, mut sxz, mut syz) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for s in samples {
            let (dx, dy, dz) = (s.x - mx, s.y - my, s.z - mz);
            sxx += dx * dx;
            sxy += dx * dy;
            syy += dy * dy;
            sxz += dx * dz;
            syz += dy * dz;
        }

        let det = sxx * syy - sxy * sxy;
        if det <= 1e-12 * (sxx * syy).max(f64::MIN_POSITIVE) {
            return Err(BedCompensationError::Collinear);
        }
        let c1 = (sxz * syy - syz * sxy) / det;
        let c2 = (syz * sxx - sxz * sxy) / det;
        let c0 = mz - c1 * mx - c2 * my;
        Ok(Self::plane(c0, c1, c2))
    }

    pub fn coefficients(&self) -> [[f64; 3]; 3] {
        self.0
    }

    pub fn is_flat(&self) -> bool {
        self.0.iter().flatten().all(|c| *c == 0.0)
    }

    /// Height of the bed surface at `(x, y)`.
    pub fn offset(&self, x: f64, y: f64) -> f64 {
        let xs = [1.0, x, x * x];
        let ys = [1.0, y, y * y];
        let mut z = 0.0;
        for (i, row) in self.0.iter().enumerate() {
            for (j, c) in row.iter().enumerate() {
                z += c * xs[i] * ys[j];
            }
        }
        z
    }

    /// Commanded height to machine height.
    pub fn apply(&self, x: f64, y: f64, z: f64) -> f64 {
        z + self.offset(x, y)
    }

    /// Machine height back to commanded height.
    pub fn remove(&self, x: f64, y: f64, z: f64) -> f64 {
        z - self.offset(x, y)
    }
}
