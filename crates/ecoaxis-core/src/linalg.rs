//! Small dense symmetric matrices on top of `nalgebra`: eigenvalue clipping
//! to the nearest valid correlation matrix and Cholesky factorization.
//!
//! On disk a matrix is `{ "n": .., "data": [row-major] }`.

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use serde::{Deserialize, Serialize};

use crate::error::{EcoaxisError, Result};

/// Smallest eigenvalue allowed after clipping.
pub const DEFAULT_PSD_FLOOR: f64 = 1e-6;

/// Square symmetric matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "StoredMatrix", try_from = "StoredMatrix")]
pub struct SymMatrix(DMatrix<f64>);

#[derive(Serialize, Deserialize)]
struct StoredMatrix {
    n: usize,
    data: Vec<f64>,
}

impl From<SymMatrix> for StoredMatrix {
    fn from(m: SymMatrix) -> Self {
        let n = m.dim();
        let data = (0..n)
            .flat_map(|i| (0..n).map(move |j| (i, j)))
            .map(|(i, j)| m.0[(i, j)])
            .collect();
        Self { n, data }
    }
}

impl TryFrom<StoredMatrix> for SymMatrix {
    type Error = String;

    fn try_from(s: StoredMatrix) -> std::result::Result<Self, Self::Error> {
        if s.data.len() != s.n * s.n {
            return Err(format!(
                "matrix of dimension {} has {} entries",
                s.n,
                s.data.len()
            ));
        }
        Ok(Self(DMatrix::from_row_slice(s.n, s.n, &s.data)))
    }
}

impl SymMatrix {
    pub fn identity(n: usize) -> Self {
        Self(DMatrix::identity(n, n))
    }

    /// Build from rows; fails unless square and symmetric within `1e-9`.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let n = rows.len();
        if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != n) {
            return Err(EcoaxisError::MalformedArtifact(format!(
                "matrix row {i} has {} entries, expected {n}",
                row.len()
            )));
        }
        let m = Self(DMatrix::from_fn(n, n, |i, j| rows[i][j]));
        if !m.is_symmetric(1e-9) {
            return Err(EcoaxisError::MalformedArtifact(
                "matrix is not symmetric".to_string(),
            ));
        }
        Ok(m)
    }

    pub fn dim(&self) -> usize {
        self.0.nrows()
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.0[(i, j)]
    }

    /// Set `(i, j)` and `(j, i)`.
    pub fn set_sym(&mut self, i: usize, j: usize, v: f64) {
        self.0[(i, j)] = v;
        self.0[(j, i)] = v;
    }

    pub fn as_matrix(&self) -> &DMatrix<f64> {
        &self.0
    }

    pub fn is_symmetric(&self, tol: f64) -> bool {
        let n = self.dim();
        self.0.iter().all(|v| v.is_finite())
            && (0..n).all(|i| ((i + 1)..n).all(|j| (self.0[(i, j)] - self.0[(j, i)]).abs() <= tol))
    }

    pub fn min_eigenvalue(&self) -> f64 {
        SymmetricEigen::new(self.0.clone()).eigenvalues.min()
    }

    /// Clip eigenvalues below `floor`, reconstruct, and rescale to a unit
    /// diagonal. Returns the corrected matrix and whether clipping happened.
    pub fn clip_to_correlation(&self, floor: f64) -> (Self, bool) {
        let eigen = SymmetricEigen::new(self.0.clone());
        if eigen.eigenvalues.iter().all(|&l| l >= floor) {
            return (self.clone(), false);
        }

        let clipped = eigen.eigenvalues.map(|l| l.max(floor));
        let q = &eigen.eigenvectors;
        let rebuilt = q * DMatrix::from_diagonal(&clipped) * q.transpose();

        let n = self.dim();
        let scale: Vec<f64> = (0..n).map(|i| rebuilt[(i, i)].max(floor).sqrt()).collect();
        let mut out = Self::identity(n);
        for i in 0..n {
            for j in (i + 1)..n {
                let avg = 0.5 * (rebuilt[(i, j)] + rebuilt[(j, i)]);
                out.set_sym(i, j, (avg / (scale[i] * scale[j])).clamp(-1.0, 1.0));
            }
        }
        (out, true)
    }

    /// Lower-triangular `L` with `self = L Lᵀ`.
    pub fn cholesky(&self) -> Result<Cholesky> {
        let chol = nalgebra::Cholesky::new(self.0.clone()).ok_or_else(|| {
            EcoaxisError::NumericalInstability("matrix not positive definite".to_string())
        })?;
        let l = chol.l();
        if let Some(i) = (0..l.nrows()).find(|&i| !(l[(i, i)] > 0.0 && l[(i, i)].is_finite())) {
            return Err(EcoaxisError::NumericalInstability(format!(
                "matrix not positive definite (pivot {i} = {:.3e})",
                l[(i, i)]
            )));
        }
        Ok(Cholesky { l })
    }
}

/// Lower-triangular Cholesky factor.
#[derive(Debug, Clone, PartialEq)]
pub struct Cholesky {
    l: DMatrix<f64>,
}

impl Cholesky {
    pub fn dim(&self) -> usize {
        self.l.nrows()
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.l[(i, j)]
    }

    /// `out = L z`.
    pub fn mul_into(&self, z: &DVector<f64>, out: &mut DVector<f64>) {
        self.l.mul_to(z, out);
    }

    /// `ln |L Lᵀ|`.
    pub fn log_det(&self) -> f64 {
        2.0 * self.l.diagonal().iter().map(|d| d.ln()).sum::<f64>()
    }

    /// `zᵀ (L Lᵀ)⁻¹ z` via forward substitution.
    pub fn quad_form_inv(&self, z: &DVector<f64>) -> f64 {
        let mut y = z.clone();
        self.l.solve_lower_triangular_unchecked_mut(&mut y);
        y.norm_squared()
    }
}
