//! 6x6 pose covariances.
//!
//! Covariances live in the tangent space of SE(3), ordered translation-first
//! to match [`Pose3D::log`](super::Pose3D::log): `[rho; theta]`.

use nalgebra::{Cholesky, Matrix6, Vector6};
use serde::{Deserialize, Serialize};

use super::Pose3D;
use crate::error::{Result, SlamError};

/// A 6x6 positive-definite covariance over an SE(3) tangent vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Covariance6 {
    /// The covariance matrix.
    pub matrix: Matrix6<f64>,
}

impl Covariance6 {
    /// Wrap an existing matrix.
    #[inline]
    pub fn from_matrix(matrix: Matrix6<f64>) -> Self {
        Self { matrix }
    }

    /// Isotropic diagonal covariance from translation and rotation variances.
    pub fn diagonal(trans_var: f64, rot_var: f64) -> Self {
        let mut m = Matrix6::zeros();
        for i in 0..3 {
            m[(i, i)] = trans_var;
            m[(i + 3, i + 3)] = rot_var;
        }
        Self { matrix: m }
    }

    /// Diagonal covariance from standard deviations.
    pub fn from_sigmas(trans_sigma: f64, rot_sigma: f64) -> Self {
        Self::diagonal(trans_sigma * trans_sigma, rot_sigma * rot_sigma)
    }

    /// Diagonal covariance from precisions (variance = 1 / precision).
    ///
    /// Zero or negative precisions clamp to a very wide variance.
    pub fn from_precisions(trans_precision: f64, rot_precision: f64) -> Self {
        let var = |p: f64| if p > 0.0 { 1.0 / p } else { 1e6 };
        Self::diagonal(var(trans_precision), var(rot_precision))
    }

    /// Per-axis diagonal covariance: `[x, y, z, roll, pitch, yaw]` variances.
    pub fn from_diagonal_vector(d: &Vector6<f64>) -> Self {
        let mut m = Matrix6::zeros();
        for i in 0..6 {
            m[(i, i)] = d[i];
        }
        Self { matrix: m }
    }

    /// Whether the matrix admits a Cholesky factorization.
    pub fn is_positive_definite(&self) -> bool {
        Cholesky::new(self.matrix).is_some()
    }

    /// Information matrix (inverse covariance).
    ///
    /// Fails with `CovarianceNotPositiveDefinite` when the matrix is
    /// singular or indefinite.
    pub fn information(&self) -> Result<Matrix6<f64>> {
        Cholesky::new(self.matrix)
            .map(|c| c.inverse())
            .ok_or(SlamError::CovarianceNotPositiveDefinite)
    }

    /// Mahalanobis distance of a residual under this covariance:
    /// `sqrt(r^T Sigma^-1 r)`.
    pub fn mahalanobis(&self, residual: &Vector6<f64>) -> Result<f64> {
        let chol =
            Cholesky::new(self.matrix).ok_or(SlamError::CovarianceNotPositiveDefinite)?;
        let solved = chol.solve(residual);
        Ok(residual.dot(&solved).max(0.0).sqrt())
    }

    /// Transport this covariance through a frame change:
    /// `Ad(T) Sigma Ad(T)^T`.
    pub fn transported(&self, transform: &Pose3D) -> Covariance6 {
        let ad = transform.adjoint();
        Covariance6 {
            matrix: ad * self.matrix * ad.transpose(),
        }
    }

    /// Covariance of a composed transform `T_acc ⊕ T_step`, where `self` is
    /// the covariance of the accumulated transform and (`step`, `step_cov`)
    /// describe the new increment.
    pub fn compose_with(&self, step: &Pose3D, step_cov: &Covariance6) -> Covariance6 {
        let transported = self.transported(&step.inverse());
        Covariance6 {
            matrix: transported.matrix + step_cov.matrix,
        }
    }

    /// Sum of two covariances (independent residual legs).
    pub fn added(&self, other: &Covariance6) -> Covariance6 {
        Covariance6 {
            matrix: self.matrix + other.matrix,
        }
    }
}

impl Default for Covariance6 {
    fn default() -> Self {
        // 10 cm translation, ~5 degree rotation standard deviation.
        Self::from_sigmas(0.1, 0.087)
    }
}
