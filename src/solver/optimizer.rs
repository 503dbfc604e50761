//! Non-linear least-squares optimization over SE(3) pose graphs.
//!
//! Minimizes
//!
//! ```text
//! F(x) = Σ r(xi, xj, zij)^T * Ωij * r(xi, xj, zij)
//! ```
//!
//! where `r` is the tangent-space residual of a factor and `Ωij` its
//! information matrix. Gauss-Newton iteratively solves `H Δx = -b`;
//! Levenberg-Marquardt adds diagonal damping adapted per iteration.
//!
//! Residuals:
//! - prior:   `r = log(Z⁻¹ ⊕ X)`
//! - between: `r = log(Z⁻¹ ⊕ Xi⁻¹ ⊕ Xj)` with the small-residual Jacobians
//!   `Jj ≈ I`, `Ji ≈ -Ad(Xj⁻¹ ⊕ Xi)`
//! - range:   `r = ‖tj − ti‖ − z` acting on the translation block only

use std::collections::{BTreeMap, HashMap};

use nalgebra::{DMatrix, DVector, Matrix6, RowVector6, Vector6};

use crate::config::{OptimizerConfig, SolverKind};
use crate::core::types::{Key, Pose3D};
use crate::graph::{Factor, Measurement};

/// Result of a graph optimization.
#[derive(Debug, Clone)]
pub struct OptimizationOutcome {
    /// Number of iterations performed.
    pub iterations: u32,
    /// Initial chi-squared error.
    pub initial_error: f64,
    /// Final chi-squared error.
    pub final_error: f64,
    /// Whether the optimization converged.
    pub converged: bool,
    /// Reason for termination.
    pub termination_reason: TerminationReason,
}

/// Reason for optimization termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Error change fell below the convergence threshold.
    Converged,
    /// Maximum iterations reached.
    MaxIterations,
    /// Error kept increasing.
    Diverged,
    /// Linear system solve failed.
    SolveFailed,
    /// Nothing to optimize.
    NoFactors,
}

/// Linearized factor with a precomputed information matrix.
enum LinFactor {
    Pose {
        i: usize,
        j: usize,
        is_prior: bool,
        measurement: Pose3D,
        information: Matrix6<f64>,
    },
    Range {
        i: usize,
        j: usize,
        range: f64,
        information: f64,
    },
}

/// Gauss-Newton / Levenberg-Marquardt pose-graph optimizer.
pub struct Optimizer {
    kind: SolverKind,
    config: OptimizerConfig,
}

impl Optimizer {
    pub fn new(kind: SolverKind, config: OptimizerConfig) -> Self {
        Self { kind, config }
    }

    /// Optimize `values` in place against `factors`.
    ///
    /// `weights`, when given, scales each factor's information matrix (used
    /// by the GNC wrapper); it must be parallel to `factors`.
    pub fn optimize(
        &self,
        values: &mut BTreeMap<Key, Pose3D>,
        factors: &[Factor],
        weights: Option<&[f64]>,
    ) -> OptimizationOutcome {
        if factors.is_empty() || values.is_empty() {
            return OptimizationOutcome {
                iterations: 0,
                initial_error: 0.0,
                final_error: 0.0,
                converged: true,
                termination_reason: TerminationReason::NoFactors,
            };
        }

        let keys: Vec<Key> = values.keys().copied().collect();
        let index: HashMap<Key, usize> = keys.iter().enumerate().map(|(i, k)| (*k, i)).collect();
        let lin = linearize_factors(factors, weights, &index);
        let dim = keys.len() * 6;

        let mut poses: Vec<Pose3D> = keys.iter().map(|k| values[k]).collect();
        let initial_error = chi_squared(&poses, &lin);
        let mut current_error = initial_error;

        let use_lm = self.kind == SolverKind::LevenbergMarquardt;
        let mut lambda = self.config.damping_factor;
        let mut iterations = 0;
        let mut reason = TerminationReason::MaxIterations;
        let mut converged = false;

        for iter in 0..self.config.max_iterations {
            iterations = iter + 1;

            let (mut h, b) = build_linear_system(&poses, &lin, dim);
            if use_lm {
                for d in 0..dim {
                    h[(d, d)] += lambda * h[(d, d)].max(1.0);
                }
            }

            let dx = match h.cholesky() {
                Some(chol) => -chol.solve(&b),
                None => {
                    reason = TerminationReason::SolveFailed;
                    break;
                }
            };

            let previous = poses.clone();
            apply_update(&mut poses, &dx);
            let new_error = chi_squared(&poses, &lin);

            if new_error > current_error * 1.1 {
                poses = previous;
                if use_lm {
                    lambda *= 10.0;
                    if lambda > 1e10 {
                        reason = TerminationReason::Diverged;
                        break;
                    }
                    continue;
                }
                reason = TerminationReason::Diverged;
                break;
            }

            if use_lm {
                lambda = (lambda * 0.1).max(1e-12);
            }

            let relative_change = (current_error - new_error).abs() / current_error.max(1e-12);
            current_error = new_error;

            if relative_change < self.config.convergence_threshold
                || relative_change < self.config.min_improvement
            {
                converged = true;
                reason = TerminationReason::Converged;
                break;
            }
        }

        if reason == TerminationReason::MaxIterations {
            log::debug!("optimizer hit max iterations at error {current_error:.3e}");
        }

        for (key, pose) in keys.iter().zip(poses.iter()) {
            values.insert(*key, *pose);
        }

        OptimizationOutcome {
            iterations,
            initial_error,
            final_error: current_error,
            converged,
            termination_reason: reason,
        }
    }
}

/// Chi-squared cost of a value assignment against a factor set.
///
/// Used by the loop-closure sanity check to compare pre- and post-closure
/// costs without running the optimizer.
pub fn graph_cost(values: &BTreeMap<Key, Pose3D>, factors: &[Factor]) -> f64 {
    let keys: Vec<Key> = values.keys().copied().collect();
    let index: HashMap<Key, usize> = keys.iter().enumerate().map(|(i, k)| (*k, i)).collect();
    let lin = linearize_factors(factors, None, &index);
    let poses: Vec<Pose3D> = keys.iter().map(|k| values[k]).collect();
    chi_squared(&poses, &lin)
}

/// Per-factor chi-squared errors at the given values.
///
/// Parallel to `factors`; a factor whose keys are missing or whose
/// covariance is singular contributes zero.
pub fn factor_errors(values: &BTreeMap<Key, Pose3D>, factors: &[Factor]) -> Vec<f64> {
    factors
        .iter()
        .map(|factor| {
            let (Some(xi), Some(xj)) = (values.get(&factor.key_from), values.get(&factor.key_to))
            else {
                return 0.0;
            };
            match &factor.measurement {
                Measurement::Pose(m) => {
                    let r = if factor.key_from == factor.key_to {
                        m.transform.inverse().compose(xi).log()
                    } else {
                        m.transform.inverse().compose(&xi.between(xj)).log()
                    };
                    match m.covariance.information() {
                        Ok(info) => r.dot(&(info * r)),
                        Err(_) => 0.0,
                    }
                }
                Measurement::Range(m) => {
                    if m.variance <= 0.0 {
                        return 0.0;
                    }
                    let r = (xj.translation - xi.translation).norm() - m.range;
                    r * r / m.variance
                }
            }
        })
        .collect()
}

fn linearize_factors(
    factors: &[Factor],
    weights: Option<&[f64]>,
    index: &HashMap<Key, usize>,
) -> Vec<LinFactor> {
    let mut lin = Vec::with_capacity(factors.len());
    for (fi, factor) in factors.iter().enumerate() {
        let (Some(&i), Some(&j)) = (index.get(&factor.key_from), index.get(&factor.key_to))
        else {
            continue;
        };
        let weight = weights.and_then(|w| w.get(fi).copied()).unwrap_or(1.0);
        if weight <= 0.0 {
            continue;
        }
        match &factor.measurement {
            Measurement::Pose(m) => {
                // Singular covariances drop the factor rather than abort the
                // whole solve; the PCM stage already rejects them upstream.
                let Ok(information) = m.covariance.information() else {
                    log::warn!(
                        "dropping factor {} -> {} with singular covariance",
                        factor.key_from,
                        factor.key_to
                    );
                    continue;
                };
                lin.push(LinFactor::Pose {
                    i,
                    j,
                    is_prior: i == j,
                    measurement: m.transform,
                    information: information * weight,
                });
            }
            Measurement::Range(m) => {
                if m.variance <= 0.0 {
                    continue;
                }
                lin.push(LinFactor::Range {
                    i,
                    j,
                    range: m.range,
                    information: weight / m.variance,
                });
            }
        }
    }
    lin
}

fn pose_residual(poses: &[Pose3D], i: usize, j: usize, is_prior: bool, z: &Pose3D) -> Vector6<f64> {
    if is_prior {
        z.inverse().compose(&poses[i]).log()
    } else {
        z.inverse().compose(&poses[i].between(&poses[j])).log()
    }
}

fn range_residual(poses: &[Pose3D], i: usize, j: usize, range: f64) -> f64 {
    (poses[j].translation - poses[i].translation).norm() - range
}

fn chi_squared(poses: &[Pose3D], lin: &[LinFactor]) -> f64 {
    let mut chi2 = 0.0;
    for factor in lin {
        match factor {
            LinFactor::Pose {
                i,
                j,
                is_prior,
                measurement,
                information,
            } => {
                let r = pose_residual(poses, *i, *j, *is_prior, measurement);
                chi2 += r.dot(&(information * r));
            }
            LinFactor::Range {
                i,
                j,
                range,
                information,
            } => {
                let r = range_residual(poses, *i, *j, *range);
                chi2 += r * r * information;
            }
        }
    }
    chi2
}

fn build_linear_system(
    poses: &[Pose3D],
    lin: &[LinFactor],
    dim: usize,
) -> (DMatrix<f64>, DVector<f64>) {
    let mut h = DMatrix::zeros(dim, dim);
    let mut b = DVector::zeros(dim);

    for factor in lin {
        match factor {
            LinFactor::Pose {
                i,
                j,
                is_prior,
                measurement,
                information,
            } => {
                let r = pose_residual(poses, *i, *j, *is_prior, measurement);
                if *is_prior {
                    // J = I at the anchored key.
                    add_block(&mut h, *i, *i, information);
                    add_segment(&mut b, *i, &(information * r));
                } else {
                    let ji = -(poses[*j].between(&poses[*i])).adjoint();
                    let h_ii = ji.transpose() * information * ji;
                    let h_ij = ji.transpose() * information;
                    let h_jj = *information;
                    add_block(&mut h, *i, *i, &h_ii);
                    add_block(&mut h, *i, *j, &h_ij);
                    add_block(&mut h, *j, *i, &h_ij.transpose());
                    add_block(&mut h, *j, *j, &h_jj);
                    add_segment(&mut b, *i, &(ji.transpose() * information * r));
                    add_segment(&mut b, *j, &(information * r));
                }
            }
            LinFactor::Range {
                i,
                j,
                range,
                information,
            } => {
                let delta = poses[*j].translation - poses[*i].translation;
                let norm = delta.norm();
                if norm < 1e-9 {
                    continue;
                }
                let unit = delta / norm;
                let r = norm - range;
                let ri = poses[*i].rotation.to_rotation_matrix();
                let rj = poses[*j].rotation.to_rotation_matrix();
                let di = -(unit.transpose() * ri.matrix());
                let dj = unit.transpose() * rj.matrix();
                let mut jac_i = RowVector6::zeros();
                let mut jac_j = RowVector6::zeros();
                jac_i.fixed_columns_mut::<3>(0).copy_from(&di);
                jac_j.fixed_columns_mut::<3>(0).copy_from(&dj);

                let h_ii = jac_i.transpose() * *information * jac_i;
                let h_ij = jac_i.transpose() * *information * jac_j;
                let h_jj = jac_j.transpose() * *information * jac_j;
                add_block(&mut h, *i, *i, &h_ii);
                add_block(&mut h, *i, *j, &h_ij);
                add_block(&mut h, *j, *i, &h_ij.transpose());
                add_block(&mut h, *j, *j, &h_jj);
                add_segment(&mut b, *i, &(jac_i.transpose() * (*information * r)));
                add_segment(&mut b, *j, &(jac_j.transpose() * (*information * r)));
            }
        }
    }

    (h, b)
}

fn add_block(h: &mut DMatrix<f64>, bi: usize, bj: usize, block: &Matrix6<f64>) {
    for r in 0..6 {
        for c in 0..6 {
            h[(bi * 6 + r, bj * 6 + c)] += block[(r, c)];
        }
    }
}

fn add_segment(b: &mut DVector<f64>, bi: usize, seg: &Vector6<f64>) {
    for r in 0..6 {
        b[bi * 6 + r] += seg[r];
    }
}

fn apply_update(poses: &mut [Pose3D], dx: &DVector<f64>) {
    for (idx, pose) in poses.iter_mut().enumerate() {
        let xi = Vector6::from_iterator((0..6).map(|r| dx[idx * 6 + r]));
        *pose = pose.retract(&xi);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Covariance6;
    use approx::assert_relative_eq;

    fn lm() -> Optimizer {
        Optimizer::new(SolverKind::LevenbergMarquardt, OptimizerConfig::default())
    }

    fn tight() -> Covariance6 {
        Covariance6::from_sigmas(0.01, 0.01)
    }

    #[test]
    fn test_empty_graph_is_noop() {
        let mut values = BTreeMap::new();
        let outcome = lm().optimize(&mut values, &[], None);
        assert!(outcome.converged);
        assert_eq!(outcome.termination_reason, TerminationReason::NoFactors);
    }

    #[test]
    fn test_prior_pulls_pose() {
        let key = Key::new('a', 0);
        let mut values = BTreeMap::new();
        values.insert(key, Pose3D::from_translation(0.3, -0.2, 0.1));
        let factors = vec![Factor::prior(key, Pose3D::identity(), tight())];

        let outcome = lm().optimize(&mut values, &factors, None);
        assert!(outcome.converged);
        assert!(values[&key].translation.norm() < 1e-6);
    }

    #[test]
    fn test_two_pose_chain() {
        let k0 = Key::new('a', 0);
        let k1 = Key::new('a', 1);
        let mut values = BTreeMap::new();
        values.insert(k0, Pose3D::identity());
        values.insert(k1, Pose3D::from_translation(0.9, 0.1, 0.0));
        let factors = vec![
            Factor::prior(k0, Pose3D::identity(), tight()),
            Factor::odometry(k0, k1, Pose3D::from_translation(1.0, 0.0, 0.0), tight()),
        ];

        let outcome = lm().optimize(&mut values, &factors, None);
        assert!(outcome.converged);
        assert_relative_eq!(values[&k1].translation.x, 1.0, epsilon = 1e-6);
        assert_relative_eq!(values[&k1].translation.y, 0.0, epsilon = 1e-6);
        assert!(outcome.final_error < 1e-9);
    }

    #[test]
    fn test_loop_closure_distributes_error() {
        // Square of four 1m edges; odometry overshoots, the loop closure
        // pins the ends together.
        let keys: Vec<Key> = (0..4).map(|i| Key::new('a', i)).collect();
        let mut values = BTreeMap::new();
        values.insert(keys[0], Pose3D::identity());
        values.insert(keys[1], Pose3D::from_translation(1.05, 0.0, 0.0));
        values.insert(keys[2], Pose3D::from_translation(1.05, 1.05, 0.0));
        values.insert(keys[3], Pose3D::from_translation(0.0, 1.1, 0.0));

        let step = |x: f64, y: f64, yaw: f64| Pose3D::from_xyz_rpy(x, y, 0.0, 0.0, 0.0, yaw);
        let factors = vec![
            Factor::prior(keys[0], Pose3D::identity(), tight()),
            Factor::odometry(keys[0], keys[1], step(1.0, 0.0, 0.0), tight()),
            Factor::odometry(keys[1], keys[2], step(0.0, 1.0, 0.0), tight()),
            Factor::odometry(keys[2], keys[3], step(-1.0, 0.0, 0.0), tight()),
            Factor::loop_closure(keys[3], keys[0], step(0.0, -1.0, 0.0), tight()),
        ];

        let outcome = lm().optimize(&mut values, &factors, None);
        assert!(outcome.converged);
        assert!(outcome.final_error < outcome.initial_error);
        // Closing the loop puts a3 within a millimeter of (0, 1, 0).
        assert_relative_eq!(values[&keys[3]].translation.x, 0.0, epsilon = 1e-3);
        assert_relative_eq!(values[&keys[3]].translation.y, 1.0, epsilon = 1e-3);
    }

    #[test]
    fn test_range_factor_adjusts_distance() {
        let k0 = Key::new('a', 0);
        let anchor = Key::new('U', 0);
        let mut values = BTreeMap::new();
        values.insert(k0, Pose3D::identity());
        values.insert(anchor, Pose3D::from_translation(4.5, 0.0, 0.0));
        let factors = vec![
            Factor::prior(k0, Pose3D::identity(), tight()),
            Factor::uwb_range(k0, anchor, 5.0, 0.01),
        ];

        let outcome = lm().optimize(&mut values, &factors, None);
        assert!(outcome.converged);
        let distance = (values[&anchor].translation - values[&k0].translation).norm();
        assert_relative_eq!(distance, 5.0, epsilon = 1e-4);
    }

    #[test]
    fn test_zero_weight_disables_factor() {
        let k0 = Key::new('a', 0);
        let k1 = Key::new('a', 1);
        let mut values = BTreeMap::new();
        values.insert(k0, Pose3D::identity());
        values.insert(k1, Pose3D::from_translation(1.0, 0.0, 0.0));
        let factors = vec![
            Factor::prior(k0, Pose3D::identity(), tight()),
            Factor::odometry(k0, k1, Pose3D::from_translation(1.0, 0.0, 0.0), tight()),
            // A wildly wrong loop closure, weighted out.
            Factor::loop_closure(k1, k0, Pose3D::from_translation(10.0, 0.0, 0.0), tight()),
        ];
        let weights = vec![1.0, 1.0, 0.0];

        let outcome = lm().optimize(&mut values, &factors, Some(&weights));
        assert!(outcome.converged);
        assert_relative_eq!(values[&k1].translation.x, 1.0, epsilon = 1e-6);
    }
}
