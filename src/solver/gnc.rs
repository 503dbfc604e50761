//! Graduated non-convexity wrapper around the NLLS optimizer.
//!
//! Wraps the configured solver with a Geman-McClure robust cost, relaxed by
//! a continuation parameter `mu`. Factors declared known inliers (the
//! odometry spine) keep unit weight throughout; every other factor's
//! information matrix is scaled by its current weight each outer iteration:
//!
//! ```text
//! w_k = ( mu*c² / (r²_k + mu*c²) )²
//! ```
//!
//! `mu` starts from the worst residual and is divided by a fixed factor
//! until it reaches 1, at which point the surrogate equals the true robust
//! cost. The final per-factor weight vector is surfaced to callers so
//! operators can inspect which loop closures were annealed away.

use std::collections::BTreeMap;

use log::debug;

use super::optimizer::{factor_errors, OptimizationOutcome, Optimizer};
use crate::core::types::{Key, Pose3D};
use crate::graph::Factor;

const MU_UPDATE_FACTOR: f64 = 1.4;
const MAX_OUTER_ITERATIONS: u32 = 100;

/// Outcome of a GNC-wrapped optimization.
#[derive(Debug, Clone)]
pub struct GncResult {
    /// Outcome of the final inner optimization.
    pub outcome: OptimizationOutcome,
    /// Final per-factor weights, parallel to the factor set.
    pub weights: Vec<f64>,
    /// Outer (continuation) iterations performed.
    pub outer_iterations: u32,
}

/// Run GNC over `values`/`factors` with the given inner optimizer.
///
/// `known_inliers[k]` pins factor `k` at unit weight (odometry and priors).
/// `inlier_cost_threshold` is the chi-squared value below which a residual
/// is considered inlying (`c²`).
pub fn optimize_with_gnc(
    optimizer: &Optimizer,
    values: &mut BTreeMap<Key, Pose3D>,
    factors: &[Factor],
    known_inliers: &[bool],
    inlier_cost_threshold: f64,
) -> GncResult {
    debug_assert_eq!(known_inliers.len(), factors.len());
    let barc2 = inlier_cost_threshold.max(1e-9);
    let mut weights = vec![1.0; factors.len()];

    // Initialize the continuation parameter from the worst residual at the
    // current estimate.
    let errors = factor_errors(values, factors);
    let max_error = errors
        .iter()
        .zip(known_inliers)
        .filter(|(_, inlier)| !**inlier)
        .map(|(e, _)| *e)
        .fold(0.0_f64, f64::max);
    let mut mu = (2.0 * max_error / barc2).max(1.0);

    let mut outcome = optimizer.optimize(values, factors, Some(&weights));
    let mut outer_iterations = 0;

    while mu > 1.0 && outer_iterations < MAX_OUTER_ITERATIONS {
        outer_iterations += 1;

        let errors = factor_errors(values, factors);
        for (k, error) in errors.iter().enumerate() {
            if known_inliers[k] {
                continue;
            }
            let denominator = error + mu * barc2;
            weights[k] = if denominator > 0.0 {
                let w = (mu * barc2) / denominator;
                w * w
            } else {
                1.0
            };
        }

        outcome = optimizer.optimize(values, factors, Some(&weights));
        mu = (mu / MU_UPDATE_FACTOR).max(1.0);
        if (mu - 1.0).abs() < f64::EPSILON {
            // One final solve at the true robust cost.
            let errors = factor_errors(values, factors);
            for (k, error) in errors.iter().enumerate() {
                if known_inliers[k] {
                    continue;
                }
                let denominator = error + barc2;
                weights[k] = if denominator > 0.0 {
                    let w = barc2 / denominator;
                    w * w
                } else {
                    1.0
                };
            }
            outcome = optimizer.optimize(values, factors, Some(&weights));
            break;
        }
    }

    debug!(
        "GNC finished after {} outer iterations, final error {:.3e}",
        outer_iterations, outcome.final_error
    );

    GncResult {
        outcome,
        weights,
        outer_iterations,
    }
}
