//! Point-to-point ICP registration for keyed scans.
//!
//! Classic ICP aligning a source cloud to a target cloud from an odometric
//! initial guess:
//!
//! ```text
//! 1. Transform source by the current estimate
//! 2. For each iteration:
//!    a. Find nearest neighbors in the target (k-d tree)
//!    b. Compute the optimal rigid transform via SVD (Kabsch)
//!    c. Compose and repeat until the increment falls below tf_epsilon
//! 3. Report transform, fitness, and a Hessian-based covariance
//! ```
//!
//! Fitness is the mean squared correspondence distance at the final
//! alignment, matching the registration fitness the loop-closure gate
//! thresholds against.

use kiddo::SquaredEuclidean;
use nalgebra::{Matrix3, Matrix6, Vector3};

use crate::config::IcpConfig;
use crate::core::types::{skew, Covariance6, PointCloud3D, Pose3D};
use crate::error::{Result, SlamError};

/// K-d tree over 3D points, keyed by index into the owning point cloud.
///
/// Uses a larger-than-default bucket size: the default `kiddo::KdTree` alias
/// caps shared-axis-coordinate points at 32 per bucket and panics beyond
/// that, which real and test point clouds (e.g. axis-aligned wall slabs)
/// routinely exceed.
type KdTree = kiddo::float::kdtree::KdTree<f64, u64, 3, 256, u32>;

/// Result of an ICP registration.
#[derive(Debug, Clone)]
pub struct IcpResult {
    /// Transform mapping source-frame points into the target frame.
    pub transform: Pose3D,
    /// Covariance of the transform, estimated from residual statistics.
    pub covariance: Covariance6,
    /// Mean squared correspondence distance at the final alignment.
    pub fitness: f64,
    /// Whether the increment converged below `tf_epsilon`.
    pub converged: bool,
    /// Iterations performed.
    pub iterations: u32,
}

/// Point-to-point ICP with k-d tree correspondences.
#[derive(Debug, Clone)]
pub struct Icp3D {
    config: IcpConfig,
}

impl Icp3D {
    pub fn new(config: IcpConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &IcpConfig {
        &self.config
    }

    /// Register `source` against `target` starting from `initial_guess`.
    ///
    /// Fails with `IcpFailure` on empty clouds or too few correspondences.
    pub fn register(
        &self,
        source: &PointCloud3D,
        target: &PointCloud3D,
        initial_guess: &Pose3D,
    ) -> Result<IcpResult> {
        if source.is_empty() || target.is_empty() {
            return Err(SlamError::IcpFailure("empty point cloud".into()));
        }

        let tree = build_kdtree(target);
        let mut current = *initial_guess;
        let mut iterations = 0;
        let mut converged = false;
        let mut last_mse = f64::MAX;

        for iter in 0..self.config.max_iterations {
            iterations = iter + 1;

            let correspondences = self.find_correspondences(source, &tree, &current);
            if correspondences.len() < self.config.min_correspondences {
                return Err(SlamError::IcpFailure(format!(
                    "{} correspondences, need {}",
                    correspondences.len(),
                    self.config.min_correspondences
                )));
            }

            let delta = compute_rigid_transform(source, target, &correspondences, &current);
            current = delta.compose(&current);

            let mse = self.mean_squared_error(source, target, &correspondences, &current);
            if delta.translation.norm() < self.config.tf_epsilon
                && delta.rotation_angle() < self.config.tf_epsilon
            {
                converged = true;
                break;
            }
            if mse > last_mse * 1.1 {
                // Diverging; keep the best alignment found so far.
                break;
            }
            last_mse = mse;
        }

        let correspondences = self.find_correspondences(source, &tree, &current);
        if correspondences.len() < self.config.min_correspondences {
            return Err(SlamError::IcpFailure(
                "correspondences lost during refinement".into(),
            ));
        }
        let fitness = self.mean_squared_error(source, target, &correspondences, &current);
        let covariance = estimate_covariance(source, &correspondences, &current, fitness);

        Ok(IcpResult {
            transform: current,
            covariance,
            fitness,
            converged,
            iterations,
        })
    }

    /// Correspondences as `(source_idx, target_idx, squared_distance)`,
    /// gated by the correspondence distance and trimmed by the outlier
    /// ratio. The tighter coarse-rejection threshold applies when it leaves
    /// enough pairs.
    fn find_correspondences(
        &self,
        source: &PointCloud3D,
        tree: &KdTree,
        transform: &Pose3D,
    ) -> Vec<(usize, usize, f64)> {
        let max_dist_sq = self.config.corr_dist * self.config.corr_dist;
        let mut correspondences = Vec::with_capacity(source.len());

        for (i, point) in source.iter().enumerate() {
            let p = transform.transform_point(&point.to_vector());
            let nearest = tree.nearest_one::<SquaredEuclidean>(&[p.x, p.y, p.z]);
            if nearest.distance <= max_dist_sq {
                correspondences.push((i, nearest.item as usize, nearest.distance));
            }
        }

        if self.config.ransac_thresh > 0.0 {
            let tight_sq = self.config.ransac_thresh * self.config.ransac_thresh;
            let tight: Vec<_> = correspondences
                .iter()
                .copied()
                .filter(|&(_, _, d)| d <= tight_sq)
                .collect();
            if tight.len() >= self.config.min_correspondences {
                correspondences = tight;
            }
        }

        if self.config.outlier_ratio > 0.0 && !correspondences.is_empty() {
            correspondences.sort_by(|a, b| a.2.total_cmp(&b.2));
            let keep = ((1.0 - self.config.outlier_ratio) * correspondences.len() as f64) as usize;
            correspondences.truncate(keep.max(self.config.min_correspondences));
        }

        correspondences
    }

    fn mean_squared_error(
        &self,
        source: &PointCloud3D,
        target: &PointCloud3D,
        correspondences: &[(usize, usize, f64)],
        transform: &Pose3D,
    ) -> f64 {
        if correspondences.is_empty() {
            return f64::MAX;
        }
        let sum: f64 = correspondences
            .iter()
            .map(|&(si, ti, _)| {
                let p = transform.transform_point(&source.points[si].to_vector());
                let q = target.points[ti].to_vector();
                (p - q).norm_squared()
            })
            .sum();
        sum / correspondences.len() as f64
    }
}

fn build_kdtree(cloud: &PointCloud3D) -> KdTree {
    let mut tree: KdTree = KdTree::new();
    for (i, point) in cloud.iter().enumerate() {
        tree.add(&[point.x, point.y, point.z], i as u64);
    }
    tree
}

/// Optimal rigid transform between corresponding point sets (Kabsch).
///
/// Returns the delta applied on the left of the current transform.
fn compute_rigid_transform(
    source: &PointCloud3D,
    target: &PointCloud3D,
    correspondences: &[(usize, usize, f64)],
    current: &Pose3D,
) -> Pose3D {
    let n = correspondences.len() as f64;
    let mut source_centroid = Vector3::zeros();
    let mut target_centroid = Vector3::zeros();
    for &(si, ti, _) in correspondences {
        source_centroid += current.transform_point(&source.points[si].to_vector());
        target_centroid += target.points[ti].to_vector();
    }
    source_centroid /= n;
    target_centroid /= n;

    let mut h = Matrix3::zeros();
    for &(si, ti, _) in correspondences {
        let s = current.transform_point(&source.points[si].to_vector()) - source_centroid;
        let t = target.points[ti].to_vector() - target_centroid;
        h += s * t.transpose();
    }

    let svd = h.svd(true, true);
    let u = svd.u.expect("SVD of 3x3 always yields U");
    let v_t = svd.v_t.expect("SVD of 3x3 always yields V^T");
    let mut rotation = v_t.transpose() * u.transpose();
    if rotation.determinant() < 0.0 {
        // Reflection case: flip the axis of least significance.
        let mut d = Matrix3::identity();
        d[(2, 2)] = -1.0;
        rotation = v_t.transpose() * d * u.transpose();
    }

    let translation = target_centroid - rotation * source_centroid;
    let rotation = nalgebra::UnitQuaternion::from_matrix(&rotation);
    Pose3D::new(translation, rotation)
}

/// Covariance from the Gauss-Newton Hessian of the point-to-point cost,
/// scaled by the residual variance. Each aligned point contributes the
/// Jacobian `[I | -[q]x]` of a small world-frame perturbation.
fn estimate_covariance(
    source: &PointCloud3D,
    correspondences: &[(usize, usize, f64)],
    transform: &Pose3D,
    fitness: f64,
) -> Covariance6 {
    let mut hessian = Matrix6::zeros();
    for &(si, _, _) in correspondences {
        let q = transform.transform_point(&source.points[si].to_vector());
        let j_rot = -skew(&q);
        // J^T J assembled blockwise for J = [I | j_rot].
        let mut block = Matrix6::zeros();
        block.fixed_view_mut::<3, 3>(0, 0).copy_from(&Matrix3::identity());
        block.fixed_view_mut::<3, 3>(0, 3).copy_from(&j_rot);
        block
            .fixed_view_mut::<3, 3>(3, 0)
            .copy_from(&j_rot.transpose());
        block
            .fixed_view_mut::<3, 3>(3, 3)
            .copy_from(&(j_rot.transpose() * j_rot));
        hessian += block;
    }

    let sigma2 = fitness.max(1e-8);
    match (sigma2 * hessian.try_inverse().unwrap_or_else(Matrix6::identity)).try_into_covariance() {
        Some(cov) => cov,
        None => Covariance6::from_sigmas(0.1, 0.05),
    }
}

/// Guard against non-finite or indefinite covariance estimates.
trait IntoCovariance {
    fn try_into_covariance(self) -> Option<Covariance6>;
}

impl IntoCovariance for Matrix6<f64> {
    fn try_into_covariance(self) -> Option<Covariance6> {
        if self.iter().all(|v| v.is_finite()) {
            let cov = Covariance6::from_matrix(self);
            cov.is_positive_definite().then_some(cov)
        } else {
            None
        }
    }
}
