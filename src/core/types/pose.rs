//! SE(3) rigid-body poses.
//!
//! `Pose3D` is the 6-DoF pose used for keyframes, landmark estimates and
//! relative-pose measurements. Tangent vectors (and 6x6 covariances) are
//! ordered translation-first: `[rho_x, rho_y, rho_z, theta_x, theta_y, theta_z]`.

use nalgebra::{Matrix3, Matrix6, UnitQuaternion, Vector3, Vector6};
use serde::{Deserialize, Serialize};

/// A rigid-body transform in 3D: rotation + translation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose3D {
    /// Translation in meters.
    pub translation: Vector3<f64>,
    /// Rotation as a unit quaternion.
    pub rotation: UnitQuaternion<f64>,
}

impl Pose3D {
    /// Create a pose from translation and rotation.
    #[inline]
    pub fn new(translation: Vector3<f64>, rotation: UnitQuaternion<f64>) -> Self {
        Self {
            translation,
            rotation,
        }
    }

    /// Identity pose at the origin.
    #[inline]
    pub fn identity() -> Self {
        Self {
            translation: Vector3::zeros(),
            rotation: UnitQuaternion::identity(),
        }
    }

    /// Pure translation.
    #[inline]
    pub fn from_translation(x: f64, y: f64, z: f64) -> Self {
        Self {
            translation: Vector3::new(x, y, z),
            rotation: UnitQuaternion::identity(),
        }
    }

    /// Pose from translation and roll/pitch/yaw Euler angles.
    pub fn from_xyz_rpy(x: f64, y: f64, z: f64, roll: f64, pitch: f64, yaw: f64) -> Self {
        Self {
            translation: Vector3::new(x, y, z),
            rotation: UnitQuaternion::from_euler_angles(roll, pitch, yaw),
        }
    }

    /// Compose two poses: `self ⊕ other`.
    #[inline]
    pub fn compose(&self, other: &Pose3D) -> Pose3D {
        Pose3D {
            translation: self.translation + self.rotation * other.translation,
            rotation: self.rotation * other.rotation,
        }
    }

    /// Inverse of this pose.
    #[inline]
    pub fn inverse(&self) -> Pose3D {
        let inv_rot = self.rotation.inverse();
        Pose3D {
            translation: -(inv_rot * self.translation),
            rotation: inv_rot,
        }
    }

    /// Relative transform from `self` to `other`: `self⁻¹ ⊕ other`.
    #[inline]
    pub fn between(&self, other: &Pose3D) -> Pose3D {
        self.inverse().compose(other)
    }

    /// Transform a point from the local frame to the global frame.
    #[inline]
    pub fn transform_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.translation + self.rotation * point
    }

    /// Euclidean distance between the translation parts.
    #[inline]
    pub fn translation_distance(&self, other: &Pose3D) -> f64 {
        (self.translation - other.translation).norm()
    }

    /// Magnitude of the rotation, in radians.
    #[inline]
    pub fn rotation_angle(&self) -> f64 {
        self.rotation.angle()
    }

    /// SE(3) logarithm: tangent vector `[rho; theta]`.
    pub fn log(&self) -> Vector6<f64> {
        let theta = self.rotation.scaled_axis();
        let rho = left_jacobian_inverse(&theta) * self.translation;
        let mut xi = Vector6::zeros();
        xi.fixed_rows_mut::<3>(0).copy_from(&rho);
        xi.fixed_rows_mut::<3>(3).copy_from(&theta);
        xi
    }

    /// SE(3) exponential: pose from a tangent vector `[rho; theta]`.
    pub fn exp(xi: &Vector6<f64>) -> Pose3D {
        let rho = xi.fixed_rows::<3>(0).into_owned();
        let theta = xi.fixed_rows::<3>(3).into_owned();
        Pose3D {
            translation: left_jacobian(&theta) * rho,
            rotation: UnitQuaternion::from_scaled_axis(theta),
        }
    }

    /// Apply a right-side tangent increment: `self ⊕ Exp(xi)`.
    #[inline]
    pub fn retract(&self, xi: &Vector6<f64>) -> Pose3D {
        self.compose(&Pose3D::exp(xi))
    }

    /// Adjoint matrix of this pose, mapping tangent vectors between frames:
    /// `T ⊕ Exp(xi) ⊕ T⁻¹ = Exp(Ad(T) xi)`.
    pub fn adjoint(&self) -> Matrix6<f64> {
        let r = self.rotation.to_rotation_matrix();
        let r = r.matrix();
        let tr = skew(&self.translation) * r;
        let mut ad = Matrix6::zeros();
        ad.fixed_view_mut::<3, 3>(0, 0).copy_from(r);
        ad.fixed_view_mut::<3, 3>(0, 3).copy_from(&tr);
        ad.fixed_view_mut::<3, 3>(3, 3).copy_from(r);
        ad
    }

    /// Interpolate between two poses at `alpha` in `[0, 1]`.
    ///
    /// Linear interpolation of translation, SLERP of rotation.
    pub fn interpolate(a: &Pose3D, b: &Pose3D, alpha: f64) -> Pose3D {
        let alpha = alpha.clamp(0.0, 1.0);
        Pose3D {
            translation: a.translation.lerp(&b.translation, alpha),
            rotation: a
                .rotation
                .try_slerp(&b.rotation, alpha, 1e-9)
                .unwrap_or(a.rotation),
        }
    }
}

impl Default for Pose3D {
    fn default() -> Self {
        Self::identity()
    }
}

/// Skew-symmetric matrix of a 3-vector.
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// SO(3) left Jacobian, relating translation and rotation in the SE(3)
/// exponential.
fn left_jacobian(theta: &Vector3<f64>) -> Matrix3<f64> {
    let angle = theta.norm();
    let k = skew(theta);
    if angle < 1e-9 {
        return Matrix3::identity() + 0.5 * k;
    }
    let a2 = angle * angle;
    Matrix3::identity()
        + ((1.0 - angle.cos()) / a2) * k
        + ((angle - angle.sin()) / (a2 * angle)) * (k * k)
}

/// Inverse of the SO(3) left Jacobian.
fn left_jacobian_inverse(theta: &Vector3<f64>) -> Matrix3<f64> {
    let angle = theta.norm();
    let k = skew(theta);
    if angle < 1e-9 {
        return Matrix3::identity() - 0.5 * k;
    }
    let half = 0.5 * angle;
    let cot_half = half.cos() / half.sin();
    Matrix3::identity() - 0.5 * k + ((1.0 / (angle * angle)) - cot_half / (2.0 * angle)) * (k * k)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_compose_identity() {
        let pose = Pose3D::from_xyz_rpy(1.0, 2.0, 3.0, 0.1, 0.2, 0.3);
        let composed = pose.compose(&Pose3D::identity());
        assert_relative_eq!(composed.translation, pose.translation, epsilon = 1e-12);
        assert_relative_eq!(
            composed.rotation.angle_to(&pose.rotation),
            0.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_inverse_cancels() {
        let pose = Pose3D::from_xyz_rpy(1.0, -0.5, 0.2, 0.3, -0.1, 1.2);
        let result = pose.compose(&pose.inverse());
        assert_relative_eq!(result.translation.norm(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(result.rotation.angle(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_between() {
        let a = Pose3D::from_translation(1.0, 0.0, 0.0);
        let b = Pose3D::from_translation(2.0, 1.0, 0.0);
        let delta = a.between(&b);
        assert_relative_eq!(delta.translation.x, 1.0, epsilon = 1e-12);
        assert_relative_eq!(delta.translation.y, 1.0, epsilon = 1e-12);
        assert_relative_eq!(a.compose(&delta).translation, b.translation, epsilon = 1e-12);
    }

    #[test]
    fn test_log_exp_roundtrip() {
        let pose = Pose3D::from_xyz_rpy(0.5, -1.0, 2.0, 0.2, 0.4, -0.6);
        let xi = pose.log();
        let back = Pose3D::exp(&xi);
        assert_relative_eq!(back.translation, pose.translation, epsilon = 1e-9);
        assert_relative_eq!(back.rotation.angle_to(&pose.rotation), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_log_of_identity_is_zero() {
        assert_relative_eq!(Pose3D::identity().log().norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_rotation_moves_translation_in_compose() {
        // Quarter turn about z then advance 1m in local x lands on +y.
        let turn = Pose3D::from_xyz_rpy(0.0, 0.0, 0.0, 0.0, 0.0, FRAC_PI_2);
        let step = Pose3D::from_translation(1.0, 0.0, 0.0);
        let result = turn.compose(&step);
        assert_relative_eq!(result.translation.x, 0.0, epsilon = 1e-12);
        assert_relative_eq!(result.translation.y, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_adjoint_transports_tangent() {
        let pose = Pose3D::from_xyz_rpy(1.0, 0.5, -0.3, 0.1, -0.2, 0.3);
        let xi = Vector6::new(0.01, -0.02, 0.03, 0.004, 0.005, -0.006);
        let lhs = pose.compose(&Pose3D::exp(&xi)).compose(&pose.inverse());
        let rhs = Pose3D::exp(&(pose.adjoint() * xi));
        assert_relative_eq!(lhs.translation, rhs.translation, epsilon = 1e-9);
        assert_relative_eq!(lhs.rotation.angle_to(&rhs.rotation), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_interpolate_midpoint() {
        let a = Pose3D::from_translation(0.0, 0.0, 0.0);
        let b = Pose3D::from_xyz_rpy(2.0, 0.0, 0.0, 0.0, 0.0, 1.0);
        let mid = Pose3D::interpolate(&a, &b, 0.5);
        assert_relative_eq!(mid.translation.x, 1.0, epsilon = 1e-12);
        assert_relative_eq!(mid.rotation.angle(), 0.5, epsilon = 1e-9);
    }
}
