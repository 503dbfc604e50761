//! 3D point clouds for keyed scans.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use super::Pose3D;

/// A 3D point in meters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point3D {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point3D {
    #[inline]
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    #[inline]
    pub fn to_vector(&self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.z)
    }

    #[inline]
    pub fn from_vector(v: &Vector3<f64>) -> Self {
        Self::new(v.x, v.y, v.z)
    }

    /// Squared distance to another point.
    #[inline]
    pub fn distance_squared(&self, other: &Point3D) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        dx * dx + dy * dy + dz * dz
    }
}

/// A point cloud attached to a keyframe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointCloud3D {
    pub points: Vec<Point3D>,
}

impl PointCloud3D {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            points: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn push(&mut self, point: Point3D) {
        self.points.push(point);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Point3D> {
        self.points.iter()
    }

    /// Transform all points by a pose (local frame → global frame).
    pub fn transform(&self, pose: &Pose3D) -> PointCloud3D {
        PointCloud3D {
            points: self
                .points
                .iter()
                .map(|p| Point3D::from_vector(&pose.transform_point(&p.to_vector())))
                .collect(),
        }
    }

    /// Centroid of the cloud, or the origin when empty.
    pub fn centroid(&self) -> Vector3<f64> {
        if self.points.is_empty() {
            return Vector3::zeros();
        }
        let sum = self
            .points
            .iter()
            .fold(Vector3::zeros(), |acc, p| acc + p.to_vector());
        sum / self.points.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_transform_translates_points() {
        let mut cloud = PointCloud3D::new();
        cloud.push(Point3D::new(1.0, 0.0, 0.0));
        cloud.push(Point3D::new(0.0, 1.0, 0.0));

        let moved = cloud.transform(&Pose3D::from_translation(0.0, 0.0, 2.0));
        assert_relative_eq!(moved.points[0].z, 2.0);
        assert_relative_eq!(moved.points[1].z, 2.0);
        assert_relative_eq!(moved.points[0].x, 1.0);
    }

    #[test]
    fn test_centroid() {
        let mut cloud = PointCloud3D::new();
        cloud.push(Point3D::new(0.0, 0.0, 0.0));
        cloud.push(Point3D::new(2.0, 4.0, 6.0));
        let c = cloud.centroid();
        assert_relative_eq!(c.x, 1.0);
        assert_relative_eq!(c.y, 2.0);
        assert_relative_eq!(c.z, 3.0);
    }

    #[test]
    fn test_empty_centroid_is_origin() {
        assert_relative_eq!(PointCloud3D::new().centroid().norm(), 0.0);
    }
}
