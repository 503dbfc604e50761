//! Core foundation layer: graph keys, SE(3) poses, covariances, point clouds.

pub mod types;
