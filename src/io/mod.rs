//! Persistence: g2o text format, ASCII PCD scans, and the zip archive.

pub mod archive;
pub mod g2o;
pub mod pcd;
