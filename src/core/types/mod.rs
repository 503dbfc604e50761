//! Core types shared by every layer of the back-end.

mod covariance;
mod key;
mod pose;
mod scan;
mod timestamped;

pub use covariance::Covariance6;
pub use key::Key;
pub use pose::{skew, Pose3D};
pub use scan::{Point3D, PointCloud3D};
pub use timestamped::{secs_to_us, us_to_secs, Timestamped};
