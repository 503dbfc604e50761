//! Pose-graph store and factor records.
//!
//! ```text
//!    Nodes: keyframe poses + sparse landmarks (artifacts, UWB anchors)
//!
//!    Factors: prior / odometry / between / loop / artifact / uwb_range
//!
//!    [a0] ──odom──▶ [a1] ──odom──▶ [a2] ──odom──▶ [a3]
//!     ▲ │                            │              │
//!     │ └────────── loop ────────────┘          artifact
//!   prior                                           ▼
//!                                                  [A0]
//! ```
//!
//! The store owns everything; the solver borrows it exclusively during an
//! update, and the loop-closure engine shares the keyed scans read-only.

mod factor;
mod msg;
mod store;

pub use factor::{Factor, FactorKind, Measurement, Node, PoseMeasurement, RangeMeasurement};
pub use msg::PoseGraphMsg;
pub use store::{is_odometry_key, PoseGraph};
