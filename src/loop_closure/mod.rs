//! Loop-closure detection.
//!
//! # Pipeline
//!
//! 1. **Keyframe gating**: admit a pose key once accumulated motion exceeds
//!    the configured thresholds (or an explicit gate fires).
//! 2. **Candidate generation**: proximity search over the current estimate,
//!    skipping recent poses and respecting re-closing spacing.
//! 3. **Registration**: point-to-point ICP between keyed scans, seeded from
//!    the odometric relative pose.
//! 4. **Sanity checks**: fitness gate, translational drift gate, and a
//!    cost-regression margin applied by the estimate task after the solver
//!    runs.
//! 5. **Submission**: surviving candidates become loop factors for the
//!    robust solver, which applies PCM.

mod engine;
mod icp;

pub use engine::{KeyframeStatus, LoopClosureEngine};
pub use icp::{Icp3D, IcpResult};
