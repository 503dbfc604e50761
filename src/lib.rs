//! SetuSLAM - Multi-robot LiDAR SLAM back-end
//!
//! An online pose-graph optimizer with robust outlier rejection, together
//! with the surrounding loop-closure detection and factor-handling pipeline.
//! Robots stream LiDAR keyed scans and odometry estimates; the back-end
//! maintains a factor graph of 6-DoF keyframe poses (plus sparse landmark
//! poses for artifacts and UWB anchors), incrementally optimizes it, rejects
//! spurious loop closures by pairwise consistency, and periodically publishes
//! a globally consistent trajectory.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   threads/                          │  ← Estimate + publish tasks
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                     io/                             │  ← g2o / PCD / zip archive
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │            solver/        loop_closure/             │  ← Robust PGO + closures
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │              graph/        handlers/                │  ← Store + ingestion
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                    core/                            │  ← Foundation
//! │            (keys, SE(3), covariances)               │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! # Dataflow
//!
//! sensor streams → factor handlers → graph store (staging) → robust solver
//! (PCM outlier filter + NLLS) → updated values → incremental diff published
//! to subscribers. The loop-closure engine runs alongside, submitting
//! candidate factors to the solver.

// ============================================================================
// Layer 1: Core foundation (no internal deps)
// ============================================================================
pub mod core;

// ============================================================================
// Layer 2: Configuration and errors
// ============================================================================
pub mod config;
pub mod error;

// ============================================================================
// Layer 3: Graph store and factor ingestion
// ============================================================================
pub mod graph;
pub mod handlers;

// ============================================================================
// Layer 4: Robust optimization and loop closure
// ============================================================================
pub mod loop_closure;
pub mod solver;

// ============================================================================
// Layer 5: I/O and task infrastructure
// ============================================================================
pub mod io;
pub mod threads;

// ============================================================================
// Convenience re-exports (flat namespace for common use)
// ============================================================================

pub use crate::core::types::{Covariance6, Key, Point3D, PointCloud3D, Pose3D, Timestamped};

pub use config::{
    ArtifactHandlerConfig, GraphConfig, IcpConfig, KeyframeConfig, LoopClosureConfig,
    ManualFactorConfig, OdometryHandlerConfig, OptimizerConfig, OutlierPolicy, SlamConfig,
    SolverConfig, SolverKind, ThreadConfig, UwbFactorPolicy, UwbHandlerConfig,
};
pub use error::{Result, SlamError};

pub use graph::{
    Factor, FactorKind, Measurement, Node, PoseGraph, PoseGraphMsg, PoseMeasurement,
    RangeMeasurement,
};

pub use handlers::{
    AnchorDrop, ArtifactHandler, ArtifactInfo, ArtifactMsg, FactorBatch, Handler,
    ManualFactorHandler, ManualFactorMsg, OdometryHandler, OdometryMsg, UwbHandler, UwbRangeMsg,
};

pub use loop_closure::{Icp3D, IcpResult, KeyframeStatus, LoopClosureEngine};

pub use solver::{
    GncResult, MaxCliqueSolver, ObservationId, OptimizationOutcome, Optimizer, Pcm, RobustSolver,
    TerminationReason, UpdateOutcome,
};

pub use threads::{
    EstimateTask, EstimateThread, PublisherThread, SensorChannels, ServiceCommand, ServiceRequest,
    ServiceResponse,
};
