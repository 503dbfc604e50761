//! Factor and node records.
//!
//! Factors reference nodes by [`Key`]; the graph store owns both as flat
//! collections with index maps. There are no back-pointers from a factor to
//! its graph.

use serde::{Deserialize, Serialize};

use crate::core::types::{Covariance6, Key, Pose3D};

/// The kind of constraint a factor encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FactorKind {
    /// Absolute pose prior anchoring a trajectory.
    Prior,
    /// Sequential odometry edge on a robot's spine.
    Odometry,
    /// Non-sequential relative-pose edge (manual or inter-robot).
    Between,
    /// Loop-closure edge, subject to outlier rejection.
    Loop,
    /// Robot-pose to artifact-landmark observation.
    Artifact,
    /// Scalar range to a UWB anchor.
    UwbRange,
}

impl FactorKind {
    /// Stable lower-case label used in messages and logs.
    pub fn label(&self) -> &'static str {
        match self {
            FactorKind::Prior => "prior",
            FactorKind::Odometry => "odom",
            FactorKind::Between => "between",
            FactorKind::Loop => "loop",
            FactorKind::Artifact => "artifact",
            FactorKind::UwbRange => "uwb_range",
        }
    }

    /// Whether this kind carries a relative SE(3) transform.
    pub fn is_pose_kind(&self) -> bool {
        !matches!(self, FactorKind::UwbRange)
    }
}

/// A relative-pose (or absolute, for priors) measurement with uncertainty.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoseMeasurement {
    pub transform: Pose3D,
    pub covariance: Covariance6,
}

/// A scalar range measurement with variance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RangeMeasurement {
    pub range: f64,
    pub variance: f64,
}

/// Measurement payload of a factor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Measurement {
    Pose(PoseMeasurement),
    Range(RangeMeasurement),
}

/// A constraint between two graph keys (or one key, for priors).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Factor {
    pub key_from: Key,
    pub key_to: Key,
    pub kind: FactorKind,
    pub measurement: Measurement,
}

impl Factor {
    /// Absolute prior on `key`.
    pub fn prior(key: Key, pose: Pose3D, covariance: Covariance6) -> Self {
        Self {
            key_from: key,
            key_to: key,
            kind: FactorKind::Prior,
            measurement: Measurement::Pose(PoseMeasurement {
                transform: pose,
                covariance,
            }),
        }
    }

    /// Sequential odometry edge.
    pub fn odometry(from: Key, to: Key, delta: Pose3D, covariance: Covariance6) -> Self {
        Self {
            key_from: from,
            key_to: to,
            kind: FactorKind::Odometry,
            measurement: Measurement::Pose(PoseMeasurement {
                transform: delta,
                covariance,
            }),
        }
    }

    /// Relative-pose edge outside the regular odometry stream, such as the
    /// bridge installed when reattaching to a loaded graph.
    pub fn between(from: Key, to: Key, delta: Pose3D, covariance: Covariance6) -> Self {
        Self {
            key_from: from,
            key_to: to,
            kind: FactorKind::Between,
            measurement: Measurement::Pose(PoseMeasurement {
                transform: delta,
                covariance,
            }),
        }
    }

    /// Loop-closure edge.
    pub fn loop_closure(from: Key, to: Key, delta: Pose3D, covariance: Covariance6) -> Self {
        Self {
            key_from: from,
            key_to: to,
            kind: FactorKind::Loop,
            measurement: Measurement::Pose(PoseMeasurement {
                transform: delta,
                covariance,
            }),
        }
    }

    /// Pose-to-landmark observation.
    pub fn artifact(pose_key: Key, artifact_key: Key, delta: Pose3D, covariance: Covariance6) -> Self {
        Self {
            key_from: pose_key,
            key_to: artifact_key,
            kind: FactorKind::Artifact,
            measurement: Measurement::Pose(PoseMeasurement {
                transform: delta,
                covariance,
            }),
        }
    }

    /// Range to a UWB anchor.
    pub fn uwb_range(pose_key: Key, anchor_key: Key, range: f64, variance: f64) -> Self {
        Self {
            key_from: pose_key,
            key_to: anchor_key,
            kind: FactorKind::UwbRange,
            measurement: Measurement::Range(RangeMeasurement { range, variance }),
        }
    }

    /// Pose measurement payload, when present.
    pub fn pose_measurement(&self) -> Option<&PoseMeasurement> {
        match &self.measurement {
            Measurement::Pose(m) => Some(m),
            Measurement::Range(_) => None,
        }
    }

    /// Range measurement payload, when present.
    pub fn range_measurement(&self) -> Option<&RangeMeasurement> {
        match &self.measurement {
            Measurement::Range(m) => Some(m),
            Measurement::Pose(_) => None,
        }
    }

    /// Identity triple used for duplicate detection on structural edges.
    pub fn triple(&self) -> (Key, Key, FactorKind) {
        (self.key_from, self.key_to, self.kind)
    }

    /// Whether this factor touches the given prefix on either end.
    pub fn touches_prefix(&self, prefix: char) -> bool {
        self.key_from.prefix() == prefix || self.key_to.prefix() == prefix
    }
}

/// A graph node: a keyframe pose or landmark estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub key: Key,
    /// Acquisition stamp in microseconds.
    pub stamp_us: u64,
    pub fixed_frame_id: String,
    /// Current estimate; re-estimated by the solver, never re-identified.
    pub pose: Pose3D,
    pub covariance: Covariance6,
    /// Type-dependent identifier (artifact parent id, UWB anchor id).
    pub id_string: Option<String>,
}

impl Node {
    pub fn new(
        key: Key,
        stamp_us: u64,
        fixed_frame_id: impl Into<String>,
        pose: Pose3D,
        covariance: Covariance6,
    ) -> Self {
        Self {
            key,
            stamp_us,
            fixed_frame_id: fixed_frame_id.into(),
            pose,
            covariance,
            id_string: None,
        }
    }

    /// Attach a type-dependent identifier.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id_string = Some(id.into());
        self
    }
}
