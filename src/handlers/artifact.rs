//! Artifact factor handler.
//!
//! Detected artifacts (survey objects) become sparse landmark nodes. The
//! handler assigns one stable key per parent id; the first observation
//! queues a landmark factor, later observations update the stored message
//! for reporting. The 3-DoF position covariance of a detection is lifted
//! into the 6x6 pose covariance with the unobserved rotation block set to a
//! very high variance.

use std::collections::{HashMap, VecDeque};

use log::{info, warn};
use nalgebra::{Matrix3, Matrix6, Vector3};

use super::{FactorBatch, Handler};
use crate::config::ArtifactHandlerConfig;
use crate::core::types::{Covariance6, Key, Pose3D};
use crate::graph::{FactorKind, Measurement, PoseMeasurement};

/// One artifact detection, relative to the robot body frame.
#[derive(Debug, Clone)]
pub struct ArtifactMsg {
    /// Acquisition stamp in microseconds. Zero stamps are rejected.
    pub stamp_us: u64,
    /// Unique detection id.
    pub id: String,
    /// Stable id grouping re-observations of the same physical object.
    pub parent_id: String,
    /// Classification label.
    pub label: String,
    /// Relative position in the robot frame.
    pub position: Vector3<f64>,
    /// 3x3 covariance of the position.
    pub covariance: Matrix3<f64>,
    /// Detector confidence in `[0, 1]`.
    pub confidence: f64,
}

/// Bookkeeping for one artifact landmark.
#[derive(Debug, Clone)]
pub struct ArtifactInfo {
    /// Parent id this landmark tracks.
    pub parent_id: String,
    /// Most recent detection message.
    pub msg: ArtifactMsg,
    /// Latest optimized global pose, once the solver produced one.
    pub global_pose: Option<Pose3D>,
    /// How many times the optimizer has updated this landmark.
    pub num_updates: u32,
}

/// The artifact handler.
pub struct ArtifactHandler {
    config: ArtifactHandlerConfig,
    id_to_key: HashMap<String, Key>,
    key_to_info: HashMap<Key, ArtifactInfo>,
    next_index: u64,
    queue: VecDeque<(Key, u64, Pose3D, Covariance6)>,
}

impl ArtifactHandler {
    pub fn new(config: ArtifactHandlerConfig) -> Self {
        Self {
            config,
            id_to_key: HashMap::new(),
            key_to_info: HashMap::new(),
            next_index: 0,
            queue: VecDeque::new(),
        }
    }

    /// Key assigned to a parent id, if the artifact has been observed.
    pub fn artifact_key(&self, parent_id: &str) -> Option<Key> {
        self.id_to_key.get(parent_id).copied()
    }

    /// Stored info for an artifact key.
    pub fn info(&self, key: Key) -> Option<&ArtifactInfo> {
        self.key_to_info.get(&key)
    }

    /// Record the optimized global pose of a landmark.
    pub fn update_global_pose(&mut self, key: Key, pose: Pose3D) {
        match self.key_to_info.get_mut(&key) {
            Some(info) => {
                info.global_pose = Some(pose);
                info.num_updates += 1;
            }
            None => warn!("global pose update for unknown artifact key {key}"),
        }
    }

    /// All tracked artifact keys.
    pub fn keys(&self) -> impl Iterator<Item = Key> + '_ {
        self.key_to_info.keys().copied()
    }

    /// Lift a 3-DoF position covariance into the 6x6 pose covariance.
    fn lift_covariance(&self, position_cov: &Matrix3<f64>) -> Covariance6 {
        let mut m = Matrix6::zeros();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(position_cov);
        for i in 3..6 {
            m[(i, i)] = self.config.rotation_variance;
        }
        let cov = Covariance6::from_matrix(m);
        if cov.is_positive_definite() {
            cov
        } else {
            // Degenerate detection covariance: fall back to the configured
            // translation precision.
            let mut fallback =
                Covariance6::from_precisions(self.config.artifact_trans_precision, 0.0);
            for i in 3..6 {
                fallback.matrix[(i, i)] = self.config.rotation_variance;
            }
            fallback
        }
    }
}

impl Handler for ArtifactHandler {
    type Message = ArtifactMsg;

    fn ingest(&mut self, msg: ArtifactMsg) {
        if msg.stamp_us == 0 {
            warn!("artifact '{}' with zero stamp dropped", msg.parent_id);
            return;
        }
        if !msg.position.iter().all(|v| v.is_finite()) {
            warn!("artifact '{}' with non-finite position dropped", msg.parent_id);
            return;
        }

        if let Some(&key) = self.id_to_key.get(&msg.parent_id) {
            info!("artifact '{}' re-observed as {key}", msg.parent_id);
            if let Some(stored) = self.key_to_info.get_mut(&key) {
                stored.msg = msg;
            }
            return;
        }

        let key = Key::new(self.config.prefix, self.next_index);
        self.next_index += 1;
        info!("new artifact '{}' assigned key {key}", msg.parent_id);
        self.id_to_key.insert(msg.parent_id.clone(), key);

        let relative = Pose3D::from_translation(msg.position.x, msg.position.y, msg.position.z);
        let covariance = self.lift_covariance(&msg.covariance);
        self.queue
            .push_back((key, msg.stamp_us, relative, covariance));
        self.key_to_info.insert(
            key,
            ArtifactInfo {
                parent_id: msg.parent_id.clone(),
                msg,
                global_pose: None,
                num_updates: 0,
            },
        );
    }

    fn drain(&mut self) -> FactorBatch {
        let mut batch = FactorBatch::empty(FactorKind::Artifact);
        while let Some((key, stamp_us, relative, covariance)) = self.queue.pop_front() {
            batch.measurements.push(Measurement::Pose(PoseMeasurement {
                transform: relative,
                covariance,
            }));
            batch.time_pairs.push((stamp_us, 0));
            batch.keys.push(key);
        }
        batch.has_data = !batch.is_empty();
        batch
    }
}
