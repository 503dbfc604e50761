//! Manual (operator) factor handler.
//!
//! Operators can pin two keys together with a relative pose and explicit
//! precisions. Precisions convert to a diagonal covariance; the records
//! drain as trusted loop factors that bypass outlier rejection.

use std::collections::VecDeque;

use super::{FactorBatch, Handler};
use crate::config::ManualFactorConfig;
use crate::core::types::{Covariance6, Key, Pose3D};
use crate::graph::{FactorKind, Measurement, PoseMeasurement};

/// One operator-supplied factor.
#[derive(Debug, Clone)]
pub struct ManualFactorMsg {
    pub key_from: Key,
    pub key_to: Key,
    pub transform: Pose3D,
    /// Translation precision; the configured default when `None`.
    pub translation_precision: Option<f64>,
    /// Rotation precision; the configured default when `None`.
    pub rotation_precision: Option<f64>,
}

/// The manual factor handler.
pub struct ManualFactorHandler {
    config: ManualFactorConfig,
    queue: VecDeque<(Key, Key, Pose3D, Covariance6)>,
}

impl ManualFactorHandler {
    pub fn new(config: ManualFactorConfig) -> Self {
        Self {
            config,
            queue: VecDeque::new(),
        }
    }
}

impl Handler for ManualFactorHandler {
    type Message = ManualFactorMsg;

    fn ingest(&mut self, msg: ManualFactorMsg) {
        let covariance = Covariance6::from_precisions(
            msg.translation_precision
                .unwrap_or(self.config.manual_lc_trans_precision),
            msg.rotation_precision
                .unwrap_or(self.config.manual_lc_rot_precision),
        );
        self.queue
            .push_back((msg.key_from, msg.key_to, msg.transform, covariance));
    }

    fn drain(&mut self) -> FactorBatch {
        let mut batch = FactorBatch::empty(FactorKind::Loop);
        while let Some((key_from, key_to, transform, covariance)) = self.queue.pop_front() {
            batch.measurements.push(Measurement::Pose(PoseMeasurement {
                transform,
                covariance,
            }));
            batch.time_pairs.push((0, 0));
            batch.keys.push(key_from);
            batch.keys.push(key_to);
        }
        batch.has_data = !batch.is_empty();
        batch
    }
}
