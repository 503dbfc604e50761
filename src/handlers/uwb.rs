//! UWB range factor handler.
//!
//! Buffers range measurements per anchor id. Drains emit binary range
//! factors (policy `Range`); dropping an anchor finalizes it with a
//! position prior near the drop pose and stops further range ingestion for
//! that anchor.

use std::collections::HashMap;

use log::{info, warn};
use nalgebra::Vector3;

use super::{FactorBatch, Handler};
use crate::config::{UwbFactorPolicy, UwbHandlerConfig};
use crate::core::types::{Covariance6, Key, Pose3D};
use crate::graph::{FactorKind, Measurement, RangeMeasurement};

/// One range measurement to an anchor.
#[derive(Debug, Clone)]
pub struct UwbRangeMsg {
    /// Acquisition stamp in microseconds. Zero stamps are rejected.
    pub stamp_us: u64,
    /// Anchor id.
    pub anchor_id: String,
    /// Measured range in meters.
    pub range: f64,
}

/// A finalized anchor: key plus the prior to install at the drop pose.
#[derive(Debug, Clone)]
pub struct AnchorDrop {
    pub key: Key,
    pub stamp_us: u64,
    pub prior_pose: Pose3D,
    pub prior_covariance: Covariance6,
}

/// The UWB handler.
pub struct UwbHandler {
    config: UwbHandlerConfig,
    id_to_key: HashMap<String, Key>,
    next_index: u64,
    /// Buffered `(stamp, range)` samples per anchor key.
    buffers: HashMap<Key, Vec<(u64, f64)>>,
    dropped: HashMap<Key, bool>,
    pending_drops: Vec<AnchorDrop>,
}

impl UwbHandler {
    pub fn new(config: UwbHandlerConfig) -> Self {
        Self {
            config,
            id_to_key: HashMap::new(),
            next_index: 0,
            buffers: HashMap::new(),
            dropped: HashMap::new(),
            pending_drops: Vec::new(),
        }
    }

    /// Key for an anchor id, assigning one on first contact.
    pub fn anchor_key(&mut self, anchor_id: &str) -> Key {
        if let Some(&key) = self.id_to_key.get(anchor_id) {
            return key;
        }
        let key = Key::new(self.config.prefix, self.next_index);
        self.next_index += 1;
        info!("new UWB anchor '{anchor_id}' assigned key {key}");
        self.id_to_key.insert(anchor_id.to_string(), key);
        key
    }

    /// Key for an anchor id without assigning one.
    pub fn existing_anchor_key(&self, anchor_id: &str) -> Option<Key> {
        self.id_to_key.get(anchor_id).copied()
    }

    /// Finalize an anchor at its drop position. Returns the assigned key,
    /// or `None` as a benign no-op when the anchor was already dropped.
    pub fn drop_anchor(
        &mut self,
        anchor_id: &str,
        stamp_us: u64,
        drop_position: Vector3<f64>,
    ) -> Option<Key> {
        let key = self.anchor_key(anchor_id);
        if self.dropped.get(&key).copied().unwrap_or(false) {
            warn!("anchor '{anchor_id}' already dropped");
            return None;
        }
        self.dropped.insert(key, true);
        let sigma = self.config.drop_prior_sigma;
        self.pending_drops.push(AnchorDrop {
            key,
            stamp_us,
            prior_pose: Pose3D::from_translation(
                drop_position.x,
                drop_position.y,
                drop_position.z,
            ),
            // Position is known to drop accuracy; orientation is meaningless
            // for an anchor, kept loose.
            prior_covariance: Covariance6::from_sigmas(sigma, 10.0),
        });
        Some(key)
    }

    /// Take the anchors finalized since the last call.
    pub fn take_drops(&mut self) -> Vec<AnchorDrop> {
        std::mem::take(&mut self.pending_drops)
    }

    /// Attach-window tolerance for resolving the pose key of a measurement.
    pub fn attach_window_us(&self) -> u64 {
        self.config.attach_window_us
    }
}

impl Handler for UwbHandler {
    type Message = UwbRangeMsg;

    fn ingest(&mut self, msg: UwbRangeMsg) {
        if msg.stamp_us == 0 {
            warn!("UWB range with zero stamp dropped");
            return;
        }
        if !msg.range.is_finite() || msg.range <= 0.0 {
            warn!("UWB range {} to '{}' dropped", msg.range, msg.anchor_id);
            return;
        }
        let key = self.anchor_key(&msg.anchor_id);
        if self.dropped.get(&key).copied().unwrap_or(false) {
            return;
        }
        self.buffers
            .entry(key)
            .or_default()
            .push((msg.stamp_us, msg.range));
    }

    fn drain(&mut self) -> FactorBatch {
        let mut batch = FactorBatch::empty(FactorKind::UwbRange);
        if self.config.policy == UwbFactorPolicy::DropPriorOnly {
            for buffer in self.buffers.values_mut() {
                buffer.clear();
            }
            return batch;
        }
        let variance = self.config.range_sigma * self.config.range_sigma;
        let mut keys: Vec<Key> = self.buffers.keys().copied().collect();
        keys.sort_unstable();
        for key in keys {
            let Some(buffer) = self.buffers.get_mut(&key) else {
                continue;
            };
            for (stamp_us, range) in buffer.drain(..) {
                batch
                    .measurements
                    .push(Measurement::Range(RangeMeasurement { range, variance }));
                batch.time_pairs.push((stamp_us, 0));
                batch.keys.push(key);
            }
        }
        batch.has_data = !batch.is_empty();
        batch
    }
}
