//! Odometry factor handler.
//!
//! Buffers time-ordered pose-with-covariance samples from the upstream
//! odometry source. On drain it emits the relative-pose factor spanning the
//! previously emitted stamp to the newest buffered stamp, interpolating at
//! the interval ends when no sample lands exactly there (linear translation,
//! SLERP rotation).

use std::collections::BTreeMap;

use log::warn;

use super::{FactorBatch, Handler};
use crate::config::OdometryHandlerConfig;
use crate::core::types::{Covariance6, Pose3D};
use crate::error::{Result, SlamError};
use crate::graph::{FactorKind, Measurement, PoseMeasurement};

/// One odometry sample.
#[derive(Debug, Clone)]
pub struct OdometryMsg {
    /// Acquisition stamp in microseconds. Zero stamps are rejected.
    pub stamp_us: u64,
    /// Pose in the odometry frame.
    pub pose: Pose3D,
    /// 6x6 covariance of the pose.
    pub covariance: Covariance6,
}

/// The odometry handler.
pub struct OdometryHandler {
    config: OdometryHandlerConfig,
    buffer: BTreeMap<u64, (Pose3D, Covariance6)>,
    /// Stamp the last drained interval ended at.
    last_emitted_us: Option<u64>,
}

impl OdometryHandler {
    pub fn new(config: OdometryHandlerConfig) -> Self {
        Self {
            config,
            buffer: BTreeMap::new(),
            last_emitted_us: None,
        }
    }

    /// Newest buffered stamp.
    pub fn latest_stamp(&self) -> Option<u64> {
        self.buffer.keys().next_back().copied()
    }

    /// Pose and covariance at a stamp, interpolated between the bracketing
    /// samples. Fails with `InsufficientOdometry` when either bracket is
    /// missing.
    pub fn pose_at_time(&self, stamp_us: u64) -> Result<(Pose3D, Covariance6)> {
        if let Some(sample) = self.buffer.get(&stamp_us) {
            return Ok(*sample);
        }
        let before = self.buffer.range(..=stamp_us).next_back();
        let after = self.buffer.range(stamp_us..).next();
        let (Some((&t0, (p0, c0))), Some((&t1, (p1, c1)))) = (before, after) else {
            return Err(SlamError::InsufficientOdometry(stamp_us));
        };
        debug_assert!(t0 < stamp_us && stamp_us < t1);
        let alpha = (stamp_us - t0) as f64 / (t1 - t0) as f64;
        let pose = Pose3D::interpolate(p0, p1, alpha);
        let covariance = Covariance6::from_matrix((c0.matrix + c1.matrix) * 0.5);
        Ok((pose, covariance))
    }

    /// Relative transform between two stamps with the averaged covariance.
    pub fn between(&self, t1_us: u64, t2_us: u64) -> Result<(Pose3D, Covariance6)> {
        let (p1, c1) = self.pose_at_time(t1_us)?;
        let (p2, c2) = self.pose_at_time(t2_us)?;
        let delta = p1.between(&p2);
        let covariance = Covariance6::from_matrix((c1.matrix + c2.matrix) * 0.5);
        Ok((delta, covariance))
    }

    /// Drop samples older than the last emitted stamp, keeping one bracket.
    fn prune(&mut self) {
        if self.buffer.len() <= self.config.buffer_capacity {
            return;
        }
        let keep_from = self.last_emitted_us.unwrap_or(0);
        let cutoff: Vec<u64> = self
            .buffer
            .range(..keep_from)
            .map(|(&t, _)| t)
            .rev()
            .skip(1)
            .collect();
        for stamp in cutoff {
            self.buffer.remove(&stamp);
        }
        while self.buffer.len() > self.config.buffer_capacity {
            self.buffer.pop_first();
        }
    }
}

impl Handler for OdometryHandler {
    type Message = OdometryMsg;

    fn ingest(&mut self, msg: OdometryMsg) {
        if msg.stamp_us == 0 {
            warn!("odometry sample with zero stamp dropped");
            return;
        }
        if !msg.pose.translation.iter().all(|v| v.is_finite())
            || !msg.pose.rotation.coords.iter().all(|v| v.is_finite())
        {
            warn!("odometry sample with non-finite pose dropped");
            return;
        }
        if let Some(latest) = self.latest_stamp() {
            if msg.stamp_us <= latest {
                warn!(
                    "out-of-order odometry sample at {} (latest {latest}) dropped",
                    msg.stamp_us
                );
                return;
            }
        }
        self.buffer.insert(msg.stamp_us, (msg.pose, msg.covariance));
        self.prune();
    }

    /// Emit the interval from the previously emitted stamp to the newest
    /// sample. The first drain primes the interval start and emits nothing.
    fn drain(&mut self) -> FactorBatch {
        let mut batch = FactorBatch::empty(FactorKind::Odometry);
        let Some(latest) = self.latest_stamp() else {
            return batch;
        };
        let Some(previous) = self.last_emitted_us else {
            self.last_emitted_us = Some(latest);
            return batch;
        };
        if latest <= previous {
            return batch;
        }
        match self.between(previous, latest) {
            Ok((delta, covariance)) => {
                batch.has_data = true;
                batch.measurements.push(Measurement::Pose(PoseMeasurement {
                    transform: delta,
                    covariance,
                }));
                batch.time_pairs.push((previous, latest));
                self.last_emitted_us = Some(latest);
            }
            Err(err) => warn!("odometry drain skipped: {err}"),
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn handler() -> OdometryHandler {
        OdometryHandler::new(OdometryHandlerConfig::default())
    }

    fn sample(stamp_us: u64, x: f64) -> OdometryMsg {
        OdometryMsg {
            stamp_us,
            pose: Pose3D::from_translation(x, 0.0, 0.0),
            covariance: Covariance6::from_sigmas(0.05, 0.02),
        }
    }

    #[test]
    fn test_zero_stamp_dropped() {
        let mut handler = handler();
        handler.ingest(sample(0, 1.0));
        assert!(handler.latest_stamp().is_none());
    }

    #[test]
    fn test_nan_pose_dropped() {
        let mut handler = handler();
        handler.ingest(OdometryMsg {
            stamp_us: 1_000,
            pose: Pose3D::from_translation(f64::NAN, 0.0, 0.0),
            covariance: Covariance6::default(),
        });
        assert!(handler.latest_stamp().is_none());
    }

    #[test]
    fn test_out_of_order_dropped() {
        let mut handler = handler();
        handler.ingest(sample(2_000, 1.0));
        handler.ingest(sample(1_000, 0.5));
        assert_eq!(handler.latest_stamp(), Some(2_000));
    }

    #[test]
    fn test_interpolation_between_brackets() {
        let mut handler = handler();
        handler.ingest(sample(1_000_000, 0.0));
        handler.ingest(sample(2_000_000, 2.0));
        let (pose, _) = handler.pose_at_time(1_500_000).unwrap();
        assert_relative_eq!(pose.translation.x, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_missing_bracket_fails() {
        let mut handler = handler();
        handler.ingest(sample(1_000_000, 0.0));
        assert!(matches!(
            handler.pose_at_time(2_000_000),
            Err(SlamError::InsufficientOdometry(_))
        ));
    }

    #[test]
    fn test_between_composes_relative_pose() {
        let mut handler = handler();
        handler.ingest(sample(1_000_000, 1.0));
        handler.ingest(sample(2_000_000, 3.0));
        let (delta, _) = handler.between(1_000_000, 2_000_000).unwrap();
        assert_relative_eq!(delta.translation.x, 2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_drain_primes_then_emits() {
        let mut handler = handler();
        handler.ingest(sample(1_000_000, 0.0));

        // First drain primes the interval start.
        let primed = handler.drain();
        assert!(!primed.has_data);

        handler.ingest(sample(2_000_000, 1.5));
        let batch = handler.drain();
        assert!(batch.has_data);
        assert_eq!(batch.time_pairs, vec![(1_000_000, 2_000_000)]);
        match &batch.measurements[0] {
            Measurement::Pose(m) => {
                assert_relative_eq!(m.transform.translation.x, 1.5, epsilon = 1e-9)
            }
            Measurement::Range(_) => panic!("odometry batch carries pose measurements"),
        }

        // Nothing new: no data.
        assert!(!handler.drain().has_data);
    }

    #[test]
    fn test_replay_reproduces_batch() {
        let build = || {
            let mut handler = handler();
            handler.ingest(sample(1_000_000, 0.0));
            handler.drain();
            handler.ingest(sample(1_700_000, 0.7));
            handler.ingest(sample(2_400_000, 1.4));
            handler.drain()
        };
        let a = build();
        let b = build();
        assert_eq!(a.time_pairs, b.time_pairs);
        assert_eq!(a.len(), b.len());
    }
}
