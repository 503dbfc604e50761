//! Factor handlers: per-source ingestion of measurement streams.
//!
//! Each handler buffers one sensor stream and, on request from the estimate
//! task, drains its queue into a [`FactorBatch`] of deterministic factor
//! records. Handlers never mutate the graph; key resolution against the
//! store (e.g. pose key at a stamp) happens in the estimate task.
//!
//! Batch interpretation by kind:
//! - `Odometry`: one relative-pose measurement per drained interval;
//!   `time_pairs[i]` holds the exact bracketing stamps used.
//! - `Artifact`: one pose measurement per first observation; `keys[i]` is
//!   the artifact landmark key, `time_pairs[i].0` the observation stamp.
//! - `UwbRange`: one range measurement per buffered sample; `keys[i]` is
//!   the anchor key.
//! - `Loop` (manual): one pose measurement per operator request; `keys`
//!   holds the flattened `(k1, k2)` pairs, two entries per measurement.

mod artifact;
mod manual;
mod odometry;
mod uwb;

use crate::core::types::Key;
use crate::graph::{FactorKind, Measurement};

pub use artifact::{ArtifactHandler, ArtifactInfo, ArtifactMsg};
pub use manual::{ManualFactorHandler, ManualFactorMsg};
pub use odometry::{OdometryHandler, OdometryMsg};
pub use uwb::{AnchorDrop, UwbHandler, UwbRangeMsg};

/// A drained batch of factor records, ready for the estimate task.
#[derive(Debug, Clone)]
pub struct FactorBatch {
    /// False when the handler had nothing to emit.
    pub has_data: bool,
    /// Kind shared by every record in the batch.
    pub kind: FactorKind,
    /// Measurements (SE(3) transform + covariance, or scalar range).
    pub measurements: Vec<Measurement>,
    /// Exact stamps backing each measurement, `(t1, t2)`; `t2` is zero for
    /// single-stamp sources.
    pub time_pairs: Vec<(u64, u64)>,
    /// Kind-dependent keys (see module docs).
    pub keys: Vec<Key>,
}

impl FactorBatch {
    /// An empty batch of the given kind.
    pub fn empty(kind: FactorKind) -> Self {
        Self {
            has_data: false,
            kind,
            measurements: Vec::new(),
            time_pairs: Vec::new(),
            keys: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }
}

/// A factor handler: ingest messages, drain factor batches.
///
/// Bad messages are dropped at `ingest` time with a warning; `drain`
/// consumes the internal queue, so replaying the same inputs reproduces the
/// same batches.
pub trait Handler {
    type Message;

    /// Buffer one incoming message, dropping invalid input.
    fn ingest(&mut self, msg: Self::Message);

    /// Consume the queue and return the pending factor records.
    fn drain(&mut self) -> FactorBatch;
}
