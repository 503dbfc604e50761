//! Task infrastructure: the estimate task and the publisher task.
//!
//! Three logical tasks cooperate around the shared graph store:
//!
//! - **Ingest** (high frequency): sensor messages land on crossbeam
//!   channels and are drained into handler buffers each estimate tick.
//! - **Estimate** (timer): drains handler batches, runs the loop-closure
//!   engine, calls the robust solver, and writes values back, holding the
//!   graph's writer lock for the duration of the update.
//! - **Publish** (timer): takes the reader lock, serializes the incremental
//!   diff, publishes it, and clears the diff sets.
//!
//! Operator service calls are serialized through the estimate task's
//! command channel; each request carries a reply sender.

mod estimate;
mod publisher;

use std::path::PathBuf;

use crossbeam_channel::Sender;
use nalgebra::Vector3;

use crate::core::types::{Covariance6, Key, Pose3D};
use crate::graph::FactorKind;

pub use estimate::{EstimateTask, EstimateThread, SensorChannels};
pub use publisher::PublisherThread;

/// Operator-facing service operations.
#[derive(Debug, Clone)]
pub enum ServiceCommand {
    /// Pin two keys together with an operator-supplied relative pose.
    AddFactor {
        key_from: Key,
        key_to: Key,
        transform: Pose3D,
        translation_precision: Option<f64>,
        rotation_precision: Option<f64>,
    },
    /// Remove a factor between two keys (loop closures only).
    RemoveFactor {
        key_from: Key,
        key_to: Key,
        kind: Option<FactorKind>,
    },
    /// Pop the most recently admitted loop closure.
    RemoveLastLoopClosure { prefix_pair: Option<(char, char)> },
    /// Save the graph archive.
    SaveGraph { path: PathBuf },
    /// Load a graph archive, replacing in-memory state.
    LoadGraph { path: PathBuf },
    /// Reload the last saved archive and bridge it to the live trajectory
    /// with the provided delta.
    RestartFromLastSaved {
        delta: Pose3D,
        covariance: Covariance6,
    },
    /// Re-evaluate loop closures over the whole trajectory.
    BatchLoopClosure,
    /// Finalize a UWB anchor at the given drop position.
    DropUwb {
        anchor_id: String,
        stamp_us: u64,
        position: Vector3<f64>,
    },
}

/// Service call outcomes.
#[derive(Debug, Clone)]
pub enum ServiceResponse {
    FactorAdded { accepted: bool },
    Removed { removed: bool },
    Saved,
    Loaded { new_initial_key: Key },
    BatchClosures { accepted: usize },
    UwbDropped { key: Option<Key> },
    Failed { error: String, exit_code: i32 },
}

/// A command paired with its reply channel.
#[derive(Debug, Clone)]
pub struct ServiceRequest {
    pub command: ServiceCommand,
    pub reply: Sender<ServiceResponse>,
}
