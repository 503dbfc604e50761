//! Estimate task: drains handlers, runs loop closure, drives the solver.
//!
//! `EstimateTask` holds the whole back-end pipeline and is directly
//! testable; `EstimateThread` wraps it in a timer-driven worker thread.
//!
//! CRITICAL: the task holds the graph's writer lock only while mutating;
//! loop-closure search runs under the reader lock so publishing stays live.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{tick, Receiver};
use log::{info, warn};
use parking_lot::RwLock;

use super::{ServiceCommand, ServiceRequest, ServiceResponse};
use crate::config::SlamConfig;
use crate::core::types::{Covariance6, Key, PointCloud3D, Pose3D};
use crate::error::{Result, SlamError};
use crate::graph::{Factor, FactorKind, Measurement, Node, PoseGraph};
use crate::handlers::{
    ArtifactHandler, ArtifactMsg, Handler, ManualFactorHandler, ManualFactorMsg, OdometryHandler,
    OdometryMsg, UwbHandler, UwbRangeMsg,
};
use crate::io::archive;
use crate::loop_closure::LoopClosureEngine;
use crate::solver::RobustSolver;

/// Shared handle to the graph store.
pub type SharedGraph = Arc<RwLock<PoseGraph>>;

/// Sensor input channels for the estimate thread.
pub struct SensorChannels {
    pub odometry: Receiver<OdometryMsg>,
    /// Keyed scan stream: `(stamp_us, cloud)` for the most recent scan.
    pub scans: Receiver<(u64, PointCloud3D)>,
    pub artifacts: Receiver<ArtifactMsg>,
    pub uwb: Receiver<UwbRangeMsg>,
    pub manual: Receiver<ManualFactorMsg>,
}

/// The estimate pipeline.
pub struct EstimateTask {
    config: SlamConfig,
    graph: SharedGraph,
    solver: RobustSolver,
    engine: LoopClosureEngine,
    odometry: OdometryHandler,
    artifacts: ArtifactHandler,
    uwb: UwbHandler,
    manual: ManualFactorHandler,
    /// Motion accumulated since the last admitted keyframe.
    pending_delta: Pose3D,
    pending_covariance: Covariance6,
    pending_stamp_us: u64,
    latest_scan: Option<(u64, Arc<PointCloud3D>)>,
    last_saved_path: Option<PathBuf>,
}

impl EstimateTask {
    pub fn new(config: SlamConfig, graph: SharedGraph) -> Result<Self> {
        Ok(Self {
            solver: RobustSolver::new(&config.solver)?,
            engine: LoopClosureEngine::new(config.loop_closure.clone()),
            odometry: OdometryHandler::new(config.odometry.clone()),
            artifacts: ArtifactHandler::new(config.artifacts.clone()),
            uwb: UwbHandler::new(config.uwb.clone()),
            manual: ManualFactorHandler::new(config.manual.clone()),
            pending_delta: Pose3D::identity(),
            pending_covariance: zero_covariance(),
            pending_stamp_us: 0,
            latest_scan: None,
            last_saved_path: None,
            config,
            graph,
        })
    }

    // ------------------------------------------------------------------
    // Ingestion (called from the channel drain, mutates handler buffers only)
    // ------------------------------------------------------------------

    pub fn ingest_odometry(&mut self, msg: OdometryMsg) {
        self.odometry.ingest(msg);
    }

    pub fn ingest_scan(&mut self, stamp_us: u64, cloud: PointCloud3D) {
        self.latest_scan = Some((stamp_us, Arc::new(cloud)));
    }

    pub fn ingest_artifact(&mut self, msg: ArtifactMsg) {
        self.artifacts.ingest(msg);
        // A landmark factor needs a pose key at its stamp.
        self.engine.request_keyframe();
    }

    pub fn ingest_uwb(&mut self, msg: UwbRangeMsg) {
        self.uwb.ingest(msg);
        self.engine.request_keyframe();
    }

    pub fn ingest_manual(&mut self, msg: ManualFactorMsg) {
        self.manual.ingest(msg);
    }

    /// Direct access for embedding applications and tests.
    pub fn solver(&self) -> &RobustSolver {
        &self.solver
    }

    // ------------------------------------------------------------------
    // Estimate tick
    // ------------------------------------------------------------------

    /// One estimate cycle. Persistent failures are logged by the caller;
    /// the graph keeps its prior valid state.
    pub fn step(&mut self) -> Result<()> {
        if !self.graph.read().is_initialized() {
            self.try_initialize()?;
            return Ok(());
        }

        self.process_odometry()?;
        self.process_artifacts()?;
        self.process_uwb()?;
        self.process_manual()?;
        self.write_back_values();
        Ok(())
    }

    /// Install the prior at the first odometry stamp.
    fn try_initialize(&mut self) -> Result<()> {
        // Prime the odometry interval start; any pre-initialization motion
        // is discarded.
        let _ = self.odometry.drain();
        let Some(stamp_us) = self.odometry.latest_stamp() else {
            return Ok(());
        };

        let initial_key = Key::new(self.config.graph.robot_prefix, 0);
        let (prior_pose, prior_covariance) = {
            let mut graph = self.graph.write();
            let covariance = graph.initial_covariance();
            graph.initialize(stamp_us, initial_key, Pose3D::identity(), covariance)?;
            if let Some((_, scan)) = &self.latest_scan {
                graph.attach_scan(initial_key, scan.clone())?;
            }
            (Pose3D::identity(), covariance)
        };
        self.solver.force_update(
            &[Factor::prior(initial_key, prior_pose, prior_covariance)],
            &[(initial_key, prior_pose)],
        )?;
        self.engine.admit_keyframe(initial_key);
        self.pending_stamp_us = stamp_us;
        info!("pose graph initialized at {initial_key}, stamp {stamp_us}");
        Ok(())
    }

    /// Drain odometry, gate keyframes, admit new poses, search closures.
    fn process_odometry(&mut self) -> Result<()> {
        let batch = self.odometry.drain();
        if !batch.has_data {
            return Ok(());
        }
        let Measurement::Pose(m) = &batch.measurements[0] else {
            return Ok(());
        };
        let (_, t2) = batch.time_pairs[0];

        self.pending_covariance = self
            .pending_covariance
            .compose_with(&m.transform, &m.covariance);
        self.pending_delta = self.pending_delta.compose(&m.transform);
        self.pending_stamp_us = t2;

        if !self.engine.register_motion(&m.transform) {
            return Ok(());
        }

        let new_key = self.admit_keyframe()?;
        self.submit_loop_closures(new_key)?;
        Ok(())
    }

    /// Admit the pending motion as a new keyframe.
    fn admit_keyframe(&mut self) -> Result<Key> {
        let delta = self.pending_delta;
        let delta_covariance = covariance_floor(self.pending_covariance);
        let stamp_us = self.pending_stamp_us;
        self.pending_delta = Pose3D::identity();
        self.pending_covariance = zero_covariance();

        let (prev_key, new_key, new_pose) = {
            let mut graph = self.graph.write();
            let frame = graph.fixed_frame_id().to_string();
            let prev_key = graph.current_key().ok_or(SlamError::NotInitialized)?;
            let prev_pose = graph.get_pose(prev_key)?;
            let new_key = graph.next_key()?;
            let new_pose = prev_pose.compose(&delta);
            graph.track_node(Node::new(new_key, stamp_us, frame, new_pose, delta_covariance))?;
            graph.track_factor(Factor::odometry(prev_key, new_key, delta, delta_covariance))?;
            if let Some((_, scan)) = &self.latest_scan {
                graph.attach_scan(new_key, scan.clone())?;
            }
            (prev_key, new_key, new_pose)
        };

        self.solver.update(
            &[Factor::odometry(prev_key, new_key, delta, delta_covariance)],
            &[(new_key, new_pose)],
            true,
        )?;
        self.engine.admit_keyframe(new_key);
        Ok(new_key)
    }

    /// Search and submit loop closures for a fresh keyframe, one at a time
    /// so the cost-regression check can back out a bad one.
    fn submit_loop_closures(&mut self, query: Key) -> Result<()> {
        let closures = {
            let graph = self.graph.read();
            self.engine.find_loop_closures(&graph, query)?
        };
        let mut accepted = 0;
        for closure in closures {
            if self.submit_closure_checked(closure)? {
                accepted += 1;
            }
        }
        if accepted > 0 {
            self.engine.mark_committed([query]);
        }
        Ok(())
    }

    /// Submit one loop factor; back it out when the optimization cost
    /// regresses beyond the configured margin.
    fn submit_closure_checked(&mut self, closure: Factor) -> Result<bool> {
        let cost_before = self.solver.cost();
        let pair = (closure.key_from, closure.key_to);
        let outcome = self.solver.update(&[closure], &[], true)?;
        if matches!(outcome, crate::solver::UpdateOutcome::NoChange) {
            // PCM rejected the candidate.
            return Ok(false);
        }
        let cost_after = self.solver.cost();
        if self.engine.cost_regression_ok(cost_before, cost_after) {
            return Ok(true);
        }
        warn!(
            "loop {} -> {} raised cost {:.3e} -> {:.3e}, removing",
            pair.0, pair.1, cost_before, cost_after
        );
        self.solver
            .remove_last_loop_closure(Some((pair.0.prefix(), pair.1.prefix())))?;
        Ok(false)
    }

    /// Attach artifact observations to pose keys and stage landmark factors.
    fn process_artifacts(&mut self) -> Result<()> {
        let batch = self.artifacts.drain();
        if !batch.has_data {
            return Ok(());
        }
        for i in 0..batch.len() {
            let Measurement::Pose(m) = &batch.measurements[i] else {
                continue;
            };
            let artifact_key = batch.keys[i];
            let (stamp_us, _) = batch.time_pairs[i];
            let resolved = self.graph.read().key_at_time(stamp_us);
            let pose_key = match resolved {
                Ok(key) => key,
                Err(err) => {
                    warn!("artifact {artifact_key} has no pose key at {stamp_us}: {err}");
                    continue;
                }
            };
            let factor = Factor::artifact(pose_key, artifact_key, m.transform, m.covariance);
            let id = self
                .artifacts
                .info(artifact_key)
                .map(|info| info.parent_id.clone())
                .unwrap_or_default();
            let global = {
                let mut graph = self.graph.write();
                let frame = graph.fixed_frame_id().to_string();
                let robot_pose = graph.get_pose(pose_key)?;
                let global = robot_pose.compose(&m.transform);
                if !graph.has_node(artifact_key) {
                    graph.track_node(
                        Node::new(artifact_key, stamp_us, frame, global, m.covariance)
                            .with_id(id),
                    )?;
                }
                graph.track_factor(factor.clone())?;
                global
            };
            self.solver.update(&[factor], &[(artifact_key, global)], true)?;
            self.artifacts.update_global_pose(artifact_key, global);
        }
        Ok(())
    }

    /// Attach UWB ranges to the nearest pose keys; install drop priors.
    fn process_uwb(&mut self) -> Result<()> {
        let window_us = self.uwb.attach_window_us();
        let batch = self.uwb.drain();
        for i in 0..batch.len() {
            let Measurement::Range(m) = &batch.measurements[i] else {
                continue;
            };
            let anchor_key = batch.keys[i];
            let (stamp_us, _) = batch.time_pairs[i];
            let resolved = self.graph.read().closest_key_at_time(stamp_us, window_us);
            let pose_key = match resolved {
                Ok(key) => key,
                Err(err) => {
                    warn!("UWB range to {anchor_key} unattached: {err}");
                    continue;
                }
            };
            let factor = Factor::uwb_range(pose_key, anchor_key, m.range, m.variance);
            let anchor_pose = {
                let mut graph = self.graph.write();
                let frame = graph.fixed_frame_id().to_string();
                let robot_pose = graph.get_pose(pose_key)?;
                if !graph.has_node(anchor_key) {
                    // Best initial guess before trilateration: the robot
                    // position at first contact.
                    graph.track_node(Node::new(
                        anchor_key,
                        stamp_us,
                        frame,
                        robot_pose,
                        Covariance6::from_sigmas(m.range, 10.0),
                    ))?;
                }
                graph.track_factor(factor.clone())?;
                graph.get_pose(anchor_key)?
            };
            self.solver
                .update(&[factor], &[(anchor_key, anchor_pose)], true)?;
        }

        for drop in self.uwb.take_drops() {
            let factor = Factor::prior(drop.key, drop.prior_pose, drop.prior_covariance);
            {
                let mut graph = self.graph.write();
                let frame = graph.fixed_frame_id().to_string();
                if !graph.has_node(drop.key) {
                    graph.track_node(Node::new(
                        drop.key,
                        drop.stamp_us,
                        frame,
                        drop.prior_pose,
                        drop.prior_covariance,
                    ))?;
                }
                graph.track_factor(factor.clone())?;
            }
            self.solver
                .force_update(&[factor], &[(drop.key, drop.prior_pose)])?;
            info!("UWB anchor {} finalized at drop pose", drop.key);
        }
        Ok(())
    }

    /// Manual factors are operator-trusted loop closures.
    fn process_manual(&mut self) -> Result<()> {
        let batch = self.manual.drain();
        if !batch.has_data {
            return Ok(());
        }
        for (i, pair) in batch.keys.chunks_exact(2).enumerate() {
            let Measurement::Pose(m) = &batch.measurements[i] else {
                continue;
            };
            let (key_from, key_to) = (pair[0], pair[1]);
            {
                let graph = self.graph.read();
                if !graph.has_node(key_from) || !graph.has_node(key_to) {
                    warn!("manual factor {key_from} -> {key_to} references unknown keys");
                    continue;
                }
            }
            let factor = Factor::loop_closure(key_from, key_to, m.transform, m.covariance);
            self.graph.write().track_factor(factor.clone())?;
            self.solver.force_update(&[factor], &[])?;
        }
        Ok(())
    }

    /// Push the solver's values back into the store for publication.
    fn write_back_values(&mut self) {
        let values: Vec<(Key, Pose3D)> = self
            .solver
            .values()
            .iter()
            .map(|(k, p)| (*k, *p))
            .collect();
        let mut graph = self.graph.write();
        graph.update_values(values.iter().map(|(k, p)| (*k, p)));
    }

    // ------------------------------------------------------------------
    // Service surface
    // ------------------------------------------------------------------

    /// Execute one operator command.
    pub fn handle_command(&mut self, command: ServiceCommand) -> ServiceResponse {
        match self.dispatch(command) {
            Ok(response) => response,
            Err(err) => ServiceResponse::Failed {
                exit_code: err.exit_code() as i32,
                error: err.to_string(),
            },
        }
    }

    fn dispatch(&mut self, command: ServiceCommand) -> Result<ServiceResponse> {
        match command {
            ServiceCommand::AddFactor {
                key_from,
                key_to,
                transform,
                translation_precision,
                rotation_precision,
            } => {
                self.ingest_manual(ManualFactorMsg {
                    key_from,
                    key_to,
                    transform,
                    translation_precision,
                    rotation_precision,
                });
                self.process_manual()?;
                self.write_back_values();
                let accepted = self
                    .graph
                    .read()
                    .factors()
                    .iter()
                    .any(|f| f.key_from == key_from && f.key_to == key_to);
                Ok(ServiceResponse::FactorAdded { accepted })
            }
            ServiceCommand::RemoveFactor {
                key_from,
                key_to,
                kind,
            } => {
                let removed = self
                    .graph
                    .write()
                    .remove_factor_between(key_from, key_to, kind);
                if removed.is_some() {
                    self.solver.remove_loop_between(key_from, key_to)?;
                    self.write_back_values();
                } else {
                    warn!("remove_factor: no factor between {key_from} and {key_to}");
                }
                Ok(ServiceResponse::Removed {
                    removed: removed.is_some(),
                })
            }
            ServiceCommand::RemoveLastLoopClosure { prefix_pair } => {
                let removed = self.solver.remove_last_loop_closure(prefix_pair)?;
                if let Some(factor) = &removed {
                    self.graph.write().remove_factor_between(
                        factor.key_from,
                        factor.key_to,
                        Some(FactorKind::Loop),
                    );
                    self.write_back_values();
                }
                Ok(ServiceResponse::Removed {
                    removed: removed.is_some(),
                })
            }
            ServiceCommand::SaveGraph { path } => {
                archive::save(&self.graph.read(), &path)?;
                self.last_saved_path = Some(path);
                Ok(ServiceResponse::Saved)
            }
            ServiceCommand::LoadGraph { path } => {
                let loaded = archive::load(&path, &self.config.graph)?;
                let new_initial_key = self.reattach(loaded)?;
                self.last_saved_path = Some(path);
                Ok(ServiceResponse::Loaded { new_initial_key })
            }
            ServiceCommand::RestartFromLastSaved { delta, covariance } => {
                let path = self
                    .last_saved_path
                    .clone()
                    .ok_or_else(|| SlamError::CorruptArchive("no saved archive".into()))?;
                let loaded = archive::load(&path, &self.config.graph)?;
                let new_initial_key = self.reattach(loaded)?;
                self.bridge_restart(delta, covariance)?;
                Ok(ServiceResponse::Loaded { new_initial_key })
            }
            ServiceCommand::BatchLoopClosure => {
                let closures = {
                    let graph = self.graph.read();
                    self.engine.batch_loop_closures(&graph)
                };
                let mut accepted = 0;
                for closure in closures {
                    if self.submit_closure_checked(closure)? {
                        accepted += 1;
                    }
                }
                self.write_back_values();
                Ok(ServiceResponse::BatchClosures { accepted })
            }
            ServiceCommand::DropUwb {
                anchor_id,
                stamp_us,
                position,
            } => {
                let key = self.uwb.drop_anchor(&anchor_id, stamp_us, position);
                self.process_uwb()?;
                self.write_back_values();
                Ok(ServiceResponse::UwbDropped { key })
            }
        }
    }

    /// Replace in-memory state with a loaded graph and rebuild the solver.
    fn reattach(&mut self, loaded: PoseGraph) -> Result<Key> {
        let new_initial_key = loaded.initial_key().ok_or(SlamError::NotInitialized)?;
        let values: Vec<(Key, Pose3D)> = loaded.nodes().map(|n| (n.key, n.pose)).collect();
        let factors: Vec<Factor> = loaded.factors().to_vec();

        let mut solver = RobustSolver::new(&self.config.solver)?;
        solver.force_update(&factors, &values)?;
        self.solver = solver;
        self.engine = LoopClosureEngine::new(self.config.loop_closure.clone());
        *self.graph.write() = loaded;
        self.write_back_values();
        info!("reattached to loaded graph at {new_initial_key}");
        Ok(new_initial_key)
    }

    /// After a restart-from-archive, bridge the stored last key to the new
    /// session origin with a between factor carrying the provided delta.
    fn bridge_restart(&mut self, delta: Pose3D, covariance: Covariance6) -> Result<()> {
        let (prev_key, new_key, new_pose) = {
            let mut graph = self.graph.write();
            let frame = graph.fixed_frame_id().to_string();
            let prev_key = graph.current_key().ok_or(SlamError::NotInitialized)?;
            let prev_pose = graph.get_pose(prev_key)?;
            let stamp_us = graph.node(prev_key).map(|n| n.stamp_us).unwrap_or(0);
            let new_key = graph.next_key()?;
            let new_pose = prev_pose.compose(&delta);
            graph.track_node(Node::new(new_key, stamp_us, frame, new_pose, covariance))?;
            graph.track_factor(Factor::between(prev_key, new_key, delta, covariance))?;
            (prev_key, new_key, new_pose)
        };
        self.solver.update(
            &[Factor::between(prev_key, new_key, delta, covariance)],
            &[(new_key, new_pose)],
            true,
        )?;
        self.engine.admit_keyframe(new_key);
        Ok(())
    }
}

/// The estimate worker thread.
pub struct EstimateThread {
    handle: JoinHandle<()>,
}

impl EstimateThread {
    /// Spawn the estimate thread around a task.
    pub fn spawn(
        config: SlamConfig,
        graph: SharedGraph,
        sensors: SensorChannels,
        command_rx: Receiver<ServiceRequest>,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        let mut task = EstimateTask::new(config.clone(), graph)?;
        let period = Duration::from_millis(config.threads.estimate_period_ms);
        let handle = thread::Builder::new()
            .name("estimate".into())
            .spawn(move || {
                let ticker = tick(period);
                log::info!("estimate thread starting ({period:?} period)");
                while running.load(Ordering::Relaxed) {
                    crossbeam_channel::select! {
                        recv(ticker) -> _ => {
                            drain_sensors(&mut task, &sensors);
                            if let Err(err) = task.step() {
                                log::error!("estimate step failed, keeping prior state: {err}");
                            }
                        }
                        recv(command_rx) -> request => {
                            let Ok(request) = request else { break };
                            drain_sensors(&mut task, &sensors);
                            let response = task.handle_command(request.command);
                            let _ = request.reply.send(response);
                        }
                    }
                }
                log::info!("estimate thread stopped");
            })
            .expect("failed to spawn estimate thread");
        Ok(Self { handle })
    }

    pub fn join(self) -> thread::Result<()> {
        self.handle.join()
    }
}

fn drain_sensors(task: &mut EstimateTask, sensors: &SensorChannels) {
    while let Ok(msg) = sensors.odometry.try_recv() {
        task.ingest_odometry(msg);
    }
    while let Ok((stamp_us, cloud)) = sensors.scans.try_recv() {
        task.ingest_scan(stamp_us, cloud);
    }
    while let Ok(msg) = sensors.artifacts.try_recv() {
        task.ingest_artifact(msg);
    }
    while let Ok(msg) = sensors.uwb.try_recv() {
        task.ingest_uwb(msg);
    }
    while let Ok(msg) = sensors.manual.try_recv() {
        task.ingest_manual(msg);
    }
}

fn zero_covariance() -> Covariance6 {
    Covariance6::from_matrix(nalgebra::Matrix6::zeros())
}

/// Keep compounded keyframe covariances comfortably positive definite.
fn covariance_floor(covariance: Covariance6) -> Covariance6 {
    covariance.added(&Covariance6::from_sigmas(1e-3, 1e-3))
}
