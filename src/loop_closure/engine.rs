//! Loop-closure engine.
//!
//! Driven by the estimate task. Gates keyframes by accumulated motion,
//! generates candidates by proximity on the current estimate, registers
//! candidate scan pairs with ICP, sanity-checks the result, and emits loop
//! factors for the robust solver (which applies PCM).
//!
//! Candidate rules for a query key `q` and candidate `k`:
//! - same-prefix candidates must satisfy `|index(q) - index(k)| >= skip_recent_poses`
//! - `distance(pose(q), pose(k)) <= proximity_threshold`
//! - no search at all until `|index(q) - index(last_closure)| >= poses_before_reclosing`

use std::collections::BTreeMap;

use kiddo::{KdTree, SquaredEuclidean};
use log::{debug, info, warn};

use super::icp::Icp3D;
use crate::config::LoopClosureConfig;
use crate::core::types::{Covariance6, Key, Pose3D};
use crate::error::Result;
use crate::graph::{Factor, PoseGraph};

/// Per-keyframe pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyframeStatus {
    /// Motion accumulated, keyframe not yet admitted.
    Pending,
    /// Admitted to the graph with a keyed scan.
    Admitted,
    /// Loop-closure candidates evaluated for this keyframe.
    ClosuresEvaluated,
    /// Accepted by the solver and published.
    Committed,
}

/// The loop-closure engine.
pub struct LoopClosureEngine {
    config: LoopClosureConfig,
    icp: Icp3D,
    accumulated_translation: f64,
    accumulated_rotation: f64,
    /// Explicit gate requested by artifact/UWB/manual ingestion.
    gate_requested: bool,
    last_closure_key: Option<Key>,
    status: BTreeMap<Key, KeyframeStatus>,
}

impl LoopClosureEngine {
    pub fn new(config: LoopClosureConfig) -> Self {
        let icp = Icp3D::new(config.icp.clone());
        Self {
            config,
            icp,
            accumulated_translation: 0.0,
            accumulated_rotation: 0.0,
            gate_requested: false,
            last_closure_key: None,
            status: BTreeMap::new(),
        }
    }

    /// Accumulate relative motion; returns `true` when the keyframe gate
    /// fires (motion thresholds exceeded or an explicit gate was requested).
    pub fn register_motion(&mut self, delta: &Pose3D) -> bool {
        self.accumulated_translation += delta.translation.norm();
        self.accumulated_rotation += delta.rotation_angle();
        self.gate_requested
            || self.accumulated_translation >= self.config.keyframe.translation_threshold_kf
            || self.accumulated_rotation >= self.config.keyframe.rotation_threshold_kf
    }

    /// Force the next `register_motion` to fire (artifact / UWB / manual
    /// factors need a pose key at their stamp).
    pub fn request_keyframe(&mut self) {
        self.gate_requested = true;
    }

    /// Record that a keyframe was admitted; resets the motion accumulators.
    pub fn admit_keyframe(&mut self, key: Key) {
        self.accumulated_translation = 0.0;
        self.accumulated_rotation = 0.0;
        self.gate_requested = false;
        self.status.insert(key, KeyframeStatus::Admitted);
    }

    /// Pipeline state of a keyframe, defaulting to `Pending`.
    pub fn status(&self, key: Key) -> KeyframeStatus {
        self.status
            .get(&key)
            .copied()
            .unwrap_or(KeyframeStatus::Pending)
    }

    /// Mark keyframes whose closures the solver has accepted.
    pub fn mark_committed(&mut self, keys: impl IntoIterator<Item = Key>) {
        for key in keys {
            self.status.insert(key, KeyframeStatus::Committed);
        }
    }

    /// Whether a proposed closure keeps the optimization cost within the
    /// configured regression margin.
    pub fn cost_regression_ok(&self, cost_before: f64, cost_after: f64) -> bool {
        cost_before <= 0.0 || cost_after <= cost_before * self.config.max_cost_increase_ratio
    }

    /// Find loop closures for a freshly admitted keyframe.
    ///
    /// Returns accepted closure factors; rejected candidates are logged and
    /// dropped. ICP failures are non-fatal.
    pub fn find_loop_closures(&mut self, graph: &PoseGraph, query: Key) -> Result<Vec<Factor>> {
        self.status.insert(query, KeyframeStatus::ClosuresEvaluated);

        if let Some(last) = self.last_closure_key {
            if last.same_prefix(&query)
                && query.index().abs_diff(last.index()) < self.config.poses_before_reclosing
            {
                return Ok(Vec::new());
            }
        }

        let candidates = self.candidate_keys(graph, query);
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        debug!("evaluating {} loop candidates for {query}", candidates.len());

        let mut closures = Vec::new();
        for candidate in candidates {
            match self.register_candidate(graph, query, candidate) {
                Ok(Some(factor)) => closures.push(factor),
                Ok(None) => {}
                Err(err) => debug!("candidate {query} -> {candidate} dropped: {err}"),
            }
        }

        if !closures.is_empty() {
            info!("{} loop closures accepted for {query}", closures.len());
            self.last_closure_key = Some(query);
        }
        Ok(closures)
    }

    /// Re-evaluate closures over the whole trajectory on the current
    /// optimized estimate. Pairs that already share a loop factor are
    /// skipped.
    pub fn batch_loop_closures(&mut self, graph: &PoseGraph) -> Vec<Factor> {
        let queries: Vec<Key> = graph.odometry_nodes().map(|n| n.key).collect();
        let mut closures = Vec::new();
        for query in queries {
            if graph.scan(query).is_none() {
                continue;
            }
            for candidate in self.candidate_keys(graph, query) {
                // One direction per pair is enough.
                if candidate < query || has_loop_between(graph, query, candidate) {
                    continue;
                }
                match self.register_candidate(graph, query, candidate) {
                    Ok(Some(factor)) => closures.push(factor),
                    Ok(None) => {}
                    Err(err) => debug!("batch candidate {query} -> {candidate}: {err}"),
                }
            }
        }
        info!("batch re-closure proposed {} factors", closures.len());
        closures
    }

    /// Proximity candidates for a query key on the current estimate.
    fn candidate_keys(&self, graph: &PoseGraph, query: Key) -> Vec<Key> {
        let Ok(query_pose) = graph.get_pose(query) else {
            return Vec::new();
        };

        let mut keys = Vec::new();
        let mut tree: KdTree<f64, 3> = KdTree::new();
        for node in graph.odometry_nodes() {
            if node.key == query {
                continue;
            }
            if node.key.same_prefix(&query)
                && node.key.index().abs_diff(query.index()) < self.config.skip_recent_poses
            {
                continue;
            }
            if graph.scan(node.key).is_none() {
                continue;
            }
            let t = node.pose.translation;
            tree.add(&[t.x, t.y, t.z], keys.len() as u64);
            keys.push(node.key);
        }
        if keys.is_empty() {
            return Vec::new();
        }

        let q = query_pose.translation;
        let radius_sq = self.config.proximity_threshold * self.config.proximity_threshold;
        let mut found: Vec<Key> = tree
            .within_unsorted::<SquaredEuclidean>(&[q.x, q.y, q.z], radius_sq)
            .into_iter()
            .map(|n| keys[n.item as usize])
            .collect();
        found.sort_unstable();
        found
    }

    /// ICP registration plus sanity checks for one candidate pair.
    fn register_candidate(
        &self,
        graph: &PoseGraph,
        query: Key,
        candidate: Key,
    ) -> Result<Option<Factor>> {
        let (Some(query_scan), Some(candidate_scan)) =
            (graph.scan(query), graph.scan(candidate))
        else {
            return Ok(None);
        };
        let query_pose = graph.get_pose(query)?;
        let candidate_pose = graph.get_pose(candidate)?;

        // Initial guess: relative pose of the candidate in the query frame.
        let guess = query_pose.between(&candidate_pose);
        let result = self
            .icp
            .register(&candidate_scan, &query_scan, &guess)?;

        if !result.converged || result.fitness > self.config.max_tolerable_fitness {
            debug!(
                "candidate {query} -> {candidate}: fitness {:.4} over limit or not converged",
                result.fitness
            );
            return Ok(None);
        }

        let drift = (result.transform.translation - guess.translation).norm();
        if drift > self.config.translational_sanity_check_lc {
            warn!(
                "candidate {query} -> {candidate}: translation {drift:.2} m from the \
                 odometric guess, rejecting"
            );
            return Ok(None);
        }

        // Floor the ICP covariance with the configured laser sigmas.
        let covariance = result.covariance.added(&Covariance6::from_sigmas(
            self.config.laser_lc_trans_sigma,
            self.config.laser_lc_rot_sigma,
        ));
        Ok(Some(Factor::loop_closure(
            query,
            candidate,
            result.transform,
            covariance,
        )))
    }
}

fn has_loop_between(graph: &PoseGraph, a: Key, b: Key) -> bool {
    graph.factors().iter().any(|f| {
        f.kind == crate::graph::FactorKind::Loop
            && ((f.key_from == a && f.key_to == b) || (f.key_from == b && f.key_to == a))
    })
}
