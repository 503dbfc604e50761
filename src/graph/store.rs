//! In-memory pose-graph store.
//!
//! Owns nodes, factors, keyed scans and the timestamp↔key index. Mutation
//! happens only under the writer lock held by the estimate task; the
//! publisher task reads snapshots and incremental diffs.
//!
//! # Invariants enforced here
//!
//! - Every key used by any factor exists as a node.
//! - The odometry subgraph per robot prefix is a simple path with strictly
//!   increasing indices.
//! - One prior factor per prefix at a time.
//! - Timestamps are monotonic along a robot's odometry keys.
//! - No duplicate `(from, to, kind)` triples for prior/odom/between edges.
//! - The timestamp↔key index stays in sync with the node set.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use log::warn;

use super::factor::{Factor, FactorKind, Node};
use super::msg::PoseGraphMsg;
use crate::config::GraphConfig;
use crate::core::types::{Covariance6, Key, PointCloud3D, Pose3D};
use crate::error::{Result, SlamError};

/// The pose-graph store.
#[derive(Debug, Clone)]
pub struct PoseGraph {
    fixed_frame_id: String,
    robot_prefix: char,
    time_threshold_us: u64,
    initial_noise: [f64; 6],

    nodes: BTreeMap<Key, Node>,
    factors: Vec<Factor>,
    structural_triples: HashSet<(Key, Key, FactorKind)>,

    keyed_scans: BTreeMap<Key, Arc<PointCloud3D>>,
    stamp_to_odom_key: BTreeMap<u64, Key>,

    initial_key: Option<Key>,
    current_key: Option<Key>,

    // Diff sets for incremental publication.
    values_new: Vec<Key>,
    edges_new: Vec<usize>,
    priors_new: Vec<usize>,
}

impl PoseGraph {
    /// Create an empty store from configuration.
    pub fn new(config: &GraphConfig) -> Self {
        Self {
            fixed_frame_id: config.fixed_frame_id.clone(),
            robot_prefix: config.robot_prefix,
            time_threshold_us: config.time_threshold_us,
            initial_noise: config.initial_noise,
            nodes: BTreeMap::new(),
            factors: Vec::new(),
            structural_triples: HashSet::new(),
            keyed_scans: BTreeMap::new(),
            stamp_to_odom_key: BTreeMap::new(),
            initial_key: None,
            current_key: None,
            values_new: Vec::new(),
            edges_new: Vec::new(),
            priors_new: Vec::new(),
        }
    }

    /// Rebuild a store from archive parts, re-validating every invariant.
    ///
    /// Factors must be orderable (priors and odometry edges in spine
    /// order); nodes are inserted in key order first.
    pub(crate) fn restore(
        config: &GraphConfig,
        fixed_frame_id: String,
        robot_prefix: char,
        nodes: Vec<Node>,
        factors: Vec<Factor>,
        scans: Vec<(Key, Arc<PointCloud3D>)>,
        initial_key: Option<Key>,
        current_key: Option<Key>,
    ) -> Result<Self> {
        let mut graph = Self::new(config);
        graph.fixed_frame_id = fixed_frame_id;
        graph.robot_prefix = robot_prefix;
        let mut nodes = nodes;
        nodes.sort_by_key(|n| n.key);
        for node in nodes {
            graph.track_node(node)?;
        }
        for factor in factors {
            graph.track_factor(factor)?;
        }
        for (key, scan) in scans {
            graph.attach_scan(key, scan)?;
        }
        graph.initial_key = initial_key;
        if current_key.is_some() {
            graph.current_key = current_key;
        }
        graph.clear_incremental();
        Ok(graph)
    }

    /// Install the prior factor and seed the values.
    ///
    /// Fails with `AlreadyInitialized` when called twice.
    pub fn initialize(
        &mut self,
        stamp_us: u64,
        initial_key: Key,
        prior_pose: Pose3D,
        prior_covariance: Covariance6,
    ) -> Result<()> {
        if self.initial_key.is_some() {
            return Err(SlamError::AlreadyInitialized);
        }
        let node = Node::new(
            initial_key,
            stamp_us,
            self.fixed_frame_id.clone(),
            prior_pose,
            prior_covariance,
        );
        self.track_node(node)?;
        self.track_factor(Factor::prior(initial_key, prior_pose, prior_covariance))?;
        self.initial_key = Some(initial_key);
        self.current_key = Some(initial_key);
        Ok(())
    }

    /// Diagonal prior covariance from the configured initial noise.
    pub fn initial_covariance(&self) -> Covariance6 {
        Covariance6::from_diagonal_vector(&nalgebra::Vector6::from_row_slice(&self.initial_noise))
    }

    /// Append a node.
    ///
    /// Odometry keys (lowercase prefix) are indexed by stamp and must keep
    /// timestamps monotonic along their spine.
    pub fn track_node(&mut self, node: Node) -> Result<()> {
        if self.nodes.contains_key(&node.key) {
            return Err(SlamError::ConstraintViolation(format!(
                "node {} already tracked",
                node.key
            )));
        }
        if is_odometry_key(&node.key) {
            if let Some(prev) = node.key.prev() {
                if let Some(prev_node) = self.nodes.get(&prev) {
                    if node.stamp_us < prev_node.stamp_us {
                        return Err(SlamError::ConstraintViolation(format!(
                            "non-monotonic stamp on {}: {} < {}",
                            node.key, node.stamp_us, prev_node.stamp_us
                        )));
                    }
                }
            }
            self.stamp_to_odom_key.insert(node.stamp_us, node.key);
            if node.key.prefix() == self.robot_prefix {
                match self.current_key {
                    Some(current) if node.key.index() <= current.index() => {}
                    _ => self.current_key = Some(node.key),
                }
            }
        }
        self.values_new.push(node.key);
        self.nodes.insert(node.key, node);
        Ok(())
    }

    /// Append a factor, validating key existence and graph invariants.
    pub fn track_factor(&mut self, factor: Factor) -> Result<()> {
        if !self.nodes.contains_key(&factor.key_from) {
            return Err(SlamError::KeyNotFound(factor.key_from));
        }
        if !self.nodes.contains_key(&factor.key_to) {
            return Err(SlamError::KeyNotFound(factor.key_to));
        }
        match factor.kind {
            FactorKind::Prior => {
                let prefix = factor.key_from.prefix();
                if self
                    .factors
                    .iter()
                    .any(|f| f.kind == FactorKind::Prior && f.key_from.prefix() == prefix)
                {
                    return Err(SlamError::ConstraintViolation(format!(
                        "duplicate prior for prefix '{}'",
                        prefix
                    )));
                }
            }
            FactorKind::Odometry => {
                if !factor.key_from.same_prefix(&factor.key_to)
                    || factor.key_to != factor.key_from.next()
                {
                    return Err(SlamError::ConstraintViolation(format!(
                        "odometry edge {} -> {} breaks the spine",
                        factor.key_from, factor.key_to
                    )));
                }
            }
            _ => {}
        }
        if matches!(
            factor.kind,
            FactorKind::Prior | FactorKind::Odometry | FactorKind::Between
        ) && !self.structural_triples.insert(factor.triple())
        {
            return Err(SlamError::ConstraintViolation(format!(
                "duplicate {} edge {} -> {}",
                factor.kind.label(),
                factor.key_from,
                factor.key_to
            )));
        }
        let index = self.factors.len();
        if factor.kind == FactorKind::Prior {
            self.priors_new.push(index);
        } else {
            self.edges_new.push(index);
        }
        self.factors.push(factor);
        Ok(())
    }

    /// Pose estimate at a key.
    pub fn get_pose(&self, key: Key) -> Result<Pose3D> {
        self.nodes
            .get(&key)
            .map(|n| n.pose)
            .ok_or(SlamError::KeyNotFound(key))
    }

    /// Pose of the most recent odometry keyframe.
    pub fn last_pose(&self) -> Result<Pose3D> {
        let key = self.current_key.ok_or(SlamError::NotInitialized)?;
        self.get_pose(key)
    }

    /// Odometry key closest to `stamp_us`, within the configured tolerance.
    pub fn key_at_time(&self, stamp_us: u64) -> Result<Key> {
        self.closest_key_at_time(stamp_us, self.time_threshold_us)
    }

    /// Odometry key closest to `stamp_us`, within an explicit tolerance.
    pub fn closest_key_at_time(&self, stamp_us: u64, threshold_us: u64) -> Result<Key> {
        let after = self.stamp_to_odom_key.range(stamp_us..).next();
        let before = self.stamp_to_odom_key.range(..=stamp_us).next_back();
        let best = match (before, after) {
            (Some((&tb, &kb)), Some((&ta, &ka))) => {
                if stamp_us - tb <= ta - stamp_us {
                    Some((tb, kb))
                } else {
                    Some((ta, ka))
                }
            }
            (Some((&t, &k)), None) | (None, Some((&t, &k))) => Some((t, k)),
            (None, None) => None,
        };
        match best {
            Some((t, k)) if t.abs_diff(stamp_us) <= threshold_us => Ok(k),
            _ => Err(SlamError::NoKeyAtTime {
                stamp_us,
                threshold_us,
            }),
        }
    }

    /// Associate a scan with an existing keyframe.
    pub fn attach_scan(&mut self, key: Key, scan: Arc<PointCloud3D>) -> Result<()> {
        if !self.nodes.contains_key(&key) {
            return Err(SlamError::KeyNotFound(key));
        }
        self.keyed_scans.insert(key, scan);
        Ok(())
    }

    /// Scan attached to a key, if any.
    pub fn scan(&self, key: Key) -> Option<Arc<PointCloud3D>> {
        self.keyed_scans.get(&key).cloned()
    }

    /// All keyed scans.
    pub fn keyed_scans(&self) -> impl Iterator<Item = (Key, &Arc<PointCloud3D>)> {
        self.keyed_scans.iter().map(|(k, s)| (*k, s))
    }

    /// Write back re-estimated poses after optimization.
    pub fn update_values<'a>(&mut self, values: impl IntoIterator<Item = (Key, &'a Pose3D)>) {
        for (key, pose) in values {
            match self.nodes.get_mut(&key) {
                Some(node) => {
                    node.pose = *pose;
                    self.values_new.push(key);
                }
                None => warn!("solver returned value for untracked key {key}"),
            }
        }
    }

    /// Remove the first factor matching the given endpoints (and kind, when
    /// specified). Returns the removed factor, or `None` as a benign no-op.
    pub fn remove_factor_between(
        &mut self,
        key_from: Key,
        key_to: Key,
        kind: Option<FactorKind>,
    ) -> Option<Factor> {
        let index = self.factors.iter().position(|f| {
            let endpoints = (f.key_from == key_from && f.key_to == key_to)
                || (f.key_from == key_to && f.key_to == key_from);
            endpoints && kind.map_or(true, |k| f.kind == k)
        })?;
        Some(self.remove_factor_at(index))
    }

    /// Remove all prior factors whose key carries `prefix`.
    pub fn remove_priors_with_prefix(&mut self, prefix: char) -> usize {
        let indices: Vec<usize> = self
            .factors
            .iter()
            .enumerate()
            .filter(|(_, f)| f.kind == FactorKind::Prior && f.key_from.prefix() == prefix)
            .map(|(i, _)| i)
            .collect();
        for index in indices.iter().rev() {
            self.remove_factor_at(*index);
        }
        indices.len()
    }

    fn remove_factor_at(&mut self, index: usize) -> Factor {
        let factor = self.factors.remove(index);
        self.structural_triples.remove(&factor.triple());
        let fix = |set: &mut Vec<usize>| {
            set.retain(|&i| i != index);
            for i in set.iter_mut() {
                if *i > index {
                    *i -= 1;
                }
            }
        };
        fix(&mut self.edges_new);
        fix(&mut self.priors_new);
        factor
    }

    /// Serialize the full graph.
    pub fn to_msg(&self) -> PoseGraphMsg {
        PoseGraphMsg {
            stamp_us: self.latest_stamp(),
            fixed_frame_id: self.fixed_frame_id.clone(),
            incremental: false,
            nodes: self.nodes.values().cloned().collect(),
            edges: self
                .factors
                .iter()
                .filter(|f| f.kind != FactorKind::Prior)
                .cloned()
                .collect(),
            priors: self
                .factors
                .iter()
                .filter(|f| f.kind == FactorKind::Prior)
                .cloned()
                .collect(),
        }
    }

    /// Serialize only what changed since the last [`clear_incremental`].
    ///
    /// [`clear_incremental`]: PoseGraph::clear_incremental
    pub fn to_incremental_msg(&self) -> PoseGraphMsg {
        let mut seen = HashSet::new();
        let nodes = self
            .values_new
            .iter()
            .filter(|k| seen.insert(**k))
            .filter_map(|k| self.nodes.get(k).cloned())
            .collect();
        PoseGraphMsg {
            stamp_us: self.latest_stamp(),
            fixed_frame_id: self.fixed_frame_id.clone(),
            incremental: true,
            nodes,
            edges: self
                .edges_new
                .iter()
                .filter_map(|&i| self.factors.get(i).cloned())
                .collect(),
            priors: self
                .priors_new
                .iter()
                .filter_map(|&i| self.factors.get(i).cloned())
                .collect(),
        }
    }

    /// Atomically reset the diff sets after a publication.
    pub fn clear_incremental(&mut self) {
        self.values_new.clear();
        self.edges_new.clear();
        self.priors_new.clear();
    }

    /// Erase all state (used when reattaching to a loaded graph).
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.factors.clear();
        self.structural_triples.clear();
        self.keyed_scans.clear();
        self.stamp_to_odom_key.clear();
        self.initial_key = None;
        self.current_key = None;
        self.clear_incremental();
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn node(&self, key: Key) -> Option<&Node> {
        self.nodes.get(&key)
    }

    pub fn has_node(&self, key: Key) -> bool {
        self.nodes.contains_key(&key)
    }

    pub fn factors(&self) -> &[Factor] {
        &self.factors
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_factors(&self) -> usize {
        self.factors.len()
    }

    pub fn num_loop_closures(&self) -> usize {
        self.factors
            .iter()
            .filter(|f| f.kind == FactorKind::Loop)
            .count()
    }

    pub fn is_initialized(&self) -> bool {
        self.initial_key.is_some()
    }

    pub fn initial_key(&self) -> Option<Key> {
        self.initial_key
    }

    pub fn current_key(&self) -> Option<Key> {
        self.current_key
    }

    /// Advance the current key; returns the newly assigned key.
    pub fn next_key(&mut self) -> Result<Key> {
        let current = self.current_key.ok_or(SlamError::NotInitialized)?;
        let next = current.next();
        self.current_key = Some(next);
        Ok(next)
    }

    pub fn robot_prefix(&self) -> char {
        self.robot_prefix
    }

    pub fn fixed_frame_id(&self) -> &str {
        &self.fixed_frame_id
    }

    pub fn time_threshold_us(&self) -> u64 {
        self.time_threshold_us
    }

    /// Keyframe nodes (lowercase prefixes), in key order.
    pub fn odometry_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values().filter(|n| is_odometry_key(&n.key))
    }

    fn latest_stamp(&self) -> u64 {
        self.nodes.values().map(|n| n.stamp_us).max().unwrap_or(0)
    }
}

/// Odometry keyframes carry lowercase prefixes; landmarks (artifacts, UWB
/// anchors) carry uppercase ones.
#[inline]
pub fn is_odometry_key(key: &Key) -> bool {
    key.prefix().is_ascii_lowercase()
}
