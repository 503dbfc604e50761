//! Pairwise-consistency outlier rejection for loop closures.
//!
//! Maintains the accepted odometry spine (with compounded step covariances)
//! and, per robot-prefix pair, the set of accepted loop closures together
//! with a symmetric boolean consistency matrix. A loop candidate must first
//! be consistent with the odometry chain between its endpoints; it is then
//! tested pairwise against every previously accepted loop in its bucket by
//! closing the cycle
//!
//! ```text
//! i1 ──loop1──▶ j1
//!  ▲             │ odom
//!  │ odom        ▼
//! i2 ◀──loop2── j2
//! ```
//!
//! and measuring the Mahalanobis distance of the cycle residual under the
//! summed covariances of all four legs. Only the maximum clique of mutually
//! consistent loops enters the optimized graph; the rest stay stashed.
//!
//! The "Simple" variant replaces Mahalanobis distances with translational
//! and rotational thresholds on the same residuals.

use std::collections::{BTreeMap, HashSet};

use log::{info, warn};

use super::clique::MaxCliqueSolver;
use crate::config::{OutlierPolicy, SolverConfig};
use crate::core::types::{Covariance6, Key, Pose3D};
use crate::error::{Result, SlamError};
use crate::graph::{Factor, FactorKind};

/// Normalized prefix pair identifying a loop-closure bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObservationId(pub char, pub char);

impl ObservationId {
    fn for_keys(a: Key, b: Key) -> Self {
        let (p, q) = (a.prefix(), b.prefix());
        if p <= q {
            Self(p, q)
        } else {
            Self(q, p)
        }
    }
}

/// A loop closure accepted into a bucket, tagged with insertion order.
#[derive(Debug, Clone)]
struct AcceptedLoop {
    seq: u64,
    factor: Factor,
    covariance: Covariance6,
}

#[derive(Debug, Default, Clone)]
struct LoopBucket {
    loops: Vec<AcceptedLoop>,
    adjacency: Vec<Vec<bool>>,
    /// Indices of the current maximum clique.
    selected: Vec<usize>,
}

impl LoopBucket {
    fn remove_at(&mut self, index: usize) -> AcceptedLoop {
        let removed = self.loops.remove(index);
        self.adjacency.remove(index);
        for row in &mut self.adjacency {
            row.remove(index);
        }
        removed
    }
}

/// Consistency metric selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Metric {
    Mahalanobis,
    Distance,
}

/// The PCM outlier-rejection filter.
pub struct Pcm {
    metric: Metric,
    odom_threshold: f64,
    lc_threshold: f64,
    trans_threshold: f64,
    rot_threshold: f64,
    clique_solver: MaxCliqueSolver,

    /// Odometry steps keyed by their arrival key.
    odom_steps: BTreeMap<Key, (Pose3D, Covariance6)>,
    /// Keys known to the spine (roots and step arrivals).
    spine_keys: HashSet<Key>,
    odom_factors: Vec<Factor>,
    prior_factors: Vec<Factor>,
    landmark_factors: Vec<Factor>,
    loop_buckets: BTreeMap<ObservationId, LoopBucket>,
    /// Loops stashed away by `ignore_prefix`, keyed by the ignored prefix.
    ignored: BTreeMap<char, Vec<Factor>>,
    next_seq: u64,
    last_signature: u64,
}

impl Pcm {
    /// Build from solver configuration. Policy must be `Pcm` or `PcmSimple`.
    pub fn new(config: &SolverConfig) -> Self {
        let metric = match config.outlier_policy {
            OutlierPolicy::PcmSimple => Metric::Distance,
            _ => Metric::Mahalanobis,
        };
        Self {
            metric,
            odom_threshold: config.odom_threshold,
            lc_threshold: config.lc_threshold,
            trans_threshold: config.trans_threshold,
            rot_threshold: config.rot_threshold,
            clique_solver: MaxCliqueSolver::new(config.max_clique_exact_bound),
            odom_steps: BTreeMap::new(),
            spine_keys: HashSet::new(),
            odom_factors: Vec::new(),
            prior_factors: Vec::new(),
            landmark_factors: Vec::new(),
            loop_buckets: BTreeMap::new(),
            ignored: BTreeMap::new(),
            next_seq: 0,
            last_signature: 0,
        }
    }

    /// Classify incoming factors, test loop candidates, reselect cliques.
    ///
    /// Returns `true` when the assembled factor set changed and the solver
    /// should re-optimize.
    pub fn remove_outliers(&mut self, new_factors: &[Factor]) -> bool {
        for factor in new_factors {
            match factor.kind {
                FactorKind::Prior => self.prior_factors.push(factor.clone()),
                FactorKind::Odometry => {
                    if let Err(err) = self.append_odometry(factor) {
                        warn!("rejecting odometry factor: {err}");
                    }
                }
                FactorKind::Between => {
                    // On-spine between edges (the restart bridge) extend the
                    // odometry chain with compounded covariance; off-spine
                    // ones pass through untested.
                    if is_spine_edge(factor) {
                        if let Err(err) = self.append_odometry(factor) {
                            warn!("rejecting between factor: {err}");
                        }
                    } else {
                        self.landmark_factors.push(factor.clone());
                    }
                }
                FactorKind::Artifact | FactorKind::UwbRange => {
                    self.landmark_factors.push(factor.clone());
                }
                FactorKind::Loop => match self.test_candidate(factor) {
                    Ok(true) => {}
                    Ok(false) => info!(
                        "loop {} -> {} rejected by odometry-consistency test",
                        factor.key_from, factor.key_to
                    ),
                    Err(err) => warn!(
                        "loop {} -> {} rejected: {err}",
                        factor.key_from, factor.key_to
                    ),
                },
            }
        }

        for bucket in self.loop_buckets.values_mut() {
            bucket.selected = self.clique_solver.max_clique(&bucket.adjacency);
        }

        let signature = self.signature();
        let changed = signature != self.last_signature;
        self.last_signature = signature;
        changed
    }

    /// The working factor set: priors, odometry spine, landmarks, and the
    /// maximum-consistent loop subset.
    pub fn assembled_factors(&self) -> Vec<Factor> {
        let mut factors = Vec::with_capacity(
            self.prior_factors.len() + self.odom_factors.len() + self.landmark_factors.len(),
        );
        factors.extend(self.prior_factors.iter().cloned());
        factors.extend(self.odom_factors.iter().cloned());
        factors.extend(self.landmark_factors.iter().cloned());
        for bucket in self.loop_buckets.values() {
            for &index in &bucket.selected {
                factors.push(bucket.loops[index].factor.clone());
            }
        }
        factors
    }

    /// Number of odometry factors on the spine (GNC known inliers).
    pub fn num_odom_factors(&self) -> usize {
        self.odom_factors.len()
    }

    /// Number of accepted (clique-selected) loop closures.
    pub fn num_active_loops(&self) -> usize {
        self.loop_buckets.values().map(|b| b.selected.len()).sum()
    }

    /// Pop the most recently admitted loop closure, optionally restricted to
    /// a prefix pair. Returns the removed factor, or `None` as a no-op.
    pub fn remove_last_loop_closure(
        &mut self,
        prefix_pair: Option<(char, char)>,
    ) -> Option<Factor> {
        let id_filter = prefix_pair.map(|(a, b)| {
            if a <= b {
                ObservationId(a, b)
            } else {
                ObservationId(b, a)
            }
        });
        let (id, index, _) = self
            .loop_buckets
            .iter()
            .filter(|(id, _)| id_filter.map_or(true, |f| **id == f))
            .flat_map(|(id, bucket)| {
                bucket
                    .loops
                    .iter()
                    .enumerate()
                    .map(move |(i, l)| (*id, i, l.seq))
            })
            .max_by_key(|(_, _, seq)| *seq)?;

        let bucket = self.loop_buckets.get_mut(&id)?;
        let removed = bucket.remove_at(index);
        bucket.selected = self.clique_solver.max_clique(&bucket.adjacency);
        self.last_signature = self.signature();
        Some(removed.factor)
    }

    /// Remove an accepted loop closure by its endpoints. Returns the
    /// removed factor, or `None` as a no-op.
    pub fn remove_loop_between(&mut self, a: Key, b: Key) -> Option<Factor> {
        let id = ObservationId::for_keys(a, b);
        let bucket = self.loop_buckets.get_mut(&id)?;
        let index = bucket.loops.iter().position(|l| {
            (l.factor.key_from == a && l.factor.key_to == b)
                || (l.factor.key_from == b && l.factor.key_to == a)
        })?;
        let removed = bucket.remove_at(index);
        bucket.selected = self.clique_solver.max_clique(&bucket.adjacency);
        self.last_signature = self.signature();
        Some(removed.factor)
    }

    /// Drop prior factors carrying the given prefix.
    pub fn remove_priors_with_prefix(&mut self, prefix: char) -> usize {
        let before = self.prior_factors.len();
        self.prior_factors
            .retain(|f| f.key_from.prefix() != prefix);
        let removed = before - self.prior_factors.len();
        if removed > 0 {
            self.last_signature = self.signature();
        }
        removed
    }

    /// Stash every accepted loop touching `prefix` without destroying it.
    pub fn ignore_prefix(&mut self, prefix: char) {
        let mut stashed = Vec::new();
        for bucket in self.loop_buckets.values_mut() {
            let mut index = 0;
            while index < bucket.loops.len() {
                if bucket.loops[index].factor.touches_prefix(prefix) {
                    stashed.push(bucket.remove_at(index).factor);
                } else {
                    index += 1;
                }
            }
            bucket.selected = self.clique_solver.max_clique(&bucket.adjacency);
        }
        if !stashed.is_empty() {
            info!("ignoring {} loop closures on prefix '{prefix}'", stashed.len());
            self.ignored.entry(prefix).or_default().extend(stashed);
        } else {
            warn!("ignore_prefix('{prefix}') matched no loop closures");
        }
        self.last_signature = self.signature();
    }

    /// Re-admit loops stashed under `prefix`, re-running consistency tests.
    pub fn revive_prefix(&mut self, prefix: char) {
        let Some(stashed) = self.ignored.remove(&prefix) else {
            warn!("revive_prefix('{prefix}') has nothing stashed");
            return;
        };
        info!("reviving {} loop closures on prefix '{prefix}'", stashed.len());
        for factor in stashed {
            if let Err(err) = self.test_candidate(&factor) {
                warn!("revived loop dropped: {err}");
            }
        }
        for bucket in self.loop_buckets.values_mut() {
            bucket.selected = self.clique_solver.max_clique(&bucket.adjacency);
        }
        self.last_signature = self.signature();
    }

    /// Prefixes currently ignored.
    pub fn ignored_prefixes(&self) -> Vec<char> {
        self.ignored.keys().copied().collect()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn append_odometry(&mut self, factor: &Factor) -> Result<()> {
        let measurement = factor
            .pose_measurement()
            .ok_or_else(|| SlamError::ConstraintViolation("odometry without pose".into()))?;
        if !measurement.covariance.is_positive_definite() {
            return Err(SlamError::CovarianceNotPositiveDefinite);
        }
        if !self.spine_keys.contains(&factor.key_from) {
            // First edge of a chain roots the spine at its origin key.
            self.spine_keys.insert(factor.key_from);
        }
        self.odom_steps.insert(
            factor.key_to,
            (measurement.transform, measurement.covariance),
        );
        self.spine_keys.insert(factor.key_to);
        self.odom_factors.push(factor.clone());
        Ok(())
    }

    /// Odometric transform and covariance along the spine from `a` to `b`
    /// (same prefix, either direction).
    fn odom_between(&self, a: Key, b: Key) -> Result<(Pose3D, Covariance6)> {
        if !a.same_prefix(&b)
            || !self.spine_keys.contains(&a)
            || !self.spine_keys.contains(&b)
        {
            return Err(SlamError::OdomChainGap { from: a, to: b });
        }
        if a == b {
            return Ok((Pose3D::identity(), Covariance6::from_matrix(
                nalgebra::Matrix6::zeros(),
            )));
        }
        let (lo, hi, forward) = if a.index() < b.index() {
            (a, b, true)
        } else {
            (b, a, false)
        };
        let mut transform = Pose3D::identity();
        let mut covariance = Covariance6::from_matrix(nalgebra::Matrix6::zeros());
        let mut key = lo;
        while key != hi {
            let next = key.next();
            let (step, step_cov) = self
                .odom_steps
                .get(&next)
                .ok_or(SlamError::OdomChainGap { from: a, to: b })?;
            covariance = covariance.compose_with(step, step_cov);
            transform = transform.compose(step);
            key = next;
        }
        if forward {
            Ok((transform, covariance))
        } else {
            Ok((transform.inverse(), covariance.transported(&transform)))
        }
    }

    /// Run the odometry-consistency test and the pairwise tests for a loop
    /// candidate; on acceptance, insert it into its bucket.
    ///
    /// Returns `Ok(false)` when the odometry test rejects the candidate.
    fn test_candidate(&mut self, factor: &Factor) -> Result<bool> {
        let measurement = factor
            .pose_measurement()
            .ok_or_else(|| SlamError::ConstraintViolation("loop without pose".into()))?;
        if factor.key_from == factor.key_to {
            return Err(SlamError::ConstraintViolation(
                "degenerate loop closure onto one key".into(),
            ));
        }
        if !measurement.covariance.is_positive_definite() {
            return Err(SlamError::CovarianceNotPositiveDefinite);
        }

        // Single-spine odometry test; cross-prefix loops have no odometric
        // path and go straight to the pairwise stage.
        if factor.key_from.same_prefix(&factor.key_to) {
            let (odom_transform, odom_cov) =
                self.odom_between(factor.key_from, factor.key_to)?;
            let residual = measurement
                .transform
                .inverse()
                .compose(&odom_transform)
                .log();
            let combined = odom_cov.added(&measurement.covariance);
            if !self.residual_consistent(&residual, &combined, self.odom_threshold)? {
                return Ok(false);
            }
        }

        let id = ObservationId::for_keys(factor.key_from, factor.key_to);
        let candidate = normalize_loop(factor, measurement.covariance);

        // Pairwise consistency against every accepted loop in the bucket.
        let accepted: Vec<(Factor, Covariance6)> = self
            .loop_buckets
            .entry(id)
            .or_default()
            .loops
            .iter()
            .map(|l| (l.factor.clone(), l.covariance))
            .collect();
        let mut consistency = Vec::with_capacity(accepted.len());
        for other in &accepted {
            let consistent = self.pairwise_consistent(&candidate, other).unwrap_or(false);
            consistency.push(consistent);
        }

        let bucket = self.loop_buckets.entry(id).or_default();
        for (index, consistent) in consistency.iter().enumerate() {
            bucket.adjacency[index].push(*consistent);
        }
        let mut new_row = consistency;
        new_row.push(true);
        bucket.adjacency.push(new_row);
        bucket.loops.push(AcceptedLoop {
            seq: self.next_seq,
            factor: candidate.0,
            covariance: candidate.1,
        });
        self.next_seq += 1;
        Ok(true)
    }

    /// Close the cycle between two normalized loops and test the residual.
    fn pairwise_consistent(
        &self,
        l1: &(Factor, Covariance6),
        l2: &(Factor, Covariance6),
    ) -> Result<bool> {
        let (f1, c1) = l1;
        let (f2, c2) = l2;
        let t1 = f1.pose_measurement().map(|m| m.transform).unwrap_or_default();
        let t2 = f2.pose_measurement().map(|m| m.transform).unwrap_or_default();

        // Legs: i1 -> j1 (loop1), j1 -> j2 (odom), j2 -> i2 (loop2 inverse),
        // i2 -> i1 (odom).
        let (odom_j, cov_j) = self.odom_between(f1.key_to, f2.key_to)?;
        let (odom_i, cov_i) = self.odom_between(f2.key_from, f1.key_from)?;
        let cycle = t1
            .compose(&odom_j)
            .compose(&t2.inverse())
            .compose(&odom_i)
            .log();
        let combined = c1.added(c2).added(&cov_i).added(&cov_j);
        self.residual_consistent(&cycle, &combined, self.lc_threshold)
    }

    fn residual_consistent(
        &self,
        residual: &nalgebra::Vector6<f64>,
        covariance: &Covariance6,
        threshold: f64,
    ) -> Result<bool> {
        match self.metric {
            Metric::Mahalanobis => Ok(covariance.mahalanobis(residual)? <= threshold),
            Metric::Distance => {
                let trans = residual.fixed_rows::<3>(0).norm();
                let rot = residual.fixed_rows::<3>(3).norm();
                Ok(trans <= self.trans_threshold && rot <= self.rot_threshold)
            }
        }
    }

    /// Cheap change-detection signature over the assembled set.
    fn signature(&self) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut hasher = DefaultHasher::new();
        self.prior_factors.len().hash(&mut hasher);
        self.odom_factors.len().hash(&mut hasher);
        self.landmark_factors.len().hash(&mut hasher);
        for (id, bucket) in &self.loop_buckets {
            id.0.hash(&mut hasher);
            id.1.hash(&mut hasher);
            for &index in &bucket.selected {
                bucket.loops[index].seq.hash(&mut hasher);
            }
        }
        hasher.finish()
    }
}

/// A sequential same-prefix edge, i.e. one that belongs on the odometry
/// spine regardless of its factor kind.
fn is_spine_edge(factor: &Factor) -> bool {
    factor.key_from.same_prefix(&factor.key_to) && factor.key_to == factor.key_from.next()
}

/// Orient a loop so its endpoints sort by prefix; same-prefix loops are kept
/// as given. Keeps cycle construction uniform across a bucket.
fn normalize_loop(factor: &Factor, covariance: Covariance6) -> (Factor, Covariance6) {
    if factor.key_from.prefix() <= factor.key_to.prefix() {
        (factor.clone(), covariance)
    } else {
        let measurement = factor
            .pose_measurement()
            .expect("loop factors carry pose measurements");
        let inverted = measurement.transform.inverse();
        let cov = covariance.transported(&measurement.transform);
        (
            Factor::loop_closure(factor.key_to, factor.key_from, inverted, cov),
            cov,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SolverConfig;

    fn pcm() -> Pcm {
        Pcm::new(&SolverConfig::default())
    }

    fn key(i: u64) -> Key {
        Key::new('a', i)
    }

    fn step_x(from: u64, x: f64) -> Factor {
        Factor::odometry(
            key(from),
            key(from + 1),
            Pose3D::from_translation(x, 0.0, 0.0),
            Covariance6::from_sigmas(0.05, 0.02),
        )
    }

    fn square_spine(pcm: &mut Pcm) {
        // Four unit steps around a square (pure translations for clarity).
        let sigma = Covariance6::from_sigmas(0.05, 0.02);
        let steps = [
            Pose3D::from_translation(1.0, 0.0, 0.0),
            Pose3D::from_translation(0.0, 1.0, 0.0),
            Pose3D::from_translation(-1.0, 0.0, 0.0),
            Pose3D::from_translation(0.0, -1.0, 0.0),
        ];
        let factors: Vec<Factor> = steps
            .iter()
            .enumerate()
            .map(|(i, s)| Factor::odometry(key(i as u64), key(i as u64 + 1), *s, sigma))
            .collect();
        pcm.remove_outliers(&factors);
    }

    #[test]
    fn test_odometry_builds_spine() {
        let mut pcm = pcm();
        let changed = pcm.remove_outliers(&[step_x(0, 1.0), step_x(1, 1.0)]);
        assert!(changed);
        assert_eq!(pcm.num_odom_factors(), 2);
        let (t, _) = pcm.odom_between(key(0), key(2)).unwrap();
        assert!((t.translation.x - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_odom_between_reversed() {
        let mut pcm = pcm();
        pcm.remove_outliers(&[step_x(0, 1.0), step_x(1, 1.0)]);
        let (t, _) = pcm.odom_between(key(2), key(0)).unwrap();
        assert!((t.translation.x + 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_chain_gap_detected() {
        let pcm = pcm();
        assert!(matches!(
            pcm.odom_between(key(0), key(3)),
            Err(SlamError::OdomChainGap { .. })
        ));
    }

    #[test]
    fn test_consistent_loop_accepted() {
        let mut pcm = pcm();
        square_spine(&mut pcm);
        let closure = Factor::loop_closure(
            key(4),
            key(0),
            Pose3D::identity(),
            Covariance6::from_sigmas(0.1, 0.05),
        );
        let changed = pcm.remove_outliers(&[closure]);
        assert!(changed);
        assert_eq!(pcm.num_active_loops(), 1);
    }

    #[test]
    fn test_gross_outlier_rejected_by_odometry_test() {
        let mut pcm = pcm();
        square_spine(&mut pcm);
        let spurious = Factor::loop_closure(
            key(2),
            key(0),
            Pose3D::from_translation(10.0, 0.0, 0.0),
            Covariance6::from_sigmas(0.1, 0.05),
        );
        pcm.remove_outliers(&[spurious]);
        assert_eq!(pcm.num_active_loops(), 0);
    }

    #[test]
    fn test_outlier_kept_out_of_clique() {
        let mut pcm = pcm();
        // Long straight spine so a generous covariance admits both loops to
        // the bucket but they cannot be mutually consistent.
        let factors: Vec<Factor> = (0..6).map(|i| step_x(i, 1.0)).collect();
        pcm.remove_outliers(&factors);

        let good = Factor::loop_closure(
            key(5),
            key(0),
            Pose3D::from_translation(-5.0, 0.0, 0.0),
            Covariance6::from_sigmas(0.2, 0.1),
        );
        let drifted = Factor::loop_closure(
            key(4),
            key(0),
            Pose3D::from_translation(-4.0, 1.4, 0.0),
            Covariance6::from_sigmas(0.5, 0.2),
        );
        pcm.remove_outliers(&[good, drifted]);
        // Both passed the (loose) odometry gate at most; the clique keeps a
        // consistent subset only.
        assert!(pcm.num_active_loops() >= 1);
        let factors = pcm.assembled_factors();
        let loops: Vec<&Factor> = factors
            .iter()
            .filter(|f| f.kind == FactorKind::Loop)
            .collect();
        for pair in loops.windows(2) {
            // Every surviving pair is pairwise consistent by construction.
            assert!(pair[0].key_from != pair[1].key_from || pair[0].key_to != pair[1].key_to);
        }
    }

    #[test]
    fn test_remove_last_loop_closure() {
        let mut pcm = pcm();
        square_spine(&mut pcm);
        let closure = Factor::loop_closure(
            key(4),
            key(0),
            Pose3D::identity(),
            Covariance6::from_sigmas(0.1, 0.05),
        );
        pcm.remove_outliers(&[closure.clone()]);
        let removed = pcm.remove_last_loop_closure(None).unwrap();
        assert_eq!(removed.key_from, closure.key_from);
        assert_eq!(pcm.num_active_loops(), 0);
        assert!(pcm.remove_last_loop_closure(None).is_none());
    }

    #[test]
    fn test_ignore_and_revive_prefix() {
        let mut pcm = pcm();
        square_spine(&mut pcm);
        let closure = Factor::loop_closure(
            key(4),
            key(0),
            Pose3D::identity(),
            Covariance6::from_sigmas(0.1, 0.05),
        );
        pcm.remove_outliers(&[closure]);
        assert_eq!(pcm.num_active_loops(), 1);

        pcm.ignore_prefix('a');
        assert_eq!(pcm.num_active_loops(), 0);
        assert_eq!(pcm.ignored_prefixes(), vec!['a']);

        pcm.revive_prefix('a');
        assert_eq!(pcm.num_active_loops(), 1);
        assert!(pcm.ignored_prefixes().is_empty());
    }

    #[test]
    fn test_between_on_spine_extends_chain() {
        let mut pcm = pcm();
        pcm.remove_outliers(&[step_x(0, 1.0)]);
        // The restart bridge arrives as a between factor on the spine.
        let bridge = Factor::between(
            key(1),
            key(2),
            Pose3D::from_translation(1.0, 0.0, 0.0),
            Covariance6::from_sigmas(0.05, 0.02),
        );
        pcm.remove_outliers(&[bridge]);
        assert_eq!(pcm.num_odom_factors(), 2);
        let (t, _) = pcm.odom_between(key(0), key(2)).unwrap();
        assert!((t.translation.x - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_off_spine_between_passes_through() {
        let mut pcm = pcm();
        pcm.remove_outliers(&[step_x(0, 1.0), step_x(1, 1.0)]);
        let cross = Factor::between(
            key(0),
            key(2),
            Pose3D::from_translation(2.0, 0.0, 0.0),
            Covariance6::from_sigmas(0.1, 0.05),
        );
        pcm.remove_outliers(&[cross]);
        assert_eq!(pcm.num_odom_factors(), 2);
        assert!(pcm
            .assembled_factors()
            .iter()
            .any(|f| f.kind == FactorKind::Between));
    }

    #[test]
    fn test_landmarks_pass_through() {
        let mut pcm = pcm();
        pcm.remove_outliers(&[step_x(0, 1.0)]);
        let artifact = Factor::artifact(
            key(1),
            Key::new('A', 0),
            Pose3D::from_translation(0.5, 0.5, 0.0),
            Covariance6::default(),
        );
        pcm.remove_outliers(&[artifact]);
        let assembled = pcm.assembled_factors();
        assert!(assembled.iter().any(|f| f.kind == FactorKind::Artifact));
    }

    #[test]
    fn test_update_without_changes_reports_no_change() {
        let mut pcm = pcm();
        pcm.remove_outliers(&[step_x(0, 1.0)]);
        assert!(!pcm.remove_outliers(&[]));
    }
}
