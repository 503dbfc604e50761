//! Robust pose-graph solver.
//!
//! Facade over the NLLS optimizer, the PCM outlier filter and the GNC
//! wrapper. Owns the working graph (assembled factors + current values).
//! Callers stage factors through [`RobustSolver::update`]; loop closures
//! pass through PCM before they can influence the estimate. A pre-update
//! snapshot of the values is kept for one call so numeric failures revert
//! cleanly instead of corrupting the estimate.

use std::collections::BTreeMap;
use std::path::Path;

use log::{info, warn};

use super::gnc::{optimize_with_gnc, GncResult};
use super::optimizer::{graph_cost, OptimizationOutcome, Optimizer, TerminationReason};
use super::pcm::Pcm;
use crate::config::{OptimizerConfig, OutlierPolicy, SolverConfig};
use crate::core::types::{Key, Pose3D};
use crate::error::{Result, SlamError};
use crate::graph::{Factor, FactorKind};

/// Result of a staged update.
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    /// Nothing changed; no optimization was run.
    NoChange,
    /// The working graph changed and was (optionally) re-optimized.
    Optimized(OptimizationOutcome),
    /// The working graph changed but optimization was deferred.
    Staged,
}

/// The robust solver.
pub struct RobustSolver {
    config: SolverConfig,
    pcm: Option<Pcm>,
    values: BTreeMap<Key, Pose3D>,
    /// The assembled working graph.
    factors: Vec<Factor>,
    /// Factor set when no outlier rejection is configured.
    base_factors: Vec<Factor>,
    /// Factors admitted without outlier rejection (trusted closures).
    forced_factors: Vec<Factor>,
    gnc_weights: Option<Vec<f64>>,
}

impl RobustSolver {
    /// Build a solver. GNC requires an active outlier-rejection policy.
    pub fn new(config: &SolverConfig) -> Result<Self> {
        let pcm = match config.outlier_policy {
            OutlierPolicy::None => None,
            OutlierPolicy::Pcm | OutlierPolicy::PcmSimple => Some(Pcm::new(config)),
        };
        if config.use_gnc && pcm.is_none() {
            return Err(SlamError::SolverFailure(
                "GNC is only supported together with PCM; configure PCM with a high \
                 threshold as an alternative to disabling outlier rejection"
                    .into(),
            ));
        }
        Ok(Self {
            config: config.clone(),
            pcm,
            values: BTreeMap::new(),
            factors: Vec::new(),
            base_factors: Vec::new(),
            forced_factors: Vec::new(),
            gnc_weights: None,
        })
    }

    /// Stage factors and values, run outlier rejection, and re-optimize when
    /// anything changed.
    pub fn update(
        &mut self,
        new_factors: &[Factor],
        new_values: &[(Key, Pose3D)],
        optimize: bool,
    ) -> Result<UpdateOutcome> {
        let mut changed = false;
        for (key, pose) in new_values {
            if self.values.insert(*key, *pose).is_none() {
                changed = true;
            }
        }

        match &mut self.pcm {
            Some(pcm) => {
                if pcm.remove_outliers(new_factors) {
                    changed = true;
                }
            }
            None => {
                if !new_factors.is_empty() {
                    self.base_factors.extend(new_factors.iter().cloned());
                    changed = true;
                }
            }
        }
        self.reassemble();

        if !changed {
            return Ok(UpdateOutcome::NoChange);
        }
        if !optimize {
            return Ok(UpdateOutcome::Staged);
        }
        self.optimize_working_graph().map(UpdateOutcome::Optimized)
    }

    /// Stage factors and values without outlier rejection on loop closures.
    ///
    /// Used for initialization and operator-trusted manual closures. The
    /// odometry spine and landmark factors still feed the PCM bookkeeping so
    /// later consistency tests see them.
    pub fn force_update(
        &mut self,
        new_factors: &[Factor],
        new_values: &[(Key, Pose3D)],
    ) -> Result<OptimizationOutcome> {
        for (key, pose) in new_values {
            self.values.entry(*key).or_insert(*pose);
        }
        let (loops, rest): (Vec<Factor>, Vec<Factor>) = new_factors
            .iter()
            .cloned()
            .partition(|f| f.kind == FactorKind::Loop);
        match &mut self.pcm {
            Some(pcm) => {
                pcm.remove_outliers(&rest);
            }
            None => self.base_factors.extend(rest),
        }
        self.forced_factors.extend(loops);
        self.reassemble();
        self.optimize_working_graph()
    }

    /// Pop the most recently admitted loop closure, optionally restricted to
    /// a prefix pair, and re-optimize. `Ok(None)` is a benign no-op.
    pub fn remove_last_loop_closure(
        &mut self,
        prefix_pair: Option<(char, char)>,
    ) -> Result<Option<Factor>> {
        let removed = match &mut self.pcm {
            Some(pcm) => pcm.remove_last_loop_closure(prefix_pair),
            None => pop_last_loop(&mut self.base_factors, prefix_pair),
        }
        .or_else(|| pop_last_loop(&mut self.forced_factors, prefix_pair));

        match removed {
            Some(factor) => {
                self.reassemble();
                self.optimize_working_graph()?;
                Ok(Some(factor))
            }
            None => {
                warn!("remove_last_loop_closure: no matching loop closure");
                Ok(None)
            }
        }
    }

    /// Remove an accepted loop closure by its endpoints and re-optimize.
    /// Returns `false` as a benign no-op when no such loop exists.
    pub fn remove_loop_between(&mut self, a: Key, b: Key) -> Result<bool> {
        let removed = match &mut self.pcm {
            Some(pcm) => pcm.remove_loop_between(a, b),
            None => remove_matching_loop(&mut self.base_factors, a, b),
        }
        .or_else(|| remove_matching_loop(&mut self.forced_factors, a, b));
        match removed {
            Some(_) => {
                self.reassemble();
                self.optimize_working_graph()?;
                Ok(true)
            }
            None => {
                warn!("remove_loop_between: no loop between {a} and {b}");
                Ok(false)
            }
        }
    }

    /// Remove prior factors carrying `prefix` (used when reattaching to a
    /// loaded graph) and re-optimize.
    pub fn remove_priors_with_prefix(&mut self, prefix: char) -> Result<usize> {
        let removed = match &mut self.pcm {
            Some(pcm) => pcm.remove_priors_with_prefix(prefix),
            None => {
                let before = self.base_factors.len();
                self.base_factors
                    .retain(|f| !(f.kind == FactorKind::Prior && f.key_from.prefix() == prefix));
                before - self.base_factors.len()
            }
        };
        if removed > 0 {
            self.reassemble();
            self.optimize_working_graph()?;
        } else {
            warn!("remove_priors_with_prefix('{prefix}') removed nothing");
        }
        Ok(removed)
    }

    /// Stash all loop closures touching a prefix and re-optimize.
    pub fn ignore_prefix(&mut self, prefix: char) -> Result<()> {
        match &mut self.pcm {
            Some(pcm) => {
                pcm.ignore_prefix(prefix);
                self.reassemble();
                self.optimize_working_graph()?;
                Ok(())
            }
            None => {
                warn!("ignore_prefix is a no-op without outlier rejection");
                Ok(())
            }
        }
    }

    /// Restore loop closures stashed under a prefix and re-optimize.
    pub fn revive_prefix(&mut self, prefix: char) -> Result<()> {
        match &mut self.pcm {
            Some(pcm) => {
                pcm.revive_prefix(prefix);
                self.reassemble();
                self.optimize_working_graph()?;
                Ok(())
            }
            None => {
                warn!("revive_prefix is a no-op without outlier rejection");
                Ok(())
            }
        }
    }

    /// Prefixes with stashed loop closures.
    pub fn ignored_prefixes(&self) -> Vec<char> {
        self.pcm
            .as_ref()
            .map(|p| p.ignored_prefixes())
            .unwrap_or_default()
    }

    /// Current value estimates.
    pub fn values(&self) -> &BTreeMap<Key, Pose3D> {
        &self.values
    }

    /// The assembled working factor set.
    pub fn factors(&self) -> &[Factor] {
        &self.factors
    }

    /// Per-factor GNC weights from the last optimization, when GNC ran.
    pub fn gnc_weights(&self) -> Option<&[f64]> {
        self.gnc_weights.as_deref()
    }

    /// Chi-squared cost of the current estimate on the working graph.
    pub fn cost(&self) -> f64 {
        graph_cost(&self.values, &self.factors)
    }

    /// Write the optimized graph as `result.g2o` under `folder`.
    pub fn save_data(&self, folder: &Path) -> Result<()> {
        std::fs::create_dir_all(folder)?;
        crate::io::g2o::write_g2o_file(&self.values, &self.factors, &folder.join("result.g2o"))
    }

    fn reassemble(&mut self) {
        let mut assembled = match &self.pcm {
            Some(pcm) => pcm.assembled_factors(),
            None => self.base_factors.clone(),
        };
        assembled.extend(self.forced_factors.iter().cloned());
        self.factors = assembled;
    }

    /// One optimization pass with a single damped retry; reverts the values
    /// snapshot and surfaces `SolverFailure` when both attempts fail.
    fn optimize_working_graph(&mut self) -> Result<OptimizationOutcome> {
        let snapshot = self.values.clone();
        let outcome = self.run_optimizer(self.config.optimizer.clone());
        if !failed(&outcome) {
            self.log_summary(&outcome);
            return Ok(outcome);
        }

        warn!(
            "optimizer failed ({:?}); retrying with increased damping",
            outcome.termination_reason
        );
        self.values = snapshot.clone();
        let mut damped_config = self.config.optimizer.clone();
        damped_config.damping_factor = (damped_config.damping_factor * 1e3).max(1e-3);
        let retry = self.run_optimizer(damped_config);
        if failed(&retry) {
            self.values = snapshot;
            return Err(SlamError::SolverFailure(format!(
                "optimization failed after damped retry: {:?}, error {:.3e} -> {:.3e}",
                retry.termination_reason, retry.initial_error, retry.final_error
            )));
        }
        self.log_summary(&retry);
        Ok(retry)
    }

    fn run_optimizer(&mut self, opt_config: OptimizerConfig) -> OptimizationOutcome {
        let optimizer = Optimizer::new(self.config.solver, opt_config);
        if self.config.use_gnc && self.pcm.is_some() {
            let known_inliers: Vec<bool> = self
                .factors
                .iter()
                .map(|f| f.kind != FactorKind::Loop)
                .collect();
            let GncResult {
                outcome, weights, ..
            } = optimize_with_gnc(
                &optimizer,
                &mut self.values,
                &self.factors,
                &known_inliers,
                self.config.gnc_inlier_threshold,
            );
            self.gnc_weights = Some(weights);
            outcome
        } else {
            optimizer.optimize(&mut self.values, &self.factors, None)
        }
    }

    fn log_summary(&self, outcome: &OptimizationOutcome) {
        if self.config.debug {
            info!(
                "solver summary: iterations={} error {:.3e} -> {:.3e} ({:?})",
                outcome.iterations,
                outcome.initial_error,
                outcome.final_error,
                outcome.termination_reason
            );
        }
    }
}

fn failed(outcome: &OptimizationOutcome) -> bool {
    matches!(
        outcome.termination_reason,
        TerminationReason::Diverged | TerminationReason::SolveFailed
    )
}

fn remove_matching_loop(factors: &mut Vec<Factor>, a: Key, b: Key) -> Option<Factor> {
    let index = factors.iter().rposition(|f| {
        f.kind == FactorKind::Loop
            && ((f.key_from == a && f.key_to == b) || (f.key_from == b && f.key_to == a))
    })?;
    Some(factors.remove(index))
}

fn pop_last_loop(factors: &mut Vec<Factor>, prefix_pair: Option<(char, char)>) -> Option<Factor> {
    let matches_pair = |f: &Factor| {
        prefix_pair.map_or(true, |(a, b)| {
            let (p, q) = (f.key_from.prefix(), f.key_to.prefix());
            (p == a && q == b) || (p == b && q == a)
        })
    };
    let index = factors
        .iter()
        .rposition(|f| f.kind == FactorKind::Loop && matches_pair(f))?;
    Some(factors.remove(index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Covariance6;
    use approx::assert_relative_eq;

    fn key(i: u64) -> Key {
        Key::new('a', i)
    }

    fn tight() -> Covariance6 {
        Covariance6::from_sigmas(0.01, 0.01)
    }

    fn solver() -> RobustSolver {
        RobustSolver::new(&SolverConfig::default()).unwrap()
    }

    fn seed_two_pose_chain(solver: &mut RobustSolver) {
        let values = vec![
            (key(0), Pose3D::identity()),
            (key(1), Pose3D::from_translation(0.9, 0.0, 0.0)),
        ];
        let factors = vec![
            Factor::prior(key(0), Pose3D::identity(), tight()),
            Factor::odometry(key(0), key(1), Pose3D::from_translation(1.0, 0.0, 0.0), tight()),
        ];
        solver.update(&factors, &values, true).unwrap();
    }

    #[test]
    fn test_gnc_requires_pcm() {
        let config = SolverConfig {
            outlier_policy: OutlierPolicy::None,
            use_gnc: true,
            ..SolverConfig::default()
        };
        assert!(matches!(
            RobustSolver::new(&config),
            Err(SlamError::SolverFailure(_))
        ));
    }

    #[test]
    fn test_update_optimizes_chain() {
        let mut solver = solver();
        seed_two_pose_chain(&mut solver);
        assert_relative_eq!(solver.values()[&key(1)].translation.x, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_empty_update_is_no_change() {
        let mut solver = solver();
        seed_two_pose_chain(&mut solver);
        let outcome = solver.update(&[], &[], true).unwrap();
        assert!(matches!(outcome, UpdateOutcome::NoChange));
    }

    #[test]
    fn test_spurious_loop_rejected() {
        let mut solver = solver();
        seed_two_pose_chain(&mut solver);
        let spurious = Factor::loop_closure(
            key(1),
            key(0),
            Pose3D::from_translation(10.0, 0.0, 0.0),
            tight(),
        );
        solver.update(&[spurious], &[], true).unwrap();
        // The outlier never enters the working graph; the chain stays put.
        assert_relative_eq!(solver.values()[&key(1)].translation.x, 1.0, epsilon = 1e-5);
        assert!(!solver.factors().iter().any(|f| f.kind == FactorKind::Loop));
    }

    #[test]
    fn test_force_update_bypasses_pcm() {
        let mut solver = solver();
        seed_two_pose_chain(&mut solver);
        let manual = Factor::loop_closure(
            key(1),
            key(0),
            Pose3D::from_translation(-1.0, 0.0, 0.0),
            tight(),
        );
        solver.force_update(&[manual], &[]).unwrap();
        assert!(solver.factors().iter().any(|f| f.kind == FactorKind::Loop));
    }

    #[test]
    fn test_remove_last_loop_restores_factor_set() {
        let mut solver = solver();
        seed_two_pose_chain(&mut solver);
        let factors_before = solver.factors().len();

        let closure = Factor::loop_closure(
            key(1),
            key(0),
            Pose3D::from_translation(-1.0, 0.0, 0.0),
            Covariance6::from_sigmas(0.1, 0.05),
        );
        solver.update(&[closure.clone()], &[], true).unwrap();
        assert_eq!(solver.factors().len(), factors_before + 1);

        let removed = solver.remove_last_loop_closure(None).unwrap().unwrap();
        assert_eq!(removed.key_from, closure.key_from);
        assert_eq!(solver.factors().len(), factors_before);
    }

    #[test]
    fn test_remove_last_loop_noop() {
        let mut solver = solver();
        seed_two_pose_chain(&mut solver);
        assert!(solver.remove_last_loop_closure(None).unwrap().is_none());
    }

    #[test]
    fn test_remove_priors_with_prefix() {
        let mut solver = solver();
        seed_two_pose_chain(&mut solver);
        let removed = solver.remove_priors_with_prefix('a').unwrap();
        assert_eq!(removed, 1);
        assert!(!solver.factors().iter().any(|f| f.kind == FactorKind::Prior));
    }

    #[test]
    fn test_without_pcm_appends_directly() {
        let config = SolverConfig {
            outlier_policy: OutlierPolicy::None,
            ..SolverConfig::default()
        };
        let mut solver = RobustSolver::new(&config).unwrap();
        seed_two_pose_chain(&mut solver);
        let closure = Factor::loop_closure(
            key(1),
            key(0),
            Pose3D::from_translation(-1.0, 0.0, 0.0),
            tight(),
        );
        solver.update(&[closure], &[], true).unwrap();
        assert!(solver.factors().iter().any(|f| f.kind == FactorKind::Loop));
    }
}
