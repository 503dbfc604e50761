//! Configuration for the SLAM back-end.
//!
//! Every component takes an explicit config value; there are no globals.
//! The aggregate [`SlamConfig`] can be deserialized from a TOML or JSON file
//! by the embedding application.

use serde::{Deserialize, Serialize};

/// Non-linear least-squares solver selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolverKind {
    /// Levenberg-Marquardt with diagonal damping.
    LevenbergMarquardt,
    /// Gauss-Newton.
    GaussNewton,
}

/// Outlier-rejection policy applied before loop closures enter the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutlierPolicy {
    /// No rejection: append and optimize.
    None,
    /// Pairwise consistency with Mahalanobis-distance tests.
    Pcm,
    /// Pairwise consistency with translational/rotational distance tests.
    PcmSimple,
}

/// Core optimizer iteration parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Maximum number of iterations.
    pub max_iterations: u32,
    /// Convergence threshold for relative error change.
    pub convergence_threshold: f64,
    /// Initial Levenberg-Marquardt damping factor.
    pub damping_factor: f64,
    /// Minimum error improvement to continue.
    pub min_improvement: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            convergence_threshold: 1e-9,
            damping_factor: 1e-6,
            min_improvement: 1e-12,
        }
    }
}

/// Robust solver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverConfig {
    /// NLLS solver variant.
    pub solver: SolverKind,
    /// Outlier-rejection policy.
    pub outlier_policy: OutlierPolicy,
    /// Chi-squared cutoff for the odometry-consistency test (Mahalanobis).
    pub odom_threshold: f64,
    /// Chi-squared cutoff for the pairwise-consistency test (Mahalanobis).
    pub lc_threshold: f64,
    /// Translational cutoff in meters for the Simple variant.
    pub trans_threshold: f64,
    /// Rotational cutoff in radians for the Simple variant.
    pub rot_threshold: f64,
    /// Above this many accepted loops, max-clique search switches from the
    /// exact Bron-Kerbosch search to the greedy heuristic.
    pub max_clique_exact_bound: usize,
    /// Wrap the NLLS solver with graduated non-convexity.
    pub use_gnc: bool,
    /// GNC inlier cost threshold.
    pub gnc_inlier_threshold: f64,
    /// Emit per-iteration solver summaries.
    pub debug: bool,
    /// Iteration parameters.
    pub optimizer: OptimizerConfig,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            solver: SolverKind::LevenbergMarquardt,
            outlier_policy: OutlierPolicy::Pcm,
            odom_threshold: 3.0,
            lc_threshold: 3.0,
            trans_threshold: 0.5,
            rot_threshold: 0.3,
            max_clique_exact_bound: 50,
            use_gnc: false,
            gnc_inlier_threshold: 1.0,
            debug: false,
            optimizer: OptimizerConfig::default(),
        }
    }
}

/// Keyframe admission thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyframeConfig {
    /// Accumulated translation (meters) before a new keyframe is admitted.
    pub translation_threshold_kf: f64,
    /// Accumulated rotation (radians) before a new keyframe is admitted.
    pub rotation_threshold_kf: f64,
}

impl Default for KeyframeConfig {
    fn default() -> Self {
        Self {
            translation_threshold_kf: 1.0,
            rotation_threshold_kf: 0.5,
        }
    }
}

/// ICP registration parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IcpConfig {
    /// Maximum number of iterations.
    pub max_iterations: u32,
    /// Convergence threshold on the incremental transform.
    pub tf_epsilon: f64,
    /// Maximum correspondence distance in meters.
    pub corr_dist: f64,
    /// Correspondence rejection distance for the coarse (RANSAC-style) pass.
    pub ransac_thresh: f64,
    /// Minimum number of valid correspondences.
    pub min_correspondences: usize,
    /// Fraction of worst correspondences rejected each iteration.
    pub outlier_ratio: f64,
}

impl Default for IcpConfig {
    fn default() -> Self {
        Self {
            max_iterations: 40,
            tf_epsilon: 1e-4,
            corr_dist: 1.0,
            ransac_thresh: 0.3,
            min_correspondences: 20,
            outlier_ratio: 0.1,
        }
    }
}

/// Loop-closure engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopClosureConfig {
    /// Minimum key-index gap between a query and a candidate.
    pub skip_recent_poses: u64,
    /// Minimum key-index gap since the last accepted closure.
    pub poses_before_reclosing: u64,
    /// Maximum translation distance between candidate poses, in meters.
    pub proximity_threshold: f64,
    /// Maximum ICP fitness (mean squared correspondence error) accepted.
    pub max_tolerable_fitness: f64,
    /// Reject a closure whose translation differs from the odometric guess
    /// by more than this many meters.
    pub translational_sanity_check_lc: f64,
    /// Reject a closure whose post-optimization cost exceeds this multiple
    /// of the pre-closure cost.
    pub max_cost_increase_ratio: f64,
    /// Translation sigma assigned to laser loop closures, in meters.
    pub laser_lc_trans_sigma: f64,
    /// Rotation sigma assigned to laser loop closures, in radians.
    pub laser_lc_rot_sigma: f64,
    /// ICP parameters.
    pub icp: IcpConfig,
    /// Keyframe gating.
    pub keyframe: KeyframeConfig,
}

impl Default for LoopClosureConfig {
    fn default() -> Self {
        Self {
            skip_recent_poses: 10,
            poses_before_reclosing: 5,
            proximity_threshold: 5.0,
            max_tolerable_fitness: 0.1,
            translational_sanity_check_lc: 2.0,
            max_cost_increase_ratio: 1.5,
            laser_lc_trans_sigma: 0.1,
            laser_lc_rot_sigma: 0.05,
            icp: IcpConfig::default(),
            keyframe: KeyframeConfig::default(),
        }
    }
}

/// Odometry handler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OdometryHandlerConfig {
    /// Maximum number of buffered pose-with-covariance samples.
    pub buffer_capacity: usize,
}

impl Default for OdometryHandlerConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 10_000,
        }
    }
}

/// Artifact handler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactHandlerConfig {
    /// Key prefix assigned to artifact landmarks.
    pub prefix: char,
    /// Translation precision of artifact observations.
    pub artifact_trans_precision: f64,
    /// Variance assigned to the (unobserved) rotation block.
    pub rotation_variance: f64,
}

impl Default for ArtifactHandlerConfig {
    fn default() -> Self {
        Self {
            prefix: 'A',
            artifact_trans_precision: 100.0,
            rotation_variance: 1e4,
        }
    }
}

/// UWB factor emission policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UwbFactorPolicy {
    /// Binary range factors to the nearest odometry key within the window.
    Range,
    /// Suppress range factors; only the drop prior is emitted.
    DropPriorOnly,
}

/// UWB handler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UwbHandlerConfig {
    /// Key prefix assigned to UWB anchors.
    pub prefix: char,
    /// Standard deviation of a range measurement, in meters.
    pub range_sigma: f64,
    /// Attach a range factor only when an odometry key exists within this
    /// window of the measurement stamp.
    pub attach_window_us: u64,
    /// Position sigma of the prior emitted when an anchor is dropped.
    pub drop_prior_sigma: f64,
    /// Factor emission policy.
    pub policy: UwbFactorPolicy,
}

impl Default for UwbHandlerConfig {
    fn default() -> Self {
        Self {
            prefix: 'U',
            range_sigma: 0.3,
            attach_window_us: 500_000,
            drop_prior_sigma: 0.5,
            policy: UwbFactorPolicy::Range,
        }
    }
}

/// Manual (operator) factor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualFactorConfig {
    /// Default translation precision for manual loop closures.
    pub manual_lc_trans_precision: f64,
    /// Default rotation precision for manual loop closures.
    pub manual_lc_rot_precision: f64,
}

impl Default for ManualFactorConfig {
    fn default() -> Self {
        Self {
            manual_lc_trans_precision: 100.0,
            manual_lc_rot_precision: 10.0,
        }
    }
}

/// Graph store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// This robot's odometry key prefix.
    pub robot_prefix: char,
    /// Fixed frame id stamped on nodes and published messages.
    pub fixed_frame_id: String,
    /// Tolerance for closest-key-at-time lookups, in microseconds.
    pub time_threshold_us: u64,
    /// Diagonal of the initial prior covariance:
    /// `[x, y, z, roll, pitch, yaw]` variances.
    pub initial_noise: [f64; 6],
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            robot_prefix: 'a',
            fixed_frame_id: "world".to_string(),
            time_threshold_us: 1_000_000,
            initial_noise: [1e-4, 1e-4, 1e-4, 1e-4, 1e-4, 1e-4],
        }
    }
}

/// Timer periods for the estimate and publisher threads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadConfig {
    /// Estimate task period in milliseconds.
    pub estimate_period_ms: u64,
    /// Publisher task period in milliseconds.
    pub publish_period_ms: u64,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            estimate_period_ms: 200,
            publish_period_ms: 1000,
        }
    }
}

/// Aggregate configuration for the back-end.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlamConfig {
    pub graph: GraphConfig,
    pub solver: SolverConfig,
    pub loop_closure: LoopClosureConfig,
    pub odometry: OdometryHandlerConfig,
    pub artifacts: ArtifactHandlerConfig,
    pub uwb: UwbHandlerConfig,
    pub manual: ManualFactorConfig,
    pub threads: ThreadConfig,
}
