//! End-to-end scenarios for the pose-graph back-end.

use std::collections::BTreeMap;

use approx::assert_relative_eq;
use nalgebra::Vector3;
use setu_slam::config::{GraphConfig, OutlierPolicy, SlamConfig, SolverConfig};
use setu_slam::io::archive;
use setu_slam::{
    Covariance6, Factor, FactorKind, Key, Node, PoseGraph, Pose3D, RobustSolver, UpdateOutcome,
};

fn key(i: u64) -> Key {
    Key::new('a', i)
}

fn tight() -> Covariance6 {
    Covariance6::from_sigmas(0.01, 0.01)
}

fn odom_cov() -> Covariance6 {
    Covariance6::from_sigmas(0.05, 0.02)
}

/// Square trajectory: four 1 m edges with 90-degree turns, ending where it
/// started. `overshoot` injects odometric drift per edge.
fn square_inputs(overshoot: f64) -> (Vec<(Key, Pose3D)>, Vec<Factor>) {
    let step = Pose3D::from_xyz_rpy(overshoot, 0.0, 0.0, 0.0, 0.0, std::f64::consts::FRAC_PI_2);
    let mut values = vec![(key(0), Pose3D::identity())];
    let mut factors = vec![Factor::prior(key(0), Pose3D::identity(), tight())];
    let mut pose = Pose3D::identity();
    for i in 0..4u64 {
        pose = pose.compose(&step);
        values.push((key(i + 1), pose));
        factors.push(Factor::odometry(key(i), key(i + 1), step, odom_cov()));
    }
    (values, factors)
}

/// S1: prior at the origin plus one odometry edge optimizes to (1, 0, 0).
#[test]
fn s1_single_robot_two_key_odometry() {
    let mut solver = RobustSolver::new(&SolverConfig::default()).unwrap();
    let values = vec![
        (key(0), Pose3D::identity()),
        (key(1), Pose3D::from_translation(0.8, 0.1, -0.05)),
    ];
    let factors = vec![
        Factor::prior(key(0), Pose3D::identity(), tight()),
        Factor::odometry(
            key(0),
            key(1),
            Pose3D::from_translation(1.0, 0.0, 0.0),
            odom_cov(),
        ),
    ];
    solver.update(&factors, &values, true).unwrap();

    let p1 = solver.values()[&key(1)];
    assert_relative_eq!(p1.translation.x, 1.0, epsilon = 1e-6);
    assert_relative_eq!(p1.translation.y, 0.0, epsilon = 1e-6);
    assert_relative_eq!(p1.translation.z, 0.0, epsilon = 1e-6);
}

/// S2: a drifting square closed by an identity loop factor pulls the
/// endpoints together.
#[test]
fn s2_clean_loop_closure() {
    let (values, factors) = square_inputs(1.01);
    let mut solver = RobustSolver::new(&SolverConfig::default()).unwrap();
    solver.update(&factors, &values, true).unwrap();

    let closure = Factor::loop_closure(key(4), key(0), Pose3D::identity(), tight());
    solver.update(&[closure], &[], true).unwrap();

    let gap = solver.values()[&key(4)].translation_distance(&solver.values()[&key(0)]);
    assert!(gap < 1e-3, "endpoint gap {gap} after closure");
}

/// S3: the spurious 10 m closure is rejected by PCM and the estimate stays
/// within 5 mm of the clean-closure result.
#[test]
fn s3_outlier_rejection() {
    let run = |with_outlier: bool| -> BTreeMap<Key, Pose3D> {
        let (values, factors) = square_inputs(1.01);
        let mut solver = RobustSolver::new(&SolverConfig::default()).unwrap();
        solver.update(&factors, &values, true).unwrap();

        if with_outlier {
            let spurious = Factor::loop_closure(
                key(2),
                key(0),
                Pose3D::from_translation(10.0, 0.0, 0.0),
                tight(),
            );
            solver.update(&[spurious], &[], true).unwrap();
        }
        let closure = Factor::loop_closure(key(4), key(0), Pose3D::identity(), tight());
        solver.update(&[closure], &[], true).unwrap();

        assert_eq!(
            solver
                .factors()
                .iter()
                .filter(|f| f.kind == FactorKind::Loop)
                .count(),
            1,
            "only the clean closure may survive"
        );
        solver.values().clone()
    };

    let clean = run(false);
    let filtered = run(true);
    for (key, pose) in &clean {
        let distance = pose.translation_distance(&filtered[key]);
        assert!(distance < 5e-3, "{key} moved {distance} m due to the outlier");
    }
}

/// S4: GNC with the odometry spine declared inlying drives the weights of
/// gross loop outliers toward zero.
#[test]
fn s4_gnc_known_inliers() {
    let n = 100u64;
    let mut values = vec![(key(0), Pose3D::identity())];
    let mut factors = vec![Factor::prior(key(0), Pose3D::identity(), tight())];
    for i in 0..n {
        values.push((key(i + 1), Pose3D::from_translation((i + 1) as f64, 0.0, 0.0)));
        factors.push(Factor::odometry(
            key(i),
            key(i + 1),
            Pose3D::from_translation(1.0, 0.0, 0.0),
            odom_cov(),
        ));
    }

    // 20 loop closures with sigma 0.1; five carry a 1 m (10 sigma) offset.
    let loop_cov = Covariance6::from_sigmas(0.1, 0.05);
    let mut outlier_pairs = Vec::new();
    for k in 0..20u64 {
        let i = k * 4;
        let j = i + 10;
        let truth = (j - i) as f64;
        let is_outlier = k % 4 == 3; // 5 of 20
        let x = if is_outlier { truth + 1.0 } else { truth };
        factors.push(Factor::loop_closure(
            key(i),
            key(j),
            Pose3D::from_translation(x, 0.0, 0.0),
            loop_cov,
        ));
        if is_outlier {
            outlier_pairs.push((key(i), key(j)));
        }
    }

    // PCM gates opened wide so GNC alone handles the outliers.
    let config = SolverConfig {
        outlier_policy: OutlierPolicy::Pcm,
        odom_threshold: 1e9,
        lc_threshold: 1e9,
        use_gnc: true,
        gnc_inlier_threshold: 1.0,
        ..SolverConfig::default()
    };
    let mut solver = RobustSolver::new(&config).unwrap();
    solver.update(&factors, &values, true).unwrap();

    let weights = solver.gnc_weights().expect("GNC surfaces weights");
    let solver_factors = solver.factors();
    assert_eq!(weights.len(), solver_factors.len());

    let mut outliers_checked = 0;
    for (factor, weight) in solver_factors.iter().zip(weights) {
        if factor.kind != FactorKind::Loop {
            assert_relative_eq!(*weight, 1.0);
            continue;
        }
        let is_outlier = outlier_pairs
            .iter()
            .any(|&(a, b)| factor.key_from == a && factor.key_to == b);
        if is_outlier {
            assert!(*weight < 0.1, "outlier weight {weight}");
            outliers_checked += 1;
        } else {
            assert!(*weight > 0.5, "inlier weight {weight}");
        }
    }
    assert_eq!(outliers_checked, 5);

    // Trajectory error stays within 2 cm everywhere.
    for i in 0..=n {
        let pose = solver.values()[&key(i)];
        let error = (pose.translation - Vector3::new(i as f64, 0.0, 0.0)).norm();
        assert!(error < 0.02, "ATE at {} is {error}", key(i));
    }
}

/// S5: archive round-trip preserves structure and poses.
#[test]
fn s5_save_load_roundtrip() {
    let mut graph = PoseGraph::new(&GraphConfig::default());
    graph
        .initialize(1_000_000, key(0), Pose3D::identity(), tight())
        .unwrap();
    let step = Pose3D::from_xyz_rpy(1.0, 0.0, 0.0, 0.0, 0.0, std::f64::consts::FRAC_PI_2);
    let mut pose = Pose3D::identity();
    for i in 0..4u64 {
        pose = pose.compose(&step);
        graph
            .track_node(Node::new(
                key(i + 1),
                1_000_000 + (i + 1) * 500_000,
                "world",
                pose,
                Covariance6::default(),
            ))
            .unwrap();
        graph
            .track_factor(Factor::odometry(key(i), key(i + 1), step, odom_cov()))
            .unwrap();
    }
    graph
        .track_factor(Factor::loop_closure(
            key(4),
            key(0),
            Pose3D::identity(),
            tight(),
        ))
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("square.zip");
    archive::save(&graph, &path).unwrap();

    let loaded = archive::load(&path, &GraphConfig::default()).unwrap();
    assert_eq!(loaded.num_nodes(), graph.num_nodes());
    assert_eq!(loaded.num_factors(), graph.num_factors());
    assert_eq!(loaded.num_loop_closures(), 1);
    assert_eq!(loaded.initial_key(), graph.initial_key());

    for node in graph.nodes() {
        let restored = loaded.node(node.key).expect("node survives the round trip");
        assert_eq!(restored.stamp_us, node.stamp_us);
        assert_relative_eq!(
            restored.pose.translation,
            node.pose.translation,
            epsilon = 1e-9
        );
        assert_relative_eq!(
            restored.pose.rotation.angle_to(&node.pose.rotation),
            0.0,
            epsilon = 1e-9
        );
    }
}

/// S6: the incremental diff carries exactly what changed since the last
/// clear.
#[test]
fn s6_incremental_diff() {
    let mut graph = PoseGraph::new(&GraphConfig::default());
    graph
        .initialize(1_000_000, key(0), Pose3D::identity(), tight())
        .unwrap();
    graph
        .track_node(Node::new(
            key(1),
            2_000_000,
            "world",
            Pose3D::from_translation(1.0, 0.0, 0.0),
            Covariance6::default(),
        ))
        .unwrap();
    graph
        .track_factor(Factor::odometry(
            key(0),
            key(1),
            Pose3D::from_translation(1.0, 0.0, 0.0),
            odom_cov(),
        ))
        .unwrap();

    let first = graph.to_incremental_msg();
    assert_eq!(first.nodes.len(), 2);
    assert_eq!(first.edges.len(), 1);
    assert_eq!(first.priors.len(), 1);

    graph.clear_incremental();
    assert!(graph.to_incremental_msg().is_empty());

    graph
        .track_node(Node::new(
            key(2),
            3_000_000,
            "world",
            Pose3D::from_translation(2.0, 0.0, 0.0),
            Covariance6::default(),
        ))
        .unwrap();
    graph
        .track_factor(Factor::odometry(
            key(1),
            key(2),
            Pose3D::from_translation(1.0, 0.0, 0.0),
            odom_cov(),
        ))
        .unwrap();

    let second = graph.to_incremental_msg();
    assert_eq!(second.nodes.len(), 1);
    assert_eq!(second.edges.len(), 1);
    assert!(second.priors.is_empty());
}

/// Property: update with nothing staged is a no-op.
#[test]
fn empty_update_is_noop() {
    let (values, factors) = square_inputs(1.0);
    let mut solver = RobustSolver::new(&SolverConfig::default()).unwrap();
    solver.update(&factors, &values, true).unwrap();
    assert!(matches!(
        solver.update(&[], &[], true).unwrap(),
        UpdateOutcome::NoChange
    ));
}

/// Property: add-then-remove-last leaves the factor set unchanged.
#[test]
fn remove_last_restores_factor_set() {
    let (values, factors) = square_inputs(1.01);
    let mut solver = RobustSolver::new(&SolverConfig::default()).unwrap();
    solver.update(&factors, &values, true).unwrap();

    let before: Vec<(Key, Key, FactorKind)> =
        solver.factors().iter().map(|f| f.triple()).collect();
    let closure = Factor::loop_closure(key(4), key(0), Pose3D::identity(), tight());
    solver.update(&[closure], &[], true).unwrap();
    solver.remove_last_loop_closure(None).unwrap().unwrap();

    let after: Vec<(Key, Key, FactorKind)> =
        solver.factors().iter().map(|f| f.triple()).collect();
    assert_eq!(before, after);
}

/// Property: the odometry spine stays a simple path with strictly
/// increasing indices and monotonic stamps.
#[test]
fn chain_continuity_and_time_monotonicity() {
    let mut graph = PoseGraph::new(&GraphConfig::default());
    graph
        .initialize(1_000_000, key(0), Pose3D::identity(), tight())
        .unwrap();
    for i in 1..6u64 {
        graph
            .track_node(Node::new(
                key(i),
                1_000_000 + i * 250_000,
                "world",
                Pose3D::from_translation(i as f64, 0.0, 0.0),
                Covariance6::default(),
            ))
            .unwrap();
        graph
            .track_factor(Factor::odometry(
                key(i - 1),
                key(i),
                Pose3D::from_translation(1.0, 0.0, 0.0),
                odom_cov(),
            ))
            .unwrap();
    }

    let odom: Vec<&Factor> = graph
        .factors()
        .iter()
        .filter(|f| f.kind == FactorKind::Odometry)
        .collect();
    for (idx, factor) in odom.iter().enumerate() {
        assert_eq!(factor.key_from.index(), idx as u64);
        assert_eq!(factor.key_to.index(), idx as u64 + 1);
    }
    let stamps: Vec<u64> = graph.odometry_nodes().map(|n| n.stamp_us).collect();
    assert!(stamps.windows(2).all(|w| w[0] <= w[1]));

    let priors = graph
        .factors()
        .iter()
        .filter(|f| f.kind == FactorKind::Prior)
        .count();
    assert_eq!(priors, 1);
}
