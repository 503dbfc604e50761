//! Zip-archive persistence for the pose graph.
//!
//! Layout:
//! ```text
//! <archive>.zip
//! ├── manifest.json     format version, prefix, counters, stamps, range factors
//! ├── graph.g2o         poses and pose factors in g2o text form
//! └── scans/<KEY>.pcd   one ASCII PCD per keyed scan
//! ```
//!
//! Writes go to a sibling temp file renamed into place on success, so a
//! failed save never clobbers the previous archive. Loading fully replaces
//! the in-memory store and fails with `CorruptArchive` on a version
//! mismatch or a scan referenced by the manifest but absent from the
//! archive.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use log::info;
use serde::{Deserialize, Serialize};
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use super::{g2o, pcd};
use crate::config::GraphConfig;
use crate::core::types::{Covariance6, Key, Pose3D};
use crate::error::{Result, SlamError};
use crate::graph::{Factor, FactorKind, Node, PoseGraph};

/// Bumped whenever the archive layout changes incompatibly.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct NodeMeta {
    key: Key,
    stamp_us: u64,
    id_string: Option<String>,
    covariance: Covariance6,
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    format_version: u32,
    robot_prefix: char,
    fixed_frame_id: String,
    initial_key: Option<Key>,
    current_key: Option<Key>,
    nodes: Vec<NodeMeta>,
    /// Range factors have no g2o representation and round-trip here.
    range_factors: Vec<Factor>,
    scan_keys: Vec<Key>,
}

/// Save the graph to a zip archive at `path`.
pub fn save(graph: &PoseGraph, path: &Path) -> Result<()> {
    let manifest = Manifest {
        format_version: FORMAT_VERSION,
        robot_prefix: graph.robot_prefix(),
        fixed_frame_id: graph.fixed_frame_id().to_string(),
        initial_key: graph.initial_key(),
        current_key: graph.current_key(),
        nodes: graph
            .nodes()
            .map(|n| NodeMeta {
                key: n.key,
                stamp_us: n.stamp_us,
                id_string: n.id_string.clone(),
                covariance: n.covariance,
            })
            .collect(),
        range_factors: graph
            .factors()
            .iter()
            .filter(|f| f.kind == FactorKind::UwbRange)
            .cloned()
            .collect(),
        scan_keys: graph.keyed_scans().map(|(k, _)| k).collect(),
    };

    let values: BTreeMap<Key, Pose3D> = graph.nodes().map(|n| (n.key, n.pose)).collect();
    let pose_factors: Vec<Factor> = graph
        .factors()
        .iter()
        .filter(|f| f.kind != FactorKind::UwbRange)
        .cloned()
        .collect();
    let mut g2o_text = Vec::new();
    g2o::write_g2o(&values, &pose_factors, &mut g2o_text)?;

    let tmp_path = path.with_extension("zip.tmp");
    {
        let file = File::create(&tmp_path)?;
        let mut zip = ZipWriter::new(file);
        let options = SimpleFileOptions::default();

        zip.start_file("manifest.json", options)?;
        zip.write_all(&serde_json::to_vec_pretty(&manifest)?)?;

        zip.start_file("graph.g2o", options)?;
        zip.write_all(&g2o_text)?;

        for (key, scan) in graph.keyed_scans() {
            zip.start_file(format!("scans/{key}.pcd"), options)?;
            zip.write_all(&pcd::write_pcd_to_vec(scan.as_ref())?)?;
        }
        zip.finish()?;
    }
    std::fs::rename(&tmp_path, path)?;
    info!(
        "saved pose graph ({} nodes, {} factors, {} scans) to {}",
        graph.num_nodes(),
        graph.num_factors(),
        manifest.scan_keys.len(),
        path.display()
    );
    Ok(())
}

/// Load a graph archive, fully replacing in-memory state.
pub fn load(path: &Path, config: &GraphConfig) -> Result<PoseGraph> {
    let file = File::open(path)?;
    let mut archive = ZipArchive::new(file)?;

    let manifest: Manifest = serde_json::from_slice(&read_entry(&mut archive, "manifest.json")?)?;
    if manifest.format_version != FORMAT_VERSION {
        return Err(SlamError::CorruptArchive(format!(
            "format version {} (expected {FORMAT_VERSION})",
            manifest.format_version
        )));
    }

    let parsed = g2o::read_g2o(read_entry(&mut archive, "graph.g2o")?.as_slice())?;

    let mut nodes = Vec::with_capacity(manifest.nodes.len());
    for meta in &manifest.nodes {
        let pose = parsed.poses.get(&meta.key).copied().ok_or_else(|| {
            SlamError::CorruptArchive(format!("node {} missing from graph.g2o", meta.key))
        })?;
        let mut node = Node::new(
            meta.key,
            meta.stamp_us,
            manifest.fixed_frame_id.clone(),
            pose,
            meta.covariance,
        );
        node.id_string = meta.id_string.clone();
        nodes.push(node);
    }

    let mut factors = parsed.factors;
    factors.extend(manifest.range_factors.iter().cloned());

    let mut scans = Vec::with_capacity(manifest.scan_keys.len());
    for key in &manifest.scan_keys {
        let bytes = read_entry(&mut archive, &format!("scans/{key}.pcd")).map_err(|_| {
            SlamError::CorruptArchive(format!("keyed scan {key} referenced but missing"))
        })?;
        scans.push((*key, Arc::new(pcd::read_pcd(bytes.as_slice())?)));
    }

    let graph = PoseGraph::restore(
        config,
        manifest.fixed_frame_id.clone(),
        manifest.robot_prefix,
        nodes,
        factors,
        scans,
        manifest.initial_key,
        manifest.current_key,
    )?;
    info!(
        "loaded pose graph ({} nodes, {} factors) from {}",
        graph.num_nodes(),
        graph.num_factors(),
        path.display()
    );
    Ok(graph)
}

fn read_entry(archive: &mut ZipArchive<File>, name: &str) -> Result<Vec<u8>> {
    let mut entry = archive.by_name(name).map_err(|err| match err {
        ZipError::FileNotFound => {
            SlamError::CorruptArchive(format!("archive entry '{name}' missing"))
        }
        other => SlamError::Zip(other),
    })?;
    let mut bytes = Vec::new();
    entry.read_to_end(&mut bytes)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Point3D, PointCloud3D};
    use approx::assert_relative_eq;

    fn sample_graph() -> PoseGraph {
        let mut graph = PoseGraph::new(&GraphConfig::default());
        graph
            .initialize(
                1_000_000,
                Key::new('a', 0),
                Pose3D::identity(),
                Covariance6::from_sigmas(0.01, 0.01),
            )
            .unwrap();
        let cov = Covariance6::from_sigmas(0.05, 0.02);
        for i in 1..4u64 {
            graph
                .track_node(Node::new(
                    Key::new('a', i),
                    1_000_000 + i * 1_000_000,
                    "world",
                    Pose3D::from_translation(i as f64, 0.0, 0.0),
                    Covariance6::default(),
                ))
                .unwrap();
            graph
                .track_factor(Factor::odometry(
                    Key::new('a', i - 1),
                    Key::new('a', i),
                    Pose3D::from_translation(1.0, 0.0, 0.0),
                    cov,
                ))
                .unwrap();
        }
        let mut scan = PointCloud3D::new();
        scan.push(Point3D::new(0.5, 0.25, 0.125));
        scan.push(Point3D::new(-1.0, 2.0, 0.0));
        graph.attach_scan(Key::new('a', 1), Arc::new(scan)).unwrap();
        graph
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.zip");
        let graph = sample_graph();
        save(&graph, &path).unwrap();

        let loaded = load(&path, &GraphConfig::default()).unwrap();
        assert_eq!(loaded.num_nodes(), graph.num_nodes());
        assert_eq!(loaded.num_factors(), graph.num_factors());
        assert_eq!(loaded.initial_key(), graph.initial_key());
        assert_eq!(loaded.current_key(), graph.current_key());

        for node in graph.nodes() {
            let restored = loaded.node(node.key).unwrap();
            assert_relative_eq!(
                restored.pose.translation,
                node.pose.translation,
                epsilon = 1e-9
            );
            assert_eq!(restored.stamp_us, node.stamp_us);
        }
        let scan = loaded.scan(Key::new('a', 1)).unwrap();
        assert_eq!(scan.len(), 2);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.zip");
        assert!(load(&path, &GraphConfig::default()).is_err());
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.zip");
        save(&sample_graph(), &path).unwrap();

        // Rewrite the manifest with a bad version.
        let file = File::open(&path).unwrap();
        let mut archive = ZipArchive::new(file).unwrap();
        let mut manifest_text = String::new();
        archive
            .by_name("manifest.json")
            .unwrap()
            .read_to_string(&mut manifest_text)
            .unwrap();
        let mut manifest: serde_json::Value = serde_json::from_str(&manifest_text).unwrap();
        manifest["format_version"] = serde_json::json!(99);

        let bad_path = dir.path().join("bad.zip");
        let out = File::create(&bad_path).unwrap();
        let mut writer = ZipWriter::new(out);
        let options = SimpleFileOptions::default();
        writer.start_file("manifest.json", options).unwrap();
        writer
            .write_all(serde_json::to_string(&manifest).unwrap().as_bytes())
            .unwrap();
        for name in ["graph.g2o"] {
            let mut bytes = Vec::new();
            archive.by_name(name).unwrap().read_to_end(&mut bytes).unwrap();
            writer.start_file(name, options).unwrap();
            writer.write_all(&bytes).unwrap();
        }
        writer.finish().unwrap();

        assert!(matches!(
            load(&bad_path, &GraphConfig::default()),
            Err(SlamError::CorruptArchive(_))
        ));
    }

    #[test]
    fn test_missing_scan_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.zip");
        save(&sample_graph(), &path).unwrap();

        // Copy the archive without the scans directory.
        let file = File::open(&path).unwrap();
        let mut archive = ZipArchive::new(file).unwrap();
        let bad_path = dir.path().join("noscan.zip");
        let out = File::create(&bad_path).unwrap();
        let mut writer = ZipWriter::new(out);
        let options = SimpleFileOptions::default();
        for name in ["manifest.json", "graph.g2o"] {
            let mut bytes = Vec::new();
            archive.by_name(name).unwrap().read_to_end(&mut bytes).unwrap();
            writer.start_file(name, options).unwrap();
            writer.write_all(&bytes).unwrap();
        }
        writer.finish().unwrap();

        assert!(matches!(
            load(&bad_path, &GraphConfig::default()),
            Err(SlamError::CorruptArchive(_))
        ));
    }

    #[test]
    fn test_temp_file_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.zip");
        save(&sample_graph(), &path).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("zip.tmp").exists());
    }
}
