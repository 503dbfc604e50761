//! g2o text-format serialization of the pose graph.
//!
//! Line schema:
//! - `VERTEX_SE3:QUAT <id> x y z qx qy qz qw`
//! - `EDGE_SE3:QUAT <i> <j> x y z qx qy qz qw <21 info entries>`
//! - `EDGE_SE3_PRIOR <id> x y z qx qy qz qw <21 info entries>`
//!
//! Vertex ids are the raw 64-bit key encodings. Information matrices are
//! the upper triangle (row-major, diagonal included) of the 6x6 inverse
//! covariance, translation block first. Range factors have no standard g2o
//! form and travel in the archive manifest instead.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use log::warn;
use nalgebra::{Matrix6, Quaternion, UnitQuaternion, Vector3};

use crate::core::types::{Covariance6, Key, Pose3D};
use crate::error::{Result, SlamError};
use crate::graph::{Factor, FactorKind, Measurement};

/// Write values and pose factors in g2o form.
pub fn write_g2o<W: Write>(
    values: &BTreeMap<Key, Pose3D>,
    factors: &[Factor],
    writer: &mut W,
) -> Result<()> {
    for (key, pose) in values {
        let t = pose.translation;
        let q = pose.rotation.quaternion();
        writeln!(
            writer,
            "VERTEX_SE3:QUAT {} {} {} {} {} {} {} {}",
            key.encode(),
            t.x,
            t.y,
            t.z,
            q.i,
            q.j,
            q.k,
            q.w
        )?;
    }
    for factor in factors {
        let Measurement::Pose(m) = &factor.measurement else {
            continue;
        };
        let info = m.covariance.information()?;
        let t = m.transform.translation;
        let q = m.transform.rotation.quaternion();
        if factor.kind == FactorKind::Prior {
            write!(
                writer,
                "EDGE_SE3_PRIOR {} {} {} {} {} {} {} {}",
                factor.key_from.encode(),
                t.x,
                t.y,
                t.z,
                q.i,
                q.j,
                q.k,
                q.w
            )?;
        } else {
            write!(
                writer,
                "EDGE_SE3:QUAT {} {} {} {} {} {} {} {} {}",
                factor.key_from.encode(),
                factor.key_to.encode(),
                t.x,
                t.y,
                t.z,
                q.i,
                q.j,
                q.k,
                q.w
            )?;
        }
        for row in 0..6 {
            for col in row..6 {
                write!(writer, " {}", info[(row, col)])?;
            }
        }
        writeln!(writer)?;
    }
    Ok(())
}

/// Write a `result.g2o`-style dump to a file.
pub fn write_g2o_file(
    values: &BTreeMap<Key, Pose3D>,
    factors: &[Factor],
    path: &Path,
) -> Result<()> {
    let file = std::fs::File::create(path)?;
    let mut writer = BufWriter::new(file);
    write_g2o(values, factors, &mut writer)?;
    writer.flush()?;
    Ok(())
}

/// Parsed g2o content: poses plus pose factors.
#[derive(Debug, Default)]
pub struct G2oGraph {
    pub poses: BTreeMap<Key, Pose3D>,
    pub factors: Vec<Factor>,
}

/// Read a g2o dump produced by [`write_g2o`].
///
/// Edge kinds are reconstructed structurally: sequential same-prefix edges
/// are odometry, edges into uppercase (landmark) keys are artifact
/// observations, everything else is a loop closure.
pub fn read_g2o<R: Read>(reader: R) -> Result<G2oGraph> {
    let mut graph = G2oGraph::default();
    let reader = BufReader::new(reader);

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        let mut tokens = line.split_whitespace();
        let Some(tag) = tokens.next() else {
            continue;
        };
        let rest: Vec<&str> = tokens.collect();
        let parse = |s: &&str| -> Result<f64> {
            s.parse::<f64>()
                .map_err(|_| bad_line("numeric field", line_no))
        };
        match tag {
            "VERTEX_SE3:QUAT" => {
                if rest.len() != 8 {
                    return Err(bad_line("VERTEX_SE3:QUAT arity", line_no));
                }
                let key = parse_key(rest[0], line_no)?;
                let v: Vec<f64> = rest[1..].iter().map(parse).collect::<Result<_>>()?;
                graph.poses.insert(key, pose_from_fields(&v));
            }
            "EDGE_SE3:QUAT" => {
                if rest.len() != 2 + 7 + 21 {
                    return Err(bad_line("EDGE_SE3:QUAT arity", line_no));
                }
                let from = parse_key(rest[0], line_no)?;
                let to = parse_key(rest[1], line_no)?;
                let v: Vec<f64> = rest[2..].iter().map(parse).collect::<Result<_>>()?;
                let transform = pose_from_fields(&v[..7]);
                let covariance = covariance_from_info(&v[7..], line_no)?;
                let kind = classify_edge(from, to);
                graph.factors.push(Factor {
                    key_from: from,
                    key_to: to,
                    kind,
                    measurement: Measurement::Pose(crate::graph::PoseMeasurement {
                        transform,
                        covariance,
                    }),
                });
            }
            "EDGE_SE3_PRIOR" => {
                if rest.len() != 1 + 7 + 21 {
                    return Err(bad_line("EDGE_SE3_PRIOR arity", line_no));
                }
                let key = parse_key(rest[0], line_no)?;
                let v: Vec<f64> = rest[1..].iter().map(parse).collect::<Result<_>>()?;
                let pose = pose_from_fields(&v[..7]);
                let covariance = covariance_from_info(&v[7..], line_no)?;
                graph.factors.push(Factor::prior(key, pose, covariance));
            }
            other => warn!("skipping unknown g2o tag '{other}' at line {line_no}"),
        }
    }
    Ok(graph)
}

fn classify_edge(from: Key, to: Key) -> FactorKind {
    if to.prefix().is_ascii_uppercase() {
        FactorKind::Artifact
    } else if from.same_prefix(&to) && to == from.next() {
        FactorKind::Odometry
    } else {
        FactorKind::Loop
    }
}

fn parse_key(token: &str, line_no: usize) -> Result<Key> {
    token
        .parse::<u64>()
        .map(Key::decode)
        .map_err(|_| bad_line("key field", line_no))
}

fn pose_from_fields(v: &[f64]) -> Pose3D {
    let translation = Vector3::new(v[0], v[1], v[2]);
    let rotation = UnitQuaternion::from_quaternion(Quaternion::new(v[6], v[3], v[4], v[5]));
    Pose3D::new(translation, rotation)
}

fn covariance_from_info(info_entries: &[f64], line_no: usize) -> Result<Covariance6> {
    let mut info = Matrix6::zeros();
    let mut iter = info_entries.iter();
    for row in 0..6 {
        for col in row..6 {
            let value = *iter
                .next()
                .ok_or_else(|| bad_line("info matrix arity", line_no))?;
            info[(row, col)] = value;
            info[(col, row)] = value;
        }
    }
    let covariance = info
        .try_inverse()
        .ok_or_else(|| bad_line("singular information matrix", line_no))?;
    Ok(Covariance6::from_matrix(covariance))
}

fn bad_line(what: &str, line_no: usize) -> SlamError {
    SlamError::CorruptArchive(format!("bad g2o {what} at line {}", line_no + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_graph() -> (BTreeMap<Key, Pose3D>, Vec<Factor>) {
        let k0 = Key::new('a', 0);
        let k1 = Key::new('a', 1);
        let mut values = BTreeMap::new();
        values.insert(k0, Pose3D::identity());
        values.insert(
            k1,
            Pose3D::from_xyz_rpy(1.0, 0.2, -0.1, 0.05, 0.0, 0.3),
        );
        let cov = Covariance6::from_sigmas(0.05, 0.02);
        let factors = vec![
            Factor::prior(k0, Pose3D::identity(), Covariance6::from_sigmas(0.01, 0.01)),
            Factor::odometry(k0, k1, Pose3D::from_translation(1.0, 0.2, -0.1), cov),
            Factor::loop_closure(k1, k0, Pose3D::from_translation(-1.0, -0.2, 0.1), cov),
        ];
        (values, factors)
    }

    #[test]
    fn test_write_read_roundtrip() {
        let (values, factors) = sample_graph();
        let mut buffer = Vec::new();
        write_g2o(&values, &factors, &mut buffer).unwrap();

        let parsed = read_g2o(buffer.as_slice()).unwrap();
        assert_eq!(parsed.poses.len(), 2);
        assert_eq!(parsed.factors.len(), 3);

        let k1 = Key::new('a', 1);
        assert_relative_eq!(
            parsed.poses[&k1].translation,
            values[&k1].translation,
            epsilon = 1e-9
        );
        assert_relative_eq!(
            parsed.poses[&k1].rotation.angle_to(&values[&k1].rotation),
            0.0,
            epsilon = 1e-9
        );

        let kinds: Vec<FactorKind> = parsed.factors.iter().map(|f| f.kind).collect();
        assert!(kinds.contains(&FactorKind::Prior));
        assert!(kinds.contains(&FactorKind::Odometry));
        assert!(kinds.contains(&FactorKind::Loop));
    }

    #[test]
    fn test_covariance_roundtrip() {
        let (values, factors) = sample_graph();
        let mut buffer = Vec::new();
        write_g2o(&values, &factors, &mut buffer).unwrap();
        let parsed = read_g2o(buffer.as_slice()).unwrap();

        let original = factors[1].pose_measurement().unwrap().covariance;
        let restored = parsed.factors[1].pose_measurement().unwrap().covariance;
        assert_relative_eq!(restored.matrix, original.matrix, epsilon = 1e-9);
    }

    #[test]
    fn test_malformed_line_rejected() {
        let text = "VERTEX_SE3:QUAT 1 2 3\n";
        assert!(matches!(
            read_g2o(text.as_bytes()),
            Err(SlamError::CorruptArchive(_))
        ));
    }

    #[test]
    fn test_artifact_edge_classification() {
        let mut values = BTreeMap::new();
        let pose_key = Key::new('a', 4);
        let art_key = Key::new('A', 0);
        values.insert(pose_key, Pose3D::identity());
        values.insert(art_key, Pose3D::from_translation(1.0, 1.0, 0.0));
        let factors = vec![Factor::artifact(
            pose_key,
            art_key,
            Pose3D::from_translation(1.0, 1.0, 0.0),
            Covariance6::default(),
        )];
        let mut buffer = Vec::new();
        write_g2o(&values, &factors, &mut buffer).unwrap();
        let parsed = read_g2o(buffer.as_slice()).unwrap();
        assert_eq!(parsed.factors[0].kind, FactorKind::Artifact);
    }
}
