//! ASCII PCD (Point Cloud Data) v0.7 read/write for keyed scans.

use std::io::{BufRead, BufReader, BufWriter, Read, Write};

use crate::core::types::{Point3D, PointCloud3D};
use crate::error::{Result, SlamError};

/// Write a cloud as ASCII PCD v0.7 with x/y/z fields.
pub fn write_pcd<W: Write>(cloud: &PointCloud3D, writer: &mut W) -> Result<()> {
    let n = cloud.len();
    writeln!(writer, "# .PCD v0.7 - Point Cloud Data file format")?;
    writeln!(writer, "VERSION 0.7")?;
    writeln!(writer, "FIELDS x y z")?;
    writeln!(writer, "SIZE 8 8 8")?;
    writeln!(writer, "TYPE F F F")?;
    writeln!(writer, "COUNT 1 1 1")?;
    writeln!(writer, "WIDTH {n}")?;
    writeln!(writer, "HEIGHT 1")?;
    writeln!(writer, "VIEWPOINT 0 0 0 1 0 0 0")?;
    writeln!(writer, "POINTS {n}")?;
    writeln!(writer, "DATA ascii")?;
    for point in cloud.iter() {
        writeln!(writer, "{} {} {}", point.x, point.y, point.z)?;
    }
    Ok(())
}

/// Read an ASCII PCD with x/y/z fields.
pub fn read_pcd<R: Read>(reader: R) -> Result<PointCloud3D> {
    let reader = BufReader::new(reader);
    let mut cloud = PointCloud3D::new();
    let mut expected_points: Option<usize> = None;
    let mut in_data = false;

    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if !in_data {
            let mut tokens = trimmed.split_whitespace();
            match tokens.next() {
                Some("POINTS") => {
                    expected_points = tokens
                        .next()
                        .and_then(|t| t.parse::<usize>().ok())
                        .or(expected_points);
                }
                Some("DATA") => {
                    if tokens.next() != Some("ascii") {
                        return Err(SlamError::CorruptArchive(
                            "only ascii PCD data is supported".into(),
                        ));
                    }
                    in_data = true;
                }
                _ => {}
            }
            continue;
        }
        let fields: Vec<f64> = trimmed
            .split_whitespace()
            .map(|t| t.parse::<f64>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| SlamError::CorruptArchive("bad PCD point line".into()))?;
        if fields.len() < 3 {
            return Err(SlamError::CorruptArchive("short PCD point line".into()));
        }
        cloud.push(Point3D::new(fields[0], fields[1], fields[2]));
    }

    if let Some(expected) = expected_points {
        if expected != cloud.len() {
            return Err(SlamError::CorruptArchive(format!(
                "PCD declares {expected} points, found {}",
                cloud.len()
            )));
        }
    }
    Ok(cloud)
}

/// Convenience file writer used by the archive layer.
pub fn write_pcd_to_vec(cloud: &PointCloud3D) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    {
        let mut writer = BufWriter::new(&mut buffer);
        write_pcd(cloud, &mut writer)?;
        writer.flush()?;
    }
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let mut cloud = PointCloud3D::new();
        cloud.push(Point3D::new(1.0, 2.0, 3.0));
        cloud.push(Point3D::new(-0.5, 0.25, 0.125));

        let bytes = write_pcd_to_vec(&cloud).unwrap();
        let back = read_pcd(bytes.as_slice()).unwrap();
        assert_eq!(back, cloud);
    }

    #[test]
    fn test_empty_cloud() {
        let bytes = write_pcd_to_vec(&PointCloud3D::new()).unwrap();
        let back = read_pcd(bytes.as_slice()).unwrap();
        assert!(back.is_empty());
    }

    #[test]
    fn test_point_count_mismatch_rejected() {
        let text = "VERSION 0.7\nFIELDS x y z\nPOINTS 2\nDATA ascii\n1 2 3\n";
        assert!(matches!(
            read_pcd(text.as_bytes()),
            Err(SlamError::CorruptArchive(_))
        ));
    }

    #[test]
    fn test_binary_data_rejected() {
        let text = "VERSION 0.7\nPOINTS 0\nDATA binary\n";
        assert!(matches!(
            read_pcd(text.as_bytes()),
            Err(SlamError::CorruptArchive(_))
        ));
    }
}
