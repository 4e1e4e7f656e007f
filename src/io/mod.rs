use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use nalgebra::Vector3;

use crate::error::GranError;
use crate::mesh::TriangleSoup;
use crate::Result;

/// Writes a particle snapshot in SU: one `x,y,z` row of integer
/// LENGTH_UNIT multiples per sphere, with a header row
pub fn write_snapshot_su<P: AsRef<Path>>(path: P, positions: &[Vector3<i64>]) -> Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    writeln!(w, "x,y,z")?;
    for p in positions {
        writeln!(w, "{},{},{}", p.x, p.y, p.z)?;
    }
    w.flush()?;
    Ok(())
}

/// Writes a particle snapshot in UU: `x,y,z,absv` per sphere with a header
/// row. The position columns double as the checkpoint format read back by
/// [`read_checkpoint`].
pub fn write_snapshot_uu<P: AsRef<Path>>(
    path: P,
    positions: &[Vector3<f64>],
    velocities: &[Vector3<f64>],
) -> Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    writeln!(w, "x,y,z,absv")?;
    for (p, v) in positions.iter().zip(velocities) {
        writeln!(w, "{},{},{},{}", p.x, p.y, p.z, v.norm())?;
    }
    w.flush()?;
    Ok(())
}

/// Writes a particle snapshot as raw binary: little-endian `f32` x, y, z
/// per sphere in UU, no header. The layout is exactly
/// `3 * n_spheres * size_of::<f32>()` bytes.
pub fn write_snapshot_binary<P: AsRef<Path>>(path: P, positions: &[Vector3<f64>]) -> Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    for p in positions {
        w.write_all(&(p.x as f32).to_le_bytes())?;
        w.write_all(&(p.y as f32).to_le_bytes())?;
        w.write_all(&(p.z as f32).to_le_bytes())?;
    }
    w.flush()?;
    Ok(())
}

/// Reads a checkpoint CSV back into a point set: the header row is
/// skipped, and the first three comma-separated fields of every following
/// line are taken as UU coordinates. Extra fields (such as `absv` written
/// by [`write_snapshot_uu`]) are ignored.
pub fn read_checkpoint<P: AsRef<Path>>(path: P) -> Result<Vec<Vector3<f64>>> {
    let reader = BufReader::new(File::open(&path)?);
    let mut points = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if lineno == 0 || line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split(',');
        let mut coords = [0.0f64; 3];
        for coord in &mut coords {
            let field = fields.next().ok_or_else(|| {
                GranError::Checkpoint(format!("line {}: expected 3 coordinates", lineno + 1))
            })?;
            *coord = field.trim().parse().map_err(|_| {
                GranError::Checkpoint(format!("line {}: malformed number {:?}", lineno + 1, field))
            })?;
        }
        points.push(Vector3::new(coords[0], coords[1], coords[2]));
    }
    if points.is_empty() {
        return Err(GranError::Checkpoint("checkpoint contains no points".into()));
    }
    Ok(points)
}

/// Dumps the posed mesh soup as a Wavefront OBJ for visualization, one
/// object per family
pub fn write_meshes<P: AsRef<Path>>(path: P, soup: &TriangleSoup) -> Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    let mut vertex_base = 1usize;
    let mut family = u32::MAX;
    for t in 0..soup.num_triangles() {
        if soup.family_of(t) != family {
            family = soup.family_of(t);
            writeln!(w, "o family_{family}")?;
        }
        let nodes = soup.world_nodes_uu(t);
        for n in &nodes {
            writeln!(w, "v {} {} {}", n.x, n.y, n.z)?;
        }
        writeln!(w, "f {} {} {}", vertex_base, vertex_base + 1, vertex_base + 2)?;
        vertex_base += 3;
    }
    w.flush()?;
    Ok(())
}
