pub mod binning;

pub use self::binning::{BucketGrid, SdOccupancy, TriangleBuckets};

use nalgebra::Vector3;

use crate::error::GranError;
use crate::units::UnitScaling;
use crate::Result;

/// The sub-domain (SD) grid tiling the big domain (BD).
///
/// The BD is the axis-aligned box that bounds the whole granular bed; the
/// partitioner slices it into an even number of SDs per axis so that the
/// grid is symmetric about the box center. SD edge lengths are whole
/// LENGTH_UNIT multiples, rounded up, so the grid may overhang the
/// physical box by at most one length unit per axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdGrid {
    /// Number of SDs along each axis; always even
    pub counts: Vector3<u32>,

    /// SD edge length along each axis, in SU
    pub sd_size_su: Vector3<i64>,

    /// Lower corner of the BD frame, in SU
    pub frame_origin_su: Vector3<i64>,

    /// Total SD count, the product of the per-axis counts
    pub num_sds: usize,
}

/// Target average sphere count per SD along each axis, the tuning knob the
/// partitioner sizes SDs from.
#[derive(Debug, Clone, Copy)]
pub struct SdSizingHeuristic {
    pub spheres_per_sd: Vector3<f64>,
}

impl Default for SdSizingHeuristic {
    fn default() -> Self {
        Self {
            spheres_per_sd: Vector3::new(3.5, 3.5, 3.5),
        }
    }
}

impl SdGrid {
    /// Partitions the BD into a grid of SDs.
    ///
    /// Per axis: the slice count is the number of `2r * avg` slabs needed to
    /// cover the box, bumped to the next even number; the SD size is that
    /// slice rounded up to whole length units. Deterministic and idempotent:
    /// the same inputs always produce the same grid, and re-partitioning
    /// yields a fresh value from which occupancy buffers are resized.
    pub fn partition(
        box_dims_uu: Vector3<f64>,
        heuristic: SdSizingHeuristic,
        scaling: &UnitScaling,
    ) -> Result<Self> {
        if box_dims_uu.min() <= 0.0 {
            return Err(GranError::InvalidParameter(format!(
                "box dimensions must be positive, got {:?}",
                box_dims_uu
            )));
        }
        if heuristic.spheres_per_sd.min() <= 0.0 {
            return Err(GranError::InvalidParameter(
                "average spheres per SD must be positive".into(),
            ));
        }

        let sphere_diameter_uu = 2.0 * scaling.length_to_uu(scaling.sphere_radius_su);

        let mut counts = Vector3::zeros();
        let mut sizes = Vector3::zeros();
        for axis in 0..3 {
            let slab = sphere_diameter_uu * heuristic.spheres_per_sd[axis];
            let mut how_many = (box_dims_uu[axis] / slab).ceil() as u32;
            how_many = how_many.max(2);
            // even count so the grid is centered on the box
            if how_many & 1 == 1 {
                how_many += 1;
            }
            let slice = box_dims_uu[axis] / f64::from(how_many);
            counts[axis] = how_many;
            sizes[axis] = (scaling.length_to_su(slice).ceil() as i64).max(1);
        }

        let frame_origin_su = Vector3::new(
            -(i64::from(counts.x) * sizes.x) / 2,
            -(i64::from(counts.y) * sizes.y) / 2,
            -(i64::from(counts.z) * sizes.z) / 2,
        );

        Ok(Self {
            counts,
            sd_size_su: sizes,
            frame_origin_su,
            num_sds: counts.x as usize * counts.y as usize * counts.z as usize,
        })
    }

    /// Flat index of the SD at the given grid coordinates.
    ///
    /// Row-major with x slowest: `(x * ny + y) * nz + z`. This convention is
    /// part of the output format and must not change.
    #[inline]
    pub fn sd_index(&self, coords: Vector3<u32>) -> usize {
        debug_assert!(coords.x < self.counts.x);
        debug_assert!(coords.y < self.counts.y);
        debug_assert!(coords.z < self.counts.z);
        ((coords.x as usize * self.counts.y as usize) + coords.y as usize)
            * self.counts.z as usize
            + coords.z as usize
    }

    /// Grid coordinates of the SD with the given flat index
    #[inline]
    pub fn sd_coords(&self, index: usize) -> Vector3<u32> {
        let nz = self.counts.z as usize;
        let ny = self.counts.y as usize;
        let z = index % nz;
        let y = (index / nz) % ny;
        let x = index / (nz * ny);
        Vector3::new(x as u32, y as u32, z as u32)
    }

    /// Grid coordinate of the SD containing an SU point, clamped into the grid
    #[inline]
    pub fn sd_of_point(&self, p: Vector3<i64>, frame_origin: Vector3<i64>) -> Vector3<u32> {
        let mut out = Vector3::zeros();
        for axis in 0..3 {
            let rel = p[axis] - frame_origin[axis];
            let c = rel.div_euclid(self.sd_size_su[axis]);
            out[axis] = c.clamp(0, i64::from(self.counts[axis]) - 1) as u32;
        }
        out
    }

    /// Inclusive grid-coordinate range of the SDs a sphere overlaps.
    ///
    /// The sphere's extent is expanded by its radius (rounded up) so that a
    /// sphere sitting exactly on an SD boundary registers on both sides;
    /// the downstream contact engine resolves contacts per SD and must see
    /// both halves of a cross-boundary pair.
    pub fn sd_range_of_sphere(
        &self,
        center: Vector3<i64>,
        radius_su: f64,
        frame_origin: Vector3<i64>,
    ) -> (Vector3<u32>, Vector3<u32>) {
        let r = radius_su.ceil() as i64;
        let lo = self.sd_of_point(center - Vector3::new(r, r, r), frame_origin);
        let hi = self.sd_of_point(center + Vector3::new(r, r, r), frame_origin);
        (lo, hi)
    }

    /// Total SU extent of the grid along each axis
    #[inline]
    pub fn extent_su(&self) -> Vector3<i64> {
        Vector3::new(
            i64::from(self.counts.x) * self.sd_size_su.x,
            i64::from(self.counts.y) * self.sd_size_su.y,
            i64::from(self.counts.z) * self.sd_size_su.z,
        )
    }
}
