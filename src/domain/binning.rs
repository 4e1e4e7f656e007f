use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use nalgebra::Vector3;
use rayon::prelude::*;

use crate::domain::SdGrid;
use crate::error::{CapacityKind, GranError};
use crate::Result;

/// Sentinel meaning "no bin has overflowed"
const NO_OVERFLOW: usize = usize::MAX;

/// Per-SD sphere occupancy: a count and a fixed-capacity occupant list for
/// every SD, rebuilt from scratch each step.
///
/// The binning pass is an unordered parallel scatter, so slot allocation
/// uses an atomic increment-and-place: two spheres racing for an SD's last
/// free slot each get a distinct slot or trip the overflow flag, never a
/// corrupted list.
pub struct SdOccupancy {
    capacity: usize,
    counts: Vec<AtomicU32>,
    occupants: Vec<AtomicU32>,
    overflow: AtomicUsize,
}

impl SdOccupancy {
    /// Allocates occupancy buffers for `num_sds` SDs with the given
    /// per-SD capacity
    pub fn new(num_sds: usize, capacity: usize) -> Self {
        let mut counts = Vec::with_capacity(num_sds);
        counts.resize_with(num_sds, || AtomicU32::new(0));
        let mut occupants = Vec::with_capacity(num_sds * capacity);
        occupants.resize_with(num_sds * capacity, || AtomicU32::new(0));
        Self {
            capacity,
            counts,
            occupants,
            overflow: AtomicUsize::new(NO_OVERFLOW),
        }
    }

    /// Number of SDs covered
    pub fn num_bins(&self) -> usize {
        self.counts.len()
    }

    /// Configured per-SD capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Clears all occupant counts; occupant slots are gated by the counts
    /// and need not be wiped
    pub fn reset(&self) {
        for c in &self.counts {
            c.store(0, Ordering::Relaxed);
        }
        self.overflow.store(NO_OVERFLOW, Ordering::Relaxed);
    }

    /// Atomically claims a slot in `bin` for `id`. On overflow the bin is
    /// recorded and the insert dropped; the caller surfaces the error after
    /// the pass via [`check_overflow`](Self::check_overflow).
    #[inline]
    pub fn insert(&self, bin: usize, id: u32) {
        let slot = self.counts[bin].fetch_add(1, Ordering::Relaxed) as usize;
        if slot >= self.capacity {
            self.overflow.store(bin, Ordering::Relaxed);
            return;
        }
        self.occupants[bin * self.capacity + slot].store(id, Ordering::Relaxed);
    }

    /// Occupant count of a bin
    #[inline]
    pub fn count(&self, bin: usize) -> usize {
        (self.counts[bin].load(Ordering::Relaxed) as usize).min(self.capacity)
    }

    /// Reads back the occupant at `slot` of `bin`; only valid below the
    /// bin's count
    #[inline]
    pub fn occupant(&self, bin: usize, slot: usize) -> u32 {
        debug_assert!(slot < self.count(bin));
        self.occupants[bin * self.capacity + slot].load(Ordering::Relaxed)
    }

    /// Iterates the occupants of a bin
    pub fn occupants_of(&self, bin: usize) -> impl Iterator<Item = u32> + '_ {
        (0..self.count(bin)).map(move |slot| self.occupant(bin, slot))
    }

    /// Fails if any bin overflowed during the last scatter, naming the
    /// offending bin. Contact detection depends on occupant lists being
    /// complete, so this is fatal to the step.
    pub fn check_overflow(&self, kind: CapacityKind) -> Result<()> {
        match self.overflow.load(Ordering::Relaxed) {
            NO_OVERFLOW => Ok(()),
            bin => Err(GranError::CapacityExceeded {
                kind,
                index: bin,
                capacity: self.capacity,
            }),
        }
    }
}

/// Scatters every sphere into the occupant list of each SD its
/// radius-expanded extent overlaps. Parallel over spheres; order across
/// spheres is unspecified and irrelevant.
pub fn bin_spheres(
    grid: &SdGrid,
    frame_origin: Vector3<i64>,
    radius_su: f64,
    positions: &[Vector3<i64>],
    occupancy: &SdOccupancy,
) -> Result<()> {
    occupancy.reset();

    positions.par_iter().enumerate().for_each(|(i, &center)| {
        let (lo, hi) = grid.sd_range_of_sphere(center, radius_su, frame_origin);
        for x in lo.x..=hi.x {
            for y in lo.y..=hi.y {
                for z in lo.z..=hi.z {
                    occupancy.insert(grid.sd_index(Vector3::new(x, y, z)), i as u32);
                }
            }
        }
    });

    occupancy.check_overflow(CapacityKind::SubDomain)
}

/// A coarser grid of "buckets" used to bin mesh triangles for
/// mesh-to-sphere candidate generation. Bucket edges are whole multiples
/// of the SD edges so the two grids stay aligned.
#[derive(Debug, Clone, Copy)]
pub struct BucketGrid {
    pub counts: Vector3<u32>,
    pub bucket_size_su: Vector3<i64>,
    pub num_buckets: usize,
}

impl BucketGrid {
    /// Builds the bucket grid by coalescing `factor` SDs per axis into one
    /// bucket
    pub fn from_sd_grid(grid: &SdGrid, factor: u32) -> Self {
        let factor = factor.max(1);
        let mut counts = Vector3::zeros();
        let mut sizes = Vector3::zeros();
        for axis in 0..3 {
            counts[axis] = (grid.counts[axis] + factor - 1) / factor;
            sizes[axis] = grid.sd_size_su[axis] * i64::from(factor);
        }
        Self {
            counts,
            bucket_size_su: sizes,
            num_buckets: counts.x as usize * counts.y as usize * counts.z as usize,
        }
    }

    /// Flat bucket index, same row-major convention as the SD grid
    #[inline]
    pub fn bucket_index(&self, coords: Vector3<u32>) -> usize {
        ((coords.x as usize * self.counts.y as usize) + coords.y as usize)
            * self.counts.z as usize
            + coords.z as usize
    }

    /// Bucket coordinate containing an SU point, clamped into the grid
    #[inline]
    pub fn bucket_of_point(&self, p: Vector3<f64>, frame_origin: Vector3<i64>) -> Vector3<u32> {
        let mut out = Vector3::zeros();
        for axis in 0..3 {
            let rel = p[axis] - frame_origin[axis] as f64;
            let c = (rel / self.bucket_size_su[axis] as f64).floor() as i64;
            out[axis] = c.clamp(0, i64::from(self.counts[axis]) - 1) as u32;
        }
        out
    }
}

/// Per-bucket triangle occupancy, the mesh-side analogue of [`SdOccupancy`]
pub struct TriangleBuckets {
    pub grid: BucketGrid,
    occupancy: SdOccupancy,
}

impl TriangleBuckets {
    pub fn new(grid: BucketGrid, capacity: usize) -> Self {
        Self {
            occupancy: SdOccupancy::new(grid.num_buckets, capacity),
            grid,
        }
    }

    /// Scatters every triangle into all buckets its AABB overlaps.
    /// `triangles` yields the three node positions in SU.
    pub fn bin_triangles(
        &self,
        frame_origin: Vector3<i64>,
        triangles: &[[Vector3<f64>; 3]],
    ) -> Result<()> {
        self.occupancy.reset();

        triangles.par_iter().enumerate().for_each(|(t, nodes)| {
            let mut lo = nodes[0];
            let mut hi = nodes[0];
            for node in &nodes[1..] {
                lo = lo.inf(node);
                hi = hi.sup(node);
            }
            let lo = self.grid.bucket_of_point(lo, frame_origin);
            let hi = self.grid.bucket_of_point(hi, frame_origin);
            for x in lo.x..=hi.x {
                for y in lo.y..=hi.y {
                    for z in lo.z..=hi.z {
                        self.occupancy
                            .insert(self.grid.bucket_index(Vector3::new(x, y, z)), t as u32);
                    }
                }
            }
        });

        self.occupancy.check_overflow(CapacityKind::TriangleBucket)
    }

    /// Triangles currently binned into the bucket at `coords`
    pub fn triangles_in(&self, coords: Vector3<u32>) -> impl Iterator<Item = u32> + '_ {
        self.occupancy.occupants_of(self.grid.bucket_index(coords))
    }
}
