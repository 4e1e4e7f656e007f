use std::path::{Path, PathBuf};

use nalgebra::Vector3;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::contact::{
    cohesive_force, multi_step_friction, normal_force, single_step_friction, triangle,
    BcId, BcShape, BoundaryCondition, ContactGeometry, ContactParams, FrictionMode,
    PartnerSlots, MAX_CONTACT_PARTNERS,
};
use crate::core::sampler::sample_hcp_box;
use crate::core::{OutputMode, SimParams};
use crate::domain::{
    binning, BucketGrid, SdGrid, SdOccupancy, SdSizingHeuristic, TriangleBuckets,
};
use crate::error::{CapacityKind, GranError};
use crate::integration::{self, StepSizeControl, TimeIntegrator, TimeStepping};
use crate::io;
use crate::mesh::{GeneralizedForce, MeshFramePose, TriangleSoup};
use crate::units::{PsiFactors, UnitScaling};
use crate::Result;

/// Default occupant-list capacity per SD
pub const DEFAULT_MAX_SPHERES_PER_SD: usize = 256;

/// Default triangle-list capacity per broad-phase bucket
pub const DEFAULT_MAX_TRIANGLES_PER_BUCKET: usize = 512;

/// SDs coalesced per axis into one triangle bucket
const BUCKET_COALESCE_FACTOR: u32 = 4;

/// Surface gap, as a fraction of the radius, inside which cohesion and
/// adhesion still act on separated bodies
const COHESION_CUTOFF_RADIUS_FRACTION: f64 = 0.1;

/// Spacing multiplier (times the radius) used by the fill-region sampler;
/// slightly above one diameter so the seeded bed starts overlap free
const FILL_SPACING_RADII: f64 = 2.05;

/// Prescribed big-domain offset along one axis as a function of time, in
/// multiples of the box half-length along that axis
pub type BdPositionFn = Box<dyn Fn(f64) -> f64 + Send + Sync>;

/// State derived by `initialize()` and consumed by every step
struct RuntimeState {
    scaling: UnitScaling,
    grid: SdGrid,

    /// BD frame origin as partitioned
    base_frame_origin: Vector3<i64>,

    /// BD frame origin for the current step; differs from the base only
    /// when a BD position function is prescribed
    frame_origin: Vector3<i64>,

    occupancy: SdOccupancy,
    buckets: Option<TriangleBuckets>,

    params: ContactParams,
    gravity_su: Vector3<f32>,
    radius_su: f64,

    /// Broad-phase radius: the sphere radius widened by the cohesion
    /// cutoff, so a separated pair still inside the attraction band is
    /// generated as a candidate wherever it sits relative to the SD grid
    search_radius_su: f64,
    integrator: TimeIntegrator,
    step_control: StepSizeControl,

    // sphere population, structure-of-arrays, index-stable for the run
    pos: Vec<Vector3<i64>>,
    vel: Vec<Vector3<f32>>,
    vel_update: Vec<Vector3<f32>>,
    acc: Vec<Vector3<f32>>,
    history: Vec<PartnerSlots>,
}

/// Per-sphere products of one force pass, merged serially afterwards
struct SphereStep {
    dv: Vector3<f32>,
    acc: Vector3<f32>,
    hist: PartnerSlots,
    family_forces: Vec<(u32, GeneralizedForce)>,
    bc_reactions: Vec<(usize, Vector3<f64>)>,
}

/// The monodisperse granular DEM engine.
///
/// Friction model, mesh presence and stepping mode are all selected
/// through configuration on one system type. Physical parameters are
/// supplied in user units before `initialize()`; the engine derives its
/// simulation-unit context once and keeps it immutable for the run.
pub struct GranularSystem {
    // configuration, UU
    sphere_radius: f64,
    sphere_density: f64,
    box_dims: Vector3<f64>,
    gravity: Vector3<f64>,

    k_n_s2s: f64,
    k_n_s2w: f64,
    k_n_s2m: f64,
    gamma_n_s2s: f64,
    gamma_n_s2w: f64,
    gamma_n_s2m: f64,
    k_t_s2s: f64,
    k_t_s2w: f64,
    gamma_t_s2s: f64,
    gamma_t_s2w: f64,
    mu_static: f64,
    cohesion_ratio: f64,
    adhesion_ratio_s2w: f64,

    friction_mode: FrictionMode,
    integrator: TimeIntegrator,
    stepping: TimeStepping,
    fixed_step_uu: f64,
    max_adaptive_step_uu: f64,
    psi: PsiFactors,

    fill_bounds: [f64; 6],
    seed_positions: Option<Vec<Vector3<f64>>>,
    seed_velocities: Option<Vec<Vector3<f64>>>,

    bd_fixed: bool,
    bd_position_fns: Option<[BdPositionFn; 3]>,

    sd_heuristic: SdSizingHeuristic,
    max_spheres_per_sd: usize,
    max_triangles_per_bucket: usize,

    output_mode: OutputMode,
    output_dir: PathBuf,
    verbose: bool,

    boundaries: Vec<BoundaryCondition>,
    mesh: Option<TriangleSoup>,

    state: Option<RuntimeState>,
    time_elapsed: f64,
}

impl GranularSystem {
    /// Creates a system for spheres of the given radius and density (UU),
    /// with the box dimensions still to be set
    pub fn new(sphere_radius: f64, sphere_density: f64) -> Self {
        Self::with_box_dims(sphere_radius, sphere_density, Vector3::new(40.0, 40.0, 60.0))
    }

    /// Creates a system with explicit box dimensions
    pub fn with_box_dims(
        sphere_radius: f64,
        sphere_density: f64,
        box_dims: Vector3<f64>,
    ) -> Self {
        Self {
            sphere_radius,
            sphere_density,
            box_dims,
            gravity: Vector3::new(0.0, 0.0, -981.0),
            k_n_s2s: 1e7,
            k_n_s2w: 1e7,
            k_n_s2m: 1e7,
            gamma_n_s2s: 0.0,
            gamma_n_s2w: 0.0,
            gamma_n_s2m: 0.0,
            k_t_s2s: 0.0,
            k_t_s2w: 0.0,
            gamma_t_s2s: 0.0,
            gamma_t_s2w: 0.0,
            mu_static: 0.5,
            cohesion_ratio: 0.0,
            adhesion_ratio_s2w: 0.0,
            friction_mode: FrictionMode::Frictionless,
            integrator: TimeIntegrator::ForwardEuler,
            stepping: TimeStepping::Fixed,
            fixed_step_uu: 1e-4,
            max_adaptive_step_uu: 1e-3,
            psi: PsiFactors::default(),
            fill_bounds: [-1.0, -1.0, -1.0, 1.0, 1.0, 1.0],
            seed_positions: None,
            seed_velocities: None,
            bd_fixed: true,
            bd_position_fns: None,
            sd_heuristic: SdSizingHeuristic::default(),
            max_spheres_per_sd: DEFAULT_MAX_SPHERES_PER_SD,
            max_triangles_per_bucket: DEFAULT_MAX_TRIANGLES_PER_BUCKET,
            output_mode: OutputMode::Csv,
            output_dir: PathBuf::from("."),
            verbose: false,
            boundaries: Vec::new(),
            mesh: None,
            state: None,
            time_elapsed: 0.0,
        }
    }

    /// Builds a system from a parameter file's worth of settings
    pub fn from_params(params: &SimParams) -> Self {
        let mut sys = Self::with_box_dims(
            params.sphere_radius,
            params.sphere_density,
            Vector3::new(params.box_x, params.box_y, params.box_z),
        );
        sys.gravity = Vector3::new(params.grav_x, params.grav_y, params.grav_z);
        sys.k_n_s2s = params.normal_stiff_s2s;
        sys.k_n_s2w = params.normal_stiff_s2w;
        sys.k_n_s2m = params.normal_stiff_s2m;
        sys.gamma_n_s2s = params.normal_damp_s2s;
        sys.gamma_n_s2w = params.normal_damp_s2w;
        sys.gamma_n_s2m = params.normal_damp_s2m;
        sys.k_t_s2s = params.tangent_stiff_s2s;
        sys.k_t_s2w = params.tangent_stiff_s2w;
        sys.gamma_t_s2s = params.tangent_damp_s2s;
        sys.gamma_t_s2w = params.tangent_damp_s2w;
        sys.mu_static = params.static_friction_coeff;
        sys.cohesion_ratio = params.cohesion_ratio;
        sys.adhesion_ratio_s2w = params.adhesion_ratio_s2w;
        sys.friction_mode = params.friction_mode;
        sys.integrator = params.time_integrator;
        sys.stepping = params.step_mode;
        sys.fixed_step_uu = params.step_size;
        sys.max_adaptive_step_uu = params.max_adaptive_step;
        sys.psi = PsiFactors {
            psi_t: params.psi_t,
            psi_h: params.psi_h,
            psi_l: params.psi_l,
        };
        sys.output_mode = params.write_mode;
        sys.output_dir = PathBuf::from(&params.output_dir);
        sys.verbose = params.verbose;
        sys
    }

    fn ensure_not_initialized(&self, what: &str) -> Result<()> {
        if self.state.is_some() {
            Err(GranError::AlreadyInitialized(what.into()))
        } else {
            Ok(())
        }
    }

    fn runtime(&self) -> Result<&RuntimeState> {
        self.state
            .as_ref()
            .ok_or_else(|| GranError::NotInitialized("engine state".into()))
    }

    // --- configuration surface -------------------------------------------

    pub fn set_box_dims(&mut self, dims: Vector3<f64>) -> Result<()> {
        self.ensure_not_initialized("set_box_dims")?;
        self.box_dims = dims;
        Ok(())
    }

    pub fn set_gravitational_acceleration(&mut self, x: f64, y: f64, z: f64) -> Result<()> {
        self.ensure_not_initialized("set_gravitational_acceleration")?;
        self.gravity = Vector3::new(x, y, z);
        Ok(())
    }

    /// Fractional fill region per axis, min then max, each in [-1, 1]
    /// multiples of the box half-length
    pub fn set_fill_bounds(
        &mut self,
        xmin: f64,
        ymin: f64,
        zmin: f64,
        xmax: f64,
        ymax: f64,
        zmax: f64,
    ) -> Result<()> {
        self.ensure_not_initialized("set_fill_bounds")?;
        self.fill_bounds = [xmin, ymin, zmin, xmax, ymax, zmax];
        Ok(())
    }

    /// Seeds the population from an explicit UU point list instead of the
    /// fill sampler
    pub fn set_particle_positions(&mut self, points: Vec<Vector3<f64>>) -> Result<()> {
        self.ensure_not_initialized("set_particle_positions")?;
        if points.is_empty() {
            return Err(GranError::InvalidParameter(
                "particle position list is empty".into(),
            ));
        }
        self.seed_positions = Some(points);
        Ok(())
    }

    /// Seeds initial UU velocities, one per seeded position; spheres start
    /// at rest when unset
    pub fn set_particle_velocities(&mut self, velocities: Vec<Vector3<f64>>) -> Result<()> {
        self.ensure_not_initialized("set_particle_velocities")?;
        if velocities.is_empty() {
            return Err(GranError::InvalidParameter(
                "particle velocity list is empty".into(),
            ));
        }
        self.seed_velocities = Some(velocities);
        Ok(())
    }

    /// Seeds the population from a checkpoint CSV written by an earlier run
    pub fn set_particle_positions_from_checkpoint<P: AsRef<Path>>(
        &mut self,
        path: P,
    ) -> Result<()> {
        let points = io::read_checkpoint(path)?;
        self.set_particle_positions(points)
    }

    pub fn set_stiffness_s2s(&mut self, k: f64) -> Result<()> {
        self.ensure_not_initialized("set_stiffness_s2s")?;
        self.k_n_s2s = k;
        Ok(())
    }

    pub fn set_stiffness_s2w(&mut self, k: f64) -> Result<()> {
        self.ensure_not_initialized("set_stiffness_s2w")?;
        self.k_n_s2w = k;
        Ok(())
    }

    pub fn set_stiffness_s2m(&mut self, k: f64) -> Result<()> {
        self.ensure_not_initialized("set_stiffness_s2m")?;
        self.k_n_s2m = k;
        Ok(())
    }

    pub fn set_damping_s2s(&mut self, gamma: f64) -> Result<()> {
        self.ensure_not_initialized("set_damping_s2s")?;
        self.gamma_n_s2s = gamma;
        Ok(())
    }

    pub fn set_damping_s2w(&mut self, gamma: f64) -> Result<()> {
        self.ensure_not_initialized("set_damping_s2w")?;
        self.gamma_n_s2w = gamma;
        Ok(())
    }

    pub fn set_damping_s2m(&mut self, gamma: f64) -> Result<()> {
        self.ensure_not_initialized("set_damping_s2m")?;
        self.gamma_n_s2m = gamma;
        Ok(())
    }

    pub fn set_tangent_stiffness_s2s(&mut self, k: f64) -> Result<()> {
        self.ensure_not_initialized("set_tangent_stiffness_s2s")?;
        self.k_t_s2s = k;
        Ok(())
    }

    pub fn set_tangent_stiffness_s2w(&mut self, k: f64) -> Result<()> {
        self.ensure_not_initialized("set_tangent_stiffness_s2w")?;
        self.k_t_s2w = k;
        Ok(())
    }

    pub fn set_tangent_damping_s2s(&mut self, gamma: f64) -> Result<()> {
        self.ensure_not_initialized("set_tangent_damping_s2s")?;
        self.gamma_t_s2s = gamma;
        Ok(())
    }

    pub fn set_tangent_damping_s2w(&mut self, gamma: f64) -> Result<()> {
        self.ensure_not_initialized("set_tangent_damping_s2w")?;
        self.gamma_t_s2w = gamma;
        Ok(())
    }

    pub fn set_static_friction_coeff(&mut self, mu: f64) -> Result<()> {
        self.ensure_not_initialized("set_static_friction_coeff")?;
        self.mu_static = mu;
        Ok(())
    }

    pub fn set_cohesion_ratio(&mut self, ratio: f64) -> Result<()> {
        self.ensure_not_initialized("set_cohesion_ratio")?;
        self.cohesion_ratio = ratio;
        Ok(())
    }

    pub fn set_adhesion_ratio_s2w(&mut self, ratio: f64) -> Result<()> {
        self.ensure_not_initialized("set_adhesion_ratio_s2w")?;
        self.adhesion_ratio_s2w = ratio;
        Ok(())
    }

    pub fn set_friction_mode(&mut self, mode: FrictionMode) -> Result<()> {
        self.ensure_not_initialized("set_friction_mode")?;
        self.friction_mode = mode;
        Ok(())
    }

    pub fn set_time_integrator(&mut self, integrator: TimeIntegrator) -> Result<()> {
        self.ensure_not_initialized("set_time_integrator")?;
        self.integrator = integrator;
        Ok(())
    }

    pub fn set_time_stepping(&mut self, mode: TimeStepping) -> Result<()> {
        self.ensure_not_initialized("set_time_stepping")?;
        self.stepping = mode;
        Ok(())
    }

    /// Fixed step size in UU seconds; also the adaptive fallback
    pub fn set_fixed_step_size(&mut self, dt: f64) -> Result<()> {
        self.ensure_not_initialized("set_fixed_step_size")?;
        if dt <= 0.0 {
            return Err(GranError::InvalidParameter(format!(
                "step size must be positive, got {dt}"
            )));
        }
        self.fixed_step_uu = dt;
        Ok(())
    }

    /// Upper clamp for the adaptive step size, UU seconds
    pub fn set_max_adaptive_step_size(&mut self, dt: f64) -> Result<()> {
        self.ensure_not_initialized("set_max_adaptive_step_size")?;
        if dt <= 0.0 {
            return Err(GranError::InvalidParameter(format!(
                "max adaptive step must be positive, got {dt}"
            )));
        }
        self.max_adaptive_step_uu = dt;
        Ok(())
    }

    pub fn set_psi_factors(&mut self, psi: PsiFactors) -> Result<()> {
        self.ensure_not_initialized("set_psi_factors")?;
        self.psi = psi;
        Ok(())
    }

    /// When fixed, any prescribed BD position functions are ignored
    pub fn set_bd_fixed(&mut self, fixed: bool) {
        self.bd_fixed = fixed;
    }

    /// Prescribes the BD center motion, one function of time per axis,
    /// each returning an offset in multiples of that axis's box
    /// half-length. Enables wavetank-style simulations when the BD is not
    /// fixed.
    pub fn set_bd_position_function(
        &mut self,
        fx: BdPositionFn,
        fy: BdPositionFn,
        fz: BdPositionFn,
    ) {
        self.bd_position_fns = Some([fx, fy, fz]);
    }

    pub fn set_sd_sizing(&mut self, heuristic: SdSizingHeuristic) -> Result<()> {
        self.ensure_not_initialized("set_sd_sizing")?;
        self.sd_heuristic = heuristic;
        Ok(())
    }

    pub fn set_max_spheres_per_sd(&mut self, capacity: usize) -> Result<()> {
        self.ensure_not_initialized("set_max_spheres_per_sd")?;
        if capacity == 0 {
            return Err(GranError::InvalidParameter(
                "SD capacity must be nonzero".into(),
            ));
        }
        self.max_spheres_per_sd = capacity;
        Ok(())
    }

    pub fn set_output_mode(&mut self, mode: OutputMode) {
        self.output_mode = mode;
    }

    /// Snapshot directory; assumed to exist already
    pub fn set_output_directory<P: AsRef<Path>>(&mut self, dir: P) {
        self.output_dir = dir.as_ref().to_path_buf();
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    // --- boundary conditions ---------------------------------------------

    /// Adds an infinite plane boundary; `track_reaction` enables reaction
    /// force read-back
    pub fn create_bc_plane(
        &mut self,
        point: Vector3<f64>,
        normal: Vector3<f64>,
        track_reaction: bool,
    ) -> Result<BcId> {
        self.ensure_not_initialized("create_bc_plane")?;
        if normal.norm() == 0.0 {
            return Err(GranError::InvalidParameter(
                "plane normal must be nonzero".into(),
            ));
        }
        self.boundaries.push(BoundaryCondition::new(
            BcShape::Plane {
                point,
                normal: normal.normalize(),
            },
            track_reaction,
        ));
        Ok(BcId(self.boundaries.len() - 1))
    }

    /// Adds a Z-aligned cylinder keeping spheres inside
    pub fn create_bc_cylinder_z(
        &mut self,
        center: Vector3<f64>,
        radius: f64,
        track_reaction: bool,
    ) -> Result<BcId> {
        self.ensure_not_initialized("create_bc_cylinder_z")?;
        if radius <= 0.0 {
            return Err(GranError::InvalidParameter(
                "cylinder radius must be positive".into(),
            ));
        }
        self.boundaries.push(BoundaryCondition::new(
            BcShape::ZCylinder { center, radius },
            track_reaction,
        ));
        Ok(BcId(self.boundaries.len() - 1))
    }

    /// Adds a Z-aligned funnel cone active between `hmin` and `hmax`
    pub fn create_bc_cone_z(
        &mut self,
        tip: Vector3<f64>,
        slope: f64,
        hmax: f64,
        hmin: f64,
        track_reaction: bool,
    ) -> Result<BcId> {
        self.ensure_not_initialized("create_bc_cone_z")?;
        if slope <= 0.0 || hmax <= hmin {
            return Err(GranError::InvalidParameter(
                "cone requires positive slope and hmax > hmin".into(),
            ));
        }
        self.boundaries.push(BoundaryCondition::new(
            BcShape::ZCone {
                tip,
                slope,
                hmax,
                hmin,
            },
            track_reaction,
        ));
        Ok(BcId(self.boundaries.len() - 1))
    }

    /// Disables a boundary without removing it; its id stays valid
    pub fn disable_bc(&mut self, id: BcId) -> Result<()> {
        self.bc_mut(id)?.active = false;
        Ok(())
    }

    /// Re-enables a previously disabled boundary
    pub fn enable_bc(&mut self, id: BcId) -> Result<()> {
        self.bc_mut(id)?.active = true;
        Ok(())
    }

    fn bc_mut(&mut self, id: BcId) -> Result<&mut BoundaryCondition> {
        self.boundaries
            .get_mut(id.0)
            .ok_or_else(|| GranError::InvalidParameter(format!("unknown boundary id {}", id.0)))
    }

    /// Reaction force on a tracked boundary over the last completed step,
    /// in UU
    pub fn bc_reaction_force(&self, id: BcId) -> Result<Vector3<f64>> {
        let bc = self
            .boundaries
            .get(id.0)
            .ok_or_else(|| GranError::InvalidParameter(format!("unknown boundary id {}", id.0)))?;
        if !bc.track_reaction {
            return Err(GranError::InvalidParameter(format!(
                "boundary {} does not track reaction forces",
                id.0
            )));
        }
        let st = self.runtime()?;
        Ok(bc.reaction_su.map(|c| st.scaling.force_to_uu(c)))
    }

    // --- mesh soup --------------------------------------------------------

    /// One-time mesh soup ingestion; must precede `initialize()`
    pub fn load_meshes<P: AsRef<Path>>(
        &mut self,
        paths: &[P],
        scalings: &[Vector3<f64>],
    ) -> Result<()> {
        self.ensure_not_initialized("load_meshes")?;
        self.mesh = Some(TriangleSoup::load(paths, scalings)?);
        Ok(())
    }

    pub fn num_mesh_families(&self) -> usize {
        self.mesh.as_ref().map_or(0, TriangleSoup::num_families)
    }

    /// Sets each family's rigid transform for the coming steps
    pub fn mesh_soup_apply_rigid_body_motion(&mut self, poses: &[MeshFramePose]) -> Result<()> {
        let soup = self
            .mesh
            .as_mut()
            .ok_or_else(|| GranError::InvalidParameter("no mesh soup loaded".into()))?;
        soup.apply_rigid_body_motion(poses)
    }

    /// Reads back the accumulated generalized force per mesh family, UU,
    /// six components each. The forces reflect the sphere configuration as
    /// of the most recently completed step.
    pub fn collect_generalized_forces_on_mesh_soup(&self, out: &mut [f64]) -> Result<()> {
        let soup = self
            .mesh
            .as_ref()
            .ok_or_else(|| GranError::InvalidParameter("no mesh soup loaded".into()))?;
        let st = self.runtime()?;
        soup.collect_generalized_forces(&st.scaling, out)
    }

    // --- lifecycle --------------------------------------------------------

    /// Validates the configuration, derives the unit context, partitions
    /// the BD, seeds the sphere population and allocates the occupancy
    /// buffers. Must be called exactly once, before `advance_simulation`.
    pub fn initialize(&mut self) -> Result<()> {
        self.ensure_not_initialized("initialize")?;

        let max_k = self.k_n_s2s.max(self.k_n_s2w).max(self.k_n_s2m);
        let scaling = UnitScaling::derive(
            self.sphere_radius,
            self.sphere_density,
            max_k,
            self.gravity,
            self.psi,
        )?;
        let grid = SdGrid::partition(self.box_dims, self.sd_heuristic, &scaling)?;

        let gravity_su = scaling.gravity_to_su(self.gravity);
        let grav_mag_su = f64::from(gravity_su.norm());
        let params = ContactParams {
            k_n_s2s: scaling.stiffness_to_su(self.k_n_s2s),
            gamma_n_s2s: scaling.damping_to_su(self.gamma_n_s2s),
            k_n_s2w: scaling.stiffness_to_su(self.k_n_s2w),
            gamma_n_s2w: scaling.damping_to_su(self.gamma_n_s2w),
            k_n_s2m: scaling.stiffness_to_su(self.k_n_s2m),
            gamma_n_s2m: scaling.damping_to_su(self.gamma_n_s2m),
            k_t_s2s: scaling.stiffness_to_su(self.k_t_s2s),
            gamma_t_s2s: scaling.damping_to_su(self.gamma_t_s2s),
            k_t_s2w: scaling.stiffness_to_su(self.k_t_s2w),
            gamma_t_s2w: scaling.damping_to_su(self.gamma_t_s2w),
            mu_static: self.mu_static,
            // one sphere has unit mass in SU, so m |g| is just |g_su|
            cohesion_force: self.cohesion_ratio * grav_mag_su,
            adhesion_force: self.adhesion_ratio_s2w * grav_mag_su,
            cohesion_cutoff: COHESION_CUTOFF_RADIUS_FRACTION * scaling.sphere_radius_su,
            friction_mode: self.friction_mode,
        };

        let points_uu = match &self.seed_positions {
            Some(points) => points.clone(),
            None => self.generate_fill_points()?,
        };
        let n = points_uu.len();
        let pos: Vec<Vector3<i64>> = points_uu
            .iter()
            .map(|p| scaling.position_to_su(*p))
            .collect();

        let vel: Vec<Vector3<f32>> = match &self.seed_velocities {
            Some(vels) => {
                if vels.len() != n {
                    return Err(GranError::InvalidParameter(format!(
                        "{} seeded velocities for {} sphere positions",
                        vels.len(),
                        n
                    )));
                }
                vels.iter()
                    .map(|v| {
                        Vector3::new(
                            scaling.velocity_to_su(v.x) as f32,
                            scaling.velocity_to_su(v.y) as f32,
                            scaling.velocity_to_su(v.z) as f32,
                        )
                    })
                    .collect()
            }
            None => vec![Vector3::zeros(); n],
        };

        let step_control = StepSizeControl::new(
            self.stepping,
            scaling.time_to_su(self.fixed_step_uu),
            scaling.time_to_su(self.max_adaptive_step_uu),
        );

        for bc in &mut self.boundaries {
            bc.shape_su = Some(bc.shape_uu.to_su(&scaling));
            bc.reaction_su = Vector3::zeros();
        }

        let buckets = self.mesh.as_ref().map(|soup| {
            let bucket_grid = BucketGrid::from_sd_grid(&grid, BUCKET_COALESCE_FACTOR);
            debug!(
                buckets = bucket_grid.num_buckets,
                triangles = soup.num_triangles(),
                "allocated triangle buckets"
            );
            TriangleBuckets::new(bucket_grid, self.max_triangles_per_bucket)
        });

        info!(
            spheres = n,
            sds = grid.num_sds,
            radius_su = scaling.sphere_radius_su,
            length_unit = scaling.length_unit,
            time_unit = scaling.time_unit,
            mass_unit = scaling.mass_unit,
            "granular system initialized"
        );

        self.state = Some(RuntimeState {
            scaling,
            grid,
            base_frame_origin: grid.frame_origin_su,
            frame_origin: grid.frame_origin_su,
            occupancy: SdOccupancy::new(grid.num_sds, self.max_spheres_per_sd),
            buckets,
            params,
            gravity_su,
            radius_su: scaling.sphere_radius_su,
            search_radius_su: scaling.sphere_radius_su + params.cohesion_cutoff,
            integrator: self.integrator,
            step_control,
            pos,
            vel,
            vel_update: vec![Vector3::zeros(); n],
            acc: vec![Vector3::zeros(); n],
            history: vec![PartnerSlots::default(); n],
        });
        Ok(())
    }

    /// Seeds the fill region with an HCP-packed point set
    fn generate_fill_points(&self) -> Result<Vec<Vector3<f64>>> {
        let b = &self.fill_bounds;
        let mut center = Vector3::zeros();
        let mut half = Vector3::zeros();
        for axis in 0..3 {
            center[axis] = self.box_dims[axis] * (b[axis + 3] + b[axis]) / 4.0;
            half[axis] = (self.box_dims[axis] * (b[axis + 3] - b[axis]) / 4.0).abs()
                - self.sphere_radius;
        }
        let points = sample_hcp_box(center, half, FILL_SPACING_RADII * self.sphere_radius);
        if points.is_empty() {
            return Err(GranError::InvalidParameter(format!(
                "fill region {:?} too small for spheres of radius {}",
                self.fill_bounds, self.sphere_radius
            )));
        }
        Ok(points)
    }

    /// Advances the simulation by `duration` UU seconds, synchronously.
    ///
    /// The duration is covered in internal steps whose size comes from the
    /// configured stepping policy; the final step is truncated so elapsed
    /// time lands exactly on the requested duration. A zero duration is a
    /// no-op.
    pub fn advance_simulation(&mut self, duration: f64) -> Result<()> {
        let st = self
            .state
            .as_mut()
            .ok_or_else(|| GranError::NotInitialized("advance_simulation".into()))?;
        if duration < 0.0 {
            return Err(GranError::InvalidParameter(format!(
                "duration must be non-negative, got {duration}"
            )));
        }

        let mut remaining = duration;
        while remaining > 0.0 {
            let mut dt_su = {
                let control = &mut st.step_control;
                let vel = &st.vel;
                let radius = st.radius_su;
                let grav = f64::from(st.gravity_su.norm());
                control.next_dt(
                    || {
                        vel.par_iter()
                            .map(|v| f64::from(v.norm()))
                            .reduce(|| 0.0, f64::max)
                    },
                    radius,
                    grav,
                )
            };
            let mut dt_uu = st.scaling.time_to_uu(dt_su);
            if dt_uu > remaining {
                dt_uu = remaining;
                dt_su = st.scaling.time_to_su(remaining);
            }

            run_step(
                st,
                self.mesh.as_mut(),
                &mut self.boundaries,
                self.bd_fixed,
                self.bd_position_fns.as_ref(),
                self.box_dims,
                self.time_elapsed,
                dt_su,
                self.verbose,
            )?;

            remaining -= dt_uu;
            self.time_elapsed += dt_uu;
        }
        Ok(())
    }

    // --- read-back --------------------------------------------------------

    /// Number of discrete elements in the system
    pub fn element_count(&self) -> usize {
        self.state.as_ref().map_or(0, |st| st.pos.len())
    }

    /// Alias for [`element_count`](Self::element_count)
    pub fn n_spheres(&self) -> usize {
        self.element_count()
    }

    /// Number of sub-domains the BD is split into
    pub fn sd_count(&self) -> usize {
        self.state.as_ref().map_or(0, |st| st.grid.num_sds)
    }

    /// Elapsed simulated time, UU seconds
    pub fn time(&self) -> f64 {
        self.time_elapsed
    }

    /// Highest sphere center, UU
    pub fn max_z(&self) -> Result<f64> {
        let st = self.runtime()?;
        let z = st
            .pos
            .par_iter()
            .map(|p| p.z)
            .max()
            .ok_or_else(|| GranError::InvalidParameter("system holds no spheres".into()))?;
        Ok(st.scaling.length_to_uu(z as f64))
    }

    /// Current sphere positions in UU
    pub fn positions_uu(&self) -> Result<Vec<Vector3<f64>>> {
        let st = self.runtime()?;
        Ok(st
            .pos
            .iter()
            .map(|p| st.scaling.position_to_uu(*p))
            .collect())
    }

    /// Current sphere velocities in UU
    pub fn velocities_uu(&self) -> Result<Vec<Vector3<f64>>> {
        let st = self.runtime()?;
        Ok(st
            .vel
            .iter()
            .map(|v| {
                Vector3::new(
                    st.scaling.velocity_to_uu(f64::from(v.x)),
                    st.scaling.velocity_to_uu(f64::from(v.y)),
                    st.scaling.velocity_to_uu(f64::from(v.z)),
                )
            })
            .collect())
    }

    /// Total kinetic energy of the bed, UU (mass x velocity squared over
    /// two); handy for settling diagnostics
    pub fn kinetic_energy(&self) -> Result<f64> {
        let st = self.runtime()?;
        let sum_v2: f64 = st
            .vel
            .par_iter()
            .map(|v| {
                let vx = st.scaling.velocity_to_uu(f64::from(v.x));
                let vy = st.scaling.velocity_to_uu(f64::from(v.y));
                let vz = st.scaling.velocity_to_uu(f64::from(v.z));
                vx * vx + vy * vy + vz * vz
            })
            .sum();
        Ok(0.5 * st.scaling.mass_unit * sum_v2)
    }

    // --- snapshots --------------------------------------------------------

    /// Writes a particle snapshot named `base` into the output directory,
    /// honoring the configured output mode: CSV rows in SU, or raw binary
    /// coordinates in UU
    pub fn write_file(&self, base: &str) -> Result<()> {
        let st = self.runtime()?;
        match self.output_mode {
            OutputMode::Csv => {
                io::write_snapshot_su(self.output_dir.join(format!("{base}.csv")), &st.pos)
            }
            OutputMode::Binary => {
                let uu = self.positions_uu()?;
                io::write_snapshot_binary(self.output_dir.join(format!("{base}.raw")), &uu)
            }
            OutputMode::None => Ok(()),
        }
    }

    /// Writes a particle snapshot in UU; the CSV variant doubles as a
    /// checkpoint re-readable through
    /// [`set_particle_positions_from_checkpoint`](Self::set_particle_positions_from_checkpoint)
    pub fn write_file_uu(&self, base: &str) -> Result<()> {
        let positions = self.positions_uu()?;
        match self.output_mode {
            OutputMode::Csv => {
                let velocities = self.velocities_uu()?;
                io::write_snapshot_uu(
                    self.output_dir.join(format!("{base}.csv")),
                    &positions,
                    &velocities,
                )
            }
            OutputMode::Binary => {
                io::write_snapshot_binary(self.output_dir.join(format!("{base}.raw")), &positions)
            }
            OutputMode::None => Ok(()),
        }
    }

    /// Dumps the posed mesh soup as an OBJ next to the particle snapshots
    pub fn write_meshes(&self, base: &str) -> Result<()> {
        let soup = self
            .mesh
            .as_ref()
            .ok_or_else(|| GranError::InvalidParameter("no mesh soup loaded".into()))?;
        if self.output_mode == OutputMode::None {
            return Ok(());
        }
        io::write_meshes(self.output_dir.join(format!("{base}.obj")), soup)
    }
}

/// For a sphere pair, the flat index of the lowest SD both spheres touch:
/// the one SD allowed to evaluate the pair, so a contact spanning several
/// SDs is never double counted
#[inline]
fn canonical_owner_sd(
    grid: &SdGrid,
    frame_origin: Vector3<i64>,
    search_radius_su: f64,
    a: Vector3<i64>,
    b: Vector3<i64>,
) -> usize {
    let (lo_a, _) = grid.sd_range_of_sphere(a, search_radius_su, frame_origin);
    let (lo_b, _) = grid.sd_range_of_sphere(b, search_radius_su, frame_origin);
    grid.sd_index(lo_a.sup(&lo_b))
}

#[inline]
fn to_f64(v: Vector3<i64>) -> Vector3<f64> {
    Vector3::new(v.x as f64, v.y as f64, v.z as f64)
}

#[inline]
fn to_f32(v: Vector3<f64>) -> Vector3<f32> {
    Vector3::new(v.x as f32, v.y as f32, v.z as f32)
}

/// One atomic time step: prime the broad phase, accumulate forces,
/// integrate, commit. Either every stage completes or the step fails with
/// the first fatal diagnostic; there are no partial steps.
#[allow(clippy::too_many_arguments)]
fn run_step(
    st: &mut RuntimeState,
    mut mesh: Option<&mut TriangleSoup>,
    boundaries: &mut [BoundaryCondition],
    bd_fixed: bool,
    bd_position_fns: Option<&[BdPositionFn; 3]>,
    box_dims: Vector3<f64>,
    time_uu: f64,
    dt_su: f64,
    verbose: bool,
) -> Result<()> {
    // prescribed BD motion offsets the frame before binning
    st.frame_origin = st.base_frame_origin;
    if !bd_fixed {
        if let Some(fns) = bd_position_fns {
            for axis in 0..3 {
                let offset_uu = fns[axis](time_uu) * box_dims[axis] / 2.0;
                st.frame_origin[axis] +=
                    st.scaling.length_to_su(offset_uu).round() as i64;
            }
        }
    }

    // pose and bin the mesh soup for this step
    if let Some(soup) = mesh.as_deref_mut() {
        soup.pose_into_su(&st.scaling);
        soup.reset_forces();
        if let Some(buckets) = &st.buckets {
            buckets.bin_triangles(st.frame_origin, soup.world_nodes_su())?;
        }
    }

    // broad phase: rebuild sphere occupancy from scratch
    binning::bin_spheres(
        &st.grid,
        st.frame_origin,
        st.search_radius_su,
        &st.pos,
        &st.occupancy,
    )?;

    for bc in boundaries.iter_mut() {
        bc.reaction_su = Vector3::zeros();
    }

    // force accumulation: a parallel gather per sphere; results land in
    // per-sphere buffers and are merged afterwards so no velocity is read
    // and written inside the same pass
    let soup_read: Option<&TriangleSoup> = mesh.as_deref();
    let out: Vec<SphereStep> = {
        let grid = &st.grid;
        let occupancy = &st.occupancy;
        let buckets = st.buckets.as_ref();
        let params = &st.params;
        let scaling = &st.scaling;
        let pos = &st.pos;
        let vel = &st.vel;
        let history = &st.history;
        let frame_origin = st.frame_origin;
        let radius = st.radius_su;
        let search_radius = st.search_radius_su;
        let gravity = st.gravity_su;
        let bcs: &[BoundaryCondition] = boundaries;

        (0..pos.len())
            .into_par_iter()
            .map(|i| {
                let center = pos[i];
                let center_f = to_f64(center);
                let vi = vel[i].cast::<f64>();
                let mut force = Vector3::<f64>::zeros();
                let mut hist = PartnerSlots::default();
                let mut family_forces = Vec::new();
                let mut bc_reactions = Vec::new();

                // sphere-sphere, pairs owned by their canonical SD; the
                // range uses the same widened radius as the binning pass
                let (lo, hi) =
                    grid.sd_range_of_sphere(center, search_radius, frame_origin);
                for x in lo.x..=hi.x {
                    for y in lo.y..=hi.y {
                        for z in lo.z..=hi.z {
                            let sd = grid.sd_index(Vector3::new(x, y, z));
                            for j in occupancy.occupants_of(sd) {
                                let j = j as usize;
                                if j == i {
                                    continue;
                                }
                                let other = pos[j];
                                if sd
                                    != canonical_owner_sd(
                                        grid,
                                        frame_origin,
                                        search_radius,
                                        center,
                                        other,
                                    )
                                {
                                    continue;
                                }

                                let d = to_f64(center - other);
                                let dist = d.norm();
                                if dist == 0.0 {
                                    continue;
                                }
                                let penetration = 2.0 * radius - dist;
                                if penetration <= -params.cohesion_cutoff {
                                    continue;
                                }
                                let normal = d / dist;
                                let geom = ContactGeometry {
                                    normal,
                                    penetration,
                                    rel_vel: vi - vel[j].cast::<f64>(),
                                };
                                let f_n =
                                    normal_force(&geom, params.k_n_s2s, params.gamma_n_s2s);
                                force += f_n;
                                if params.cohesion_force > 0.0 {
                                    force += cohesive_force(normal, params.cohesion_force);
                                }
                                if penetration > 0.0 {
                                    match params.friction_mode {
                                        FrictionMode::Frictionless => {}
                                        FrictionMode::SingleStep => {
                                            force += single_step_friction(
                                                &geom,
                                                f_n,
                                                params.gamma_t_s2s,
                                                params.mu_static,
                                            );
                                        }
                                        FrictionMode::MultiStep => {
                                            let carried =
                                                history[i].carried_elongation(j as u32);
                                            let (f_t, elongation) = multi_step_friction(
                                                &geom,
                                                f_n,
                                                carried,
                                                dt_su,
                                                params.k_t_s2s,
                                                params.gamma_t_s2s,
                                                params.mu_static,
                                            );
                                            force += f_t;
                                            hist.push(j as u32, elongation);
                                        }
                                    }
                                }
                            }
                        }
                    }
                }

                // analytic boundaries; probed with the cohesion cutoff so
                // adhesion can act across a small gap
                for (b, bc) in bcs.iter().enumerate() {
                    if !bc.active {
                        continue;
                    }
                    let Some(shape) = bc.shape_su else { continue };
                    let Some(probe) = shape.contact_with_sphere(
                        center_f,
                        radius + params.cohesion_cutoff,
                        vi,
                    ) else {
                        continue;
                    };
                    let geom = ContactGeometry {
                        normal: probe.normal,
                        penetration: probe.penetration - params.cohesion_cutoff,
                        rel_vel: probe.rel_vel,
                    };
                    let f_n = normal_force(&geom, params.k_n_s2w, params.gamma_n_s2w);
                    let mut f_bc = f_n;
                    if params.adhesion_force > 0.0 {
                        f_bc += cohesive_force(geom.normal, params.adhesion_force);
                    }
                    if geom.penetration > 0.0
                        && params.friction_mode != FrictionMode::Frictionless
                    {
                        // wall friction carries no history in any mode
                        f_bc += single_step_friction(
                            &geom,
                            f_n,
                            params.gamma_t_s2w,
                            params.mu_static,
                        );
                    }
                    if f_bc != Vector3::zeros() {
                        force += f_bc;
                        if bc.track_reaction {
                            bc_reactions.push((b, -f_bc));
                        }
                    }
                }

                // mesh soup, candidates from the triangle buckets
                if let (Some(soup), Some(buckets)) = (soup_read, buckets) {
                    let r_probe = Vector3::new(radius, radius, radius);
                    let lo = buckets
                        .grid
                        .bucket_of_point(center_f - r_probe, frame_origin);
                    let hi = buckets
                        .grid
                        .bucket_of_point(center_f + r_probe, frame_origin);
                    let mut candidates = Vec::new();
                    for x in lo.x..=hi.x {
                        for y in lo.y..=hi.y {
                            for z in lo.z..=hi.z {
                                candidates
                                    .extend(buckets.triangles_in(Vector3::new(x, y, z)));
                            }
                        }
                    }
                    candidates.sort_unstable();
                    candidates.dedup();

                    for t in candidates {
                        let t = t as usize;
                        let nodes = &soup.world_nodes_su()[t];
                        let Some((first_pass, point)) = triangle::sphere_triangle_contact(
                            center_f,
                            radius,
                            nodes,
                            vi,
                            Vector3::zeros(),
                        ) else {
                            continue;
                        };
                        let surface_vel = soup.surface_velocity_su(t, point, scaling);
                        let geom = ContactGeometry {
                            normal: first_pass.normal,
                            penetration: first_pass.penetration,
                            rel_vel: vi - surface_vel,
                        };
                        let f_m = normal_force(&geom, params.k_n_s2m, params.gamma_n_s2m);
                        if f_m == Vector3::zeros() {
                            continue;
                        }
                        force += f_m;
                        let family = soup.family_of(t);
                        let reference =
                            soup.family_reference_su(family as usize, scaling);
                        family_forces.push((
                            family,
                            GeneralizedForce {
                                force: -f_m,
                                torque: (point - reference).cross(&(-f_m)),
                            },
                        ));
                    }
                }

                // unit sphere mass in SU: acceleration equals force
                let acc = force + gravity.cast::<f64>();
                SphereStep {
                    dv: to_f32(acc * dt_su),
                    acc: to_f32(acc),
                    hist,
                    family_forces,
                    bc_reactions,
                }
            })
            .collect()
    };

    // contact history rows are fixed capacity; overflowing one means the
    // bed is in a nonphysical configuration
    for (i, o) in out.iter().enumerate() {
        if o.hist.overflowed() {
            return Err(GranError::CapacityExceeded {
                kind: CapacityKind::ContactHistory,
                index: i,
                capacity: MAX_CONTACT_PARTNERS,
            });
        }
    }

    // merge the small per-sphere side products serially
    for o in &out {
        for (b, f) in &o.bc_reactions {
            boundaries[*b].reaction_su += *f;
        }
    }
    if let Some(soup) = mesh.as_deref_mut() {
        for o in &out {
            for (family, gf) in &o.family_forces {
                soup.add_family_force(*family as usize, gf);
            }
        }
    }

    // two-phase commit: pending updates first, then the live arrays
    for (i, o) in out.iter().enumerate() {
        st.vel_update[i] = o.dv;
        st.acc[i] = o.acc;
        st.history[i] = o.hist;
    }
    integration::commit_velocity_updates(&mut st.vel, &st.vel_update);
    integration::integrate_positions(st.integrator, &mut st.pos, &st.vel, &st.acc, dt_su);

    if verbose {
        debug!(dt_su, spheres = st.pos.len(), "completed step");
    }
    Ok(())
}
