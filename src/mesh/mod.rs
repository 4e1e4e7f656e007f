use std::path::Path;

use nalgebra::{UnitQuaternion, Vector3};
use tracing::info;

use crate::error::GranError;
use crate::units::UnitScaling;
use crate::Result;

/// Rigid transform (and optional velocity) of one mesh family, supplied by
/// the co-simulation caller once per step, in UU
#[derive(Debug, Clone, Copy)]
pub struct MeshFramePose {
    pub position: Vector3<f64>,
    pub rotation: UnitQuaternion<f64>,

    /// Velocity of the family reference point; enters the contact damping
    /// term
    pub linear_velocity: Vector3<f64>,

    /// Angular velocity about the reference point, rad/s
    pub angular_velocity: Vector3<f64>,
}

impl Default for MeshFramePose {
    fn default() -> Self {
        Self {
            position: Vector3::zeros(),
            rotation: UnitQuaternion::identity(),
            linear_velocity: Vector3::zeros(),
            angular_velocity: Vector3::zeros(),
        }
    }
}

/// Accumulated generalized force on one mesh family: three force and three
/// torque components about the family reference point
#[derive(Debug, Clone, Copy, Default)]
pub struct GeneralizedForce {
    pub force: Vector3<f64>,
    pub torque: Vector3<f64>,
}

impl GeneralizedForce {
    pub fn accumulate(&mut self, other: &GeneralizedForce) {
        self.force += other.force;
        self.torque += other.torque;
    }
}

/// A collection of triangle mesh "families" acting as rigid implements in
/// the granular bed.
///
/// Topology and rest-pose geometry are immutable after loading; per step
/// only the family rigid transforms and the accumulated forces change. One
/// OBJ file becomes one family, so the four wheels of a vehicle loaded from
/// four files form a soup with four families.
pub struct TriangleSoup {
    /// Rest-pose node positions per triangle, UU, already scaled per family
    rest_nodes: Vec<[Vector3<f64>; 3]>,

    /// Owning family of each triangle
    family_of: Vec<u32>,

    num_families: usize,

    /// Current rigid transform per family
    poses: Vec<MeshFramePose>,

    /// Posed node positions per triangle, SU; rebuilt whenever poses change
    world_nodes_su: Vec<[Vector3<f64>; 3]>,

    /// Generalized force per family from the last completed step, SU
    family_forces_su: Vec<GeneralizedForce>,
}

impl TriangleSoup {
    /// Ingests one or more OBJ files, one family per file, applying a
    /// per-family geometric scaling.
    ///
    /// Triangles whose winding contradicts the file's vertex normals are
    /// flipped so the right-hand-rule face normal points out of the
    /// implement.
    pub fn load<P: AsRef<Path>>(paths: &[P], scalings: &[Vector3<f64>]) -> Result<Self> {
        if paths.len() != scalings.len() {
            return Err(GranError::InvalidParameter(format!(
                "got {} mesh files but {} scaling entries",
                paths.len(),
                scalings.len()
            )));
        }
        if paths.is_empty() {
            return Err(GranError::InvalidParameter(
                "mesh soup requires at least one file".into(),
            ));
        }

        let mut rest_nodes = Vec::new();
        let mut family_of = Vec::new();

        for (family, (path, scale)) in paths.iter().zip(scalings).enumerate() {
            let (models, _materials) = tobj::load_obj(
                path.as_ref(),
                &tobj::LoadOptions {
                    triangulate: true,
                    single_index: true,
                    ..Default::default()
                },
            )
            .map_err(|e| {
                GranError::MeshLoad(format!("{}: {e}", path.as_ref().display()))
            })?;

            if models.is_empty() {
                return Err(GranError::MeshLoad(format!(
                    "{}: no mesh data",
                    path.as_ref().display()
                )));
            }

            for model in &models {
                let mesh = &model.mesh;
                for tri in mesh.indices.chunks_exact(3) {
                    let mut nodes = [Vector3::zeros(); 3];
                    for (slot, &vi) in tri.iter().enumerate() {
                        let base = vi as usize * 3;
                        nodes[slot] = Vector3::new(
                            f64::from(mesh.positions[base]) * scale.x,
                            f64::from(mesh.positions[base + 1]) * scale.y,
                            f64::from(mesh.positions[base + 2]) * scale.z,
                        );
                    }

                    // reorient inside-out triangles against the file normals
                    if !mesh.normals.is_empty() {
                        let base = tri[0] as usize * 3;
                        let file_normal = Vector3::new(
                            f64::from(mesh.normals[base]),
                            f64::from(mesh.normals[base + 1]),
                            f64::from(mesh.normals[base + 2]),
                        );
                        let winding =
                            (nodes[1] - nodes[0]).cross(&(nodes[2] - nodes[0]));
                        if winding.dot(&file_normal) < 0.0 {
                            nodes.swap(1, 2);
                        }
                    }

                    rest_nodes.push(nodes);
                    family_of.push(family as u32);
                }
            }
        }

        let num_families = paths.len();
        info!(
            triangles = rest_nodes.len(),
            families = num_families,
            "loaded mesh soup"
        );

        let num_triangles = rest_nodes.len();
        Ok(Self {
            rest_nodes,
            family_of,
            num_families,
            poses: vec![MeshFramePose::default(); num_families],
            world_nodes_su: vec![[Vector3::zeros(); 3]; num_triangles],
            family_forces_su: vec![GeneralizedForce::default(); num_families],
        })
    }

    pub fn num_triangles(&self) -> usize {
        self.rest_nodes.len()
    }

    pub fn num_families(&self) -> usize {
        self.num_families
    }

    /// Owning family of triangle `t`
    #[inline]
    pub fn family_of(&self, t: usize) -> u32 {
        self.family_of[t]
    }

    /// Current pose of a family
    pub fn pose(&self, family: usize) -> &MeshFramePose {
        &self.poses[family]
    }

    /// Sets the rigid transform of every family; one pose per family is
    /// required
    pub fn apply_rigid_body_motion(&mut self, poses: &[MeshFramePose]) -> Result<()> {
        if poses.len() != self.num_families {
            return Err(GranError::InvalidParameter(format!(
                "got {} poses for {} mesh families",
                poses.len(),
                self.num_families
            )));
        }
        self.poses.copy_from_slice(poses);
        Ok(())
    }

    /// Maps the rest-pose triangles through the family transforms into the
    /// simulation frame, in SU. Called by the engine before binning.
    pub fn pose_into_su(&mut self, scaling: &UnitScaling) {
        for (t, rest) in self.rest_nodes.iter().enumerate() {
            let pose = &self.poses[self.family_of[t] as usize];
            for slot in 0..3 {
                let world_uu = pose.rotation * rest[slot] + pose.position;
                self.world_nodes_su[t][slot] = world_uu / scaling.length_unit;
            }
        }
    }

    /// Posed triangle nodes in SU, valid after [`pose_into_su`](Self::pose_into_su)
    pub fn world_nodes_su(&self) -> &[[Vector3<f64>; 3]] {
        &self.world_nodes_su
    }

    /// Posed nodes of one triangle in UU, for mesh snapshots
    pub fn world_nodes_uu(&self, t: usize) -> [Vector3<f64>; 3] {
        let pose = &self.poses[self.family_of[t] as usize];
        let rest = &self.rest_nodes[t];
        [
            pose.rotation * rest[0] + pose.position,
            pose.rotation * rest[1] + pose.position,
            pose.rotation * rest[2] + pose.position,
        ]
    }

    /// Velocity of the family's material point at `point_su`, expressed in
    /// SU: rigid-body velocity field of the family transform
    pub fn surface_velocity_su(
        &self,
        t: usize,
        point_su: Vector3<f64>,
        scaling: &UnitScaling,
    ) -> Vector3<f64> {
        let pose = &self.poses[self.family_of[t] as usize];
        let point_uu = point_su * scaling.length_unit;
        let v_uu = pose.linear_velocity
            + pose.angular_velocity.cross(&(point_uu - pose.position));
        v_uu.map(|c| scaling.velocity_to_su(c))
    }

    /// Family reference point in SU, the torque reference for the
    /// generalized force
    pub fn family_reference_su(&self, family: usize, scaling: &UnitScaling) -> Vector3<f64> {
        self.poses[family].position / scaling.length_unit
    }

    /// Clears the per-family force accumulators at the start of a step
    pub fn reset_forces(&mut self) {
        for f in &mut self.family_forces_su {
            *f = GeneralizedForce::default();
        }
    }

    /// Adds one contact's reaction onto a family accumulator, in SU
    pub fn add_family_force(&mut self, family: usize, contribution: &GeneralizedForce) {
        self.family_forces_su[family].accumulate(contribution);
    }

    /// Copies the per-family generalized forces into `out`, de-scaled to
    /// UU: six components per family, force before torque.
    ///
    /// The values reflect contacts against the sphere configuration as of
    /// the most recently completed step.
    pub fn collect_generalized_forces(&self, scaling: &UnitScaling, out: &mut [f64]) -> Result<()> {
        if out.len() != 6 * self.num_families {
            return Err(GranError::InvalidParameter(format!(
                "force buffer holds {} values, need {}",
                out.len(),
                6 * self.num_families
            )));
        }
        for (family, f) in self.family_forces_su.iter().enumerate() {
            let base = family * 6;
            out[base] = scaling.force_to_uu(f.force.x);
            out[base + 1] = scaling.force_to_uu(f.force.y);
            out[base + 2] = scaling.force_to_uu(f.force.z);
            out[base + 3] = scaling.torque_to_uu(f.torque.x);
            out[base + 4] = scaling.torque_to_uu(f.torque.y);
            out[base + 5] = scaling.torque_to_uu(f.torque.z);
        }
        Ok(())
    }
}
