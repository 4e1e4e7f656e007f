pub mod boundary;
pub mod triangle;

pub use self::boundary::{BcId, BcShape, BoundaryCondition};

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Selects whether and how tangential contact forces are modeled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FrictionMode {
    /// Normal forces only; no tangential contact response
    #[default]
    Frictionless,

    /// Viscous tangential damping clamped by the Coulomb cone, with no
    /// memory between steps
    SingleStep,

    /// Tangential spring whose elongation is carried across steps in
    /// per-sphere contact-partner slots, clamped by the Coulomb cone
    MultiStep,
}

/// Maximum simultaneous contact partners tracked per sphere. Twelve is the
/// kissing number for equal spheres, so a monodisperse bed cannot exceed it
/// without already being in a broken configuration.
pub const MAX_CONTACT_PARTNERS: usize = 12;

/// Contact coefficients in SU, consumed read-only by every force kernel
#[derive(Debug, Clone, Copy, Default)]
pub struct ContactParams {
    pub k_n_s2s: f64,
    pub gamma_n_s2s: f64,
    pub k_n_s2w: f64,
    pub gamma_n_s2w: f64,
    pub k_n_s2m: f64,
    pub gamma_n_s2m: f64,

    pub k_t_s2s: f64,
    pub gamma_t_s2s: f64,
    pub k_t_s2w: f64,
    pub gamma_t_s2w: f64,

    /// Static friction coefficient bounding tangential force
    pub mu_static: f64,

    /// Constant sphere-sphere attraction, `cohesion_ratio * m|g|` in SU
    pub cohesion_force: f64,

    /// Constant sphere-wall attraction, `adhesion_ratio * m|g|` in SU
    pub adhesion_force: f64,

    /// Surface gap (SU) below which cohesion/adhesion still acts while the
    /// bodies are separated
    pub cohesion_cutoff: f64,

    pub friction_mode: FrictionMode,
}

/// A resolved narrow-phase contact, in SU
#[derive(Debug, Clone, Copy)]
pub struct ContactGeometry {
    /// Unit normal pointing toward the sphere the force acts on
    pub normal: Vector3<f64>,

    /// Penetration depth; positive while the bodies overlap
    pub penetration: f64,

    /// Relative velocity of the sphere with respect to the other body
    pub rel_vel: Vector3<f64>,
}

/// Hookean normal spring-damper force on a sphere.
///
/// `F_n = k_n * delta * n - gamma_n * v_n`, active only while the
/// penetration is positive. The damping term acts on the normal component
/// of the relative velocity only.
#[inline]
pub fn normal_force(geom: &ContactGeometry, k_n: f64, gamma_n: f64) -> Vector3<f64> {
    if geom.penetration <= 0.0 {
        return Vector3::zeros();
    }
    let v_n = geom.normal * geom.rel_vel.dot(&geom.normal);
    geom.normal * (k_n * geom.penetration) - v_n * gamma_n
}

/// Constant attractive force along the contact normal, active regardless of
/// penetration sign while the pair is inside the cohesion cutoff
#[inline]
pub fn cohesive_force(normal: Vector3<f64>, magnitude: f64) -> Vector3<f64> {
    -normal * magnitude
}

/// Single-step tangential force: viscous damping of the tangential relative
/// velocity, clamped to the Coulomb cone `mu * |F_n|`
pub fn single_step_friction(
    geom: &ContactGeometry,
    normal_force: Vector3<f64>,
    gamma_t: f64,
    mu: f64,
) -> Vector3<f64> {
    let v_t = geom.rel_vel - geom.normal * geom.rel_vel.dot(&geom.normal);
    let mut f_t = -v_t * gamma_t;
    let limit = mu * normal_force.norm();
    let mag = f_t.norm();
    if mag > limit && mag > 0.0 {
        f_t *= limit / mag;
    }
    f_t
}

/// Multi-step tangential force: integrates a tangential spring elongation
/// across steps and clamps it to the Coulomb cone. When the clamp engages,
/// the stored elongation is rescaled to sit on the cone so the spring does
/// not wind up unboundedly while sliding.
///
/// Returns the tangential force and the updated elongation to carry into
/// the next step.
pub fn multi_step_friction(
    geom: &ContactGeometry,
    normal_force: Vector3<f64>,
    elongation: Vector3<f64>,
    dt: f64,
    k_t: f64,
    gamma_t: f64,
    mu: f64,
) -> (Vector3<f64>, Vector3<f64>) {
    let v_t = geom.rel_vel - geom.normal * geom.rel_vel.dot(&geom.normal);

    // project the carried elongation into the current tangent plane
    let mut xi = elongation - geom.normal * elongation.dot(&geom.normal);
    xi += v_t * dt;

    let mut f_t = -xi * k_t - v_t * gamma_t;
    let limit = mu * normal_force.norm();
    let mag = f_t.norm();
    if mag > limit && mag > 0.0 {
        f_t *= limit / mag;
        if k_t > 0.0 {
            xi = -(f_t + v_t * gamma_t) / k_t;
        }
    }
    (f_t, xi)
}

/// Fixed-capacity contact-partner slots for one sphere, carrying the
/// tangential spring elongation of each live contact across steps.
///
/// Each sphere owns exactly one row, written only by the parallel task
/// handling that sphere, so no synchronization is needed.
#[derive(Debug, Clone, Copy)]
pub struct PartnerSlots {
    ids: [u32; MAX_CONTACT_PARTNERS],
    elongation: [Vector3<f32>; MAX_CONTACT_PARTNERS],
    len: u8,
    overflowed: bool,
}

impl Default for PartnerSlots {
    fn default() -> Self {
        Self {
            ids: [u32::MAX; MAX_CONTACT_PARTNERS],
            elongation: [Vector3::zeros(); MAX_CONTACT_PARTNERS],
            len: 0,
            overflowed: false,
        }
    }
}

impl PartnerSlots {
    /// Looks up the elongation carried for `partner`, or zero if the
    /// contact is new
    pub fn carried_elongation(&self, partner: u32) -> Vector3<f64> {
        for slot in 0..self.len as usize {
            if self.ids[slot] == partner {
                return self.elongation[slot].cast::<f64>();
            }
        }
        Vector3::zeros()
    }

    /// Records the elongation for `partner` in the next-step row
    pub fn push(&mut self, partner: u32, elongation: Vector3<f64>) {
        let slot = self.len as usize;
        if slot >= MAX_CONTACT_PARTNERS {
            self.overflowed = true;
            return;
        }
        self.ids[slot] = partner;
        self.elongation[slot] = Vector3::new(
            elongation.x as f32,
            elongation.y as f32,
            elongation.z as f32,
        );
        self.len = slot as u8 + 1;
    }

    /// Whether more partners touched this sphere than the row can hold
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// Number of live contacts recorded
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
