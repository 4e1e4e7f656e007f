use nalgebra::Vector3;

use crate::error::GranError;
use crate::Result;

/// Integer multipliers trading numeric range against precision in the
/// derived simulation units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PsiFactors {
    /// Subdivision of the characteristic oscillation period
    pub psi_t: u32,

    /// Fraction of the unit step over which stiffness may act
    pub psi_h: u32,

    /// Controls how many length units span the static overlap length
    pub psi_l: u32,
}

impl Default for PsiFactors {
    fn default() -> Self {
        Self {
            psi_t: 16,
            psi_h: 4,
            psi_l: 16,
        }
    }
}

/// The immutable simulation-unit context.
///
/// Physical quantities supplied by the caller ("user units", UU) are
/// re-expressed internally as multiples of a mass, length and time unit
/// ("simulation units", SU) chosen so that per-step displacements and
/// contact forces stay well inside the range and precision budget of the
/// integrator. The context is derived exactly once during initialization
/// and then passed by shared reference into every kernel; nothing mutates
/// it afterwards, so the double-derivation hazard of a mutable shared
/// parameter block cannot arise.
#[derive(Debug, Clone, Copy)]
pub struct UnitScaling {
    /// Mass of one sphere; every mass is a multiple of this
    pub mass_unit: f64,

    /// Every SU length is an integer multiple of this
    pub length_unit: f64,

    /// Every SU time span is a multiple of this
    pub time_unit: f64,

    /// Sphere radius expressed in SU
    pub sphere_radius_su: f64,

    /// The psi factors the context was derived with
    pub psi: PsiFactors,
}

impl UnitScaling {
    /// Derives the SU context from the physical sphere radius, density,
    /// the stiffest configured contact pair and the gravity vector.
    ///
    /// * `MASS_UNIT` is the mass of one sphere.
    /// * `TIME_UNIT = sqrt(m / (psi_h K)) / psi_t` subdivides the
    ///   stiffness-driven oscillation period.
    /// * `LENGTH_UNIT = m |g| / (psi_l K)` puts the static overlap length
    ///   at `psi_l` length units.
    ///
    /// Degenerate inputs make the derivation divide by zero and are
    /// rejected up front.
    pub fn derive(
        sphere_radius: f64,
        sphere_density: f64,
        max_stiffness: f64,
        gravity: Vector3<f64>,
        psi: PsiFactors,
    ) -> Result<Self> {
        if sphere_radius <= 0.0 {
            return Err(GranError::InvalidParameter(format!(
                "sphere radius must be positive, got {}",
                sphere_radius
            )));
        }
        if sphere_density <= 0.0 {
            return Err(GranError::InvalidParameter(format!(
                "sphere density must be positive, got {}",
                sphere_density
            )));
        }
        if max_stiffness <= 0.0 {
            return Err(GranError::InvalidParameter(format!(
                "normal stiffness must be positive, got {}",
                max_stiffness
            )));
        }
        if psi.psi_t == 0 || psi.psi_h == 0 || psi.psi_l == 0 {
            return Err(GranError::InvalidParameter(
                "psi factors must be nonzero".into(),
            ));
        }
        let grav_mag = gravity.norm();
        if grav_mag <= 0.0 {
            return Err(GranError::InvalidParameter(
                "gravity magnitude must be nonzero to derive the length unit".into(),
            ));
        }

        let mass_unit =
            4.0 / 3.0 * std::f64::consts::PI * sphere_radius.powi(3) * sphere_density;
        let time_unit =
            (mass_unit / (f64::from(psi.psi_h) * max_stiffness)).sqrt() / f64::from(psi.psi_t);
        let length_unit = mass_unit * grav_mag / (f64::from(psi.psi_l) * max_stiffness);

        Ok(Self {
            mass_unit,
            length_unit,
            time_unit,
            sphere_radius_su: sphere_radius / length_unit,
            psi,
        })
    }

    /// Converts a length from UU to SU
    #[inline]
    pub fn length_to_su(&self, l: f64) -> f64 {
        l / self.length_unit
    }

    /// Converts a length from SU back to UU
    #[inline]
    pub fn length_to_uu(&self, l: f64) -> f64 {
        l * self.length_unit
    }

    /// Converts a time span from UU to SU
    #[inline]
    pub fn time_to_su(&self, t: f64) -> f64 {
        t / self.time_unit
    }

    /// Converts a time span from SU back to UU
    #[inline]
    pub fn time_to_uu(&self, t: f64) -> f64 {
        t * self.time_unit
    }

    /// Converts a velocity from UU to SU
    #[inline]
    pub fn velocity_to_su(&self, v: f64) -> f64 {
        v * self.time_unit / self.length_unit
    }

    /// Converts a velocity from SU back to UU
    #[inline]
    pub fn velocity_to_uu(&self, v: f64) -> f64 {
        v * self.length_unit / self.time_unit
    }

    /// Converts an acceleration from UU to SU
    #[inline]
    pub fn acceleration_to_su(&self, a: f64) -> f64 {
        a * self.time_unit * self.time_unit / self.length_unit
    }

    /// Converts a normal stiffness (force per length) from UU to SU.
    ///
    /// For the stiffest configured pair this evaluates to
    /// `1 / (psi_t^2 psi_h)` by construction of the time unit.
    #[inline]
    pub fn stiffness_to_su(&self, k: f64) -> f64 {
        k * self.time_unit * self.time_unit / self.mass_unit
    }

    /// Converts a normal damping coefficient (mass per time) from UU to SU
    #[inline]
    pub fn damping_to_su(&self, gamma: f64) -> f64 {
        gamma * self.time_unit / self.mass_unit
    }

    /// Converts a force from SU back to UU
    #[inline]
    pub fn force_to_uu(&self, f: f64) -> f64 {
        f * self.mass_unit * self.length_unit / (self.time_unit * self.time_unit)
    }

    /// Converts a torque from SU back to UU
    #[inline]
    pub fn torque_to_uu(&self, t: f64) -> f64 {
        self.force_to_uu(t) * self.length_unit
    }

    /// Gravity vector expressed in SU.
    ///
    /// Component-wise this is `psi_l / (psi_t^2 psi_h) * g_i / |g|` when the
    /// context was derived from the same gravity vector.
    pub fn gravity_to_su(&self, gravity: Vector3<f64>) -> Vector3<f32> {
        Vector3::new(
            self.acceleration_to_su(gravity.x) as f32,
            self.acceleration_to_su(gravity.y) as f32,
            self.acceleration_to_su(gravity.z) as f32,
        )
    }

    /// Converts a UU position to the integer SU grid
    #[inline]
    pub fn position_to_su(&self, p: Vector3<f64>) -> Vector3<i64> {
        Vector3::new(
            (p.x / self.length_unit).round() as i64,
            (p.y / self.length_unit).round() as i64,
            (p.z / self.length_unit).round() as i64,
        )
    }

    /// Converts an integer SU position back to UU
    #[inline]
    pub fn position_to_uu(&self, p: Vector3<i64>) -> Vector3<f64> {
        Vector3::new(
            p.x as f64 * self.length_unit,
            p.y as f64 * self.length_unit,
            p.z as f64 * self.length_unit,
        )
    }
}
