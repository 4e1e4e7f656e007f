use nalgebra::Vector3;

use crate::contact::ContactGeometry;
use crate::units::UnitScaling;

/// Identifier handed back when a boundary condition is created, used to
/// disable it or read its reaction force later
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BcId(pub(crate) usize);

/// Analytic boundary surfaces producing contact forces against spheres.
///
/// All geometry is stored in the units it was created in (UU) and rescaled
/// once at initialization.
#[derive(Debug, Clone, Copy)]
pub enum BcShape {
    /// Infinite plane through `point` with outward `normal`; spheres are
    /// pushed along the normal
    Plane {
        point: Vector3<f64>,
        normal: Vector3<f64>,
    },

    /// Infinite cylinder about a Z-aligned axis; spheres are kept inside
    ZCylinder { center: Vector3<f64>, radius: f64 },

    /// Funnel-style cone opening upward along Z from `tip` with
    /// `slope = dr/dz`, active for sphere centers with z in `[hmin, hmax]`;
    /// spheres are kept inside the cone
    ZCone {
        tip: Vector3<f64>,
        slope: f64,
        hmax: f64,
        hmin: f64,
    },
}

impl BcShape {
    /// Rescales the shape's lengths into SU
    pub fn to_su(&self, scaling: &UnitScaling) -> BcShape {
        match *self {
            BcShape::Plane { point, normal } => BcShape::Plane {
                point: point / scaling.length_unit,
                normal: normal.normalize(),
            },
            BcShape::ZCylinder { center, radius } => BcShape::ZCylinder {
                center: center / scaling.length_unit,
                radius: scaling.length_to_su(radius),
            },
            BcShape::ZCone {
                tip,
                slope,
                hmax,
                hmin,
            } => BcShape::ZCone {
                tip: tip / scaling.length_unit,
                slope,
                hmax: scaling.length_to_su(hmax),
                hmin: scaling.length_to_su(hmin),
            },
        }
    }

    /// Narrow-phase test of a sphere against this surface. Positions,
    /// radius and velocity are in the same unit system as the shape.
    /// Returns the contact geometry when the sphere penetrates, with the
    /// normal pointing from the surface into the sphere.
    pub fn contact_with_sphere(
        &self,
        center: Vector3<f64>,
        radius: f64,
        velocity: Vector3<f64>,
    ) -> Option<ContactGeometry> {
        match *self {
            BcShape::Plane { point, normal } => {
                let signed = (center - point).dot(&normal);
                let penetration = radius - signed;
                (penetration > 0.0).then(|| ContactGeometry {
                    normal,
                    penetration,
                    rel_vel: velocity,
                })
            }
            BcShape::ZCylinder {
                center: axis,
                radius: wall_radius,
            } => {
                let radial = Vector3::new(center.x - axis.x, center.y - axis.y, 0.0);
                let rho = radial.norm();
                if rho == 0.0 {
                    return None;
                }
                let penetration = center_to_inner_wall(rho, wall_radius, radius)?;
                Some(ContactGeometry {
                    normal: -radial / rho,
                    penetration,
                    rel_vel: velocity,
                })
            }
            BcShape::ZCone {
                tip,
                slope,
                hmax,
                hmin,
            } => {
                if center.z < hmin || center.z > hmax {
                    return None;
                }
                let radial = Vector3::new(center.x - tip.x, center.y - tip.y, 0.0);
                let rho = radial.norm();
                if rho == 0.0 {
                    return None;
                }
                // signed distance to the surface rho = slope * (z - tip.z),
                // negative inside the cone
                let denom = (1.0 + slope * slope).sqrt();
                let signed = (rho - slope * (center.z - tip.z)) / denom;
                let penetration = radius + signed;
                if signed < 0.0 && penetration > 0.0 {
                    let radial_dir = radial / rho;
                    let normal =
                        (Vector3::new(-radial_dir.x, -radial_dir.y, slope) / denom).normalize();
                    Some(ContactGeometry {
                        normal,
                        penetration,
                        rel_vel: velocity,
                    })
                } else {
                    None
                }
            }
        }
    }
}

/// Penetration of a sphere of `radius` at radial distance `rho` against the
/// inside of a wall at `wall_radius`
#[inline]
fn center_to_inner_wall(rho: f64, wall_radius: f64, radius: f64) -> Option<f64> {
    let penetration = radius - (wall_radius - rho);
    (rho < wall_radius && penetration > 0.0).then_some(penetration)
}

/// An analytic boundary owned by the contact engine.
///
/// Disabled boundaries are skipped, not removed, so their ids stay stable
/// for the run.
#[derive(Debug, Clone)]
pub struct BoundaryCondition {
    /// Geometry as created, in UU
    pub shape_uu: BcShape,

    /// Geometry rescaled at initialization, in SU
    pub shape_su: Option<BcShape>,

    /// Skipped by the contact pass when false
    pub active: bool,

    /// Whether the engine accumulates the reaction force on this boundary
    pub track_reaction: bool,

    /// Accumulated reaction force from the last completed step, in SU
    pub reaction_su: Vector3<f64>,
}

impl BoundaryCondition {
    pub fn new(shape: BcShape, track_reaction: bool) -> Self {
        Self {
            shape_uu: shape,
            shape_su: None,
            active: true,
            track_reaction,
            reaction_su: Vector3::zeros(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn plane_pushes_along_normal() {
        let plane = BcShape::Plane {
            point: Vector3::zeros(),
            normal: Vector3::new(0.0, 0.0, 1.0),
        };
        let hit = plane
            .contact_with_sphere(Vector3::new(0.0, 0.0, 0.8), 1.0, Vector3::zeros())
            .unwrap();
        assert_relative_eq!(hit.penetration, 0.2, max_relative = 1e-12);
        assert_relative_eq!(hit.normal.z, 1.0, max_relative = 1e-12);

        assert!(plane
            .contact_with_sphere(Vector3::new(0.0, 0.0, 1.5), 1.0, Vector3::zeros())
            .is_none());
    }

    #[test]
    fn cylinder_keeps_spheres_inside() {
        let cyl = BcShape::ZCylinder {
            center: Vector3::zeros(),
            radius: 10.0,
        };
        let hit = cyl
            .contact_with_sphere(Vector3::new(9.5, 0.0, 3.0), 1.0, Vector3::zeros())
            .unwrap();
        assert_relative_eq!(hit.penetration, 0.5, max_relative = 1e-12);
        assert_relative_eq!(hit.normal.x, -1.0, max_relative = 1e-12);

        assert!(cyl
            .contact_with_sphere(Vector3::new(2.0, 0.0, 3.0), 1.0, Vector3::zeros())
            .is_none());
    }

    #[test]
    fn cone_contact_respects_height_window() {
        let cone = BcShape::ZCone {
            tip: Vector3::new(0.0, 0.0, 0.0),
            slope: 1.0,
            hmax: 100.0,
            hmin: 1.0,
        };
        // wall radius at z=10 is 10; center just inside the wall
        let hit = cone
            .contact_with_sphere(Vector3::new(9.6, 0.0, 10.0), 1.0, Vector3::zeros())
            .unwrap();
        assert!(hit.penetration > 0.0);
        // normal points inward and upward for a funnel
        assert!(hit.normal.x < 0.0);
        assert!(hit.normal.z > 0.0);

        // below the active window, no contact
        assert!(cone
            .contact_with_sphere(Vector3::new(0.4, 0.0, 0.5), 1.0, Vector3::zeros())
            .is_none());
    }
}
