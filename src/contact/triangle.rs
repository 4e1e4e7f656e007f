use nalgebra::Vector3;

use crate::contact::ContactGeometry;

/// Closest point on triangle `(a, b, c)` to point `p`, handling the face,
/// edge and vertex regions of the Voronoi decomposition
pub fn closest_point_on_triangle(
    p: Vector3<f64>,
    a: Vector3<f64>,
    b: Vector3<f64>,
    c: Vector3<f64>,
) -> Vector3<f64> {
    let ab = b - a;
    let ac = c - a;
    let ap = p - a;

    let d1 = ab.dot(&ap);
    let d2 = ac.dot(&ap);
    if d1 <= 0.0 && d2 <= 0.0 {
        return a;
    }

    let bp = p - b;
    let d3 = ab.dot(&bp);
    let d4 = ac.dot(&bp);
    if d3 >= 0.0 && d4 <= d3 {
        return b;
    }

    let vc = d1 * d4 - d3 * d2;
    if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
        let v = d1 / (d1 - d3);
        return a + ab * v;
    }

    let cp = p - c;
    let d5 = ab.dot(&cp);
    let d6 = ac.dot(&cp);
    if d6 >= 0.0 && d5 <= d6 {
        return c;
    }

    let vb = d5 * d2 - d1 * d6;
    if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
        let w = d2 / (d2 - d6);
        return a + ac * w;
    }

    let va = d3 * d6 - d5 * d4;
    if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
        let w = (d4 - d3) / ((d4 - d3) + (d5 - d6));
        return b + (c - b) * w;
    }

    let denom = 1.0 / (va + vb + vc);
    let v = vb * denom;
    let w = vc * denom;
    a + ab * v + ac * w
}

/// Narrow-phase test of a sphere against one triangle.
///
/// Returns the contact geometry (normal pointing from the triangle surface
/// into the sphere) and the contact point, or `None` when the sphere does
/// not reach the triangle. `surface_vel` is the velocity of the triangle's
/// material point at the contact.
pub fn sphere_triangle_contact(
    center: Vector3<f64>,
    radius: f64,
    nodes: &[Vector3<f64>; 3],
    sphere_vel: Vector3<f64>,
    surface_vel: Vector3<f64>,
) -> Option<(ContactGeometry, Vector3<f64>)> {
    let closest = closest_point_on_triangle(center, nodes[0], nodes[1], nodes[2]);
    let offset = center - closest;
    let dist = offset.norm();
    if dist >= radius || dist == 0.0 {
        return None;
    }
    Some((
        ContactGeometry {
            normal: offset / dist,
            penetration: radius - dist,
            rel_vel: sphere_vel - surface_vel,
        },
        closest,
    ))
}
