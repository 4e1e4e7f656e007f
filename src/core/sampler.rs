use nalgebra::Vector3;

/// Samples points on a hexagonal-close-packed lattice inside the
/// axis-aligned box `center ± half_dims`.
///
/// `spacing` is the minimum distance between any two sampled points, so a
/// fill of spheres of radius `r` uses a spacing slightly above `2 r` to
/// avoid seeding the bed with overlaps.
pub fn sample_hcp_box(
    center: Vector3<f64>,
    half_dims: Vector3<f64>,
    spacing: f64,
) -> Vec<Vector3<f64>> {
    let mut points = Vec::new();
    if spacing <= 0.0 || half_dims.min() < 0.0 {
        return points;
    }

    // HCP lattice geometry for touching spheres of diameter `spacing`
    let dx = spacing;
    let dy = spacing * (3.0f64).sqrt() / 2.0;
    let dz = spacing * (6.0f64).sqrt() / 3.0;

    let lo = center - half_dims;
    let hi = center + half_dims;

    let mut k = 0u64;
    loop {
        let z = lo.z + k as f64 * dz;
        if z > hi.z {
            break;
        }
        let mut j = 0u64;
        loop {
            let y = lo.y + j as f64 * dy + if k % 2 == 1 { dy / 3.0 } else { 0.0 };
            if y > hi.y {
                break;
            }
            let row_shift = if (j + k) % 2 == 1 { dx / 2.0 } else { 0.0 };
            let mut i = 0u64;
            loop {
                let x = lo.x + i as f64 * dx + row_shift;
                if x > hi.x {
                    break;
                }
                points.push(Vector3::new(x, y, z));
                i += 1;
            }
            j += 1;
        }
        k += 1;
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_stay_inside_the_box() {
        let center = Vector3::new(1.0, -2.0, 3.0);
        let half = Vector3::new(5.0, 4.0, 6.0);
        let points = sample_hcp_box(center, half, 1.0);
        assert!(!points.is_empty());
        for p in &points {
            for axis in 0..3 {
                assert!(p[axis] >= center[axis] - half[axis] - 1e-9);
                assert!(p[axis] <= center[axis] + half[axis] + 1e-9);
            }
        }
    }

    #[test]
    fn no_two_samples_closer_than_spacing() {
        let points = sample_hcp_box(Vector3::zeros(), Vector3::new(2.0, 2.0, 2.0), 1.0);
        for (a, pa) in points.iter().enumerate() {
            for pb in &points[a + 1..] {
                assert!(
                    (pa - pb).norm() >= 1.0 - 1e-9,
                    "samples {pa:?} and {pb:?} too close"
                );
            }
        }
    }

    #[test]
    fn degenerate_inputs_yield_no_samples() {
        assert!(sample_hcp_box(Vector3::zeros(), Vector3::new(1.0, 1.0, 1.0), 0.0).is_empty());
        assert!(sample_hcp_box(Vector3::zeros(), Vector3::new(-1.0, 1.0, 1.0), 0.0).is_empty());
    }
}
