use approx::assert_relative_eq;
use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use gran_engine::core::TimeStepping;
use gran_engine::error::GranError;
use gran_engine::{GranularSystem, MeshFramePose, SimParams};

fn basic_system(box_edge: f64) -> GranularSystem {
    let mut sys = GranularSystem::with_box_dims(
        1.0,
        1.5,
        Vector3::new(box_edge, box_edge, box_edge),
    );
    sys.set_gravitational_acceleration(0.0, 0.0, -981.0).unwrap();
    sys.set_stiffness_s2s(1e7).unwrap();
    sys.set_stiffness_s2w(1e7).unwrap();
    sys.set_damping_s2s(1e4).unwrap();
    sys.set_damping_s2w(1e4).unwrap();
    sys.set_fixed_step_size(1e-4).unwrap();
    sys
}

#[test]
fn overlapping_pair_receives_equal_and_opposite_impulse() {
    let mut sys = basic_system(40.0);
    sys.set_fixed_step_size(1e-5).unwrap();
    // overlap along x only, so the pair force is horizontal and gravity
    // affects both spheres identically
    sys.set_particle_positions(vec![
        Vector3::new(-0.9, 0.0, 0.0),
        Vector3::new(0.9, 0.0, 0.0),
    ])
    .unwrap();
    sys.initialize().unwrap();
    sys.advance_simulation(1e-5).unwrap();

    let v = sys.velocities_uu().unwrap();
    assert!(v[0].x < 0.0, "left sphere should be pushed further left");
    assert!(v[1].x > 0.0, "right sphere should be pushed further right");
    assert_relative_eq!(v[0].x, -v[1].x, max_relative = 1e-4);
    assert_relative_eq!(v[0].z, v[1].z, max_relative = 1e-4);
    assert_relative_eq!(v[0].y, 0.0, epsilon = 1e-9);
}

#[test]
fn separated_pair_feels_only_gravity() {
    let mut sys = basic_system(40.0);
    sys.set_fixed_step_size(1e-5).unwrap();
    sys.set_particle_positions(vec![
        Vector3::new(-5.0, 0.0, 0.0),
        Vector3::new(5.0, 0.0, 0.0),
    ])
    .unwrap();
    sys.initialize().unwrap();
    sys.advance_simulation(1e-5).unwrap();

    let v = sys.velocities_uu().unwrap();
    for vi in &v {
        assert_relative_eq!(vi.x, 0.0, epsilon = 1e-9);
        assert_relative_eq!(vi.y, 0.0, epsilon = 1e-9);
        assert_relative_eq!(vi.z, -981.0 * 1e-5, max_relative = 1e-3);
    }
}

#[test]
fn cohesion_reaches_across_sd_boundaries() {
    let mut sys = basic_system(40.0);
    sys.set_cohesion_ratio(50.0).unwrap();
    sys.set_fixed_step_size(1e-5).unwrap();
    // two pairs with identical 0.05 surface gaps; the first straddles the
    // grid plane at x = 0, the second sits shifted off it. Attraction must
    // not depend on where a pair lands relative to the SD grid.
    sys.set_particle_positions(vec![
        Vector3::new(-1.025, 0.0, 0.0),
        Vector3::new(1.025, 0.0, 0.0),
        Vector3::new(3.975, 10.0, 0.0),
        Vector3::new(6.025, 10.0, 0.0),
    ])
    .unwrap();
    sys.initialize().unwrap();
    sys.advance_simulation(1e-5).unwrap();

    let v = sys.velocities_uu().unwrap();
    assert!(v[0].x > 0.0 && v[1].x < 0.0, "straddling pair must attract");

    // each sphere gains ratio * |g| * dt toward its partner
    let expected_closing = 2.0 * 50.0 * 981.0 * 1e-5;
    let closing_straddling = v[0].x - v[1].x;
    let closing_shifted = v[2].x - v[3].x;
    assert_relative_eq!(closing_straddling, expected_closing, max_relative = 1e-3);
    assert_relative_eq!(closing_straddling, closing_shifted, max_relative = 1e-6);
}

fn horizontal_kinetic_energy(velocities: &[Vector3<f64>]) -> f64 {
    velocities.iter().map(|v| v.x * v.x + v.y * v.y).sum()
}

#[test]
fn pair_collision_does_not_gain_kinetic_energy() {
    // gravity stays perpendicular to the line of centers, so the
    // horizontal energy balance is the collision's alone
    let mut sys = basic_system(40.0);
    sys.set_particle_positions(vec![
        Vector3::new(-1.05, 0.0, 0.0),
        Vector3::new(1.05, 0.0, 0.0),
    ])
    .unwrap();
    sys.set_particle_velocities(vec![
        Vector3::new(20.0, 0.0, 0.0),
        Vector3::new(-20.0, 0.0, 0.0),
    ])
    .unwrap();
    sys.initialize().unwrap();

    let ke_before = horizontal_kinetic_energy(&sys.velocities_uu().unwrap());
    // long enough to cover approach, full contact and separation
    sys.advance_simulation(0.01).unwrap();

    let v = sys.velocities_uu().unwrap();
    assert!(v[0].x < 0.0 && v[1].x > 0.0, "pair should have rebounded");
    let ke_after = horizontal_kinetic_energy(&v);
    assert!(
        ke_after <= ke_before * (1.0 + 1e-6),
        "collision gained energy: before {ke_before}, after {ke_after}"
    );
    assert!(ke_after > 0.0);
}

#[test]
fn seeded_velocities_must_match_the_population() {
    let mut sys = basic_system(40.0);
    sys.set_particle_positions(vec![Vector3::new(0.0, 0.0, 0.0)])
        .unwrap();
    sys.set_particle_velocities(vec![Vector3::zeros(), Vector3::zeros()])
        .unwrap();
    assert!(matches!(
        sys.initialize(),
        Err(GranError::InvalidParameter(_))
    ));
}

#[test]
fn zero_duration_advance_is_a_no_op() {
    let mut sys = basic_system(40.0);
    sys.set_particle_positions(vec![Vector3::new(0.0, 0.0, 0.0)])
        .unwrap();
    sys.initialize().unwrap();

    let before = sys.positions_uu().unwrap();
    sys.advance_simulation(0.0).unwrap();
    let after = sys.positions_uu().unwrap();

    assert_eq!(sys.time(), 0.0);
    assert_eq!(before, after);
}

#[test]
fn lifecycle_guards_are_enforced() {
    let mut sys = basic_system(40.0);
    assert!(matches!(
        sys.advance_simulation(1e-4),
        Err(GranError::NotInitialized(_))
    ));
    assert!(matches!(sys.max_z(), Err(GranError::NotInitialized(_))));

    sys.set_particle_positions(vec![Vector3::new(0.0, 0.0, 0.0)])
        .unwrap();
    sys.initialize().unwrap();

    assert!(matches!(
        sys.set_stiffness_s2s(2e7),
        Err(GranError::AlreadyInitialized(_))
    ));
    assert!(matches!(
        sys.initialize(),
        Err(GranError::AlreadyInitialized(_))
    ));
    assert!(matches!(
        sys.advance_simulation(-1.0),
        Err(GranError::InvalidParameter(_))
    ));
}

#[test]
fn floor_plane_pushes_back_and_reports_reaction() {
    let mut sys = basic_system(40.0);
    let floor = sys
        .create_bc_plane(
            Vector3::new(0.0, 0.0, -10.0),
            Vector3::new(0.0, 0.0, 1.0),
            true,
        )
        .unwrap();
    let untracked = sys
        .create_bc_plane(
            Vector3::new(0.0, 0.0, -15.0),
            Vector3::new(0.0, 0.0, 1.0),
            false,
        )
        .unwrap();
    // sphere penetrating the floor by half a radius
    sys.set_particle_positions(vec![Vector3::new(0.0, 0.0, -9.5)])
        .unwrap();
    sys.set_fixed_step_size(1e-5).unwrap();
    sys.initialize().unwrap();
    sys.advance_simulation(1e-5).unwrap();

    let v = sys.velocities_uu().unwrap();
    assert!(v[0].z > 0.0, "penetrating sphere should be pushed up");

    let reaction = sys.bc_reaction_force(floor).unwrap();
    assert!(reaction.z < 0.0, "wall should feel the opposite push");
    assert_relative_eq!(reaction.x, 0.0, epsilon = 1e-9);

    assert!(matches!(
        sys.bc_reaction_force(untracked),
        Err(GranError::InvalidParameter(_))
    ));
}

#[test]
fn disabled_boundary_is_ignored() {
    let mut sys = basic_system(40.0);
    let floor = sys
        .create_bc_plane(
            Vector3::new(0.0, 0.0, -10.0),
            Vector3::new(0.0, 0.0, 1.0),
            false,
        )
        .unwrap();
    sys.disable_bc(floor).unwrap();
    sys.set_particle_positions(vec![Vector3::new(0.0, 0.0, -9.5)])
        .unwrap();
    sys.set_fixed_step_size(1e-5).unwrap();
    sys.initialize().unwrap();
    sys.advance_simulation(1e-5).unwrap();

    let v = sys.velocities_uu().unwrap();
    // no floor force, gravity only
    assert!(v[0].z < 0.0);
}

#[test]
fn bed_settles_onto_floor_without_tunneling() {
    let mut sys = basic_system(20.0);
    sys.set_fill_bounds(-0.4, -0.4, -0.4, 0.4, 0.4, 0.4).unwrap();
    sys.create_bc_plane(
        Vector3::new(0.0, 0.0, -9.0),
        Vector3::new(0.0, 0.0, 1.0),
        false,
    )
    .unwrap();
    sys.initialize().unwrap();
    let n = sys.element_count();
    assert!(n > 0, "fill sampler should seed at least one sphere");

    sys.advance_simulation(0.05).unwrap();
    assert_relative_eq!(sys.time(), 0.05, max_relative = 1e-9);

    let positions = sys.positions_uu().unwrap();
    assert_eq!(positions.len(), n);
    for p in &positions {
        assert!(p.x.is_finite() && p.y.is_finite() && p.z.is_finite());
        // floor at -9, radius 1; allow a dynamic overshoot margin
        assert!(p.z > -8.7, "sphere tunneled through the floor: z = {}", p.z);
    }
    assert!(sys.max_z().unwrap() < 10.0);
    assert!(sys.kinetic_energy().unwrap().is_finite());
}

#[test]
fn cylinder_confines_the_bed_laterally() {
    let mut sys = basic_system(20.0);
    sys.set_fill_bounds(-0.3, -0.3, -0.2, 0.3, 0.3, 0.2).unwrap();
    sys.create_bc_plane(
        Vector3::new(0.0, 0.0, -9.0),
        Vector3::new(0.0, 0.0, 1.0),
        false,
    )
    .unwrap();
    sys.create_bc_cylinder_z(Vector3::zeros(), 6.0, false).unwrap();
    sys.initialize().unwrap();

    sys.advance_simulation(0.05).unwrap();
    for p in &sys.positions_uu().unwrap() {
        let rho = (p.x * p.x + p.y * p.y).sqrt();
        assert!(rho < 6.0, "sphere escaped the cylinder: rho = {rho}");
    }
}

#[test]
fn adaptive_run_with_random_velocities_stays_bounded() {
    let mut rng = StdRng::seed_from_u64(3);
    let mut positions = Vec::new();
    let mut velocities = Vec::new();
    for i in 0..4 {
        for j in 0..4 {
            for k in 0..2 {
                positions.push(Vector3::new(
                    -4.5 + 3.0 * f64::from(i),
                    -4.5 + 3.0 * f64::from(j),
                    -1.5 + 3.0 * f64::from(k),
                ));
                velocities.push(Vector3::new(
                    rng.gen_range(-30.0..30.0),
                    rng.gen_range(-30.0..30.0),
                    rng.gen_range(-30.0..30.0),
                ));
            }
        }
    }
    let n = positions.len();

    let mut sys = basic_system(40.0);
    sys.set_time_stepping(TimeStepping::Adaptive).unwrap();
    sys.set_max_adaptive_step_size(5e-4).unwrap();
    sys.create_bc_plane(
        Vector3::new(0.0, 0.0, -15.0),
        Vector3::new(0.0, 0.0, 1.0),
        false,
    )
    .unwrap();
    sys.set_particle_positions(positions).unwrap();
    sys.set_particle_velocities(velocities).unwrap();
    sys.initialize().unwrap();
    sys.advance_simulation(0.01).unwrap();

    assert_relative_eq!(sys.time(), 0.01, max_relative = 1e-9);
    let after = sys.positions_uu().unwrap();
    assert_eq!(after.len(), n);
    for p in &after {
        assert!(p.x.is_finite() && p.y.is_finite() && p.z.is_finite());
        assert!(p.z > -14.7, "sphere tunneled through the floor: z = {}", p.z);
    }
}

#[test]
fn adaptive_stepping_covers_the_requested_duration() {
    let mut sys = basic_system(20.0);
    sys.set_time_stepping(TimeStepping::Adaptive).unwrap();
    sys.set_max_adaptive_step_size(5e-4).unwrap();
    sys.set_fill_bounds(-0.3, -0.3, -0.3, 0.3, 0.3, 0.3).unwrap();
    sys.create_bc_plane(
        Vector3::new(0.0, 0.0, -9.0),
        Vector3::new(0.0, 0.0, 1.0),
        false,
    )
    .unwrap();
    sys.initialize().unwrap();

    sys.advance_simulation(0.02).unwrap();
    assert_relative_eq!(sys.time(), 0.02, max_relative = 1e-9);
    for p in &sys.positions_uu().unwrap() {
        assert!(p.z.is_finite());
        assert!(p.z > -8.7);
    }
}

#[test]
fn jittered_lattice_survives_a_short_run() {
    let mut rng = StdRng::seed_from_u64(7);
    // lattice spacing leaves a gap even at maximum jitter
    let mut seed = Vec::new();
    for i in 0..4 {
        for j in 0..4 {
            for k in 0..3 {
                seed.push(Vector3::new(
                    -4.0 + 2.5 * f64::from(i) + rng.gen_range(-0.2..0.2),
                    -4.0 + 2.5 * f64::from(j) + rng.gen_range(-0.2..0.2),
                    -4.0 + 2.5 * f64::from(k) + rng.gen_range(-0.2..0.2),
                ));
            }
        }
    }
    let n = seed.len();

    let mut sys = basic_system(40.0);
    sys.create_bc_plane(
        Vector3::new(0.0, 0.0, -15.0),
        Vector3::new(0.0, 0.0, 1.0),
        false,
    )
    .unwrap();
    sys.set_particle_positions(seed).unwrap();
    sys.initialize().unwrap();
    sys.advance_simulation(0.02).unwrap();

    let positions = sys.positions_uu().unwrap();
    assert_eq!(positions.len(), n);
    for p in &positions {
        assert!(p.x.is_finite() && p.y.is_finite() && p.z.is_finite());
        assert!(p.z > -14.7);
    }
}

#[test]
fn checkpoint_round_trips_through_a_fresh_system() {
    let dir = tempfile::tempdir().unwrap();

    let mut first = basic_system(40.0);
    first.set_output_directory(dir.path());
    let seed = vec![
        Vector3::new(-3.0, 1.0, 2.0),
        Vector3::new(4.0, -2.0, -5.0),
        Vector3::new(0.5, 0.25, 7.0),
    ];
    first.set_particle_positions(seed.clone()).unwrap();
    first.initialize().unwrap();
    first.write_file_uu("checkpoint").unwrap();

    let mut second = basic_system(40.0);
    second
        .set_particle_positions_from_checkpoint(dir.path().join("checkpoint.csv"))
        .unwrap();
    second.initialize().unwrap();

    assert_eq!(second.element_count(), seed.len());
    let restored = second.positions_uu().unwrap();
    for (r, s) in restored.iter().zip(&seed) {
        // positions survive two trips through the integer SU grid
        assert_relative_eq!(r.x, s.x, epsilon = 1e-3);
        assert_relative_eq!(r.y, s.y, epsilon = 1e-3);
        assert_relative_eq!(r.z, s.z, epsilon = 1e-3);
    }
}

#[test]
fn system_builds_from_parameter_json() {
    let params = SimParams::from_json(
        r#"{
            "sphere_radius": 0.5,
            "sphere_density": 2.0,
            "box_x": 20.0, "box_y": 20.0, "box_z": 20.0,
            "normal_stiff_s2s": 5e6,
            "step_size": 5e-5
        }"#,
    )
    .unwrap();
    let mut sys = GranularSystem::from_params(&params);
    sys.set_fill_bounds(-0.3, -0.3, -0.3, 0.3, 0.3, 0.3).unwrap();
    sys.initialize().unwrap();
    assert!(sys.element_count() > 0);
    assert!(sys.sd_count() > 0);
}

fn write_floor_quad(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("floor.obj");
    std::fs::write(
        &path,
        "v -5.0 -5.0 0.0\n\
         v 5.0 -5.0 0.0\n\
         v 5.0 5.0 0.0\n\
         v -5.0 5.0 0.0\n\
         f 1 2 3\n\
         f 1 3 4\n",
    )
    .unwrap();
    path
}

#[test]
fn mesh_floor_receives_a_downward_generalized_force() {
    let dir = tempfile::tempdir().unwrap();
    let obj = write_floor_quad(dir.path());

    let mut sys = basic_system(40.0);
    sys.set_damping_s2m(1e4).unwrap();
    sys.load_meshes(&[&obj], &[Vector3::new(1.0, 1.0, 1.0)])
        .unwrap();
    assert_eq!(sys.num_mesh_families(), 1);

    // sphere overlapping the quad from above
    sys.set_particle_positions(vec![Vector3::new(0.0, 0.0, 0.5)])
        .unwrap();
    sys.set_fixed_step_size(1e-5).unwrap();
    sys.initialize().unwrap();
    sys.advance_simulation(1e-5).unwrap();

    let v = sys.velocities_uu().unwrap();
    assert!(v[0].z > 0.0, "sphere should be pushed off the mesh");

    let mut forces = [0.0f64; 6];
    sys.collect_generalized_forces_on_mesh_soup(&mut forces)
        .unwrap();
    assert!(forces[2] < 0.0, "mesh should be pushed down, got {forces:?}");
    // contact is at the torque reference's vertical, so no moment arm
    assert_relative_eq!(forces[3], 0.0, epsilon = 1e-9);
    assert_relative_eq!(forces[4], 0.0, epsilon = 1e-9);

    sys.set_output_directory(dir.path());
    sys.write_meshes("meshes_0").unwrap();
    assert!(dir.path().join("meshes_0.obj").exists());
}

#[test]
fn mesh_motion_requires_one_pose_per_family() {
    let dir = tempfile::tempdir().unwrap();
    let obj = write_floor_quad(dir.path());

    let mut sys = basic_system(40.0);
    sys.load_meshes(&[&obj], &[Vector3::new(1.0, 1.0, 1.0)])
        .unwrap();

    let poses = vec![MeshFramePose::default(), MeshFramePose::default()];
    assert!(sys.mesh_soup_apply_rigid_body_motion(&poses).is_err());
    assert!(sys
        .mesh_soup_apply_rigid_body_motion(&[MeshFramePose::default()])
        .is_ok());
}

#[test]
fn snapshots_land_in_the_output_directory() {
    let dir = tempfile::tempdir().unwrap();
    let mut sys = basic_system(40.0);
    sys.set_output_directory(dir.path());
    sys.set_particle_positions(vec![Vector3::new(1.0, 2.0, 3.0)])
        .unwrap();
    sys.initialize().unwrap();

    sys.write_file("step_0").unwrap();
    sys.write_file_uu("step_0_uu").unwrap();
    assert!(dir.path().join("step_0.csv").exists());
    assert!(dir.path().join("step_0_uu.csv").exists());
}
