use nalgebra::Vector3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Selects the position/velocity update scheme.
///
/// Velocities are always committed before positions, so the position pass
/// sees the end-of-step velocity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeIntegrator {
    /// Semi-implicit Euler baseline: `x += v dt` with the freshly
    /// committed velocity
    #[default]
    ForwardEuler,

    /// Second-order Taylor expansion about the start of the step. The
    /// committed velocity already contains `a dt`, so the position
    /// correction is `-a dt^2 / 2`, recovering `x += v_old dt + a dt^2 / 2`.
    ExtendedTaylor,
}

/// How step sizes are chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeStepping {
    /// Every step uses the configured fixed size
    #[default]
    Fixed,

    /// Step size re-derived from the current maximum sphere velocity at a
    /// fixed cadence, bounded by displacement limits
    Adaptive,
}

/// Commits the pending velocity updates accumulated by the force pass.
///
/// The force pass writes per-sphere deltas into a separate buffer so
/// concurrent contact evaluation never reads a half-updated velocity; the
/// commit is the only writer of the live velocity array.
pub fn commit_velocity_updates(vel: &mut [Vector3<f32>], updates: &[Vector3<f32>]) {
    vel.par_iter_mut()
        .zip(updates.par_iter())
        .for_each(|(v, dv)| *v += dv);
}

/// Advances integer SU positions from the committed velocities.
///
/// Positions stay on the integer LENGTH_UNIT grid to bound long-run
/// floating-point drift; the per-step displacement is rounded to the
/// nearest unit.
pub fn integrate_positions(
    scheme: TimeIntegrator,
    pos: &mut [Vector3<i64>],
    vel: &[Vector3<f32>],
    acc: &[Vector3<f32>],
    dt_su: f64,
) {
    pos.par_iter_mut()
        .zip(vel.par_iter().zip(acc.par_iter()))
        .for_each(|(p, (v, a))| {
            for axis in 0..3 {
                let mut disp = f64::from(v[axis]) * dt_su;
                if scheme == TimeIntegrator::ExtendedTaylor {
                    disp -= 0.5 * f64::from(a[axis]) * dt_su * dt_su;
                }
                p[axis] += disp.round() as i64;
            }
        });
}

/// Step-size policy: fixed, or adaptive from a CFL-like displacement bound
/// on the fastest sphere.
///
/// The maximum-velocity scan is amortized by only re-deriving the adaptive
/// step every `recheck_cadence` steps; in between the last derived size is
/// reused.
#[derive(Debug, Clone)]
pub struct StepSizeControl {
    pub mode: TimeStepping,

    /// Fixed step size, SU; also the fallback for degenerate adaptive input
    pub fixed_dt_su: f64,

    /// Clamp range for the adaptive step, SU
    pub min_adaptive_dt_su: f64,
    pub max_adaptive_dt_su: f64,

    /// Steps between max-velocity rescans
    pub recheck_cadence: u32,

    /// No sphere may move further than this fraction of its radius per step
    pub max_radius_fraction: f64,

    /// Nor further than this multiple of the gravitational displacement
    /// accrued over one fixed step
    pub max_gravity_lengths: f64,

    steps_since_check: u32,
    current_dt_su: f64,
}

impl StepSizeControl {
    pub fn new(mode: TimeStepping, fixed_dt_su: f64, max_adaptive_dt_su: f64) -> Self {
        Self {
            mode,
            fixed_dt_su,
            min_adaptive_dt_su: fixed_dt_su * 1e-2,
            max_adaptive_dt_su,
            recheck_cadence: 10,
            max_radius_fraction: 0.1,
            max_gravity_lengths: 5.0,
            steps_since_check: 0,
            current_dt_su: fixed_dt_su,
        }
    }

    /// Step size to use for the next step. `max_velocity` runs the scan for
    /// the current maximum sphere speed (SU) and is only invoked when the
    /// cadence calls for a re-check.
    pub fn next_dt(
        &mut self,
        max_velocity: impl FnOnce() -> f64,
        radius_su: f64,
        gravity_mag_su: f64,
    ) -> f64 {
        match self.mode {
            TimeStepping::Fixed => self.fixed_dt_su,
            TimeStepping::Adaptive => {
                if self.steps_since_check == 0 {
                    self.current_dt_su =
                        self.derive_adaptive(max_velocity(), radius_su, gravity_mag_su);
                }
                self.steps_since_check =
                    (self.steps_since_check + 1) % self.recheck_cadence.max(1);
                self.current_dt_su
            }
        }
    }

    fn derive_adaptive(&self, v_max: f64, radius_su: f64, gravity_mag_su: f64) -> f64 {
        if v_max <= 0.0 || !v_max.is_finite() {
            // nothing is moving (or the scan produced garbage); degrade
            // gracefully to the fixed step rather than aborting
            warn!(v_max, "adaptive step fell back to the fixed step size");
            return self.fixed_dt_su;
        }
        let grav_disp = gravity_mag_su * self.fixed_dt_su * self.fixed_dt_su;
        let disp_bound = (self.max_radius_fraction * radius_su)
            .min(self.max_gravity_lengths * grav_disp);
        (disp_bound / v_max).clamp(self.min_adaptive_dt_su, self.max_adaptive_dt_su)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn fixed_mode_ignores_velocity() {
        let mut ctrl = StepSizeControl::new(TimeStepping::Fixed, 2.0, 100.0);
        assert_eq!(ctrl.next_dt(|| panic!("must not scan"), 10.0, 1.0), 2.0);
    }

    #[test]
    fn adaptive_step_respects_displacement_bound() {
        let mut ctrl = StepSizeControl::new(TimeStepping::Adaptive, 1.0, 1e6);
        let radius = 1000.0;
        let dt = ctrl.next_dt(|| 50.0, radius, 1e6);
        // fastest sphere must not cover more than a tenth of a radius
        assert!(50.0 * dt <= 0.1 * radius + 1e-9);
    }

    #[test]
    fn adaptive_bound_holds_across_random_velocities() {
        let mut rng = StdRng::seed_from_u64(11);
        let radius = 1000.0;
        // gravity large enough that the radius bound is the binding one
        let gravity = 1e6;
        for _ in 0..200 {
            let v_max = rng.gen_range(1e-3..9e3);
            let mut ctrl = StepSizeControl::new(TimeStepping::Adaptive, 1.0, 1e6);
            let dt = ctrl.next_dt(|| v_max, radius, gravity);
            assert!(
                v_max * dt <= 0.1 * radius * (1.0 + 1e-9),
                "displacement bound violated: v = {v_max}, dt = {dt}"
            );
            assert!(dt >= ctrl.min_adaptive_dt_su && dt <= ctrl.max_adaptive_dt_su);
        }
    }

    #[test]
    fn adaptive_step_is_clamped_to_max() {
        let mut ctrl = StepSizeControl::new(TimeStepping::Adaptive, 1.0, 3.0);
        let dt = ctrl.next_dt(|| 1e-12, 1000.0, 1e9);
        assert_relative_eq!(dt, 3.0, max_relative = 1e-12);
    }

    #[test]
    fn degenerate_velocity_falls_back_to_fixed() {
        let mut ctrl = StepSizeControl::new(TimeStepping::Adaptive, 1.5, 100.0);
        assert_eq!(ctrl.next_dt(|| 0.0, 1000.0, 1.0), 1.5);
        let mut ctrl = StepSizeControl::new(TimeStepping::Adaptive, 1.5, 100.0);
        assert_eq!(ctrl.next_dt(|| -4.0, 1000.0, 1.0), 1.5);
    }

    #[test]
    fn rescan_happens_only_at_cadence() {
        let mut ctrl = StepSizeControl::new(TimeStepping::Adaptive, 1.0, 1e6);
        ctrl.recheck_cadence = 5;
        let dt0 = ctrl.next_dt(|| 10.0, 1000.0, 1e6);
        for _ in 0..4 {
            // between re-checks the scan closure must not run
            assert_eq!(ctrl.next_dt(|| panic!("must not scan"), 1000.0, 1e6), dt0);
        }
        // fifth call re-scans
        let dt1 = ctrl.next_dt(|| 20.0, 1000.0, 1e6);
        assert!(dt1 < dt0);
    }

    #[test]
    fn euler_position_update_rounds_to_grid() {
        let mut pos = vec![Vector3::new(0i64, 0, 0)];
        let vel = vec![Vector3::new(2.6f32, -2.6, 0.4)];
        let acc = vec![Vector3::zeros()];
        integrate_positions(TimeIntegrator::ForwardEuler, &mut pos, &vel, &acc, 1.0);
        assert_eq!(pos[0], Vector3::new(3, -3, 0));
    }

    #[test]
    fn extended_taylor_recovers_start_of_step_expansion() {
        // a body starting the step at rest has committed velocity a dt;
        // the expansion about the step start must cover a dt^2 / 2
        let mut pos = vec![Vector3::new(0i64, 0, 0)];
        let vel = vec![Vector3::new(8.0f32, 0.0, 0.0)];
        let acc = vec![Vector3::new(8.0f32, 0.0, 0.0)];
        integrate_positions(TimeIntegrator::ExtendedTaylor, &mut pos, &vel, &acc, 1.0);
        assert_eq!(pos[0].x, 4);
    }

    #[test]
    fn zero_cadence_rescans_every_step() {
        let mut ctrl = StepSizeControl::new(TimeStepping::Adaptive, 1.0, 1e6);
        ctrl.recheck_cadence = 0;
        let dt0 = ctrl.next_dt(|| 10.0, 1000.0, 1e6);
        let dt1 = ctrl.next_dt(|| 20.0, 1000.0, 1e6);
        assert!(dt1 < dt0);
    }
}
