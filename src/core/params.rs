use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::contact::FrictionMode;
use crate::core::OutputMode;
use crate::error::GranError;
use crate::integration::{TimeIntegrator, TimeStepping};
use crate::Result;

/// Simulation parameters as consumed from a driver's JSON file.
///
/// Field names follow the established config surface so existing parameter
/// files keep working; every field is optional and falls back to its
/// default. Units are whatever consistent system the driver works in
/// (the granular demos use cm-g-s).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimParams {
    pub sphere_radius: f64,
    pub sphere_density: f64,

    pub box_x: f64,
    pub box_y: f64,
    pub box_z: f64,

    pub step_size: f64,
    pub time_end: f64,

    pub grav_x: f64,
    pub grav_y: f64,
    pub grav_z: f64,

    pub normal_stiff_s2s: f64,
    pub normal_stiff_s2w: f64,
    pub normal_stiff_s2m: f64,
    pub normal_damp_s2s: f64,
    pub normal_damp_s2w: f64,
    pub normal_damp_s2m: f64,

    pub tangent_stiff_s2s: f64,
    pub tangent_stiff_s2w: f64,
    pub tangent_damp_s2s: f64,
    pub tangent_damp_s2w: f64,
    pub static_friction_coeff: f64,

    pub cohesion_ratio: f64,
    pub adhesion_ratio_s2w: f64,

    pub psi_t: u32,
    pub psi_h: u32,
    pub psi_l: u32,

    pub step_mode: TimeStepping,
    pub max_adaptive_step: f64,
    pub friction_mode: FrictionMode,
    pub time_integrator: TimeIntegrator,

    pub output_dir: String,
    pub write_mode: OutputMode,
    pub verbose: bool,
}

impl Default for SimParams {
    fn default() -> Self {
        Self {
            sphere_radius: 1.0,
            sphere_density: 1.5,
            box_x: 40.0,
            box_y: 40.0,
            box_z: 60.0,
            step_size: 1e-4,
            time_end: 1.0,
            grav_x: 0.0,
            grav_y: 0.0,
            grav_z: -981.0,
            normal_stiff_s2s: 1e7,
            normal_stiff_s2w: 1e7,
            normal_stiff_s2m: 1e7,
            normal_damp_s2s: 1e4,
            normal_damp_s2w: 1e4,
            normal_damp_s2m: 1e4,
            tangent_stiff_s2s: 0.0,
            tangent_stiff_s2w: 0.0,
            tangent_damp_s2s: 0.0,
            tangent_damp_s2w: 0.0,
            static_friction_coeff: 0.5,
            cohesion_ratio: 0.0,
            adhesion_ratio_s2w: 0.0,
            psi_t: 16,
            psi_h: 4,
            psi_l: 16,
            step_mode: TimeStepping::Fixed,
            max_adaptive_step: 1e-3,
            friction_mode: FrictionMode::Frictionless,
            time_integrator: TimeIntegrator::ForwardEuler,
            output_dir: ".".into(),
            write_mode: OutputMode::Csv,
            verbose: false,
        }
    }
}

impl SimParams {
    /// Loads parameters from a JSON file; unknown fields are errors so a
    /// typo in a parameter name cannot silently fall back to a default
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(&path)?;
        Self::from_json(&text)
    }

    /// Parses parameters from a JSON string
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| GranError::InvalidParameter(format!("malformed parameter JSON: {e}")))
    }
}
