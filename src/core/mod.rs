pub mod params;
pub mod sampler;
pub mod system;

pub use self::params::SimParams;
pub use self::system::GranularSystem;
pub use crate::contact::FrictionMode;
pub use crate::integration::{TimeIntegrator, TimeStepping};

use serde::{Deserialize, Serialize};

/// How per-frame particle snapshots are written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OutputMode {
    /// Comma-separated text, one row per sphere
    #[default]
    Csv,

    /// Raw little-endian f32 coordinate triples
    Binary,

    /// Snapshot calls are no-ops
    None,
}
