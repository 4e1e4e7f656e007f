pub mod units;
pub mod domain;
pub mod contact;
pub mod mesh;
pub mod integration;
pub mod core;
pub mod io;

/// Re-export common types for easier usage
pub use crate::core::{FrictionMode, GranularSystem, OutputMode, SimParams, TimeStepping};
pub use crate::mesh::MeshFramePose;
pub use crate::units::{PsiFactors, UnitScaling};

/// Error types for the granular engine
pub mod error {
    use thiserror::Error;

    /// Which fixed-capacity bin overflowed
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum CapacityKind {
        /// Sphere occupant list of a sub-domain
        SubDomain,
        /// Triangle occupant list of a broad-phase bucket
        TriangleBucket,
        /// Per-sphere contact-partner history slots
        ContactHistory,
    }

    impl std::fmt::Display for CapacityKind {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                CapacityKind::SubDomain => write!(f, "sub-domain"),
                CapacityKind::TriangleBucket => write!(f, "triangle bucket"),
                CapacityKind::ContactHistory => write!(f, "contact history"),
            }
        }
    }

    #[derive(Error, Debug)]
    pub enum GranError {
        #[error("Invalid parameter: {0}")]
        InvalidParameter(String),

        #[error("{kind} {index} exceeded its capacity of {capacity}")]
        CapacityExceeded {
            kind: CapacityKind,
            index: usize,
            capacity: usize,
        },

        #[error("Operation requires initialize() to have been called: {0}")]
        NotInitialized(String),

        #[error("Operation must precede initialize(): {0}")]
        AlreadyInitialized(String),

        #[error("Mesh load error: {0}")]
        MeshLoad(String),

        #[error("Checkpoint error: {0}")]
        Checkpoint(String),

        #[error("I/O error: {0}")]
        Io(#[from] std::io::Error),
    }
}

/// Result type for granular engine operations
pub type Result<T> = std::result::Result<T, error::GranError>;

/// Engine version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
