use thiserror::Error;

/// Failure reported by the approximate nearest neighbor backend.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("failed to insert descriptor {index}: {reason}")]
    Insert { index: usize, reason: &'static str },
    #[error("failed to build descriptor index: {0}")]
    Build(&'static str),
}

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("source and target sizes differ ({source_len} vs {target_len})")]
    LengthMismatch {
        source_len: usize,
        target_len: usize,
    },
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("voxel size must be finite and positive, got {0}")]
    InvalidVoxelSize(f64),
    #[error("solver noise bound gain ({solver}) must be smaller than the pruning gain ({pruning})")]
    NoiseBoundGainOrder { solver: f64, pruning: f64 },
    #[error("tuple scale must lie in [0, 1), got {0}")]
    InvalidTupleScale(f64),
    #[error("maximum number of correspondences must be positive")]
    ZeroMaxCorrespondences,
}

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Solver(#[from] SolverError),
}
